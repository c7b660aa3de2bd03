use std::collections::VecDeque;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};

use lockstep::protocol::FRAME_HEADER_LEN;
use lockstep::{
    ClockConfig, Frame, FrameDecoder, LockstepClock, MAX_CONNECTED_PLAYERS, Message, Rational,
    ReadStatus, SlotFlags, Socket, SocketError, SocketSet, Transport, resolve_host,
};

use crate::config::{NodeConfig, Role};
use crate::events::{LeaveReason, NodeEvent};

const HOST_SLOT: usize = 0;
const READ_CHUNK: usize = 4096;

struct Peer {
    socket: Socket,
    decoder: FrameDecoder,
    /// The slot behind this connection. For a joined node this is the host.
    slot: usize,
}

/// One participant of a match, either the host (star centre, relays every
/// time-sync message) or a joined peer.
pub struct LockstepNode {
    config: NodeConfig,
    transport: Transport,
    clock: LockstepClock,
    peers: Vec<Peer>,
    set: SocketSet,
    local_slot: usize,
    is_host: bool,
    state: u32,
    ticks: u32,
    running: bool,
    reported_desync: Vec<usize>,
    last_waiting: Option<usize>,
    pending_events: VecDeque<NodeEvent>,
}

impl LockstepNode {
    pub fn start(config: NodeConfig) -> Result<Self> {
        match config.role.clone() {
            Role::Host { port, players } => Self::host(config, port, players),
            Role::Join { host, port } => Self::join(config, &host, port),
        }
    }

    fn host(config: NodeConfig, port: u16, players: usize) -> Result<Self> {
        if players == 0 || players > MAX_CONNECTED_PLAYERS {
            bail!("player count must be between 1 and {MAX_CONNECTED_PLAYERS}");
        }

        let transport =
            Transport::start(config.transport.clone()).context("failed to start writer thread")?;
        let listener = transport
            .listen(port)
            .with_context(|| format!("failed to listen on port {port}"))?;
        log::info!("hosting on port {port}, waiting for {} peers", players - 1);

        let mut pending_events = VecDeque::new();
        let mut spectators = if config.spectator { 1u32 << HOST_SLOT } else { 0 };
        let mut lobby = SocketSet::new();
        lobby.add(&listener);

        let mut peers = Vec::new();
        while peers.len() + 1 < players {
            lobby.check(Duration::from_millis(100))?;
            let Some(mut socket) = listener.accept() else {
                continue;
            };

            let slot = peers.len() + 1;
            let spectator = match host_handshake(&mut socket, slot, players, &config) {
                Ok(spectator) => spectator,
                Err(err) => {
                    log::warn!("handshake with [{}] failed: {err:#}", socket.text_address());
                    continue;
                }
            };
            if spectator {
                spectators |= 1 << slot;
            }
            pending_events.push_back(NodeEvent::PeerJoined {
                slot,
                address: socket.text_address().to_string(),
                spectator,
            });
            peers.push(Peer {
                socket,
                decoder: FrameDecoder::new(),
                slot,
            });
        }
        listener.close();

        let mut node = Self::assemble(config, transport, peers, HOST_SLOT, players, spectators)?;
        node.pending_events = pending_events;
        node.is_host = true;
        node.broadcast(&Frame::new(HOST_SLOT as u8, Message::Start { spectators }), None);
        node.flush_peers();
        node.pending_events
            .push_back(NodeEvent::MatchStarted { players });
        Ok(node)
    }

    fn join(config: NodeConfig, host: &str, port: u16) -> Result<Self> {
        let transport =
            Transport::start(config.transport.clone()).context("failed to start writer thread")?;
        let addrs = resolve_host(host, port).with_context(|| format!("failed to resolve {host}"))?;
        let mut socket = transport
            .open_any(&addrs, config.handshake_timeout)
            .with_context(|| format!("failed to connect to {host}:{port}"))?;
        log::info!("connected to [{}]", socket.text_address());

        let join = Frame::new(0, Message::Join {
            spectator: config.spectator,
        });
        socket.write_all(&join.encode()?)?;

        let welcome = read_frame(&mut socket, config.handshake_timeout)?;
        let Message::Welcome {
            slot,
            players,
            compress,
        } = welcome.message
        else {
            bail!("expected a welcome from the host, got {:?}", welcome.message);
        };
        if compress {
            socket.begin_compression();
        }
        log::info!("assigned slot {slot} of {players}");

        let mut peer = Peer {
            socket,
            decoder: FrameDecoder::new(),
            slot: HOST_SLOT,
        };
        let spectators = wait_for_start(&mut peer)?;

        let mut node = Self::assemble(
            config,
            transport,
            vec![peer],
            slot as usize,
            players as usize,
            spectators,
        )?;
        node.pending_events.push_back(NodeEvent::MatchStarted {
            players: players as usize,
        });
        Ok(node)
    }

    fn assemble(
        config: NodeConfig,
        transport: Transport,
        peers: Vec<Peer>,
        local_slot: usize,
        players: usize,
        spectators: u32,
    ) -> Result<Self> {
        let clock_config = ClockConfig {
            slots: players,
            host_slot: HOST_SLOT,
            ..config.clock.clone()
        };
        let mut clock = LockstepClock::with_config(clock_config);
        for slot in 0..players {
            let mut flags = SlotFlags::ALLOCATED;
            if spectators & (1 << slot) != 0 {
                flags |= SlotFlags::SPECTATOR;
            }
            if slot == local_slot {
                flags |= SlotFlags::AUTHORITATIVE;
            }
            clock.set_slot_flags(slot, flags)?;
        }
        if config.speed != Rational::ONE {
            log::info!("running at {:.2}x speed", config.speed.as_f32());
        }
        clock.set_modifier(config.speed);

        let mut set = SocketSet::new();
        for peer in &peers {
            set.add(&peer.socket);
        }

        Ok(Self {
            config,
            transport,
            clock,
            peers,
            set,
            local_slot,
            is_host: false,
            state: 0,
            ticks: 0,
            running: true,
            reported_desync: Vec::new(),
            last_waiting: None,
            pending_events: VecDeque::new(),
        })
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn ticks(&self) -> u32 {
        self.ticks
    }

    pub fn clock(&self) -> &LockstepClock {
        &self.clock
    }

    pub fn drain_events(&mut self) -> impl Iterator<Item = NodeEvent> + '_ {
        self.pending_events.drain(..)
    }

    /// One frame: read the network, run due ticks, send what they produced.
    pub fn tick_once(&mut self) {
        self.poll_network();

        while self.running && self.clock.update(true, false) {
            self.simulate_tick();
            for (slot, msg) in self.clock.emit_time_sync() {
                self.broadcast(&Frame::new(slot as u8, Message::GameTime(msg)), None);
            }

            self.ticks += 1;
            if self.config.ticks.is_some_and(|limit| self.ticks >= limit) {
                log::info!("reached {} ticks", self.ticks);
                self.running = false;
            }
        }

        self.report_status();
        self.flush_peers();
    }

    fn simulate_tick(&mut self) {
        let sim = self.clock.sim_time();
        self.state = self
            .state
            .wrapping_mul(1_664_525)
            .wrapping_add(1_013_904_223 ^ sim);

        let log = self.clock.sync_log_mut();
        log.record("simulate", &format!("gameTime {sim}"));
        log.record_value("simulate", "state", self.state as i32, None);
    }

    fn poll_network(&mut self) {
        if let Err(err) = self.set.check(Duration::ZERO) {
            self.pending_events.push_back(NodeEvent::Error {
                message: format!("socket check failed: {err}"),
            });
            return;
        }

        let mut incoming = Vec::new();
        let mut gone = Vec::new();
        for (index, peer) in self.peers.iter_mut().enumerate() {
            if peer.socket.write_failed() {
                gone.push((index, LeaveReason::WriteFailed));
                continue;
            }
            if peer.socket.read_ready() {
                match pump(&mut peer.socket, &mut peer.decoder) {
                    Ok(true) => {}
                    Ok(false) => gone.push((index, LeaveReason::Disconnected)),
                    Err(err) => {
                        log::debug!("read from slot {} failed: {err}", peer.slot);
                        gone.push((index, LeaveReason::Disconnected));
                    }
                }
            }
            loop {
                match peer.decoder.next_frame() {
                    Ok(Some(frame)) => incoming.push((peer.slot, frame)),
                    Ok(None) => break,
                    Err(err) => log::warn!("bad frame from slot {}: {err}", peer.slot),
                }
            }
        }

        for (from, frame) in incoming {
            self.handle_frame(from, frame);
        }
        for (index, reason) in gone.into_iter().rev() {
            self.remove_peer(index, reason);
        }

        let desynced = self.clock.desynced_slots();
        if desynced != self.reported_desync {
            self.pending_events.push_back(NodeEvent::Desync {
                slots: desynced.clone(),
                time: self.clock.sim_time(),
            });
            self.reported_desync = desynced;
        }
    }

    fn handle_frame(&mut self, from: usize, frame: Frame) {
        let slot = frame.player as usize;
        if self.is_host && slot != from {
            log::warn!("slot {from} sent a message for slot {slot}, ignoring");
            return;
        }

        match &frame.message {
            Message::GameTime(msg) => {
                if let Err(err) = self.clock.receive_time_sync(slot, msg) {
                    log::warn!("time sync from slot {from}: {err}");
                    return;
                }
            }
            Message::Leave => {
                if let Err(err) = self.clock.drop_player(slot) {
                    log::warn!("leave from slot {from}: {err}");
                    return;
                }
                self.pending_events.push_back(NodeEvent::PeerLeft {
                    slot,
                    reason: LeaveReason::Graceful,
                });
                if !self.is_host && slot == HOST_SLOT {
                    self.running = false;
                }
            }
            other => {
                log::debug!("ignoring {:?} from slot {from}", other.kind());
                return;
            }
        }

        if self.is_host {
            self.broadcast(&frame, Some(from));
        }
    }

    fn remove_peer(&mut self, index: usize, reason: LeaveReason) {
        let peer = self.peers.remove(index);
        self.set.remove(peer.socket.id());
        if self.clock.slot(peer.slot).is_some_and(|slot| slot.is_allocated()) {
            if let Err(err) = self.clock.drop_player(peer.slot) {
                log::warn!("dropping slot {}: {err}", peer.slot);
            }
            self.pending_events.push_back(NodeEvent::PeerLeft {
                slot: peer.slot,
                reason,
            });
            if self.is_host {
                self.broadcast(&Frame::new(peer.slot as u8, Message::Leave), None);
            }
        }
        peer.socket.close();

        if !self.is_host {
            log::info!("lost connection to host");
            self.running = false;
        }
    }

    fn broadcast(&mut self, frame: &Frame, except: Option<usize>) {
        let bytes = match frame.encode() {
            Ok(bytes) => bytes,
            Err(err) => {
                log::error!("failed to encode {:?}: {err}", frame.message.kind());
                return;
            }
        };
        for peer in self.peers.iter_mut().filter(|peer| Some(peer.slot) != except) {
            if let Err(err) = peer.socket.write_all(&bytes) {
                log::debug!("write to slot {} failed: {err}", peer.slot);
            }
        }
    }

    fn flush_peers(&mut self) {
        for peer in &mut self.peers {
            if let Err(err) = peer.socket.flush() {
                log::debug!("flush to slot {} failed: {err}", peer.slot);
            }
        }
    }

    fn report_status(&mut self) {
        let waiting = self.clock.waiting_status();
        let slot = waiting.map(|status| status.slot);
        if slot != self.last_waiting {
            if let Some(status) = waiting {
                self.pending_events.push_back(NodeEvent::Waiting {
                    slot: status.slot,
                    waited_ms: status.waited_ms,
                });
            }
            self.last_waiting = slot;
        }
    }

    /// Tells everyone we are leaving and gives the writer a moment to get it
    /// out.
    pub fn leave(mut self) {
        self.broadcast(&Frame::new(self.local_slot as u8, Message::Leave), None);
        self.flush_peers();

        let start = Instant::now();
        while self.transport.has_pending_writes() && start.elapsed() < Duration::from_secs(1) {
            thread::sleep(Duration::from_millis(10));
        }
        log::info!(
            "left after {} ticks at gameTime {}",
            self.ticks,
            self.clock.sim_time()
        );
        for peer in &self.peers {
            let stats = peer.socket.stats();
            match stats.send_ratio() {
                Some(ratio) => log::debug!(
                    "slot {}: sent {} bytes, {:.0}% on the wire",
                    peer.slot,
                    stats.bytes_sent,
                    ratio * 100.0
                ),
                None => log::debug!("slot {}: nothing sent", peer.slot),
            }
        }
        self.peers.clear();
        self.transport.shutdown();
    }
}

/// Reads everything the socket has right now into `decoder`. Returns false
/// once the peer has disconnected.
fn pump(socket: &mut Socket, decoder: &mut FrameDecoder) -> Result<bool, SocketError> {
    let mut buf = [0u8; READ_CHUNK];
    loop {
        match socket.read(&mut buf)? {
            ReadStatus::Data(n) => decoder.push(&buf[..n]),
            ReadStatus::Pending => return Ok(true),
            ReadStatus::Disconnected => return Ok(false),
        }
    }
}

/// Blocking read of one uncompressed frame, used before the match starts.
fn read_frame(socket: &mut Socket, timeout: Duration) -> Result<Frame> {
    let mut header = [0u8; FRAME_HEADER_LEN];
    if socket.read_all(&mut header, Some(timeout))? < FRAME_HEADER_LEN {
        bail!("peer disconnected during handshake");
    }
    let mut payload = vec![0u8; Frame::payload_len(&header)];
    if socket.read_all(&mut payload, Some(timeout))? < payload.len() {
        bail!("peer disconnected during handshake");
    }
    Ok(Frame::decode(&header, &payload)?)
}

fn host_handshake(
    socket: &mut Socket,
    slot: usize,
    players: usize,
    config: &NodeConfig,
) -> Result<bool> {
    let frame = read_frame(socket, config.handshake_timeout)?;
    let Message::Join { spectator } = frame.message else {
        bail!("expected a join, got {:?}", frame.message);
    };

    let welcome = Frame::new(
        HOST_SLOT as u8,
        Message::Welcome {
            slot: slot as u8,
            players: players as u8,
            compress: config.compress,
        },
    );
    socket.write_all(&welcome.encode()?)?;
    if config.compress {
        socket.begin_compression();
    }
    log::info!(
        "slot {slot} taken by [{}]{}",
        socket.text_address(),
        if spectator { " as spectator" } else { "" }
    );
    Ok(spectator)
}

/// Waits for the host to start the match. Frames that arrive right behind
/// the start stay in the peer's decoder.
fn wait_for_start(peer: &mut Peer) -> Result<u32> {
    let mut set = SocketSet::new();
    set.add(&peer.socket);
    loop {
        set.check(Duration::from_millis(100))?;
        if peer.socket.read_ready() && !pump(&mut peer.socket, &mut peer.decoder)? {
            bail!("host disconnected before the match started");
        }
        while let Some(frame) = peer.decoder.next_frame()? {
            match frame.message {
                Message::Start { spectators } => return Ok(spectators),
                other => log::debug!("ignoring {:?} before start", other.kind()),
            }
        }
    }
}
