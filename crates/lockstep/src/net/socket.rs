use std::io::{self, Read};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use socket2::SockRef;

use super::address::{LISTENING_ADDRESS, address_to_text};
use super::compression::StreamCompression;
use super::error::SocketError;
use super::stats::TrafficStats;
use super::sys::{AsPollHandle, Handle, Interest, Native, PlatformSockets, PollEntry};
use super::writer::WriteQueue;

pub type SocketId = u64;

static NEXT_SOCKET_ID: AtomicU64 = AtomicU64::new(1);

/// Extra room for compressed input on top of the caller's buffer size.
const INFLATE_READ_SLACK: usize = 1000;

pub(crate) enum Handles {
    Connection(TcpStream),
    /// Up to one listener per address family. When the IPv6 listener also
    /// accepts mapped IPv4 connections the IPv4 one is left out.
    Listening {
        v4: Option<TcpListener>,
        v6: Option<TcpListener>,
    },
}

/// The part of a socket that the writer thread and socket sets can see.
pub(crate) struct SocketShared {
    pub id: SocketId,
    pub handles: Handles,
    pub ready: AtomicBool,
    pub write_failed: AtomicBool,
    /// A compressed socket holds decoded bytes that have not been read yet.
    pub decoded_pending: AtomicBool,
    pub closed: AtomicBool,
}

impl SocketShared {
    fn new(handles: Handles) -> Self {
        Self {
            id: NEXT_SOCKET_ID.fetch_add(1, Ordering::Relaxed),
            handles,
            ready: AtomicBool::new(false),
            write_failed: AtomicBool::new(false),
            decoded_pending: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    pub fn stream(&self) -> Option<&TcpStream> {
        match &self.handles {
            Handles::Connection(stream) => Some(stream),
            Handles::Listening { .. } => None,
        }
    }

    pub fn read_handles(&self) -> Vec<Handle<'_>> {
        match &self.handles {
            Handles::Connection(stream) => vec![stream.poll_handle()],
            Handles::Listening { v4, v6 } => [v4, v6]
                .into_iter()
                .flatten()
                .map(|listener| listener.poll_handle())
                .collect(),
        }
    }

    /// Checks whether the peer is still there without consuming data.
    ///
    /// A readable socket with nothing to peek at has been closed by the peer.
    pub fn connection_is_open(&self) -> bool {
        let Some(stream) = self.stream() else {
            return false;
        };

        let mut entries = [PollEntry::new(stream.poll_handle(), Interest::Read)];
        match Native::poll(&mut entries, Duration::ZERO) {
            Err(err) => {
                log::debug!("socket {}: poll failed: {err}", self.id);
                false
            }
            Ok(_) if !entries[0].ready => true,
            Ok(_) => {
                let mut byte = [0u8; 1];
                match stream.peek(&mut byte) {
                    Ok(0) => {
                        log::debug!("socket {}: read queue empty, peer is gone", self.id);
                        false
                    }
                    Ok(_) => true,
                    Err(err) if err.kind() == io::ErrorKind::WouldBlock => true,
                    Err(err) => {
                        log::debug!("socket {}: {err}", self.id);
                        false
                    }
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadStatus {
    Data(usize),
    /// Nothing to hand out right now; try again after the next readiness check.
    Pending,
    Disconnected,
}

/// A non-blocking TCP connection or listener.
///
/// Writes never block: uncompressed data is queued for the writer thread,
/// compressed data is held in the deflate stage until [`Socket::flush`].
/// Dropping a socket with queued data closes it once the queue drains.
pub struct Socket {
    shared: Arc<SocketShared>,
    queue: Arc<WriteQueue>,
    text_address: String,
    compression_level: u32,
    compression: Option<Box<StreamCompression>>,
    read_disconnected: bool,
    stats: TrafficStats,
}

impl Socket {
    pub(crate) fn from_stream(
        stream: TcpStream,
        peer: &SocketAddr,
        queue: Arc<WriteQueue>,
        compression_level: u32,
    ) -> Self {
        Self {
            shared: Arc::new(SocketShared::new(Handles::Connection(stream))),
            queue,
            text_address: address_to_text(peer),
            compression_level,
            compression: None,
            read_disconnected: false,
            stats: TrafficStats::default(),
        }
    }

    pub(crate) fn listening(
        v4: Option<TcpListener>,
        v6: Option<TcpListener>,
        queue: Arc<WriteQueue>,
        compression_level: u32,
    ) -> Self {
        Self {
            shared: Arc::new(SocketShared::new(Handles::Listening { v4, v6 })),
            queue,
            text_address: LISTENING_ADDRESS.to_string(),
            compression_level,
            compression: None,
            read_disconnected: false,
            stats: TrafficStats::default(),
        }
    }

    pub(crate) fn shared(&self) -> &Arc<SocketShared> {
        &self.shared
    }

    pub fn id(&self) -> SocketId {
        self.shared.id
    }

    pub fn text_address(&self) -> &str {
        &self.text_address
    }

    pub fn is_listening(&self) -> bool {
        matches!(self.shared.handles, Handles::Listening { .. })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        match &self.shared.handles {
            Handles::Connection(stream) => stream.local_addr(),
            Handles::Listening { v4, v6 } => v6
                .as_ref()
                .or(v4.as_ref())
                .map_or_else(|| Err(io::ErrorKind::NotConnected.into()), |l| l.local_addr()),
        }
    }

    /// Set by the last readiness check.
    pub fn read_ready(&self) -> bool {
        self.shared.ready.load(Ordering::Acquire)
    }

    /// True once a read saw the peer close its side.
    pub fn read_disconnected(&self) -> bool {
        self.read_disconnected
    }

    pub fn write_failed(&self) -> bool {
        self.shared.write_failed.load(Ordering::Acquire)
    }

    pub fn is_compressed(&self) -> bool {
        self.compression.is_some()
    }

    pub fn stats(&self) -> TrafficStats {
        self.stats
    }

    /// Bytes handed to the writer thread that are not on the wire yet.
    pub fn queued_bytes(&self) -> usize {
        self.queue.queued_bytes(self.shared.id)
    }

    pub fn connection_is_open(&self) -> bool {
        self.shared.connection_is_open()
    }

    /// Switches both directions to DEFLATE. Both peers must do this at the
    /// same point in the byte stream.
    pub fn begin_compression(&mut self) {
        if self.compression.is_some() {
            return;
        }
        log::debug!("socket {}: compression enabled", self.shared.id);
        self.compression = Some(Box::new(StreamCompression::new(self.compression_level)));
    }

    /// Accepts one pending connection, if any listener has one.
    pub fn accept(&self) -> Option<Socket> {
        let Handles::Listening { v4, v6 } = &self.shared.handles else {
            log::error!("socket {}: accept on a connection", self.shared.id);
            return None;
        };

        for listener in [v4, v6].into_iter().flatten() {
            match listener.accept() {
                Ok((stream, addr)) => {
                    self.shared.ready.store(false, Ordering::Release);
                    if let Err(err) = configure_stream(&stream) {
                        log::debug!("couldn't make connection from {addr} non-blocking: {err}");
                        return None;
                    }
                    let socket = Socket::from_stream(
                        stream,
                        &addr,
                        Arc::clone(&self.queue),
                        self.compression_level,
                    );
                    log::debug!(
                        "incoming connection from [{}], socket {}",
                        socket.text_address,
                        socket.id()
                    );
                    return Some(socket);
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => continue,
                Err(err) => {
                    log::error!("accept failed for socket {}: {err}", self.shared.id);
                    continue;
                }
            }
        }

        None
    }

    /// Non-blocking read.
    ///
    /// On a compressed socket at most one `recv` happens per call and the
    /// result may be shorter than what is pending; call again while
    /// [`Socket::read_ready`] stays set.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<ReadStatus, SocketError> {
        let stream = self.shared.stream().ok_or_else(|| {
            log::error!("socket {}: read on a listening socket", self.shared.id);
            SocketError::InvalidSocket
        })?;
        self.shared.ready.store(false, Ordering::Release);

        if let Some(compression) = self.compression.as_deref_mut() {
            let mut raw = 0;
            if compression.inflate.needs_input() {
                let mut chunk = vec![0u8; buf.len() + INFLATE_READ_SLACK];
                match recv(stream, &mut chunk) {
                    Ok(0) => self.read_disconnected = true,
                    Ok(n) => {
                        compression.inflate.feed(&chunk[..n]);
                        raw = n;
                    }
                    Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                        return Ok(ReadStatus::Pending);
                    }
                    Err(err) => return Err(err.into()),
                }
            }

            let produced = compression.inflate.drain(buf).map_err(|err| {
                log::error!("couldn't decompress data from socket {}: {err}", self.shared.id);
                SocketError::from(err)
            })?;
            self.shared
                .decoded_pending
                .store(!compression.inflate.needs_input(), Ordering::Release);
            self.stats.record_received(produced, raw);

            return Ok(if produced > 0 {
                ReadStatus::Data(produced)
            } else if self.read_disconnected {
                ReadStatus::Disconnected
            } else {
                ReadStatus::Pending
            });
        }

        match recv(stream, buf) {
            Ok(0) if !buf.is_empty() => {
                self.read_disconnected = true;
                Ok(ReadStatus::Disconnected)
            }
            Ok(n) => {
                self.stats.record_received(n, n);
                Ok(ReadStatus::Data(n))
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => Ok(ReadStatus::Pending),
            Err(err) => Err(err.into()),
        }
    }

    /// Reads exactly `buf.len()` bytes unless the peer disconnects first, in
    /// which case the short count is returned. Uncompressed sockets only.
    ///
    /// `None` waits as long as it takes.
    pub fn read_all(
        &mut self,
        buf: &mut [u8],
        timeout: Option<Duration>,
    ) -> Result<usize, SocketError> {
        if self.compression.is_some() {
            log::error!("socket {}: read_all on a compressed socket", self.shared.id);
            return Err(SocketError::InvalidSocket);
        }
        let stream = self.shared.stream().ok_or(SocketError::InvalidSocket)?;

        let wait = timeout.unwrap_or(Duration::MAX);
        let mut received = 0;
        while received < buf.len() {
            let mut entries = [PollEntry::new(stream.poll_handle(), Interest::Read)];
            if Native::poll(&mut entries, wait)? == 0 || !entries[0].ready {
                log::debug!("socket {}: timed out in read_all", self.shared.id);
                return Err(SocketError::TimedOut);
            }

            match recv(stream, &mut buf[received..]) {
                Ok(0) => {
                    log::debug!("socket {} disconnected", self.shared.id);
                    self.read_disconnected = true;
                    self.stats.record_received(received, received);
                    return Ok(received);
                }
                Ok(n) => received += n,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => continue,
                Err(err) => return Err(err.into()),
            }
        }
        self.shared.ready.store(false, Ordering::Release);

        self.stats.record_received(received, received);
        Ok(received)
    }

    /// Queues `data` for sending. Never blocks.
    ///
    /// Compressed sockets only buffer the data; it goes out on the next
    /// [`Socket::flush`].
    pub fn write_all(&mut self, data: &[u8]) -> Result<(), SocketError> {
        if self.shared.stream().is_none() {
            log::error!("socket {}: write on a listening socket", self.shared.id);
            return Err(SocketError::InvalidSocket);
        }
        if self.write_failed() {
            return Err(SocketError::WriteFailed);
        }
        if data.is_empty() {
            return Ok(());
        }

        match self.compression.as_deref_mut() {
            Some(compression) => {
                compression.deflate.feed(data)?;
                self.stats.record_sent(data.len(), 0);
            }
            None => {
                self.queue.enqueue(&self.shared, data);
                self.stats.record_sent(data.len(), data.len());
            }
        }

        Ok(())
    }

    /// Pushes buffered compressed data to the writer thread. No-op on
    /// uncompressed sockets.
    pub fn flush(&mut self) -> Result<(), SocketError> {
        let Some(compression) = self.compression.as_deref_mut() else {
            return Ok(());
        };

        let wire = compression.deflate.flush()?;
        if wire.is_empty() {
            return Ok(());
        }
        if self.shared.write_failed.load(Ordering::Acquire) {
            return Err(SocketError::WriteFailed);
        }

        self.queue.enqueue(&self.shared, &wire);
        self.stats.record_sent(0, wire.len());
        Ok(())
    }

    /// Closes the socket. If the writer thread still holds data for it the
    /// handle stays open until that data is sent or the send fails.
    pub fn close(self) {}
}

impl Drop for Socket {
    fn drop(&mut self) {
        self.shared.closed.store(true, Ordering::Release);
        if self.queue.close_when_drained(self.shared.id) {
            log::debug!("socket {}: close deferred until queue drains", self.shared.id);
        } else {
            log::debug!("socket {}: closed", self.shared.id);
        }
    }
}

impl std::fmt::Debug for Socket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Socket")
            .field("id", &self.shared.id)
            .field("address", &self.text_address)
            .field("compressed", &self.compression.is_some())
            .field("write_failed", &self.write_failed())
            .finish()
    }
}

pub(crate) fn configure_stream(stream: &TcpStream) -> io::Result<()> {
    stream.set_nonblocking(true)?;
    if let Err(err) = Native::suppress_sigpipe(&SockRef::from(stream)) {
        log::info!("failed to suppress SIGPIPE, a broken connection may raise it: {err}");
    }
    Ok(())
}

fn recv(mut stream: &TcpStream, buf: &mut [u8]) -> io::Result<usize> {
    loop {
        match stream.read(buf) {
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            result => return result,
        }
    }
}
