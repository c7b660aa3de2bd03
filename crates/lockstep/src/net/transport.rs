use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use socket2::{Domain, Protocol, SockAddr, Type};

use super::compression::DEFAULT_LEVEL;
use super::error::SocketError;
use super::socket::Socket;
use super::sys::{AsPollHandle, Interest, Native, PlatformSockets, PollEntry};
use super::writer::WriteQueue;

#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// How long the writer waits for writability before looking at its queue
    /// again.
    pub idle_poll: Duration,
    pub listen_backlog: i32,
    pub compression_level: u32,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            idle_poll: Duration::from_millis(50),
            listen_backlog: 5,
            compression_level: DEFAULT_LEVEL,
        }
    }
}

/// Owns the writer thread. Every socket is created through a transport and
/// queues its outbound data on it.
pub struct Transport {
    config: TransportConfig,
    queue: Arc<WriteQueue>,
    writer: Option<JoinHandle<()>>,
}

impl Transport {
    pub fn start(config: TransportConfig) -> io::Result<Self> {
        let queue = Arc::new(WriteQueue::new(config.idle_poll));
        let writer = {
            let queue = Arc::clone(&queue);
            thread::Builder::new()
                .name("lockstep-writer".into())
                .spawn(move || queue.run())?
        };

        Ok(Self {
            config,
            queue,
            writer: Some(writer),
        })
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    pub fn has_pending_writes(&self) -> bool {
        self.queue.has_pending()
    }

    /// Connects to `addr`, waiting at most `timeout` for the handshake. A zero
    /// timeout only succeeds if the connection completes immediately.
    pub fn open(&self, addr: SocketAddr, timeout: Duration) -> Result<Socket, SocketError> {
        let raw = socket2::Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
            .map_err(|err| {
                log::error!("failed to create a socket for {addr}: {err}");
                SocketError::from(err)
            })?;
        raw.set_nonblocking(true)?;
        if let Err(err) = Native::suppress_sigpipe(&raw) {
            log::info!("failed to suppress SIGPIPE, a broken connection may raise it: {err}");
        }

        match raw.connect(&SockAddr::from(addr)) {
            Ok(()) => {}
            Err(err) if Native::connect_in_progress(&err) && !timeout.is_zero() => {
                let mut entries = [PollEntry::new(raw.poll_handle(), Interest::Write)];
                if Native::poll(&mut entries, timeout)? == 0 {
                    log::debug!("timed out connecting to {addr}");
                    return Err(SocketError::TimedOut);
                }
                if let Some(err) = raw.take_error()? {
                    log::debug!("failed to connect to {addr}: {err}");
                    return Err(err.into());
                }
            }
            Err(err) => {
                log::debug!("failed to start connecting to {addr}: {err}");
                return Err(err.into());
            }
        }

        let stream: TcpStream = raw.into();
        let peer = stream.peer_addr()?;
        let socket = Socket::from_stream(
            stream,
            &peer,
            Arc::clone(&self.queue),
            self.config.compression_level,
        );
        log::debug!("connected to [{}], socket {}", socket.text_address(), socket.id());
        Ok(socket)
    }

    pub fn open_any(&self, addrs: &[SocketAddr], timeout: Duration) -> Result<Socket, SocketError> {
        let mut last = SocketError::InvalidSocket;
        for addr in addrs {
            match self.open(*addr, timeout) {
                Ok(socket) => return Ok(socket),
                Err(err) => last = err,
            }
        }
        Err(last)
    }

    /// Opens up to `max` connections, one per address, skipping addresses that
    /// fail.
    pub fn open_array(&self, addrs: &[SocketAddr], max: usize, timeout: Duration) -> Vec<Socket> {
        let mut sockets = Vec::with_capacity(max.min(addrs.len()));
        for addr in addrs {
            if sockets.len() == max {
                break;
            }
            match self.open(*addr, timeout) {
                Ok(socket) => sockets.push(socket),
                Err(err) => log::debug!("skipping {addr}: {err}"),
            }
        }
        sockets
    }

    /// Listens on every local IPv4 and IPv6 address. If the IPv6 socket also
    /// takes IPv4 connections, only that one is used.
    pub fn listen(&self, port: u16) -> Result<Socket, SocketError> {
        let v6 = self.listener(SocketAddr::from((Ipv6Addr::UNSPECIFIED, port)));
        let dual_stack = matches!(v6, Ok((_, true)));
        let v6 = v6.map(|(listener, _)| listener);

        let v4 = if dual_stack {
            log::debug!("IPv4 to IPv6 mapping enabled, skipping the IPv4 listener");
            None
        } else {
            match self.listener(SocketAddr::from((Ipv4Addr::UNSPECIFIED, port))) {
                Ok((listener, _)) => Some(listener),
                Err(err) => {
                    log::error!("failed to set up IPv4 socket for listening on port {port}: {err}");
                    None
                }
            }
        };

        let v6 = match v6 {
            Ok(listener) => Some(listener),
            Err(err) => {
                log::error!("failed to set up IPv6 socket for listening on port {port}: {err}");
                if v4.is_none() {
                    return Err(err.into());
                }
                None
            }
        };

        let socket = Socket::listening(
            v4,
            v6,
            Arc::clone(&self.queue),
            self.config.compression_level,
        );
        log::debug!("listening on port {port}, socket {}", socket.id());
        Ok(socket)
    }

    /// Returns the listener and whether it accepts both address families.
    fn listener(&self, addr: SocketAddr) -> io::Result<(TcpListener, bool)> {
        let raw = socket2::Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;

        let mut dual_stack = false;
        if addr.is_ipv6() {
            match raw.set_only_v6(false) {
                Ok(()) => dual_stack = true,
                Err(err) => log::info!(
                    "failed to enable IPv4 to IPv6 mapping, falling back to two sockets: {err}"
                ),
            }
        }
        if let Err(err) = raw.set_reuse_address(true) {
            log::warn!("failed to set SO_REUSEADDR on {addr}: {err}");
        }

        raw.bind(&SockAddr::from(addr))?;
        raw.listen(self.config.listen_backlog)?;
        raw.set_nonblocking(true)?;

        Ok((raw.into(), dual_stack))
    }

    /// Stops the writer thread. Anything still queued is dropped.
    pub fn shutdown(&mut self) {
        let Some(writer) = self.writer.take() else {
            return;
        };
        self.queue.quit();
        if writer.join().is_err() {
            log::error!("writer thread panicked");
        }
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.shutdown();
    }
}
