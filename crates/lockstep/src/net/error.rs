use std::io;

#[derive(Debug, thiserror::Error)]
pub enum CompressionError {
    #[error("deflate failed: {0}")]
    Deflate(#[from] flate2::CompressError),
    #[error("inflate failed: {0}")]
    Inflate(#[from] flate2::DecompressError),
}

/// Socket failures, translated from the platform error codes.
///
/// `Interrupted` exists so the translation is total, but every call site in
/// this crate retries on it; callers never observe it.
#[derive(Debug, thiserror::Error)]
pub enum SocketError {
    #[error("operation would block")]
    WouldBlock,
    #[error("interrupted system call")]
    Interrupted,
    #[error("connection reset by peer")]
    ConnectionReset,
    #[error("timed out")]
    TimedOut,
    #[error("address already in use")]
    AddrInUse,
    #[error("socket has a failed write, no further writes are possible")]
    WriteFailed,
    #[error("invalid socket for this operation")]
    InvalidSocket,
    #[error("compression: {0}")]
    Compression(#[from] CompressionError),
    #[error("{0}")]
    Failed(#[source] io::Error),
}

impl SocketError {
    /// Transient errors are retried by the transport and are not a reason to
    /// give up on a connection.
    pub fn is_transient(&self) -> bool {
        matches!(self, SocketError::WouldBlock | SocketError::Interrupted)
    }
}

impl From<io::Error> for SocketError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::WouldBlock => SocketError::WouldBlock,
            io::ErrorKind::Interrupted => SocketError::Interrupted,
            io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::NotConnected => SocketError::ConnectionReset,
            io::ErrorKind::TimedOut => SocketError::TimedOut,
            io::ErrorKind::AddrInUse => SocketError::AddrInUse,
            _ => SocketError::Failed(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_errors_map_to_taxonomy() {
        let cases = [
            (io::ErrorKind::WouldBlock, "would block"),
            (io::ErrorKind::ConnectionReset, "reset"),
            (io::ErrorKind::BrokenPipe, "reset"),
            (io::ErrorKind::TimedOut, "timed out"),
            (io::ErrorKind::AddrInUse, "in use"),
        ];
        for (kind, needle) in cases {
            let err = SocketError::from(io::Error::from(kind));
            assert!(err.to_string().contains(needle), "{kind:?} -> {err}");
        }
    }

    #[test]
    fn test_unknown_errors_keep_their_source() {
        let err = SocketError::from(io::Error::new(io::ErrorKind::Other, "boom"));
        match err {
            SocketError::Failed(source) => assert_eq!(source.to_string(), "boom"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_transient_classification() {
        assert!(SocketError::WouldBlock.is_transient());
        assert!(SocketError::Interrupted.is_transient());
        assert!(!SocketError::ConnectionReset.is_transient());
        assert!(!SocketError::WriteFailed.is_transient());
    }
}
