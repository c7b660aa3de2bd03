//! Platform socket primitives.
//!
//! Everything above this module is platform-free: the readiness loop, the
//! writer thread and the socket wrapper all go through [`PlatformSockets`].

use std::io;
use std::time::Duration;

#[cfg(unix)]
mod unix;
#[cfg(windows)]
mod windows;

#[cfg(unix)]
pub(crate) use unix::{Handle, UnixSockets as Native};
#[cfg(windows)]
pub(crate) use windows::{Handle, WindowsSockets as Native};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Interest {
    Read,
    Write,
}

/// One handle to wait on, and whether it came back ready.
pub(crate) struct PollEntry<'a> {
    pub handle: Handle<'a>,
    pub interest: Interest,
    pub ready: bool,
}

impl<'a> PollEntry<'a> {
    pub fn new(handle: Handle<'a>, interest: Interest) -> Self {
        Self {
            handle,
            interest,
            ready: false,
        }
    }
}

/// Anything that can sit in a [`PollEntry`].
pub(crate) trait AsPollHandle {
    fn poll_handle(&self) -> Handle<'_>;
}

#[cfg(unix)]
impl<T: std::os::fd::AsFd> AsPollHandle for T {
    fn poll_handle(&self) -> Handle<'_> {
        self.as_fd()
    }
}

#[cfg(windows)]
impl<T: std::os::windows::io::AsSocket> AsPollHandle for T {
    fn poll_handle(&self) -> Handle<'_> {
        self.as_socket()
    }
}

pub(crate) trait PlatformSockets {
    /// Waits until at least one entry is ready or `timeout` elapses, then
    /// sets every entry's `ready` flag. Interrupted waits are restarted.
    fn poll(entries: &mut [PollEntry<'_>], timeout: Duration) -> io::Result<usize>;

    /// True when a non-blocking `connect` reported that it is still running.
    fn connect_in_progress(err: &io::Error) -> bool;

    /// Makes sure a broken connection never raises a signal on write.
    fn suppress_sigpipe(socket: &socket2::Socket) -> io::Result<()>;
}
