use std::io;
use std::os::fd::BorrowedFd;
use std::time::Duration;

use rustix::event::{PollFd, PollFlags};
use rustix::io::Errno;

use super::{Interest, PlatformSockets, PollEntry};

pub(crate) type Handle<'a> = BorrowedFd<'a>;

pub(crate) struct UnixSockets;

impl PlatformSockets for UnixSockets {
    fn poll(entries: &mut [PollEntry<'_>], timeout: Duration) -> io::Result<usize> {
        let timeout_ms = i32::try_from(timeout.as_millis()).unwrap_or(i32::MAX);
        let mut fds: Vec<PollFd<'_>> = entries
            .iter()
            .map(|entry| {
                let flags = match entry.interest {
                    Interest::Read => PollFlags::IN,
                    Interest::Write => PollFlags::OUT,
                };
                PollFd::from_borrowed_fd(entry.handle, flags)
            })
            .collect();

        let ready = loop {
            match rustix::event::poll(&mut fds, timeout_ms) {
                Ok(n) => break n,
                Err(err) if err == Errno::INTR => continue,
                Err(err) => return Err(err.into()),
            }
        };

        // Hang-ups and errors count as ready so the following read or write
        // surfaces the actual failure.
        let wanted = PollFlags::IN | PollFlags::OUT | PollFlags::HUP | PollFlags::ERR;
        for (entry, fd) in entries.iter_mut().zip(fds.iter()) {
            entry.ready = fd.revents().intersects(wanted);
        }

        Ok(ready)
    }

    fn connect_in_progress(err: &io::Error) -> bool {
        err.raw_os_error() == Some(Errno::INPROGRESS.raw_os_error())
            || err.kind() == io::ErrorKind::WouldBlock
    }

    #[cfg(any(
        target_os = "macos",
        target_os = "ios",
        target_os = "tvos",
        target_os = "watchos"
    ))]
    fn suppress_sigpipe(socket: &socket2::Socket) -> io::Result<()> {
        socket.set_nosigpipe(true)
    }

    // Elsewhere std already sends with MSG_NOSIGNAL.
    #[cfg(not(any(
        target_os = "macos",
        target_os = "ios",
        target_os = "tvos",
        target_os = "watchos"
    )))]
    fn suppress_sigpipe(_socket: &socket2::Socket) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::net::{TcpListener, TcpStream};
    use std::os::fd::AsFd;

    fn pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();
        (client, server)
    }

    #[test]
    fn test_poll_reports_readable_after_write() {
        let (mut client, server) = pair();

        let mut entries = [PollEntry::new(server.as_fd(), Interest::Read)];
        let n = UnixSockets::poll(&mut entries, Duration::ZERO).unwrap();
        assert_eq!(n, 0);
        assert!(!entries[0].ready);

        client.write_all(b"x").unwrap();
        let n = UnixSockets::poll(&mut entries, Duration::from_secs(1)).unwrap();
        assert_eq!(n, 1);
        assert!(entries[0].ready);
    }

    #[test]
    fn test_fresh_connection_is_writable() {
        let (client, _server) = pair();
        let mut entries = [PollEntry::new(client.as_fd(), Interest::Write)];
        UnixSockets::poll(&mut entries, Duration::from_secs(1)).unwrap();
        assert!(entries[0].ready);
    }

    #[test]
    fn test_in_progress_is_recognised() {
        let err = io::Error::from_raw_os_error(Errno::INPROGRESS.raw_os_error());
        assert!(UnixSockets::connect_in_progress(&err));
        assert!(!UnixSockets::connect_in_progress(&io::Error::from(
            io::ErrorKind::ConnectionRefused
        )));
    }
}
