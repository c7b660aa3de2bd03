use std::io;
use std::os::windows::io::{AsRawSocket, BorrowedSocket};
use std::thread;
use std::time::Duration;

use windows_sys::Win32::Networking::WinSock::{
    self, POLLERR, POLLHUP, POLLRDNORM, POLLWRNORM, SOCKET, SOCKET_ERROR, WSAEINPROGRESS,
    WSAEINTR, WSAEWOULDBLOCK, WSAPOLLFD,
};

use super::{Interest, PlatformSockets, PollEntry};

pub(crate) type Handle<'a> = BorrowedSocket<'a>;

pub(crate) struct WindowsSockets;

impl PlatformSockets for WindowsSockets {
    fn poll(entries: &mut [PollEntry<'_>], timeout: Duration) -> io::Result<usize> {
        // WSAPoll rejects an empty array.
        if entries.is_empty() {
            thread::sleep(timeout);
            return Ok(0);
        }

        let timeout_ms = i32::try_from(timeout.as_millis()).unwrap_or(i32::MAX);
        let mut fds: Vec<WSAPOLLFD> = entries
            .iter()
            .map(|entry| WSAPOLLFD {
                fd: entry.handle.as_raw_socket() as SOCKET,
                events: match entry.interest {
                    Interest::Read => POLLRDNORM,
                    Interest::Write => POLLWRNORM,
                },
                revents: 0,
            })
            .collect();

        let ready = loop {
            // SAFETY: `fds` is a live, correctly sized array of WSAPOLLFD and
            // every socket in it is borrowed for the duration of the call.
            let result =
                unsafe { WinSock::WSAPoll(fds.as_mut_ptr(), fds.len() as u32, timeout_ms) };
            if result != SOCKET_ERROR {
                break result as usize;
            }
            // SAFETY: reads the calling thread's last WinSock error.
            let code = unsafe { WinSock::WSAGetLastError() };
            if code != WSAEINTR as i32 {
                return Err(io::Error::from_raw_os_error(code));
            }
        };

        let wanted = POLLRDNORM | POLLWRNORM | POLLHUP | POLLERR;
        for (entry, fd) in entries.iter_mut().zip(fds.iter()) {
            entry.ready = fd.revents & wanted != 0;
        }

        Ok(ready)
    }

    fn connect_in_progress(err: &io::Error) -> bool {
        let code = err.raw_os_error();
        code == Some(WSAEWOULDBLOCK as i32)
            || code == Some(WSAEINPROGRESS as i32)
            || err.kind() == io::ErrorKind::WouldBlock
    }

    // Windows has no SIGPIPE.
    fn suppress_sigpipe(_socket: &socket2::Socket) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::net::{TcpListener, TcpStream};
    use std::os::windows::io::AsSocket;

    #[test]
    fn test_poll_reports_readable_after_write() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let mut client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();

        let mut entries = [PollEntry::new(server.as_socket(), Interest::Read)];
        assert_eq!(WindowsSockets::poll(&mut entries, Duration::ZERO).unwrap(), 0);

        client.write_all(b"x").unwrap();
        assert_eq!(WindowsSockets::poll(&mut entries, Duration::from_secs(1)).unwrap(), 1);
        assert!(entries[0].ready);
    }

    #[test]
    fn test_would_block_counts_as_in_progress() {
        let err = io::Error::from_raw_os_error(WSAEWOULDBLOCK as i32);
        assert!(WindowsSockets::connect_in_progress(&err));
        assert!(!WindowsSockets::connect_in_progress(&io::Error::from(
            io::ErrorKind::ConnectionRefused
        )));
    }
}
