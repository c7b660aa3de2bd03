use std::collections::BTreeMap;
use std::io::{self, Write};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use parking_lot::{Condvar, Mutex, MutexGuard};

use super::socket::{SocketId, SocketShared};
use super::sys::{AsPollHandle, Interest, Native, PlatformSockets, PollEntry};

/// Counting semaphore.
pub(crate) struct Semaphore {
    count: Mutex<usize>,
    cond: Condvar,
}

impl Semaphore {
    pub fn new() -> Self {
        Self {
            count: Mutex::new(0),
            cond: Condvar::new(),
        }
    }

    pub fn post(&self) {
        *self.count.lock() += 1;
        self.cond.notify_one();
    }

    pub fn wait(&self) {
        let mut count = self.count.lock();
        while *count == 0 {
            self.cond.wait(&mut count);
        }
        *count -= 1;
    }
}

struct PendingWrite {
    /// Keeps the handle open until the data is out, even after the owning
    /// `Socket` is gone.
    socket: Arc<SocketShared>,
    data: Vec<u8>,
    close_when_drained: bool,
}

#[derive(Default)]
struct WriterState {
    quit: bool,
    pending: BTreeMap<SocketId, PendingWrite>,
}

pub(crate) struct WriteQueue {
    state: Mutex<WriterState>,
    semaphore: Semaphore,
    idle_poll: Duration,
}

impl WriteQueue {
    pub fn new(idle_poll: Duration) -> Self {
        Self {
            state: Mutex::new(WriterState::default()),
            semaphore: Semaphore::new(),
            idle_poll,
        }
    }

    pub fn enqueue(&self, socket: &Arc<SocketShared>, data: &[u8]) {
        let mut state = self.state.lock();
        if state.quit {
            log::debug!("socket {}: writer stopped, dropping {} bytes", socket.id, data.len());
            return;
        }

        let was_empty = state.pending.is_empty();
        state
            .pending
            .entry(socket.id)
            .or_insert_with(|| PendingWrite {
                socket: Arc::clone(socket),
                data: Vec::new(),
                close_when_drained: false,
            })
            .data
            .extend_from_slice(data);

        if was_empty {
            self.semaphore.post();
        }
    }

    /// Marks the socket to be closed once its queue drains. Returns false when
    /// nothing is queued and the caller can close right away.
    pub fn close_when_drained(&self, id: SocketId) -> bool {
        let mut state = self.state.lock();
        match state.pending.get_mut(&id) {
            Some(entry) => {
                entry.close_when_drained = true;
                true
            }
            None => false,
        }
    }

    pub fn queued_bytes(&self, id: SocketId) -> usize {
        self.state
            .lock()
            .pending
            .get(&id)
            .map_or(0, |entry| entry.data.len())
    }

    pub fn has_pending(&self) -> bool {
        !self.state.lock().pending.is_empty()
    }

    /// Tells the writer thread to exit and drops everything still queued.
    pub fn quit(&self) {
        let mut state = self.state.lock();
        state.quit = true;
        let dropped: usize = state.pending.values().map(|entry| entry.data.len()).sum();
        if dropped > 0 {
            log::debug!("writer quitting with {dropped} unsent bytes");
        }
        state.pending.clear();
        drop(state);
        self.semaphore.post();
    }

    /// Body of the writer thread.
    pub fn run(&self) {
        log::debug!("writer thread started");
        let mut state = self.state.lock();

        while !state.quit {
            if state.pending.is_empty() {
                MutexGuard::unlocked(&mut state, || self.semaphore.wait());
                continue;
            }

            let sockets: Vec<Arc<SocketShared>> = state
                .pending
                .values()
                .map(|entry| Arc::clone(&entry.socket))
                .collect();

            let writable = MutexGuard::unlocked(&mut state, || self.wait_writable(&sockets));
            if state.quit {
                break;
            }

            for id in writable {
                if let Some(entry) = state.pending.get_mut(&id) {
                    if send_pending(entry) {
                        continue;
                    }
                }
                if let Some(entry) = state.pending.remove(&id) {
                    if entry.close_when_drained {
                        log::debug!("socket {id}: closing after queue drained");
                    }
                }
            }
        }

        log::debug!("writer thread stopped");
    }

    fn wait_writable(&self, sockets: &[Arc<SocketShared>]) -> Vec<SocketId> {
        let targets: Vec<(SocketId, &SocketShared)> = sockets
            .iter()
            .filter_map(|socket| socket.stream().map(|_| (socket.id, socket.as_ref())))
            .collect();

        let mut entries: Vec<PollEntry<'_>> = targets
            .iter()
            .filter_map(|(_, socket)| socket.stream())
            .map(|stream| PollEntry::new(stream.poll_handle(), Interest::Write))
            .collect();

        match Native::poll(&mut entries, self.idle_poll) {
            Ok(0) => Vec::new(),
            Ok(_) => targets
                .iter()
                .zip(entries.iter())
                .filter(|(_, entry)| entry.ready)
                .map(|((id, _), _)| *id)
                .collect(),
            Err(err) => {
                log::error!("poll on queued sockets failed: {err}");
                // Back off instead of spinning on a persistent error.
                std::thread::sleep(self.idle_poll);
                Vec::new()
            }
        }
    }
}

/// Sends what the socket accepts without blocking. Returns true while the
/// entry should stay queued.
fn send_pending(entry: &mut PendingWrite) -> bool {
    let socket = &entry.socket;
    let Some(mut stream) = socket.stream() else {
        socket.write_failed.store(true, Ordering::Release);
        return false;
    };

    loop {
        match stream.write(&entry.data) {
            Ok(0) => {
                log::debug!("socket {}: send wrote nothing", socket.id);
                socket.write_failed.store(true, Ordering::Release);
                return false;
            }
            Ok(n) => {
                entry.data.drain(..n);
                return !entry.data.is_empty();
            }
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                if socket.connection_is_open() {
                    return true;
                }
                log::debug!("socket {}: peer went away with data queued", socket.id);
                socket.write_failed.store(true, Ordering::Release);
                return false;
            }
            Err(err) => {
                log::debug!("socket {}: send failed: {err}", socket.id);
                socket.write_failed.store(true, Ordering::Release);
                return false;
            }
        }
    }
}
