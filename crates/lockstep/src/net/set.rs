use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};
use std::time::Duration;

use super::error::SocketError;
use super::socket::{Socket, SocketId, SocketShared};
use super::sys::{Interest, Native, PlatformSockets, PollEntry};

/// Sockets polled together for read readiness. Membership does not keep a
/// socket alive; closed sockets drop out on the next check.
#[derive(Default)]
pub struct SocketSet {
    members: Vec<Weak<SocketShared>>,
}

impl SocketSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `socket`. Returns false if it was already a member.
    pub fn add(&mut self, socket: &Socket) -> bool {
        if self.contains(socket.id()) {
            return false;
        }
        self.members.push(Arc::downgrade(socket.shared()));
        true
    }

    pub fn remove(&mut self, id: SocketId) -> bool {
        let before = self.members.len();
        self.members
            .retain(|member| member.upgrade().is_some_and(|shared| shared.id != id));
        self.members.len() != before
    }

    pub fn contains(&self, id: SocketId) -> bool {
        self.members
            .iter()
            .filter_map(Weak::upgrade)
            .any(|shared| shared.id == id)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Updates every member's read-ready flag and returns how many are ready.
    ///
    /// A compressed socket with decoded bytes still waiting is ready without
    /// touching the network, and in that case nothing is polled at all and
    /// every other member reads as not ready. An empty set returns at once.
    pub fn check(&mut self, timeout: Duration) -> Result<usize, SocketError> {
        self.members.retain(|member| {
            member
                .upgrade()
                .is_some_and(|shared| !shared.closed.load(Ordering::Acquire))
        });
        let live: Vec<Arc<SocketShared>> = self.members.iter().filter_map(Weak::upgrade).collect();
        if live.is_empty() {
            return Ok(0);
        }

        let buffered = live
            .iter()
            .filter(|shared| shared.decoded_pending.load(Ordering::Acquire))
            .count();
        if buffered > 0 {
            for shared in &live {
                let pending = shared.decoded_pending.load(Ordering::Acquire);
                shared.ready.store(pending, Ordering::Release);
            }
            return Ok(buffered);
        }

        let mut owners = Vec::new();
        let mut entries = Vec::new();
        for (index, shared) in live.iter().enumerate() {
            for handle in shared.read_handles() {
                owners.push(index);
                entries.push(PollEntry::new(handle, Interest::Read));
            }
        }

        Native::poll(&mut entries, timeout)?;

        for shared in &live {
            shared.ready.store(false, Ordering::Release);
        }
        for (owner, entry) in owners.iter().zip(entries.iter()) {
            if entry.ready {
                live[*owner].ready.store(true, Ordering::Release);
            }
        }

        Ok(live
            .iter()
            .filter(|shared| shared.ready.load(Ordering::Acquire))
            .count())
    }
}

impl std::fmt::Debug for SocketSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SocketSet")
            .field("members", &self.members.len())
            .finish()
    }
}
