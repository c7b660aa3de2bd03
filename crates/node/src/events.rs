#[derive(Debug, Clone)]
pub enum NodeEvent {
    PeerJoined {
        slot: usize,
        address: String,
        spectator: bool,
    },
    PeerLeft {
        slot: usize,
        reason: LeaveReason,
    },
    MatchStarted {
        players: usize,
    },
    Waiting {
        slot: usize,
        waited_ms: u64,
    },
    Desync {
        slots: Vec<usize>,
        time: u32,
    },
    Error {
        message: String,
    },
}

#[derive(Debug, Clone, Copy)]
pub enum LeaveReason {
    Graceful,
    Disconnected,
    WriteFailed,
}

impl LeaveReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            LeaveReason::Graceful => "left",
            LeaveReason::Disconnected => "disconnected",
            LeaveReason::WriteFailed => "stopped accepting data",
        }
    }
}
