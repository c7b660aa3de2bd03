pub mod clock;
pub mod net;
pub mod protocol;
pub mod sync_log;

pub use clock::{
    ClockConfig, ClockError, ClockState, GAME_TICKS_PER_SEC, GAME_TICKS_PER_UPDATE,
    LatencyNegotiator, LatencyPolicy, LockstepClock, MAX_CONNECTED_PLAYERS, MAX_PLAYERS,
    MAX_TIMING_SLOTS, ManualTimeSource, MonotonicClock, PlayerSlot, Rational, SlotFlags,
    TimeSource, WaitingStatus,
};
pub use net::{
    ReadStatus, Socket, SocketError, SocketId, SocketSet, TrafficStats, Transport,
    TransportConfig, resolve_host,
};
pub use protocol::{
    DEFAULT_PORT, Frame, FrameDecoder, GameTimeMessage, Message, MessageKind, ProtocolError,
};
pub use sync_log::{SyncCheck, SyncLog};
