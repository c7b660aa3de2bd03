mod address;
mod compression;
mod error;
mod set;
mod socket;
mod stats;
mod sys;
mod transport;
mod writer;

pub use address::{LISTENING_ADDRESS, address_to_text, ip_to_text, resolve_host};
pub use compression::{DEFAULT_LEVEL, Deflater, Inflater, StreamCompression};
pub use error::{CompressionError, SocketError};
pub use set::SocketSet;
pub use socket::{ReadStatus, Socket, SocketId};
pub use stats::TrafficStats;
pub use transport::{Transport, TransportConfig};
