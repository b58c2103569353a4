//! Takion transport
//!
//! SCTP-like association over two connected UDP sockets: a four-way
//! INIT/COOKIE handshake on the control port for legacy peers, then framed
//! DATA, input and feedback chunks on both ports.

pub mod connection;
pub mod message;
pub mod state;

pub use connection::{TakionConnection, TakionListener, TakionStats};
pub use message::{ChunkType, DataKind, PacketType, TakionMessage};
pub use state::TakionState;
