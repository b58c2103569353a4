//! Platform abstractions
//!
//! Threads, synchronization, the monotonic clock and the stop-pipe
//! cancellation primitive that every socket wait in the crate goes through.

pub mod clock;
pub mod net;
pub mod stop_pipe;
pub mod sync;

pub use clock::{monotonic_ms, sleep_ms};
pub use net::{connect_tcp, ConnectErrorKind};
pub use stop_pipe::{EitherResult, SelectResult, StopPipe};
pub use sync::{Semaphore, Worker};

/// Mutex and condition variable used throughout the crate
pub use parking_lot::{Condvar, Mutex, ReentrantMutex};
