//! TCP control plane
//!
//! Length-prefixed messages on a TCP connection to the negotiated control
//! port. A worker sends a BANG every keepalive interval and declares the
//! connection lost when the peer stays silent past the timeout.

pub mod client;
pub mod message;

pub use client::{ControlListener, ControlPlane};
pub use message::{ControlMessage, ControlType};
