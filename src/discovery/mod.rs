//! LAN discovery and wake
//!
//! Broadcasts `SRCH` probes to both console families, parses the HTTP-like
//! replies into [`HostRecord`]s keyed by host id, and sends `WAKEUP`
//! packets to hosts in standby.

pub mod protocol;
pub mod service;
pub mod wake;

pub use protocol::{DeviceType, DiscoveryResponse, HostRecord};
pub use service::{DiscoveryListener, DiscoveryService};
pub use wake::{build_wake_packet, wake};
