//! # Remote Play Client Core
//!
//! Network, session and media-pipeline core for a handheld remote play
//! client: LAN discovery and wake, HTTP session init, the Takion UDP
//! transport, the TCP control plane and UDP keepalive, and the video and
//! audio decode pipelines.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                         HOST APPLICATION                             │
//! │   discovery::DiscoveryService        session::Session ◀── SessionEvents
//! └──────────┬─────────────────────────────────┬─────────────────────────┘
//!            │ UDP broadcast :987/:9302        │
//!            ▼                                 ▼
//! ┌─────────────────────┐   ┌────────────────────────────────────────────┐
//! │ HostRecord list     │   │ session::init    HTTP GET  ─▶ SessionGrant │
//! │ wake (WAKEUP *)     │   │ control          TCP BANG / VERSION / ERR  │
//! └─────────────────────┘   │ keepalive        UDP KEEP:<ms> echo        │
//!                           │ takion           UDP control + stream      │
//!                           └───────────────────────┬────────────────────┘
//!                                                   │ DataKind + payload
//!                                                   ▼
//!                           ┌────────────────────────────────────────────┐
//!                           │ media::AvReceiver                          │
//!                           │   ├─▶ VideoPipeline  queue ▶ decode ▶ pool │
//!                           │   └─▶ AudioPipeline  queue ▶ decode ▶ pool │
//!                           └────────────────────────────────────────────┘
//! ```
//!
//! Every long-running component runs on named worker threads that block on
//! a [`platform::StopPipe`] and stop within a bounded join timeout.

pub mod codec;
pub mod config;
pub mod control;
pub mod diagnostics;
pub mod discovery;
pub mod error;
pub mod keepalive;
pub mod logging;
pub mod media;
pub mod network;
pub mod platform;
pub mod retry;
pub mod session;
pub mod takion;

pub use error::{Error, Result};

/// Protocol and pipeline constants
pub mod constants {
    /// Discovery and wake port of PS4-class consoles
    pub const DISCOVERY_PORT_PS4: u16 = 987;

    /// Discovery and wake port of PS5-class consoles
    pub const DISCOVERY_PORT_PS5: u16 = 9302;

    /// Upper bound on the discovery result list
    pub const MAX_DISCOVERED_HOSTS: usize = 16;

    /// Takion control socket, also the session-init HTTP port
    pub const TAKION_CONTROL_PORT: u16 = 9295;

    /// Takion stream socket
    pub const TAKION_STREAM_PORT: u16 = 9296;

    /// Advertised receiver window
    pub const TAKION_A_RWND: u32 = 102_400;

    pub const VIDEO_QUEUE_CAPACITY: usize = 32;
    pub const VIDEO_POOL_SIZE: usize = 3;

    /// Default sample rate for audio processing
    pub const DEFAULT_SAMPLE_RATE: u32 = 48_000;

    /// Default channel count (stereo)
    pub const DEFAULT_CHANNELS: u16 = 2;

    /// Audio frame duration in milliseconds
    pub const AUDIO_FRAME_MS: u32 = 20;

    pub const AUDIO_QUEUE_CAPACITY: usize = 32;
    pub const AUDIO_POOL_SIZE: usize = 8;
}
