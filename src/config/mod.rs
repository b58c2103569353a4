//! Configuration
//!
//! `AppConfig` is the typed runtime configuration, loaded from TOML.
//! User-facing persisted settings live in [`settings`].

pub mod settings;

use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use crate::constants::*;
use crate::error::ConfigError;

pub use settings::{ButtonMapping, QualityPreset, Resolution, Settings, SettingsIssue, Validation};

/// Console generation, which decides the Takion handshake path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PeerClass {
    /// PS4-class peers perform the full INIT/COOKIE exchange
    #[default]
    Legacy,
    /// PS5-class peers skip the handshake
    Ps5,
}

/// Complete runtime configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub network: NetworkConfig,
    pub discovery: DiscoveryConfig,
    pub takion: TakionConfig,
    pub control: ControlConfig,
    pub keepalive: KeepaliveConfig,
    pub video: VideoConfig,
    pub audio: AudioConfig,
    pub monitor: MonitorConfig,
    pub logging: LoggingConfig,
}

/// Network manager configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Refuse all network operations
    pub force_offline: bool,
    /// Fail instead of downgrading to offline when the stack cannot start
    pub require_network: bool,
    /// How long cached interface info stays fresh
    pub info_ttl_ms: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            force_offline: false,
            require_network: false,
            info_ttl_ms: 5_000,
        }
    }
}

/// LAN discovery configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    pub scan_interval_ms: u64,
    pub scan_timeout_ms: u64,
    pub broadcast_address: Ipv4Addr,
    /// Probe port for PS4-class consoles
    pub ps4_port: u16,
    /// Probe port for PS5-class consoles
    pub ps5_port: u16,
    pub max_hosts: usize,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            scan_interval_ms: 1_000,
            scan_timeout_ms: 10_000,
            broadcast_address: Ipv4Addr::BROADCAST,
            ps4_port: DISCOVERY_PORT_PS4,
            ps5_port: DISCOVERY_PORT_PS5,
            max_hosts: MAX_DISCOVERED_HOSTS,
        }
    }
}

/// Takion transport configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TakionConfig {
    pub control_port: u16,
    pub stream_port: u16,
    pub peer_class: PeerClass,
    /// Receive buffer size, also advertised as the INIT receive window
    pub a_rwnd: u32,
    pub send_buffer: usize,
    pub recv_timeout_ms: u64,
    pub send_timeout_ms: u64,
    /// Per-receive timeout during the handshake
    pub handshake_timeout_ms: u64,
    /// Silence allowed from the peer while mid-handshake
    pub timeout_ms: u64,
    /// Stale datagram drain window after connect
    pub drain_window_ms: u64,
    pub drain_poll_ms: u64,
    /// Receive loop poll interval
    pub poll_interval_ms: u64,
    pub outbound_streams: u16,
    pub inbound_streams: u16,
}

impl Default for TakionConfig {
    fn default() -> Self {
        Self {
            control_port: TAKION_CONTROL_PORT,
            stream_port: TAKION_STREAM_PORT,
            peer_class: PeerClass::Legacy,
            a_rwnd: TAKION_A_RWND,
            send_buffer: 64 * 1024,
            recv_timeout_ms: 30_000,
            send_timeout_ms: 10_000,
            handshake_timeout_ms: 5_000,
            timeout_ms: 10_000,
            drain_window_ms: 1_000,
            drain_poll_ms: 200,
            poll_interval_ms: 1_000,
            outbound_streams: 100,
            inbound_streams: 100,
        }
    }
}

/// TCP control plane configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    pub enabled: bool,
    pub port: u16,
    pub keepalive_interval_ms: u64,
    pub connection_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    /// Version string announced in VERSION_REQ
    pub client_version: String,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: TAKION_CONTROL_PORT,
            keepalive_interval_ms: 1_000,
            connection_timeout_ms: 10_000,
            connect_timeout_ms: 5_000,
            client_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// UDP session keepalive configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KeepaliveConfig {
    pub enabled: bool,
    pub port: u16,
    pub interval_ms: u64,
    pub max_failures: u32,
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: TAKION_CONTROL_PORT,
            interval_ms: 3_000,
            max_failures: 3,
        }
    }
}

/// Video pipeline configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VideoConfig {
    pub queue_capacity: usize,
    pub pool_size: usize,
    /// Capacity of each frame slot in bytes
    pub max_frame_bytes: usize,
}

impl Default for VideoConfig {
    fn default() -> Self {
        Self {
            queue_capacity: VIDEO_QUEUE_CAPACITY,
            pool_size: VIDEO_POOL_SIZE,
            max_frame_bytes: 1920 * 1080 * 3 / 2,
        }
    }
}

/// Audio pipeline configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    pub sample_rate: u32,
    pub channels: u16,
    pub frame_duration_ms: u32,
    pub queue_capacity: usize,
    pub pool_size: usize,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: DEFAULT_SAMPLE_RATE,
            channels: DEFAULT_CHANNELS,
            frame_duration_ms: AUDIO_FRAME_MS,
            queue_capacity: AUDIO_QUEUE_CAPACITY,
            pool_size: AUDIO_POOL_SIZE,
        }
    }
}

impl AudioConfig {
    /// Samples per channel in one frame
    pub fn samples_per_frame(&self) -> usize {
        (self.sample_rate * self.frame_duration_ms / 1000) as usize
    }

    /// PCM S16LE bytes needed for one frame
    pub fn frame_bytes(&self) -> usize {
        self.samples_per_frame() * self.channels as usize * 2
    }
}

/// Performance monitor configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub enabled: bool,
    pub interval_ms: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: 1_000,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Fallback filter when `RUST_LOG` is unset
    pub level: String,
    /// Optional log file, written in addition to stderr
    pub file: Option<PathBuf>,
    pub ansi: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
            ansi: true,
        }
    }
}

impl AppConfig {
    /// Default location of `config.toml`
    pub fn default_path() -> Result<PathBuf, ConfigError> {
        directories::ProjectDirs::from("com", "remoteplay", "remote-play-core")
            .map(|dirs| dirs.config_dir().join("config.toml"))
            .ok_or(ConfigError::NoConfigDir)
    }

    /// Load from the default location, falling back to defaults if absent
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::default_path()?;
        if !path.exists() {
            tracing::debug!("No config file at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        Self::load_from(&path)
    }

    /// Load and validate a TOML file
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let config: AppConfig = toml::from_str(&text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Write as TOML, creating parent directories
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        let text = toml::to_string_pretty(self).map_err(|e| ConfigError::Serialize(e.to_string()))?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| ConfigError::Write {
                path: parent.display().to_string(),
                source,
            })?;
        }
        std::fs::write(path, text).map_err(|source| ConfigError::Write {
            path: path.display().to_string(),
            source,
        })
    }

    /// Reject values the runtime cannot work with
    pub fn validate(&self) -> Result<(), ConfigError> {
        fn nonzero(field: &'static str, value: u64) -> Result<(), ConfigError> {
            if value == 0 {
                return Err(ConfigError::InvalidValue {
                    field,
                    reason: "must be greater than zero".into(),
                });
            }
            Ok(())
        }

        nonzero("discovery.scan_interval_ms", self.discovery.scan_interval_ms)?;
        nonzero("discovery.max_hosts", self.discovery.max_hosts as u64)?;
        nonzero("takion.a_rwnd", self.takion.a_rwnd as u64)?;
        nonzero("takion.handshake_timeout_ms", self.takion.handshake_timeout_ms)?;
        nonzero("takion.poll_interval_ms", self.takion.poll_interval_ms)?;
        nonzero("control.keepalive_interval_ms", self.control.keepalive_interval_ms)?;
        nonzero("keepalive.interval_ms", self.keepalive.interval_ms)?;
        nonzero("keepalive.max_failures", self.keepalive.max_failures as u64)?;
        nonzero("video.queue_capacity", self.video.queue_capacity as u64)?;
        nonzero("video.pool_size", self.video.pool_size as u64)?;
        nonzero("audio.queue_capacity", self.audio.queue_capacity as u64)?;
        nonzero("audio.pool_size", self.audio.pool_size as u64)?;
        nonzero("monitor.interval_ms", self.monitor.interval_ms)?;

        if !matches!(self.audio.channels, 1 | 2) {
            return Err(ConfigError::InvalidValue {
                field: "audio.channels",
                reason: format!("unsupported channel count {}", self.audio.channels),
            });
        }
        if !matches!(self.audio.sample_rate, 8_000 | 12_000 | 16_000 | 24_000 | 48_000) {
            return Err(ConfigError::InvalidValue {
                field: "audio.sample_rate",
                reason: format!("unsupported sample rate {}", self.audio.sample_rate),
            });
        }
        if !matches!(self.audio.frame_duration_ms, 10 | 20 | 40 | 60) {
            return Err(ConfigError::InvalidValue {
                field: "audio.frame_duration_ms",
                reason: format!("unsupported frame duration {}", self.audio.frame_duration_ms),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        assert!(AppConfig::default().validate().is_ok());
    }

    #[test]
    fn test_audio_frame_bytes() {
        let audio = AudioConfig::default();
        assert_eq!(audio.samples_per_frame(), 960);
        assert_eq!(audio.frame_bytes(), 960 * 2 * 2);
    }

    #[test]
    fn test_toml_roundtrip() {
        let mut config = AppConfig::default();
        config.takion.peer_class = PeerClass::Ps5;
        config.discovery.scan_timeout_ms = 3_000;
        config.logging.file = Some(PathBuf::from("/tmp/rp.log"));

        let text = toml::to_string_pretty(&config).unwrap();
        let parsed: AppConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let parsed: AppConfig = toml::from_str("[takion]\npeer_class = \"ps5\"\n").unwrap();
        assert_eq!(parsed.takion.peer_class, PeerClass::Ps5);
        assert_eq!(parsed.takion.control_port, TAKION_CONTROL_PORT);
        assert_eq!(parsed.audio, AudioConfig::default());
    }

    #[test]
    fn test_rejects_bad_channel_count() {
        let mut config = AppConfig::default();
        config.audio.channels = 6;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_save_and_load_file() {
        let path = std::env::temp_dir()
            .join(format!("rp-config-{}", uuid::Uuid::new_v4()))
            .join("config.toml");
        let config = AppConfig::default();
        config.save_to(&path).unwrap();
        assert_eq!(AppConfig::load_from(&path).unwrap(), config);
        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }
}
