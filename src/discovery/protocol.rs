//! Discovery wire format
//!
//! Plaintext HTTP-like datagrams: `SRCH` probes out, a status line plus
//! `key:value` headers back.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv4Addr;
use std::time::Duration;

use crate::error::ProtocolError;

/// Probe for PS4-class responders, sent to port 987
pub const PROBE_PS4: &[u8] = b"SRCH * HTTP/1.1\ndevice-discovery-protocol-version:00020020\n\0";

/// Probe for PS5-class responders, sent to port 9302
pub const PROBE_PS5: &[u8] = b"SRCH * HTTP/1.1\ndevice-discovery-protocol-version:00030010\n\0";

pub const PROTOCOL_VERSION_PS4: &str = "00020020";
pub const PROTOCOL_VERSION_PS5: &str = "00030010";

/// Console-specific status for a host in rest mode
pub const STATUS_STANDBY: u16 = 620;

const MAX_HOST_ID_LEN: usize = 32;
const MAX_DEVICE_NAME_LEN: usize = 64;

/// Console family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum DeviceType {
    Ps4,
    Ps4Pro,
    Ps5,
    Ps5Digital,
    #[default]
    Unknown,
}

impl DeviceType {
    /// Classify a `host-type` header value
    pub fn from_host_type(value: &str) -> Self {
        let upper = value.to_ascii_uppercase();
        if upper.contains("PS5") {
            if upper.contains("DIGITAL") {
                DeviceType::Ps5Digital
            } else {
                DeviceType::Ps5
            }
        } else if upper.contains("PS4") {
            if upper.contains("PRO") {
                DeviceType::Ps4Pro
            } else {
                DeviceType::Ps4
            }
        } else {
            DeviceType::Unknown
        }
    }

    pub fn is_ps5_class(self) -> bool {
        matches!(self, DeviceType::Ps5 | DeviceType::Ps5Digital)
    }

    /// Discovery protocol version spoken by this family
    pub fn protocol_version(self) -> &'static str {
        if self.is_ps5_class() {
            PROTOCOL_VERSION_PS5
        } else {
            PROTOCOL_VERSION_PS4
        }
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DeviceType::Ps4 => "PS4",
            DeviceType::Ps4Pro => "PS4 Pro",
            DeviceType::Ps5 => "PS5",
            DeviceType::Ps5Digital => "PS5 Digital",
            DeviceType::Unknown => "Unknown",
        };
        f.write_str(name)
    }
}

/// Parsed discovery response
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiscoveryResponse {
    pub status: u16,
    pub host_name: Option<String>,
    pub host_type: Option<String>,
    pub host_id: Option<String>,
    pub request_port: Option<u16>,
    pub system_version: Option<u32>,
    /// Explicit power state from a state header, if any
    pub state_awake: Option<bool>,
}

impl DiscoveryResponse {
    /// Parse a response datagram
    pub fn parse(datagram: &[u8]) -> Result<Self, ProtocolError> {
        let text = String::from_utf8_lossy(datagram);
        let mut lines = text
            .split('\n')
            .map(|line| line.trim_end_matches(['\r', '\0']));

        let status_line = lines.next().unwrap_or_default();
        let status = parse_status_line(status_line)?;

        let mut response = DiscoveryResponse {
            status,
            ..Self::default()
        };

        for line in lines {
            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            let key = key.trim().to_ascii_lowercase();
            let value = value.trim();
            if value.is_empty() {
                continue;
            }

            match key.as_str() {
                "host-name" => response.host_name = Some(value.to_string()),
                "host-type" => response.host_type = Some(value.to_string()),
                "host-id" => response.host_id = Some(value.to_string()),
                "host-request-port" => response.request_port = value.parse().ok(),
                "system-version" => response.system_version = u32::from_str_radix(value, 16).ok(),
                "host-state" | "status" | "state" | "ps-state" | "running-app" => {
                    if let Some(awake) = parse_power_state(value) {
                        response.state_awake = Some(awake);
                    }
                }
                _ => {}
            }
        }

        Ok(response)
    }

    /// Power state, preferring an explicit header over the status code
    pub fn is_awake(&self) -> bool {
        self.state_awake.unwrap_or_else(|| status_is_awake(self.status))
    }

    pub fn device_type(&self) -> DeviceType {
        self.host_type
            .as_deref()
            .map(DeviceType::from_host_type)
            .unwrap_or_default()
    }
}

fn parse_status_line(line: &str) -> Result<u16, ProtocolError> {
    let mut parts = line.split_whitespace();
    let version = parts.next().unwrap_or_default();
    if !version.to_ascii_uppercase().starts_with("HTTP/") {
        return Err(ProtocolError::Malformed(format!("bad status line: {line:.40}")));
    }
    parts
        .next()
        .and_then(|code| code.parse().ok())
        .ok_or_else(|| ProtocolError::Malformed(format!("bad status code: {line:.40}")))
}

fn parse_power_state(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "ready" | "awake" | "active" | "on" => Some(true),
        "standby" | "sleep" | "rest" | "off" => Some(false),
        _ => None,
    }
}

/// Power state implied by an HTTP status
pub fn status_is_awake(status: u16) -> bool {
    match status {
        200..=499 => true,
        STATUS_STANDBY => false,
        _ => true,
    }
}

/// Link quality estimate from response latency
pub fn signal_strength(latency: Duration, same_subnet: bool) -> f32 {
    let ms = latency.as_millis();
    let base = match ms {
        0..=9 => 1.0,
        10..=49 => 0.8,
        50..=99 => 0.6,
        100..=199 => 0.4,
        _ => 0.2,
    };
    if same_subnet {
        f32::min(base + 0.2, 1.0)
    } else {
        base
    }
}

/// Discovered console
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostRecord {
    pub host_id: String,
    pub ip: Ipv4Addr,
    pub request_port: u16,
    pub device_type: DeviceType,
    pub device_name: String,
    pub firmware_version: u32,
    pub is_awake: bool,
    pub signal_strength: f32,
    /// Monotonic milliseconds at the latest observation
    pub discovery_time: u64,
    pub last_seen: DateTime<Utc>,
}

impl HostRecord {
    /// Build a record from a response received from `ip`.
    ///
    /// Responses without a `host-id` are keyed by address.
    pub fn from_response(
        response: &DiscoveryResponse,
        ip: Ipv4Addr,
        default_port: u16,
        signal_strength: f32,
        discovery_time: u64,
    ) -> Self {
        let host_id = response.host_id.clone().unwrap_or_else(|| ip.to_string());
        let device_name = response.host_name.clone().unwrap_or_else(|| ip.to_string());

        Self {
            host_id: truncate(host_id, MAX_HOST_ID_LEN),
            ip,
            request_port: response.request_port.unwrap_or(default_port),
            device_type: response.device_type(),
            device_name: truncate(device_name, MAX_DEVICE_NAME_LEN),
            firmware_version: response.system_version.unwrap_or(0),
            is_awake: response.is_awake(),
            signal_strength,
            discovery_time,
            last_seen: Utc::now(),
        }
    }
}

fn truncate(mut value: String, max: usize) -> String {
    if value.len() > max {
        let mut end = max;
        while !value.is_char_boundary(end) {
            end -= 1;
        }
        value.truncate(end);
    }
    value
}

#[cfg(test)]
mod tests {
    use super::*;

    const PS5_READY: &[u8] = b"HTTP/1.1 200 OK\r\nhost-name:Console-A\r\nhost-type:PS5\r\nhost-id:ABCDEF0123\r\nhost-request-port:9295\r\nsystem-version:07020001\r\n\r\n";

    #[test]
    fn test_probes_are_null_terminated() {
        assert_eq!(PROBE_PS4.last(), Some(&0));
        assert_eq!(PROBE_PS5.last(), Some(&0));
        assert!(PROBE_PS5.starts_with(b"SRCH * HTTP/1.1\n"));
    }

    #[test]
    fn test_parse_full_response() {
        let response = DiscoveryResponse::parse(PS5_READY).unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.host_name.as_deref(), Some("Console-A"));
        assert_eq!(response.host_id.as_deref(), Some("ABCDEF0123"));
        assert_eq!(response.request_port, Some(9295));
        assert_eq!(response.system_version, Some(0x0702_0001));
        assert_eq!(response.device_type(), DeviceType::Ps5);
        assert!(response.is_awake());
    }

    #[test]
    fn test_standby_status() {
        let response = DiscoveryResponse::parse(b"HTTP/1.1 620 Server Standby\r\n\r\n").unwrap();
        assert_eq!(response.status, 620);
        assert!(!response.is_awake());
    }

    #[test]
    fn test_state_header_overrides_status() {
        let response = DiscoveryResponse::parse(b"HTTP/1.1 200 OK\nhost-state:standby\n").unwrap();
        assert!(!response.is_awake());

        let response = DiscoveryResponse::parse(b"HTTP/1.1 620 Standby\nps-state:Ready\n").unwrap();
        assert!(response.is_awake());
    }

    #[test]
    fn test_status_mapping() {
        assert!(status_is_awake(200));
        assert!(status_is_awake(404));
        assert!(status_is_awake(503));
        assert!(!status_is_awake(620));
        assert!(status_is_awake(100));
    }

    #[test]
    fn test_rejects_non_http() {
        assert!(DiscoveryResponse::parse(b"SRCH * HTTP/1.1\n").is_err());
        assert!(DiscoveryResponse::parse(b"").is_err());
        assert!(DiscoveryResponse::parse(b"HTTP/1.1 abc\n").is_err());
    }

    #[test]
    fn test_device_type_classification() {
        assert_eq!(DeviceType::from_host_type("PS4"), DeviceType::Ps4);
        assert_eq!(DeviceType::from_host_type("PS4 Pro"), DeviceType::Ps4Pro);
        assert_eq!(DeviceType::from_host_type("ps5"), DeviceType::Ps5);
        assert_eq!(DeviceType::from_host_type("PS5 Digital Edition"), DeviceType::Ps5Digital);
        assert_eq!(DeviceType::from_host_type("Vita"), DeviceType::Unknown);
    }

    #[test]
    fn test_signal_strength_buckets() {
        assert_eq!(signal_strength(Duration::from_millis(3), false), 1.0);
        assert_eq!(signal_strength(Duration::from_millis(20), false), 0.8);
        assert_eq!(signal_strength(Duration::from_millis(75), false), 0.6);
        assert_eq!(signal_strength(Duration::from_millis(150), false), 0.4);
        assert_eq!(signal_strength(Duration::from_millis(500), false), 0.2);
        assert_eq!(signal_strength(Duration::from_millis(3), true), 1.0);
        assert!((signal_strength(Duration::from_millis(150), true) - 0.6).abs() < 1e-6);
    }

    #[test]
    fn test_record_falls_back_to_address() {
        let response = DiscoveryResponse::parse(b"HTTP/1.1 620 Server Standby\r\n\r\n").unwrap();
        let ip = Ipv4Addr::new(192, 168, 1, 50);
        let record = HostRecord::from_response(&response, ip, 9295, 0.8, 0);
        assert_eq!(record.host_id, "192.168.1.50");
        assert_eq!(record.request_port, 9295);
        assert!(!record.is_awake);
    }

    #[test]
    fn test_long_fields_truncated() {
        let long_id = "X".repeat(80);
        let datagram = format!("HTTP/1.1 200 OK\nhost-id:{long_id}\nhost-name:{}\n", "é".repeat(50));
        let response = DiscoveryResponse::parse(datagram.as_bytes()).unwrap();
        let record = HostRecord::from_response(&response, Ipv4Addr::LOCALHOST, 9295, 1.0, 0);
        assert_eq!(record.host_id.len(), 32);
        assert!(record.device_name.len() <= 64);
    }
}
