//! Wake-from-standby

use std::fmt::Write as _;
use std::net::{Ipv4Addr, SocketAddrV4, UdpSocket};

use crate::config::DiscoveryConfig;
use crate::discovery::protocol::DeviceType;
use crate::error::{Error, NetworkError, Result};
use crate::retry::{self, RetryPolicy};

/// Build the `WAKEUP` datagram for a registered credential
pub fn build_wake_packet(credential: &[u8], device_type: DeviceType) -> Vec<u8> {
    let mut hex = String::with_capacity(credential.len() * 2);
    for byte in credential {
        let _ = write!(hex, "{byte:02x}");
    }

    format!(
        "WAKEUP * HTTP/1.1\n\
         client-type:vr\n\
         auth-type:R\n\
         model:w\n\
         app-type:r\n\
         user-credential:{hex}\n\
         device-discovery-protocol-version:{}\n\0",
        device_type.protocol_version()
    )
    .into_bytes()
}

/// Send a wake packet to `ip` under the wake retry preset
pub fn wake(ip: Ipv4Addr, credential: &[u8], device_type: DeviceType, config: &DiscoveryConfig) -> Result<()> {
    wake_with(ip, credential, device_type, config, &RetryPolicy::wake())
}

/// Send a wake packet with an explicit retry policy
pub fn wake_with(
    ip: Ipv4Addr,
    credential: &[u8],
    device_type: DeviceType,
    config: &DiscoveryConfig,
    policy: &RetryPolicy,
) -> Result<()> {
    if credential.is_empty() {
        return Err(Error::NotRegistered);
    }

    let port = if device_type.is_ps5_class() {
        config.ps5_port
    } else {
        config.ps4_port
    };
    let target = SocketAddrV4::new(ip, port);
    let packet = build_wake_packet(credential, device_type);

    retry::execute(policy, |ctx| {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))
            .map_err(|e| NetworkError::SocketSetup(e.to_string()))?;
        socket
            .set_broadcast(ip.is_broadcast())
            .map_err(|e| NetworkError::SocketSetup(e.to_string()))?;
        socket
            .send_to(&packet, target)
            .map_err(|e| NetworkError::SendFailed(format!("{target}: {e}")))?;
        tracing::info!(%target, attempt = ctx.attempt, "Sent wake packet");
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_wake_packet_layout() {
        let packet = build_wake_packet(&[0x12, 0xab, 0x00], DeviceType::Ps5);
        let text = std::str::from_utf8(&packet).unwrap();
        assert!(text.starts_with("WAKEUP * HTTP/1.1\nclient-type:vr\n"));
        assert!(text.contains("\nuser-credential:12ab00\n"));
        assert!(text.ends_with("device-discovery-protocol-version:00030010\n\0"));

        let packet = build_wake_packet(&[0x01], DeviceType::Ps4Pro);
        assert!(std::str::from_utf8(&packet).unwrap().contains("version:00020020\n"));
    }

    #[test]
    fn test_wake_reaches_listener() {
        let listener = UdpSocket::bind("127.0.0.1:0").unwrap();
        listener.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        let config = DiscoveryConfig {
            ps4_port: listener.local_addr().unwrap().port(),
            ..DiscoveryConfig::default()
        };

        wake(Ipv4Addr::LOCALHOST, &[0xde, 0xad], DeviceType::Ps4, &config).unwrap();

        let mut buf = [0u8; 512];
        let n = listener.recv(&mut buf).unwrap();
        assert!(buf[..n].starts_with(b"WAKEUP"));
    }

    #[test]
    fn test_wake_requires_credential() {
        let result = wake(Ipv4Addr::LOCALHOST, &[], DeviceType::Ps5, &DiscoveryConfig::default());
        assert!(matches!(result, Err(Error::NotRegistered)));
    }
}
