//! Reachability probes for troubleshooting a console connection

use serde::Serialize;
use std::io::ErrorKind as IoErrorKind;
use std::net::{IpAddr, SocketAddr, UdpSocket};
use std::time::{Duration, Instant};

use crate::constants::{DISCOVERY_PORT_PS4, DISCOVERY_PORT_PS5, TAKION_CONTROL_PORT, TAKION_STREAM_PORT};
use crate::error::{NetworkError, Result};
use crate::platform::{connect_tcp, ConnectErrorKind, StopPipe};

const UDP_PROBE: &[u8] = b"\x00";

/// Outcome of probing one port
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PortTestResult {
    pub port: u16,
    /// The probe completed without a local or ICMP error
    pub success: bool,
    /// Something answered on the port
    pub service_available: bool,
    /// Crate error code, 0 on success
    pub error_code: i32,
    pub response_time_ms: u64,
    pub message: String,
    #[serde(skip)]
    pub failure: Option<ConnectErrorKind>,
}

impl PortTestResult {
    fn ok(port: u16, service_available: bool, elapsed: Duration, message: impl Into<String>) -> Self {
        Self {
            port,
            success: true,
            service_available,
            error_code: 0,
            response_time_ms: elapsed.as_millis() as u64,
            message: message.into(),
            failure: None,
        }
    }

    fn failed(addr: SocketAddr, kind: ConnectErrorKind, elapsed: Duration) -> Self {
        Self {
            port: addr.port(),
            success: false,
            service_available: false,
            error_code: kind.into_error(addr).kind().code(),
            response_time_ms: elapsed.as_millis() as u64,
            message: kind.to_string(),
            failure: Some(kind),
        }
    }
}

/// TCP connect-and-close
pub fn test_port_tcp(ip: IpAddr, port: u16, timeout: Duration) -> Result<PortTestResult> {
    let stop = StopPipe::new().map_err(|e| NetworkError::SocketSetup(format!("stop pipe: {e}")))?;
    let addr = SocketAddr::new(ip, port);
    let started = Instant::now();
    let result = match connect_tcp(addr, Some(timeout), &stop) {
        Ok(stream) => {
            drop(stream);
            PortTestResult::ok(port, true, started.elapsed(), "connected")
        }
        Err(kind) => PortTestResult::failed(addr, kind, started.elapsed()),
    };
    tracing::debug!(%addr, success = result.success, "TCP port test: {}", result.message);
    Ok(result)
}

/// UDP send-and-wait. Silence is a success without an observed service;
/// an ICMP port-unreachable surfaces as `Refused`.
pub fn test_port_udp(ip: IpAddr, port: u16, timeout: Duration) -> Result<PortTestResult> {
    let addr = SocketAddr::new(ip, port);
    let bind: SocketAddr = match ip {
        IpAddr::V4(_) => ([0, 0, 0, 0], 0).into(),
        IpAddr::V6(_) => ([0u16; 8], 0).into(),
    };
    let socket = UdpSocket::bind(bind).map_err(|e| NetworkError::SocketSetup(e.to_string()))?;
    socket.set_read_timeout(Some(timeout.max(Duration::from_millis(1))))?;

    let started = Instant::now();
    if let Err(e) = socket.connect(addr).and_then(|_| socket.send(UDP_PROBE)) {
        return Ok(PortTestResult::failed(addr, ConnectErrorKind::from_io(&e), started.elapsed()));
    }

    let mut buf = [0u8; 512];
    let result = match socket.recv(&mut buf) {
        Ok(_) => PortTestResult::ok(port, true, started.elapsed(), "response received"),
        Err(e) if matches!(e.kind(), IoErrorKind::WouldBlock | IoErrorKind::TimedOut) => {
            PortTestResult::ok(port, false, started.elapsed(), "no response")
        }
        Err(e) => PortTestResult::failed(addr, ConnectErrorKind::from_io(&e), started.elapsed()),
    };
    tracing::debug!(%addr, success = result.success, "UDP port test: {}", result.message);
    Ok(result)
}

/// Overall verdict for a console address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Connectivity {
    Ready,
    NeedsWake,
    Unreachable,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectivityReport {
    pub status: Connectivity,
    pub control: PortTestResult,
    pub stream: PortTestResult,
    pub wake: PortTestResult,
    pub discovery: PortTestResult,
}

/// Probe control, stream, wake and discovery ports and classify
pub fn test_connectivity(ip: IpAddr, timeout: Duration) -> Result<ConnectivityReport> {
    let control = test_port_tcp(ip, TAKION_CONTROL_PORT, timeout)?;
    let stream = test_port_udp(ip, TAKION_STREAM_PORT, timeout)?;
    let wake = test_port_udp(ip, DISCOVERY_PORT_PS4, timeout)?;
    let discovery = test_port_udp(ip, DISCOVERY_PORT_PS5, timeout)?;

    let status = classify(&control, &stream);
    tracing::info!(%ip, ?status, "Connectivity test finished");
    Ok(ConnectivityReport {
        status,
        control,
        stream,
        wake,
        discovery,
    })
}

fn classify(control: &PortTestResult, stream: &PortTestResult) -> Connectivity {
    let unreachable = |r: &PortTestResult| matches!(r.failure, Some(ConnectErrorKind::HostUnreach | ConnectErrorKind::HostDown));
    if control.success && stream.success {
        Connectivity::Ready
    } else if unreachable(control) || unreachable(stream) {
        Connectivity::Unreachable
    } else if control.failure == Some(ConnectErrorKind::Refused) {
        Connectivity::NeedsWake
    } else {
        Connectivity::Unknown
    }
}

/// Latency bucket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PingQuality {
    Excellent,
    Good,
    Fair,
    Poor,
}

impl PingQuality {
    pub fn from_ms(ms: u64) -> Self {
        match ms {
            0..=9 => PingQuality::Excellent,
            10..=29 => PingQuality::Good,
            30..=49 => PingQuality::Fair,
            _ => PingQuality::Poor,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PingResult {
    pub rtt_ms: u64,
    pub quality: PingQuality,
}

/// TCP connect-and-close round trip to `ip:port`
pub fn ping(ip: IpAddr, port: u16, timeout: Duration) -> Result<PingResult> {
    let stop = StopPipe::new().map_err(|e| NetworkError::SocketSetup(format!("stop pipe: {e}")))?;
    let addr = SocketAddr::new(ip, port);
    let started = Instant::now();
    let stream = connect_tcp(addr, Some(timeout), &stop).map_err(|kind| kind.into_error(addr))?;
    let rtt_ms = started.elapsed().as_millis() as u64;
    drop(stream);
    Ok(PingResult {
        rtt_ms,
        quality: PingQuality::from_ms(rtt_ms),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, TcpListener};

    const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

    fn closed_port() -> u16 {
        // Bound then released, so nothing listens there
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    }

    #[test]
    fn test_tcp_open_port() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let result = test_port_tcp(LOCALHOST, port, Duration::from_secs(1)).unwrap();
        assert!(result.success);
        assert!(result.service_available);
        assert_eq!(result.error_code, 0);
    }

    #[test]
    fn test_tcp_refused_port() {
        let port = closed_port();
        let result = test_port_tcp(LOCALHOST, port, Duration::from_secs(1)).unwrap();
        assert!(!result.success);
        assert_eq!(result.failure, Some(ConnectErrorKind::Refused));
        assert_ne!(result.error_code, 0);
    }

    #[test]
    fn test_udp_echo() {
        let echo = UdpSocket::bind("127.0.0.1:0").unwrap();
        let port = echo.local_addr().unwrap().port();
        let responder = std::thread::spawn(move || {
            let mut buf = [0u8; 16];
            let (n, from) = echo.recv_from(&mut buf).unwrap();
            echo.send_to(&buf[..n], from).unwrap();
        });
        let result = test_port_udp(LOCALHOST, port, Duration::from_secs(1)).unwrap();
        responder.join().unwrap();
        assert!(result.success);
        assert!(result.service_available);
    }

    #[test]
    fn test_classification() {
        let addr = SocketAddr::new(LOCALHOST, TAKION_CONTROL_PORT);
        let up = PortTestResult::ok(1, true, Duration::ZERO, "");
        let refused = PortTestResult::failed(addr, ConnectErrorKind::Refused, Duration::ZERO);
        let unreach = PortTestResult::failed(addr, ConnectErrorKind::HostUnreach, Duration::ZERO);
        let timeout = PortTestResult::failed(addr, ConnectErrorKind::Timeout, Duration::ZERO);

        assert_eq!(classify(&up, &up), Connectivity::Ready);
        assert_eq!(classify(&refused, &up), Connectivity::NeedsWake);
        assert_eq!(classify(&unreach, &up), Connectivity::Unreachable);
        assert_eq!(classify(&timeout, &up), Connectivity::Unknown);
    }

    #[test]
    fn test_ping_buckets() {
        assert_eq!(PingQuality::from_ms(0), PingQuality::Excellent);
        assert_eq!(PingQuality::from_ms(10), PingQuality::Good);
        assert_eq!(PingQuality::from_ms(49), PingQuality::Fair);
        assert_eq!(PingQuality::from_ms(50), PingQuality::Poor);
    }
}
