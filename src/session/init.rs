//! HTTP session init
//!
//! One blocking `GET` against the console's request port. A 200 reply hands
//! back the nonce used by the rest of the session.

use std::fmt::Write as _;
use std::io::{self, Read, Write};
use std::net::{IpAddr, SocketAddr, TcpStream};
use std::os::fd::AsRawFd;
use std::time::{Duration, Instant};

use crate::config::PeerClass;
use crate::error::{Error, NetworkError, ProtocolError, Result};
use crate::platform::{connect_tcp, SelectResult, StopPipe};

pub const PATH_PS5: &str = "/sie/ps5/rp/sess/init";
pub const PATH_LEGACY: &str = "/sce/rp/session";

const RP_VERSION_PS5: &str = "1.0";
const RP_VERSION_LEGACY: &str = "10.0";
const MAX_RESPONSE_SIZE: usize = 16 * 1024;

/// Source of registration material
pub trait CredentialStore: Send + Sync {
    /// Identifier sent as `RP-Registkey`
    fn discovery_id(&self) -> [u8; 16];

    /// Sign `data` with the registered key
    fn sign(&self, data: &[u8]) -> Result<Vec<u8>>;
}

/// Credentials provisioned up front.
///
/// `sign` returns the pre-computed auth blob regardless of input.
#[derive(Debug, Clone)]
pub struct StaticCredentials {
    discovery_id: [u8; 16],
    auth: Vec<u8>,
}

impl StaticCredentials {
    pub fn new(discovery_id: [u8; 16], auth: Vec<u8>) -> Self {
        Self { discovery_id, auth }
    }
}

impl CredentialStore for StaticCredentials {
    fn discovery_id(&self) -> [u8; 16] {
        self.discovery_id
    }

    fn sign(&self, _data: &[u8]) -> Result<Vec<u8>> {
        if self.auth.is_empty() {
            return Err(Error::NotRegistered);
        }
        Ok(self.auth.clone())
    }
}

/// Successful session init
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionGrant {
    pub nonce: String,
    pub server_type: Option<String>,
    pub headers: Vec<(String, String)>,
}

impl SessionGrant {
    /// Case-insensitive header lookup
    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }
}

/// Session init client
pub struct SessionInit {
    timeout: Duration,
    user_agent: String,
    stop: StopPipe,
}

impl SessionInit {
    pub fn new(timeout: Duration) -> Result<Self> {
        let stop = StopPipe::new().map_err(|e| NetworkError::SocketSetup(format!("stop pipe: {e}")))?;
        Ok(Self {
            timeout,
            user_agent: format!("remoteplay/{}", env!("CARGO_PKG_VERSION")),
            stop,
        })
    }

    /// Abort an in-flight or future request on this client
    pub fn cancel(&self) {
        let _ = self.stop.stop();
    }

    /// Request a session from the console at `ip:port`
    pub fn request(&self, ip: IpAddr, port: u16, credentials: &dyn CredentialStore, class: PeerClass) -> Result<SessionGrant> {
        let addr = SocketAddr::new(ip, port);
        let request = self.build_request(addr, credentials, class);

        let mut stream = connect_tcp(addr, Some(self.timeout), &self.stop).map_err(|kind| kind.into_error(addr))?;
        stream.set_read_timeout(Some(self.timeout))?;
        stream.set_write_timeout(Some(self.timeout))?;
        stream
            .write_all(request.as_bytes())
            .map_err(|e| NetworkError::SendFailed(e.to_string()))?;

        let response = self.read_response(&mut stream, addr)?;
        let grant = parse_response(&response)?;
        tracing::info!(%addr, server_type = ?grant.server_type, "Session init granted");
        Ok(grant)
    }

    /// Read until the console closes the connection, the size cap, the
    /// timeout or `cancel`
    fn read_response(&self, stream: &mut TcpStream, addr: SocketAddr) -> Result<Vec<u8>> {
        let deadline = Instant::now() + self.timeout;
        let mut response = Vec::with_capacity(1024);
        let mut chunk = [0u8; 4096];

        while response.len() < MAX_RESPONSE_SIZE {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(Error::Timeout(format!("session init response from {addr}")));
            }
            match self.stop.select_single(stream.as_raw_fd(), false, Some(remaining)) {
                SelectResult::Ready => {}
                SelectResult::Timeout => continue,
                SelectResult::Canceled => return Err(NetworkError::Canceled.into()),
                SelectResult::Error(e) => return Err(NetworkError::ReceiveFailed(e.to_string()).into()),
            }
            match stream.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => {
                    let take = n.min(MAX_RESPONSE_SIZE - response.len());
                    response.extend_from_slice(&chunk[..take]);
                }
                Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted) => {}
                Err(e) => return Err(NetworkError::ReceiveFailed(e.to_string()).into()),
            }
        }
        Ok(response)
    }

    fn build_request(&self, addr: SocketAddr, credentials: &dyn CredentialStore, class: PeerClass) -> String {
        let (path, version) = match class {
            PeerClass::Ps5 => (PATH_PS5, RP_VERSION_PS5),
            PeerClass::Legacy => (PATH_LEGACY, RP_VERSION_LEGACY),
        };
        let id = credentials.discovery_id();

        let mut request = format!(
            "GET {path} HTTP/1.1\r\n\
             Host: {addr}\r\n\
             User-Agent: {}\r\n\
             Connection: close\r\n\
             Content-Length: 0\r\n\
             RP-Registkey: {}\r\n\
             RP-Version: {version}\r\n",
            self.user_agent,
            to_hex(&id)
        );
        match credentials.sign(&id) {
            Ok(auth) => {
                let _ = write!(request, "RP-Auth: {}\r\n", to_hex(&auth));
            }
            Err(e) => tracing::debug!("Session init without RP-Auth: {}", e),
        }
        request.push_str("\r\n");
        request
    }
}

fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().fold(String::with_capacity(bytes.len() * 2), |mut out, b| {
        let _ = write!(out, "{b:02x}");
        out
    })
}

fn find_header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(name))
        .map(|(_, value)| value.as_str())
}

/// Interpret a raw HTTP response
pub fn parse_response(raw: &[u8]) -> Result<SessionGrant> {
    let text = String::from_utf8_lossy(raw);
    let head = text.split("\r\n\r\n").next().unwrap_or_default();
    let mut lines = head.lines();

    let status_line = lines.next().unwrap_or_default();
    let mut parts = status_line.split_whitespace();
    let version = parts.next().unwrap_or_default();
    let status: u16 = match (version.starts_with("HTTP/"), parts.next().and_then(|s| s.parse().ok())) {
        (true, Some(status)) => status,
        _ => return Err(ProtocolError::Malformed(format!("bad status line: {status_line:.40}")).into()),
    };

    let headers: Vec<(String, String)> = lines
        .filter_map(|line| line.split_once(':'))
        .map(|(key, value)| (key.trim().to_string(), value.trim().to_string()))
        .collect();

    match status {
        200 => {
            let nonce = find_header(&headers, "RP-Nonce")
                .ok_or_else(|| ProtocolError::Malformed("missing RP-Nonce".into()))?
                .to_string();
            let server_type = find_header(&headers, "RP-Server-Type").map(str::to_string);
            Ok(SessionGrant {
                nonce,
                server_type,
                headers,
            })
        }
        403 => {
            let reason = find_header(&headers, "RP-Application-Reason").unwrap_or("forbidden");
            Err(Error::AuthFailed(reason.to_string()))
        }
        other => Err(ProtocolError::HttpStatus(other).into()),
    }
}
