//! Error types for the remote play client core

use std::fmt;
use thiserror::Error;

/// Main error type for the client core
#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid parameter: {0}")]
    InvalidParam(String),

    #[error("Component not initialized: {0}")]
    NotInitialized(&'static str),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    #[error("Network is offline")]
    Offline,

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Not connected")]
    NotConnected,

    #[error("Out of memory: {0}")]
    Memory(String),

    #[error("Crypto error: {0}")]
    Crypto(String),

    #[error("Authentication failed: {0}")]
    AuthFailed(String),

    #[error("Console is not registered")]
    NotRegistered,

    #[error("Not authenticated")]
    NotAuthenticated,

    #[error("Invalid data: {0}")]
    InvalidData(String),

    #[error("Buffer too small: need {needed} bytes, have {available}")]
    BufferTooSmall { needed: usize, available: usize },

    #[error("No data available")]
    NoData,

    #[error("Hardware error: {0}")]
    Hardware(String),

    #[error("Audio error: {0}")]
    Audio(#[from] AudioError),

    #[error("Video error: {0}")]
    Video(#[from] VideoError),

    #[error("Initialization failed: {0}")]
    Init(String),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Unknown(String),
}

/// Flat error taxonomy shared with the host application
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    InvalidParam,
    NotInitialized,
    InvalidState,
    Network,
    Offline,
    Timeout,
    Protocol,
    NotConnected,
    Memory,
    Crypto,
    AuthFailed,
    NotRegistered,
    NotAuthenticated,
    InvalidData,
    BufferTooSmall,
    NoData,
    Hardware,
    Audio,
    Video,
    Init,
    Unknown,
}

impl ErrorKind {
    /// Stable numeric code reported through the session error callback
    pub fn code(self) -> i32 {
        match self {
            ErrorKind::InvalidParam => -1,
            ErrorKind::NotInitialized => -2,
            ErrorKind::InvalidState => -3,
            ErrorKind::Network => -4,
            ErrorKind::Offline => -5,
            ErrorKind::Timeout => -6,
            ErrorKind::Protocol => -7,
            ErrorKind::NotConnected => -8,
            ErrorKind::Memory => -9,
            ErrorKind::Crypto => -10,
            ErrorKind::AuthFailed => -11,
            ErrorKind::NotRegistered => -12,
            ErrorKind::NotAuthenticated => -13,
            ErrorKind::InvalidData => -14,
            ErrorKind::BufferTooSmall => -15,
            ErrorKind::NoData => -16,
            ErrorKind::Hardware => -17,
            ErrorKind::Audio => -18,
            ErrorKind::Video => -19,
            ErrorKind::Init => -20,
            ErrorKind::Unknown => -99,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Coarse classification consulted by the retry engine's abort rules
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Network,
    Auth,
    Protocol,
    Other,
}

impl Error {
    /// Get the taxonomy kind of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::InvalidParam(_) => ErrorKind::InvalidParam,
            Error::NotInitialized(_) => ErrorKind::NotInitialized,
            Error::InvalidState(_) => ErrorKind::InvalidState,
            Error::Network(_) | Error::Io(_) => ErrorKind::Network,
            Error::Offline => ErrorKind::Offline,
            Error::Timeout(_) => ErrorKind::Timeout,
            Error::Protocol(_) => ErrorKind::Protocol,
            Error::NotConnected => ErrorKind::NotConnected,
            Error::Memory(_) => ErrorKind::Memory,
            Error::Crypto(_) => ErrorKind::Crypto,
            Error::AuthFailed(_) => ErrorKind::AuthFailed,
            Error::NotRegistered => ErrorKind::NotRegistered,
            Error::NotAuthenticated => ErrorKind::NotAuthenticated,
            Error::InvalidData(_) => ErrorKind::InvalidData,
            Error::BufferTooSmall { .. } => ErrorKind::BufferTooSmall,
            Error::NoData => ErrorKind::NoData,
            Error::Hardware(_) => ErrorKind::Hardware,
            Error::Audio(_) => ErrorKind::Audio,
            Error::Video(_) => ErrorKind::Video,
            Error::Init(_) => ErrorKind::Init,
            Error::Config(_) => ErrorKind::InvalidParam,
            Error::Unknown(_) => ErrorKind::Unknown,
        }
    }

    /// Classify for retry decisions
    pub fn class(&self) -> ErrorClass {
        match self.kind() {
            ErrorKind::Network | ErrorKind::Offline | ErrorKind::Timeout | ErrorKind::NotConnected => {
                ErrorClass::Network
            }
            ErrorKind::AuthFailed | ErrorKind::NotRegistered | ErrorKind::NotAuthenticated => {
                ErrorClass::Auth
            }
            ErrorKind::Protocol | ErrorKind::InvalidData => ErrorClass::Protocol,
            _ => ErrorClass::Other,
        }
    }

    /// Numeric code for the host-facing error callback
    pub fn code(&self) -> i32 {
        self.kind().code()
    }
}

/// Network subsystem errors
#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("Socket setup failed: {0}")]
    SocketSetup(String),

    #[error("Connection refused by {0}")]
    Refused(String),

    #[error("Host {0} is down")]
    HostDown(String),

    #[error("Host {0} is unreachable")]
    HostUnreachable(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    #[error("Connection lost")]
    ConnectionLost,

    #[error("Operation canceled")]
    Canceled,
}

/// Wire protocol errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Packet too short: {0} bytes")]
    Truncated(usize),

    #[error("Length mismatch: expected {expected} bytes, got {actual}")]
    LengthMismatch { expected: usize, actual: usize },

    #[error("Unexpected packet type {0:#04x}")]
    UnexpectedPacketType(u8),

    #[error("Unexpected chunk type {actual:#04x}, expected {expected:#04x}")]
    UnexpectedChunk { expected: u8, actual: u8 },

    #[error("Peer returned a zero association tag")]
    ZeroTag,

    #[error("Payload too large: {0} bytes")]
    PayloadTooLarge(usize),

    #[error("Malformed message: {0}")]
    Malformed(String),

    #[error("Unexpected HTTP status {0}")]
    HttpStatus(u16),
}

/// Audio pipeline errors
#[derive(Error, Debug)]
pub enum AudioError {
    #[error("Decoder initialization failed: {0}")]
    DecoderInit(String),

    #[error("Decoding failed: {0}")]
    DecodingFailed(String),

    #[error("Sink error: {0}")]
    Sink(String),

    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),
}

/// Video pipeline errors
#[derive(Error, Debug)]
pub enum VideoError {
    #[error("Decoder error: {0}")]
    Decoder(String),

    #[error("Renderer error: {0}")]
    Renderer(String),

    #[error("Frame of {0} bytes exceeds slot capacity")]
    FrameTooLarge(usize),
}

/// Configuration and settings errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Read { path: String, source: std::io::Error },

    #[error("Failed to write {path}: {source}")]
    Write { path: String, source: std::io::Error },

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Serialization error: {0}")]
    Serialize(String),

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },

    #[error("No configuration directory available")]
    NoConfigDir,
}

/// Result type alias for the client core
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_errors_classify_as_network() {
        let err: Error = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset").into();
        assert_eq!(err.kind(), ErrorKind::Network);
        assert_eq!(err.class(), ErrorClass::Network);
    }

    #[test]
    fn test_auth_classification() {
        assert_eq!(Error::AuthFailed("bad pin".into()).class(), ErrorClass::Auth);
        assert_eq!(Error::NotRegistered.class(), ErrorClass::Auth);
        assert_eq!(Error::from(ProtocolError::ZeroTag).class(), ErrorClass::Protocol);
        assert_eq!(Error::NoData.class(), ErrorClass::Other);
    }

    #[test]
    fn test_codes_are_distinct() {
        let kinds = [
            ErrorKind::InvalidParam,
            ErrorKind::NotInitialized,
            ErrorKind::InvalidState,
            ErrorKind::Network,
            ErrorKind::Offline,
            ErrorKind::Timeout,
            ErrorKind::Protocol,
            ErrorKind::NotConnected,
            ErrorKind::Memory,
            ErrorKind::Crypto,
            ErrorKind::AuthFailed,
            ErrorKind::NotRegistered,
            ErrorKind::NotAuthenticated,
            ErrorKind::InvalidData,
            ErrorKind::BufferTooSmall,
            ErrorKind::NoData,
            ErrorKind::Hardware,
            ErrorKind::Audio,
            ErrorKind::Video,
            ErrorKind::Init,
            ErrorKind::Unknown,
        ];
        let mut codes: Vec<i32> = kinds.iter().map(|k| k.code()).collect();
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), kinds.len());
    }
}
