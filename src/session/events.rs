//! Session state and the host-facing event trait

use serde::Serialize;
use std::fmt;

use crate::takion::TakionState;

/// Lifecycle of a streaming session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Default)]
pub enum SessionState {
    #[default]
    Idle,
    TakionConnect,
    ExpectBang,
    ExpectStreamInfo,
    Streaming,
    Disconnecting,
    Error,
}

impl SessionState {
    pub fn is_active(self) -> bool {
        !matches!(self, SessionState::Idle | SessionState::Error)
    }
}

impl From<TakionState> for SessionState {
    fn from(state: TakionState) -> Self {
        match state {
            TakionState::Idle => SessionState::Idle,
            TakionState::Connecting | TakionState::InitSent => SessionState::TakionConnect,
            TakionState::InitAckReceived | TakionState::CookieSent => SessionState::ExpectBang,
            TakionState::CookieAckReceived => SessionState::ExpectStreamInfo,
            TakionState::Connected => SessionState::Streaming,
            TakionState::Disconnecting => SessionState::Disconnecting,
            TakionState::Error => SessionState::Error,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Idle => "idle",
            SessionState::TakionConnect => "takion-connect",
            SessionState::ExpectBang => "expect-bang",
            SessionState::ExpectStreamInfo => "expect-stream-info",
            SessionState::Streaming => "streaming",
            SessionState::Disconnecting => "disconnecting",
            SessionState::Error => "error",
        };
        f.write_str(name)
    }
}

/// Callbacks from a [`Session`](super::Session) to its host.
///
/// Invoked from worker threads; implementations must not call back into
/// `connect` or `disconnect` on the same session.
pub trait SessionEvents: Send + Sync {
    fn on_state_changed(&self, old: SessionState, new: SessionState);

    /// `code` is the numeric [`ErrorKind`](crate::error::ErrorKind) code or a peer error code
    fn on_error(&self, code: i32, message: &str);

    fn on_version(&self, _version: &str) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_takion_state_mapping() {
        assert_eq!(SessionState::from(TakionState::Idle), SessionState::Idle);
        assert_eq!(SessionState::from(TakionState::Connecting), SessionState::TakionConnect);
        assert_eq!(SessionState::from(TakionState::InitSent), SessionState::TakionConnect);
        assert_eq!(SessionState::from(TakionState::InitAckReceived), SessionState::ExpectBang);
        assert_eq!(SessionState::from(TakionState::CookieSent), SessionState::ExpectBang);
        assert_eq!(SessionState::from(TakionState::CookieAckReceived), SessionState::ExpectStreamInfo);
        assert_eq!(SessionState::from(TakionState::Connected), SessionState::Streaming);
        assert_eq!(SessionState::from(TakionState::Disconnecting), SessionState::Disconnecting);
        assert_eq!(SessionState::from(TakionState::Error), SessionState::Error);
    }

    #[test]
    fn test_active_states() {
        assert!(!SessionState::Idle.is_active());
        assert!(!SessionState::Error.is_active());
        assert!(SessionState::Streaming.is_active());
        assert_eq!(SessionState::ExpectBang.to_string(), "expect-bang");
    }
}
