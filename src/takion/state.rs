//! Takion association state machine

use std::fmt;

/// Association state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TakionState {
    Idle,
    Connecting,
    InitSent,
    InitAckReceived,
    CookieSent,
    CookieAckReceived,
    Connected,
    Disconnecting,
    Error,
}

impl TakionState {
    /// Legal transitions; `Error` is reachable from anywhere
    pub fn can_transition_to(self, next: TakionState) -> bool {
        use TakionState::*;
        match (self, next) {
            (_, Error) => true,
            (Idle, Connecting) => true,
            (Connecting, InitSent) => true,
            // PS5-class fast path
            (Connecting, Connected) => true,
            (InitSent, InitAckReceived) => true,
            (InitAckReceived, CookieSent) => true,
            (CookieSent, CookieAckReceived) => true,
            (CookieAckReceived, Connected) => true,
            // Handshake retry restarts from Connecting
            (InitSent | InitAckReceived | CookieSent, Connecting) => true,
            (Connecting | InitSent | InitAckReceived | CookieSent | CookieAckReceived | Connected, Disconnecting) => {
                true
            }
            (Disconnecting | Error, Idle) => true,
            (Error, Connecting) => true,
            (Idle, _)
            | (Connecting, _)
            | (InitSent, _)
            | (InitAckReceived, _)
            | (CookieSent, _)
            | (CookieAckReceived, _)
            | (Connected, _)
            | (Disconnecting, _)
            | (Error, _) => false,
        }
    }

    /// Between the first INIT and the established association
    pub fn is_handshaking(self) -> bool {
        matches!(
            self,
            TakionState::Connecting
                | TakionState::InitSent
                | TakionState::InitAckReceived
                | TakionState::CookieSent
                | TakionState::CookieAckReceived
        )
    }
}

impl fmt::Display for TakionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use TakionState::*;

    #[test]
    fn test_legacy_path_is_legal() {
        let path = [
            Idle,
            Connecting,
            InitSent,
            InitAckReceived,
            CookieSent,
            CookieAckReceived,
            Connected,
            Disconnecting,
            Idle,
        ];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{} -> {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn test_fast_path_and_error() {
        assert!(Connecting.can_transition_to(Connected));
        for state in [Idle, Connecting, InitSent, Connected, Disconnecting] {
            assert!(state.can_transition_to(Error));
        }
    }

    #[test]
    fn test_illegal_transitions() {
        assert!(!Idle.can_transition_to(Connected));
        assert!(!InitSent.can_transition_to(CookieSent));
        assert!(!Connected.can_transition_to(InitSent));
        assert!(!Idle.can_transition_to(Disconnecting));
    }
}
