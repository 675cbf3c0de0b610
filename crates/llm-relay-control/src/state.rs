//! Tunnel lifecycle state machine

use serde::Serialize;
use std::fmt;
use thiserror::Error;

/// Lifecycle state of a tunnel connection
///
/// ```text
/// connecting → connected ⇄ reconnecting → failed
///      │           │            │
///      └───────────┴────────────┴──→ closing → closed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TunnelState {
    Connecting,
    Connected,
    Reconnecting,
    Closing,
    Closed,
    Failed,
}

#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
#[error("Illegal tunnel transition {from} -> {to}")]
pub struct InvalidTransition {
    pub from: TunnelState,
    pub to: TunnelState,
}

impl TunnelState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TunnelState::Connecting => "connecting",
            TunnelState::Connected => "connected",
            TunnelState::Reconnecting => "reconnecting",
            TunnelState::Closing => "closing",
            TunnelState::Closed => "closed",
            TunnelState::Failed => "failed",
        }
    }

    /// `closed` and `failed` never change again
    pub fn is_terminal(&self) -> bool {
        matches!(self, TunnelState::Closed | TunnelState::Failed)
    }

    /// States in which new requests may be queued
    pub fn accepts_requests(&self) -> bool {
        matches!(
            self,
            TunnelState::Connecting | TunnelState::Connected | TunnelState::Reconnecting
        )
    }

    pub fn can_transition_to(&self, next: TunnelState) -> bool {
        use TunnelState::*;
        matches!(
            (self, next),
            (Connecting, Connected)
                | (Connected, Reconnecting)
                | (Reconnecting, Connected)
                | (Connecting, Closing)
                | (Connected, Closing)
                | (Reconnecting, Closing)
                | (Closing, Closed)
                | (Reconnecting, Failed)
        )
    }

    pub fn transition(self, next: TunnelState) -> Result<TunnelState, InvalidTransition> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(InvalidTransition {
                from: self,
                to: next,
            })
        }
    }
}

impl fmt::Display for TunnelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use TunnelState::*;

    #[test]
    fn test_legal_transitions() {
        assert_eq!(Connecting.transition(Connected), Ok(Connected));
        assert_eq!(Connected.transition(Reconnecting), Ok(Reconnecting));
        assert_eq!(Reconnecting.transition(Connected), Ok(Connected));
        assert_eq!(Reconnecting.transition(Failed), Ok(Failed));
        assert_eq!(Connected.transition(Closing), Ok(Closing));
        assert_eq!(Closing.transition(Closed), Ok(Closed));
    }

    #[test]
    fn test_terminal_states_are_final() {
        for next in [Connecting, Connected, Reconnecting, Closing, Closed, Failed] {
            assert!(Closed.transition(next).is_err());
            assert!(Failed.transition(next).is_err());
        }
    }

    #[test]
    fn test_illegal_transitions_rejected() {
        assert_eq!(
            Connected.transition(Failed),
            Err(InvalidTransition {
                from: Connected,
                to: Failed
            })
        );
        assert!(Connecting.transition(Reconnecting).is_err());
        assert!(Closing.transition(Connected).is_err());
    }
}
