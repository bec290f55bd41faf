//! Pure session state transitions
//!
//! The session moves `Disconnected → Connecting → Connected → Disconnecting
//! → Disconnected`, with the abnormal `Connected → Disconnected` edge on
//! transport failure. Transitions are pure so they can be tested without a
//! transport.

use tracing::{info, warn};

/// Protocol-level session state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

/// Events that drive session state transitions
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// A connect attempt (or reconnect attempt) started
    ConnectStarted,
    /// CONNACK with return code 0 arrived
    ConnAckAccepted,
    /// Graceful disconnect requested by the application
    DisconnectStarted,
    /// The transport failed or the broker dropped us
    ConnectionLost(String),
    /// Transport closed after a graceful disconnect
    DisconnectComplete,
}

/// Compute the next state for an event, or `None` when the transition is
/// not legal from the current state.
pub fn next_state(current: SessionState, event: &SessionEvent) -> Option<SessionState> {
    use SessionState::*;
    match (current, event) {
        (Disconnected, SessionEvent::ConnectStarted) => Some(Connecting),
        (Connecting, SessionEvent::ConnAckAccepted) => {
            info!("session connected");
            Some(Connected)
        }
        (Connecting, SessionEvent::ConnectionLost(reason)) => {
            warn!(reason = %reason, "connect attempt failed");
            Some(Disconnected)
        }
        (Connected, SessionEvent::DisconnectStarted) => Some(Disconnecting),
        (Connected, SessionEvent::ConnectionLost(reason)) => {
            warn!(reason = %reason, "connection lost");
            Some(Disconnected)
        }
        (Disconnecting, SessionEvent::DisconnectComplete) => Some(Disconnected),
        (Disconnecting, SessionEvent::ConnectionLost(_)) => Some(Disconnected),
        _ => None,
    }
}

impl SessionState {
    /// Publishing and subscribing require an established session.
    pub fn can_publish(self) -> bool {
        matches!(self, SessionState::Connected)
    }

    pub fn can_subscribe(self) -> bool {
        matches!(self, SessionState::Connected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use SessionState::*;

    #[test]
    fn test_normal_lifecycle() {
        let mut state = Disconnected;
        for (event, expected) in [
            (SessionEvent::ConnectStarted, Connecting),
            (SessionEvent::ConnAckAccepted, Connected),
            (SessionEvent::DisconnectStarted, Disconnecting),
            (SessionEvent::DisconnectComplete, Disconnected),
        ] {
            state = next_state(state, &event).expect("legal transition");
            assert_eq!(state, expected);
        }
    }

    #[test]
    fn test_abnormal_disconnect_from_connected() {
        let state = next_state(
            Connected,
            &SessionEvent::ConnectionLost("broken pipe".to_string()),
        );
        assert_eq!(state, Some(Disconnected));
    }

    #[test]
    fn test_failed_connect_attempt() {
        let state = next_state(
            Connecting,
            &SessionEvent::ConnectionLost("refused".to_string()),
        );
        assert_eq!(state, Some(Disconnected));
    }

    #[test]
    fn test_illegal_transitions_rejected() {
        assert_eq!(next_state(Disconnected, &SessionEvent::ConnAckAccepted), None);
        assert_eq!(next_state(Connected, &SessionEvent::ConnectStarted), None);
        assert_eq!(
            next_state(Disconnected, &SessionEvent::DisconnectStarted),
            None
        );
    }

    #[test]
    fn test_capability_checks() {
        assert!(Connected.can_publish());
        assert!(Connected.can_subscribe());
        assert!(!Connecting.can_publish());
        assert!(!Disconnecting.can_publish());
        assert!(!Disconnected.can_subscribe());
    }
}
