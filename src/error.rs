//! Error types for the MQTT session engine
//!
//! One taxonomy for the whole engine: transient errors (transport failures,
//! ack timeouts) are recovered per the reconnect policy, structural errors
//! (protocol violations, broker rejections) tear the session down and are
//! surfaced to every pending operation.

use crate::codec::ConnectReturnCode;
use crate::session::SessionState;
use thiserror::Error;

/// Main error type for MQTT session operations
#[derive(Debug, Error)]
pub enum MqttError {
    /// I/O failure on the transport. Retried per the reconnect policy.
    #[error("Transport error: {0}")]
    Transport(#[source] std::io::Error),

    /// The broker refused the connection. Terminal, never retried.
    #[error("Connection rejected by broker: {code:?}")]
    ProtocolRejected { code: ConnectReturnCode },

    /// The peer behaved outside the protocol. Fatal for the session.
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    /// A frame could not be decoded. Escalates to a protocol violation.
    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    /// An acknowledgment handshake did not complete in time. Local-only;
    /// the frame already on the wire is not retracted.
    #[error("Acknowledgment timed out for packet id {packet_id}")]
    AckTimeout { packet_id: u16 },

    /// The outbound queue is at its configured bound. Recoverable by retry.
    #[error("Outbound queue full ({bound} messages pending)")]
    Overflow { bound: usize },

    /// No ping response within the grace window.
    #[error("Keep-alive timed out after {seconds}s without a ping response")]
    KeepAliveTimeout { seconds: u64 },

    /// Operation attempted outside the CONNECTED state.
    #[error("Not connected - current state: {state:?}")]
    NotConnected { state: SessionState },

    /// The session was torn down while the operation was pending.
    #[error("Session closed: {reason}")]
    SessionClosed { reason: String },

    /// The broker answered SUBSCRIBE with a failure return code.
    #[error("Subscription rejected by broker: {filter}")]
    SubscriptionRejected { filter: String },

    /// No packet identifier available (all 65535 in flight).
    #[error("Packet identifier pool exhausted")]
    PacketIdExhausted,

    /// Connect attempt did not complete within the configured timeout.
    #[error("Connect timed out after {seconds}s")]
    ConnectTimeout { seconds: u64 },

    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),
}

impl MqttError {
    /// Transient errors are retried per the reconnect policy; everything
    /// else terminates the session.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            MqttError::Transport(_)
                | MqttError::AckTimeout { .. }
                | MqttError::KeepAliveTimeout { .. }
                | MqttError::ConnectTimeout { .. }
                | MqttError::ProtocolRejected {
                    code: ConnectReturnCode::ServerUnavailable
                }
        )
    }

    /// Structural errors tear down the session and are not retried.
    pub fn is_fatal(&self) -> bool {
        match self {
            MqttError::ProtocolViolation(_) | MqttError::MalformedFrame(_) => true,
            MqttError::ProtocolRejected { code } => code.is_terminal(),
            _ => false,
        }
    }

    /// Create a protocol violation error
    pub fn violation<S: Into<String>>(message: S) -> Self {
        Self::ProtocolViolation(message.into())
    }

    /// Create a malformed frame error
    pub fn malformed<S: Into<String>>(message: S) -> Self {
        Self::MalformedFrame(message.into())
    }

    /// Create a session closed error
    pub fn closed<S: Into<String>>(reason: S) -> Self {
        Self::SessionClosed {
            reason: reason.into(),
        }
    }
}

/// Decode-layer errors escalate to protocol violations at the session layer.
pub(crate) fn escalate_decode_error(err: MqttError) -> MqttError {
    match err {
        MqttError::MalformedFrame(msg) => MqttError::ProtocolViolation(msg),
        other => other,
    }
}

/// Result type for MQTT session operations
pub type MqttResult<T> = Result<T, MqttError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_errors_are_transient() {
        let err = MqttError::Transport(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "reset",
        ));
        assert!(err.is_transient());
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_bad_credentials_is_fatal() {
        let err = MqttError::ProtocolRejected {
            code: ConnectReturnCode::BadUserNameOrPassword,
        };
        assert!(err.is_fatal());
        assert!(!err.is_transient());
    }

    #[test]
    fn test_server_unavailable_is_transient() {
        let err = MqttError::ProtocolRejected {
            code: ConnectReturnCode::ServerUnavailable,
        };
        assert!(err.is_transient());
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_violation_is_fatal() {
        let err = MqttError::violation("PUBCOMP before PUBREC");
        assert!(err.is_fatal());
        assert!(!err.is_transient());
    }

    #[test]
    fn test_ack_timeout_is_local_only() {
        let err = MqttError::AckTimeout { packet_id: 7 };
        assert!(err.is_transient());
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_malformed_frame_escalates_to_violation() {
        let err = escalate_decode_error(MqttError::malformed("remaining length mismatch"));
        assert!(matches!(err, MqttError::ProtocolViolation(_)));
    }

    #[test]
    fn test_error_display_is_nonempty() {
        let errors = vec![
            MqttError::violation("test"),
            MqttError::malformed("test"),
            MqttError::AckTimeout { packet_id: 1 },
            MqttError::Overflow { bound: 64 },
            MqttError::KeepAliveTimeout { seconds: 30 },
            MqttError::PacketIdExhausted,
            MqttError::ConnectTimeout { seconds: 10 },
        ];
        for error in errors {
            assert!(!error.to_string().is_empty());
        }
    }
}
