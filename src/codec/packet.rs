//! Control packet model for the MQTT 3.1.1 wire protocol
//!
//! These types are the unit of exchange between the codec, the session
//! state machine and the connection event loop. Payloads are `Bytes` so a
//! decoded publish can be fanned out to multiple subscriptions without
//! copying.

use bytes::Bytes;

/// Quality-of-service delivery guarantee level
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum QoS {
    /// At most once (fire and forget)
    AtMostOnce = 0,
    /// At least once (PUBACK handshake)
    AtLeastOnce = 1,
    /// Exactly once (PUBREC/PUBREL/PUBCOMP handshake)
    ExactlyOnce = 2,
}

impl QoS {
    pub fn from_u8(value: u8) -> Option<QoS> {
        match value {
            0 => Some(QoS::AtMostOnce),
            1 => Some(QoS::AtLeastOnce),
            2 => Some(QoS::ExactlyOnce),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

/// CONNACK return code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectReturnCode {
    Accepted,
    UnacceptableProtocolVersion,
    IdentifierRejected,
    ServerUnavailable,
    BadUserNameOrPassword,
    NotAuthorized,
}

impl ConnectReturnCode {
    pub fn from_u8(value: u8) -> Option<ConnectReturnCode> {
        match value {
            0 => Some(ConnectReturnCode::Accepted),
            1 => Some(ConnectReturnCode::UnacceptableProtocolVersion),
            2 => Some(ConnectReturnCode::IdentifierRejected),
            3 => Some(ConnectReturnCode::ServerUnavailable),
            4 => Some(ConnectReturnCode::BadUserNameOrPassword),
            5 => Some(ConnectReturnCode::NotAuthorized),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            ConnectReturnCode::Accepted => 0,
            ConnectReturnCode::UnacceptableProtocolVersion => 1,
            ConnectReturnCode::IdentifierRejected => 2,
            ConnectReturnCode::ServerUnavailable => 3,
            ConnectReturnCode::BadUserNameOrPassword => 4,
            ConnectReturnCode::NotAuthorized => 5,
        }
    }

    /// Terminal rejections are never retried; `ServerUnavailable` is the
    /// one transient code.
    pub fn is_terminal(self) -> bool {
        !matches!(
            self,
            ConnectReturnCode::Accepted | ConnectReturnCode::ServerUnavailable
        )
    }
}

/// Last-will message carried in CONNECT
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LastWill {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
}

/// CONNECT variable header and payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connect {
    pub client_id: String,
    pub clean_session: bool,
    pub keep_alive_secs: u16,
    pub last_will: Option<LastWill>,
    pub username: Option<String>,
    pub password: Option<String>,
}

/// PUBLISH packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Publish {
    pub dup: bool,
    pub qos: QoS,
    pub retain: bool,
    pub topic: String,
    /// Present exactly when `qos > AtMostOnce`
    pub packet_id: Option<u16>,
    pub payload: Bytes,
}

/// SUBACK per-filter result
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubAckCode {
    GrantedQoS0,
    GrantedQoS1,
    GrantedQoS2,
    Failure,
}

impl SubAckCode {
    pub fn from_u8(value: u8) -> Option<SubAckCode> {
        match value {
            0x00 => Some(SubAckCode::GrantedQoS0),
            0x01 => Some(SubAckCode::GrantedQoS1),
            0x02 => Some(SubAckCode::GrantedQoS2),
            0x80 => Some(SubAckCode::Failure),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            SubAckCode::GrantedQoS0 => 0x00,
            SubAckCode::GrantedQoS1 => 0x01,
            SubAckCode::GrantedQoS2 => 0x02,
            SubAckCode::Failure => 0x80,
        }
    }

    pub fn is_failure(self) -> bool {
        matches!(self, SubAckCode::Failure)
    }
}

/// A decoded MQTT control packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlPacket {
    Connect(Connect),
    ConnAck {
        session_present: bool,
        code: ConnectReturnCode,
    },
    Publish(Publish),
    PubAck {
        packet_id: u16,
    },
    PubRec {
        packet_id: u16,
    },
    PubRel {
        packet_id: u16,
    },
    PubComp {
        packet_id: u16,
    },
    Subscribe {
        packet_id: u16,
        filters: Vec<(String, QoS)>,
    },
    SubAck {
        packet_id: u16,
        codes: Vec<SubAckCode>,
    },
    Unsubscribe {
        packet_id: u16,
        filters: Vec<String>,
    },
    UnsubAck {
        packet_id: u16,
    },
    PingReq,
    PingResp,
    Disconnect,
}

impl ControlPacket {
    /// Short name for logging
    pub fn kind(&self) -> &'static str {
        match self {
            ControlPacket::Connect(_) => "CONNECT",
            ControlPacket::ConnAck { .. } => "CONNACK",
            ControlPacket::Publish(_) => "PUBLISH",
            ControlPacket::PubAck { .. } => "PUBACK",
            ControlPacket::PubRec { .. } => "PUBREC",
            ControlPacket::PubRel { .. } => "PUBREL",
            ControlPacket::PubComp { .. } => "PUBCOMP",
            ControlPacket::Subscribe { .. } => "SUBSCRIBE",
            ControlPacket::SubAck { .. } => "SUBACK",
            ControlPacket::Unsubscribe { .. } => "UNSUBSCRIBE",
            ControlPacket::UnsubAck { .. } => "UNSUBACK",
            ControlPacket::PingReq => "PINGREQ",
            ControlPacket::PingResp => "PINGRESP",
            ControlPacket::Disconnect => "DISCONNECT",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_qos_from_u8() {
        assert_eq!(QoS::from_u8(0), Some(QoS::AtMostOnce));
        assert_eq!(QoS::from_u8(1), Some(QoS::AtLeastOnce));
        assert_eq!(QoS::from_u8(2), Some(QoS::ExactlyOnce));
        assert_eq!(QoS::from_u8(3), None);
    }

    #[test]
    fn test_return_code_terminality() {
        assert!(!ConnectReturnCode::Accepted.is_terminal());
        assert!(!ConnectReturnCode::ServerUnavailable.is_terminal());
        assert!(ConnectReturnCode::BadUserNameOrPassword.is_terminal());
        assert!(ConnectReturnCode::NotAuthorized.is_terminal());
        assert!(ConnectReturnCode::IdentifierRejected.is_terminal());
        assert!(ConnectReturnCode::UnacceptableProtocolVersion.is_terminal());
    }

    #[test]
    fn test_suback_code_roundtrip() {
        for code in [
            SubAckCode::GrantedQoS0,
            SubAckCode::GrantedQoS1,
            SubAckCode::GrantedQoS2,
            SubAckCode::Failure,
        ] {
            assert_eq!(SubAckCode::from_u8(code.as_u8()), Some(code));
        }
        assert_eq!(SubAckCode::from_u8(0x42), None);
    }
}
