//! MQTT v3.1 / v3.1.1 wire vocabulary
//!
//! Packet structs, version and QoS enums, and the return codes a broker can
//! answer with. Nothing here touches a socket.

mod error;
mod packet;
mod reason;

pub use error::{DecodeError, EncodeError, ProtocolError};
pub use packet::*;
pub use reason::{ConnectReturnCode, SubAckReturnCode};

/// Protocol revision announced in CONNECT
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum ProtocolVersion {
    /// 3.1, protocol name "MQIsdp"
    V31 = 3,
    /// 3.1.1, protocol name "MQTT"
    #[default]
    V311 = 4,
}

impl ProtocolVersion {
    /// Map a protocol level byte, `None` for anything but 3 and 4
    pub fn from_u8(level: u8) -> Option<Self> {
        [Self::V31, Self::V311]
            .into_iter()
            .find(|version| *version as u8 == level)
    }

    pub fn protocol_name(self) -> &'static str {
        if self == Self::V31 {
            "MQIsdp"
        } else {
            "MQTT"
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(u8)]
pub enum QoS {
    #[default]
    AtMostOnce = 0,
    AtLeastOnce = 1,
    ExactlyOnce = 2,
}

impl QoS {
    pub fn from_u8(level: u8) -> Option<Self> {
        [Self::AtMostOnce, Self::AtLeastOnce, Self::ExactlyOnce]
            .get(level as usize)
            .copied()
    }
}

/// Control packet kind, the high nibble of the first header byte
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    Connect = 1,
    ConnAck = 2,
    Publish = 3,
    PubAck = 4,
    PubRec = 5,
    PubRel = 6,
    PubComp = 7,
    Subscribe = 8,
    SubAck = 9,
    Unsubscribe = 10,
    UnsubAck = 11,
    PingReq = 12,
    PingResp = 13,
    Disconnect = 14,
}
