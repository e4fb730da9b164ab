//! MQTT Packet Definitions
//!
//! Packet types shared by MQTT v3.1 and v3.1.1. The two versions differ only in
//! the CONNECT protocol name and level.

use bytes::Bytes;

use super::{ConnectReturnCode, PacketType, ProtocolVersion, QoS, SubAckReturnCode};

/// MQTT control packet
#[derive(Debug, Clone, PartialEq, Eq)]
#[allow(clippy::large_enum_variant)]
pub enum Packet {
    Connect(Box<Connect>),
    ConnAck(ConnAck),
    Publish(Publish),
    PubAck(PubAck),
    PubRec(PubRec),
    PubRel(PubRel),
    PubComp(PubComp),
    Subscribe(Subscribe),
    SubAck(SubAck),
    Unsubscribe(Unsubscribe),
    UnsubAck(UnsubAck),
    PingReq,
    PingResp,
    Disconnect,
}

impl Packet {
    pub fn packet_type(&self) -> PacketType {
        match self {
            Packet::Connect(_) => PacketType::Connect,
            Packet::ConnAck(_) => PacketType::ConnAck,
            Packet::Publish(_) => PacketType::Publish,
            Packet::PubAck(_) => PacketType::PubAck,
            Packet::PubRec(_) => PacketType::PubRec,
            Packet::PubRel(_) => PacketType::PubRel,
            Packet::PubComp(_) => PacketType::PubComp,
            Packet::Subscribe(_) => PacketType::Subscribe,
            Packet::SubAck(_) => PacketType::SubAck,
            Packet::Unsubscribe(_) => PacketType::Unsubscribe,
            Packet::UnsubAck(_) => PacketType::UnsubAck,
            Packet::PingReq => PacketType::PingReq,
            Packet::PingResp => PacketType::PingResp,
            Packet::Disconnect => PacketType::Disconnect,
        }
    }
}

/// CONNECT packet (client -> server)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connect {
    pub protocol_version: ProtocolVersion,
    pub client_id: String,
    pub clean_session: bool,
    /// Keep alive interval in seconds, 0 disables it
    pub keep_alive: u16,
    pub username: Option<String>,
    pub password: Option<Bytes>,
    pub will: Option<Will>,
}

impl Default for Connect {
    fn default() -> Self {
        Self {
            protocol_version: ProtocolVersion::V311,
            client_id: String::new(),
            clean_session: true,
            keep_alive: 60,
            username: None,
            password: None,
            will: None,
        }
    }
}

/// Last will, published by the broker if the client vanishes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Will {
    pub topic: String,
    /// May be empty
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
}

/// CONNACK packet (server -> client)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnAck {
    /// Always false for v3.1, which has no such flag
    pub session_present: bool,
    pub return_code: ConnectReturnCode,
}

impl Default for ConnAck {
    fn default() -> Self {
        Self {
            session_present: false,
            return_code: ConnectReturnCode::Accepted,
        }
    }
}

/// PUBLISH packet (bidirectional)
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Publish {
    pub dup: bool,
    pub qos: QoS,
    pub retain: bool,
    pub topic: String,
    /// Present only for QoS > 0
    pub packet_id: Option<u16>,
    /// Opaque binary payload
    pub payload: Bytes,
}

/// PUBACK packet (QoS 1)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PubAck {
    pub packet_id: u16,
}

/// PUBREC packet (QoS 2 step 1)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PubRec {
    pub packet_id: u16,
}

/// PUBREL packet (QoS 2 step 2)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PubRel {
    pub packet_id: u16,
}

/// PUBCOMP packet (QoS 2 step 3)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PubComp {
    pub packet_id: u16,
}

/// Topic filter with its requested maximum QoS
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub filter: String,
    pub qos: QoS,
}

/// SUBSCRIBE packet (client -> server)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscribe {
    pub packet_id: u16,
    pub subscriptions: Vec<Subscription>,
}

/// SUBACK packet (server -> client)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubAck {
    pub packet_id: u16,
    /// One entry per requested subscription, in request order
    pub return_codes: Vec<SubAckReturnCode>,
}

/// UNSUBSCRIBE packet (client -> server)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unsubscribe {
    pub packet_id: u16,
    pub filters: Vec<String>,
}

/// UNSUBACK packet (server -> client)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnsubAck {
    pub packet_id: u16,
}
