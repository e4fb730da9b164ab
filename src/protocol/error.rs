//! Codec failures

use std::fmt;

/// Why bytes from the broker could not become a packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// More bytes are needed; not an error once the stream is complete
    InsufficientData,
    InvalidPacketType(u8),
    InvalidRemainingLength,
    InvalidProtocolName,
    InvalidProtocolVersion(u8),
    InvalidQoS(u8),
    InvalidUtf8,
    /// Reserved fixed header flags do not have their mandated value
    InvalidFlags,
    MalformedPacket(&'static str),
    /// Larger than the decoder's packet size limit
    PacketTooLarge,
    /// CONNACK or SUBACK code outside the defined set
    InvalidReturnCode(u8),
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InsufficientData => f.write_str("incomplete packet"),
            Self::InvalidPacketType(kind) => write!(f, "unknown packet type {}", kind),
            Self::InvalidRemainingLength => f.write_str("remaining length longer than 4 bytes"),
            Self::InvalidProtocolName => f.write_str("unknown protocol name"),
            Self::InvalidProtocolVersion(level) => write!(f, "unsupported protocol level {}", level),
            Self::InvalidQoS(qos) => write!(f, "QoS {} out of range", qos),
            Self::InvalidUtf8 => f.write_str("string is not UTF-8"),
            Self::InvalidFlags => f.write_str("reserved header flags violated"),
            Self::MalformedPacket(why) => write!(f, "malformed packet: {}", why),
            Self::PacketTooLarge => f.write_str("packet exceeds size limit"),
            Self::InvalidReturnCode(code) => write!(f, "undefined return code {:#04x}", code),
        }
    }
}

impl std::error::Error for DecodeError {}

/// Why a packet could not be serialized
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncodeError {
    PacketTooLarge,
    /// A length-prefixed field over 65535 bytes
    StringTooLong,
    /// QoS 1/2 PUBLISH without an identifier
    MissingPacketId,
    /// SUBSCRIBE, UNSUBSCRIBE or SUBACK without entries
    EmptyPayload,
}

impl fmt::Display for EncodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::PacketTooLarge => "packet exceeds size limit",
            Self::StringTooLong => "field longer than 65535 bytes",
            Self::MissingPacketId => "QoS > 0 requires a packet identifier",
            Self::EmptyPayload => "packet needs at least one entry",
        })
    }
}

impl std::error::Error for EncodeError {}

/// Anything wrong at the MQTT framing level
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    Decode(DecodeError),
    Encode(EncodeError),
    /// A well-formed packet the client must never receive
    ProtocolViolation(&'static str),
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Decode(e) => write!(f, "decode: {}", e),
            Self::Encode(e) => write!(f, "encode: {}", e),
            Self::ProtocolViolation(what) => write!(f, "protocol violation: {}", what),
        }
    }
}

impl std::error::Error for ProtocolError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Decode(e) => Some(e),
            Self::Encode(e) => Some(e),
            Self::ProtocolViolation(_) => None,
        }
    }
}

impl From<DecodeError> for ProtocolError {
    fn from(e: DecodeError) -> Self {
        Self::Decode(e)
    }
}

impl From<EncodeError> for ProtocolError {
    fn from(e: EncodeError) -> Self {
        Self::Encode(e)
    }
}
