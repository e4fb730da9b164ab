//! MQTT Packet Decoder
//!
//! Decodes MQTT v3.1 and v3.1.1 packets in both directions, so the same decoder
//! serves the client session and the loopback brokers used in tests.

use bytes::Bytes;

use super::{read_binary, read_string, read_u16, read_variable_int, MAX_REMAINING_LENGTH};
use crate::protocol::{
    ConnAck, Connect, ConnectReturnCode, DecodeError, Packet, ProtocolVersion, PubAck, PubComp,
    PubRec, PubRel, Publish, QoS, SubAck, SubAckReturnCode, Subscribe, Subscription, UnsubAck,
    Unsubscribe, Will,
};

/// MQTT Packet Decoder
#[derive(Debug, Clone)]
pub struct Decoder {
    /// Maximum size of a whole packet, fixed header included
    max_packet_size: usize,
}

impl Decoder {
    pub fn new() -> Self {
        Self {
            max_packet_size: MAX_REMAINING_LENGTH,
        }
    }

    pub fn with_max_packet_size(mut self, size: usize) -> Self {
        self.max_packet_size = size.min(MAX_REMAINING_LENGTH);
        self
    }

    pub fn max_packet_size(&self) -> usize {
        self.max_packet_size
    }

    /// Decode one packet from the front of `buf`.
    ///
    /// Returns `Ok(None)` when `buf` does not yet hold a complete packet, or
    /// `Ok(Some((packet, bytes_consumed)))`. Nothing past `buf` is ever read.
    pub fn decode(&self, buf: &[u8]) -> Result<Option<(Packet, usize)>, DecodeError> {
        if buf.len() < 2 {
            return Ok(None);
        }

        // Parse fixed header
        let first_byte = buf[0];
        let packet_type = first_byte >> 4;
        let flags = first_byte & 0x0F;

        let (remaining_length, len_bytes) = match read_variable_int(&buf[1..]) {
            Ok(r) => r,
            Err(DecodeError::InsufficientData) => return Ok(None),
            Err(e) => return Err(e),
        };

        let total_len = 1 + len_bytes + remaining_length as usize;

        if total_len > self.max_packet_size {
            return Err(DecodeError::PacketTooLarge);
        }

        // Wait for complete packet
        if buf.len() < total_len {
            return Ok(None);
        }

        let body = &buf[1 + len_bytes..total_len];

        let packet = match packet_type {
            1 => self.decode_connect(flags, body),
            2 => self.decode_connack(flags, body),
            3 => self.decode_publish(flags, body),
            4 => expect_flags(flags, 0x00)
                .and_then(|_| packet_id_only(body))
                .map(|packet_id| Packet::PubAck(PubAck { packet_id })),
            5 => expect_flags(flags, 0x00)
                .and_then(|_| packet_id_only(body))
                .map(|packet_id| Packet::PubRec(PubRec { packet_id })),
            6 => expect_flags(flags, 0x02)
                .and_then(|_| packet_id_only(body))
                .map(|packet_id| Packet::PubRel(PubRel { packet_id })),
            7 => expect_flags(flags, 0x00)
                .and_then(|_| packet_id_only(body))
                .map(|packet_id| Packet::PubComp(PubComp { packet_id })),
            8 => self.decode_subscribe(flags, body),
            9 => self.decode_suback(flags, body),
            10 => self.decode_unsubscribe(flags, body),
            11 => expect_flags(flags, 0x00)
                .and_then(|_| packet_id_only(body))
                .map(|packet_id| Packet::UnsubAck(UnsubAck { packet_id })),
            12 => empty_body(flags, body).map(|_| Packet::PingReq),
            13 => empty_body(flags, body).map(|_| Packet::PingResp),
            14 => empty_body(flags, body).map(|_| Packet::Disconnect),
            _ => Err(DecodeError::InvalidPacketType(packet_type)),
        };

        // The whole packet is present, so a short field means the remaining
        // length lied about the contents.
        let packet = packet.map_err(|e| match e {
            DecodeError::InsufficientData => {
                DecodeError::MalformedPacket("packet shorter than its fields")
            }
            e => e,
        })?;

        Ok(Some((packet, total_len)))
    }

    fn decode_connect(&self, flags: u8, body: &[u8]) -> Result<Packet, DecodeError> {
        expect_flags(flags, 0x00)?;
        let mut pos = 0;

        let (protocol_name, len) = read_string(&body[pos..])?;
        pos += len;

        let version_byte = *body.get(pos).ok_or(DecodeError::InsufficientData)?;
        pos += 1;

        let protocol_version = ProtocolVersion::from_u8(version_byte)
            .ok_or(DecodeError::InvalidProtocolVersion(version_byte))?;
        if protocol_name != protocol_version.protocol_name() {
            return Err(DecodeError::InvalidProtocolName);
        }

        let connect_flags = *body.get(pos).ok_or(DecodeError::InsufficientData)?;
        pos += 1;

        // Reserved bit must be 0
        if (connect_flags & 0x01) != 0 {
            return Err(DecodeError::InvalidFlags);
        }

        let clean_session = (connect_flags & 0x02) != 0;
        let will_flag = (connect_flags & 0x04) != 0;
        let will_qos = (connect_flags >> 3) & 0x03;
        let will_retain = (connect_flags & 0x20) != 0;
        let password_flag = (connect_flags & 0x40) != 0;
        let username_flag = (connect_flags & 0x80) != 0;

        if !username_flag && password_flag {
            return Err(DecodeError::InvalidFlags);
        }

        let will_qos = QoS::from_u8(will_qos).ok_or(DecodeError::InvalidQoS(will_qos))?;

        if !will_flag && (will_qos != QoS::AtMostOnce || will_retain) {
            return Err(DecodeError::InvalidFlags);
        }

        let keep_alive = read_u16(&body[pos..])?;
        pos += 2;

        let (client_id, len) = read_string(&body[pos..])?;
        pos += len;

        let will = if will_flag {
            let (topic, len) = read_string(&body[pos..])?;
            pos += len;
            let (payload, len) = read_binary(&body[pos..])?;
            pos += len;

            Some(Will {
                topic: topic.to_string(),
                payload: Bytes::copy_from_slice(payload),
                qos: will_qos,
                retain: will_retain,
            })
        } else {
            None
        };

        let username = if username_flag {
            let (s, len) = read_string(&body[pos..])?;
            pos += len;
            Some(s.to_string())
        } else {
            None
        };

        let password = if password_flag {
            let (data, len) = read_binary(&body[pos..])?;
            pos += len;
            Some(Bytes::copy_from_slice(data))
        } else {
            None
        };

        if pos != body.len() {
            return Err(DecodeError::MalformedPacket("trailing bytes in CONNECT"));
        }

        Ok(Packet::Connect(Box::new(Connect {
            protocol_version,
            client_id: client_id.to_string(),
            clean_session,
            keep_alive,
            username,
            password,
            will,
        })))
    }

    fn decode_connack(&self, flags: u8, body: &[u8]) -> Result<Packet, DecodeError> {
        expect_flags(flags, 0x00)?;

        if body.len() != 2 {
            return Err(DecodeError::MalformedPacket("CONNACK must be 2 bytes"));
        }

        let acknowledge_flags = body[0];
        // Only bit 0 is valid (session present), rest must be 0
        if (acknowledge_flags & 0xFE) != 0 {
            return Err(DecodeError::InvalidFlags);
        }

        let return_code =
            ConnectReturnCode::from_u8(body[1]).ok_or(DecodeError::InvalidReturnCode(body[1]))?;

        Ok(Packet::ConnAck(ConnAck {
            session_present: (acknowledge_flags & 0x01) != 0,
            return_code,
        }))
    }

    fn decode_publish(&self, flags: u8, body: &[u8]) -> Result<Packet, DecodeError> {
        let dup = (flags & 0x08) != 0;
        let qos_bits = (flags >> 1) & 0x03;
        let retain = (flags & 0x01) != 0;

        let qos = QoS::from_u8(qos_bits).ok_or(DecodeError::InvalidQoS(qos_bits))?;

        if qos == QoS::AtMostOnce && dup {
            return Err(DecodeError::MalformedPacket("DUP must be 0 for QoS 0"));
        }

        let mut pos = 0;

        let (topic, len) = read_string(&body[pos..])?;
        pos += len;

        if topic.is_empty() {
            return Err(DecodeError::MalformedPacket("empty topic name"));
        }
        if topic.contains(['+', '#']) {
            return Err(DecodeError::MalformedPacket("topic contains wildcard"));
        }

        let packet_id = if qos != QoS::AtMostOnce {
            let id = read_u16(&body[pos..])?;
            if id == 0 {
                return Err(DecodeError::MalformedPacket("packet id cannot be 0"));
            }
            pos += 2;
            Some(id)
        } else {
            None
        };

        Ok(Packet::Publish(Publish {
            dup,
            qos,
            retain,
            topic: topic.to_string(),
            packet_id,
            payload: Bytes::copy_from_slice(&body[pos..]),
        }))
    }

    fn decode_subscribe(&self, flags: u8, body: &[u8]) -> Result<Packet, DecodeError> {
        expect_flags(flags, 0x02)?;

        let packet_id = nonzero_packet_id(body)?;
        let mut pos = 2;

        let mut subscriptions = Vec::new();
        while pos < body.len() {
            let (filter, len) = read_string(&body[pos..])?;
            pos += len;

            if filter.is_empty() {
                return Err(DecodeError::MalformedPacket("topic filter cannot be empty"));
            }

            let requested = *body.get(pos).ok_or(DecodeError::InsufficientData)?;
            pos += 1;

            // Upper six bits are reserved in v3.1.1
            if requested & 0xFC != 0 {
                return Err(DecodeError::InvalidFlags);
            }
            let qos = QoS::from_u8(requested).ok_or(DecodeError::InvalidQoS(requested))?;

            subscriptions.push(Subscription {
                filter: filter.to_string(),
                qos,
            });
        }

        if subscriptions.is_empty() {
            return Err(DecodeError::MalformedPacket(
                "SUBSCRIBE must have at least one topic",
            ));
        }

        Ok(Packet::Subscribe(Subscribe {
            packet_id,
            subscriptions,
        }))
    }

    fn decode_suback(&self, flags: u8, body: &[u8]) -> Result<Packet, DecodeError> {
        expect_flags(flags, 0x00)?;

        if body.len() < 3 {
            return Err(DecodeError::MalformedPacket(
                "SUBACK must carry at least one return code",
            ));
        }

        let packet_id = read_u16(body)?;
        let return_codes = body[2..]
            .iter()
            .map(|&code| SubAckReturnCode::from_u8(code).ok_or(DecodeError::InvalidReturnCode(code)))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Packet::SubAck(SubAck {
            packet_id,
            return_codes,
        }))
    }

    fn decode_unsubscribe(&self, flags: u8, body: &[u8]) -> Result<Packet, DecodeError> {
        expect_flags(flags, 0x02)?;

        let packet_id = nonzero_packet_id(body)?;
        let mut pos = 2;

        let mut filters = Vec::new();
        while pos < body.len() {
            let (filter, len) = read_string(&body[pos..])?;
            pos += len;

            if filter.is_empty() {
                return Err(DecodeError::MalformedPacket("topic filter cannot be empty"));
            }

            filters.push(filter.to_string());
        }

        if filters.is_empty() {
            return Err(DecodeError::MalformedPacket(
                "UNSUBSCRIBE must have at least one topic",
            ));
        }

        Ok(Packet::Unsubscribe(Unsubscribe { packet_id, filters }))
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}

#[inline]
fn expect_flags(flags: u8, expected: u8) -> Result<(), DecodeError> {
    if flags != expected {
        return Err(DecodeError::InvalidFlags);
    }
    Ok(())
}

fn empty_body(flags: u8, body: &[u8]) -> Result<(), DecodeError> {
    expect_flags(flags, 0x00)?;
    if !body.is_empty() {
        return Err(DecodeError::MalformedPacket("packet must have no body"));
    }
    Ok(())
}

fn packet_id_only(body: &[u8]) -> Result<u16, DecodeError> {
    if body.len() != 2 {
        return Err(DecodeError::MalformedPacket(
            "acknowledgement must be exactly 2 bytes",
        ));
    }
    read_u16(body)
}

fn nonzero_packet_id(body: &[u8]) -> Result<u16, DecodeError> {
    let packet_id = read_u16(body)?;
    if packet_id == 0 {
        return Err(DecodeError::MalformedPacket("packet id cannot be 0"));
    }
    Ok(packet_id)
}
