//! MQTT Packet Encoder
//!
//! Each packet is serialized as a first header byte plus a body; the fixed
//! header's remaining length is taken from the finished body. Nothing is
//! appended to the caller's buffer unless the whole packet encodes.

use bytes::{BufMut, BytesMut};

use super::{write_binary, write_string, write_variable_int, MAX_REMAINING_LENGTH};
use crate::protocol::{Connect, EncodeError, Packet, Publish, QoS};

mod header {
    pub const CONNECT: u8 = 0x10;
    pub const CONNACK: u8 = 0x20;
    pub const PUBLISH: u8 = 0x30;
    pub const PUBACK: u8 = 0x40;
    pub const PUBREC: u8 = 0x50;
    pub const PUBREL: u8 = 0x62;
    pub const PUBCOMP: u8 = 0x70;
    pub const SUBSCRIBE: u8 = 0x82;
    pub const SUBACK: u8 = 0x90;
    pub const UNSUBSCRIBE: u8 = 0xA2;
    pub const UNSUBACK: u8 = 0xB0;
    pub const PINGREQ: u8 = 0xC0;
    pub const PINGRESP: u8 = 0xD0;
    pub const DISCONNECT: u8 = 0xE0;
}

mod connect_flags {
    pub const CLEAN_SESSION: u8 = 0x02;
    pub const WILL: u8 = 0x04;
    pub const WILL_RETAIN: u8 = 0x20;
    pub const PASSWORD: u8 = 0x40;
    pub const USERNAME: u8 = 0x80;
}

#[derive(Debug, Clone)]
pub struct Encoder {
    /// Largest remaining length this encoder will emit
    max_remaining_length: usize,
}

impl Encoder {
    pub fn new() -> Self {
        Self {
            max_remaining_length: MAX_REMAINING_LENGTH,
        }
    }

    pub fn with_max_packet_size(mut self, size: usize) -> Self {
        // Fixed header takes at least two bytes
        self.max_remaining_length = size.saturating_sub(2).min(MAX_REMAINING_LENGTH);
        self
    }

    /// Append `packet` to `buf`
    pub fn encode(&self, packet: &Packet, buf: &mut BytesMut) -> Result<(), EncodeError> {
        let mut body = BytesMut::new();

        let first_byte = match packet {
            Packet::Connect(connect) => {
                connect_body(connect, &mut body)?;
                header::CONNECT
            }
            Packet::ConnAck(connack) => {
                body.put_u8(u8::from(connack.session_present));
                body.put_u8(connack.return_code as u8);
                header::CONNACK
            }
            Packet::Publish(publish) => publish_body(publish, &mut body)?,
            Packet::PubAck(ack) => packet_id_body(header::PUBACK, ack.packet_id, &mut body),
            Packet::PubRec(ack) => packet_id_body(header::PUBREC, ack.packet_id, &mut body),
            Packet::PubRel(ack) => packet_id_body(header::PUBREL, ack.packet_id, &mut body),
            Packet::PubComp(ack) => packet_id_body(header::PUBCOMP, ack.packet_id, &mut body),
            Packet::UnsubAck(ack) => packet_id_body(header::UNSUBACK, ack.packet_id, &mut body),
            Packet::Subscribe(subscribe) => {
                if subscribe.subscriptions.is_empty() {
                    return Err(EncodeError::EmptyPayload);
                }
                body.put_u16(subscribe.packet_id);
                for entry in &subscribe.subscriptions {
                    write_string(&mut body, &entry.filter)?;
                    body.put_u8(entry.qos as u8);
                }
                header::SUBSCRIBE
            }
            Packet::SubAck(suback) => {
                if suback.return_codes.is_empty() {
                    return Err(EncodeError::EmptyPayload);
                }
                body.put_u16(suback.packet_id);
                body.extend(suback.return_codes.iter().map(|code| code.to_u8()));
                header::SUBACK
            }
            Packet::Unsubscribe(unsubscribe) => {
                if unsubscribe.filters.is_empty() {
                    return Err(EncodeError::EmptyPayload);
                }
                body.put_u16(unsubscribe.packet_id);
                for filter in &unsubscribe.filters {
                    write_string(&mut body, filter)?;
                }
                header::UNSUBSCRIBE
            }
            Packet::PingReq => header::PINGREQ,
            Packet::PingResp => header::PINGRESP,
            Packet::Disconnect => header::DISCONNECT,
        };

        if body.len() > self.max_remaining_length {
            return Err(EncodeError::PacketTooLarge);
        }
        let mut head = BytesMut::with_capacity(5);
        head.put_u8(first_byte);
        write_variable_int(&mut head, body.len() as u32)?;

        buf.reserve(head.len() + body.len());
        buf.put_slice(&head);
        buf.put_slice(&body);
        Ok(())
    }
}

impl Default for Encoder {
    fn default() -> Self {
        Self::new()
    }
}

fn packet_id_body(first_byte: u8, packet_id: u16, body: &mut BytesMut) -> u8 {
    body.put_u16(packet_id);
    first_byte
}

fn connect_body(connect: &Connect, body: &mut BytesMut) -> Result<(), EncodeError> {
    write_string(body, connect.protocol_version.protocol_name())?;
    body.put_u8(connect.protocol_version as u8);

    let mut flags = 0;
    if connect.clean_session {
        flags |= connect_flags::CLEAN_SESSION;
    }
    if let Some(will) = &connect.will {
        flags |= connect_flags::WILL | ((will.qos as u8) << 3);
        if will.retain {
            flags |= connect_flags::WILL_RETAIN;
        }
    }
    if connect.username.is_some() {
        flags |= connect_flags::USERNAME;
    }
    if connect.password.is_some() {
        flags |= connect_flags::PASSWORD;
    }
    body.put_u8(flags);
    body.put_u16(connect.keep_alive);

    // Payload order is fixed: client id, will, username, password
    write_string(body, &connect.client_id)?;
    if let Some(will) = &connect.will {
        write_string(body, &will.topic)?;
        write_binary(body, &will.payload)?;
    }
    if let Some(username) = &connect.username {
        write_string(body, username)?;
    }
    if let Some(password) = &connect.password {
        write_binary(body, password)?;
    }
    Ok(())
}

/// Returns the first header byte, which carries DUP, QoS and RETAIN
fn publish_body(publish: &Publish, body: &mut BytesMut) -> Result<u8, EncodeError> {
    write_string(body, &publish.topic)?;
    if publish.qos != QoS::AtMostOnce {
        let packet_id = publish.packet_id.ok_or(EncodeError::MissingPacketId)?;
        body.put_u16(packet_id);
    }
    body.put_slice(&publish.payload);

    let mut first_byte = header::PUBLISH | ((publish.qos as u8) << 1);
    if publish.dup {
        first_byte |= 0x08;
    }
    if publish.retain {
        first_byte |= 0x01;
    }
    Ok(first_byte)
}
