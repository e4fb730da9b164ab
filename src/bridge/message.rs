use bytes::Bytes;

use crate::error::Error;
use crate::protocol::QoS;

/// Longest topic a bridged message may carry, in bytes
pub const MAX_TOPIC_LEN: usize = 256;
/// Largest payload a bridged message may carry, in bytes
pub const MAX_PAYLOAD_LEN: usize = 1024;

/// An application message travelling through the bridge.
///
/// Built by whichever side produces it, moved into a queue slot and out to the
/// consumer, which releases it by dropping. The payload is a shared `Bytes`
/// handle, so moving a message never copies its data.
#[derive(Debug, PartialEq, Eq)]
pub struct Message {
    topic: String,
    qos: QoS,
    retained: bool,
    payload: Bytes,
}

impl Message {
    pub fn new(
        topic: impl Into<String>,
        qos: QoS,
        retained: bool,
        payload: impl Into<Bytes>,
    ) -> Result<Self, Error> {
        let topic = topic.into();
        let payload = payload.into();

        if topic.len() > MAX_TOPIC_LEN {
            return Err(Error::InvalidArgument("topic exceeds 256 bytes"));
        }
        if payload.len() > MAX_PAYLOAD_LEN {
            return Err(Error::InvalidArgument("payload exceeds 1024 bytes"));
        }

        Ok(Self {
            topic,
            qos,
            retained,
            payload,
        })
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn qos(&self) -> QoS {
        self.qos
    }

    pub fn retained(&self) -> bool {
        self.retained
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Payload length
    pub fn len(&self) -> u32 {
        // Bounded by MAX_PAYLOAD_LEN at construction
        self.payload.len() as u32
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bounds_are_inclusive() {
        let topic = "t".repeat(MAX_TOPIC_LEN);
        let payload = vec![0u8; MAX_PAYLOAD_LEN];
        let msg = Message::new(topic, QoS::AtMostOnce, false, payload).unwrap();
        assert_eq!(msg.len(), 1024);
    }

    #[test]
    fn test_oversized_topic_rejected() {
        let result = Message::new("t".repeat(MAX_TOPIC_LEN + 1), QoS::AtMostOnce, false, "x");
        assert!(matches!(result, Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn test_oversized_payload_rejected() {
        let result = Message::new("t", QoS::AtMostOnce, false, vec![0u8; MAX_PAYLOAD_LEN + 1]);
        assert!(matches!(result, Err(Error::InvalidArgument(_))));
    }
}
