//! MQTT Client Session
//!
//! One broker conversation over an exclusively owned [`Transport`]: the
//! CONNECT handshake, subscriptions with per-filter handlers, publishing,
//! keepalive and the processing of everything the broker sends back.
//!
//! A session is single-threaded; the network task owns it and drives it
//! through [`Session::tick`]. Once it reports a fatal error it is finished and
//! the supervisor builds a fresh one on a fresh transport.

mod handlers;

#[cfg(test)]
mod tests;

pub use handlers::{HandlerTable, MessageHandler};

use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, Bytes, BytesMut};
use tokio::time::{timeout, Instant};
use tracing::{debug, info, trace, warn};

use crate::bridge::{Message, MAX_PAYLOAD_LEN, MAX_TOPIC_LEN};
use crate::codec::{Decoder, Encoder, DEFAULT_MAX_PACKET_SIZE};
use crate::error::{ConnectFailure, Error};
use crate::protocol::{
    ConnAck, Connect, Packet, ProtocolError, ProtocolVersion, PubAck, PubComp, PubRec, PubRel,
    Publish, QoS, SubAckReturnCode, Subscribe, Subscription, Unsubscribe, Will,
};
use crate::topic::{validate_topic_filter, validate_topic_name};
use crate::transport::Transport;

/// Default number of subscription handlers a session can hold
pub const DEFAULT_MAX_HANDLERS: usize = 5;

/// Connection state of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

/// Everything the CONNECT packet and the session loop need to know
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub client_id: String,
    pub protocol_version: ProtocolVersion,
    /// Keepalive in seconds, 0 disables it
    pub keep_alive: u16,
    pub clean_session: bool,
    pub username: Option<String>,
    pub password: Option<Bytes>,
    pub will: Option<Will>,
    /// Upper bound on every blocking exchange (CONNACK, SUBACK, writes)
    pub command_timeout: Duration,
    pub max_handlers: usize,
    pub max_packet_size: usize,
    /// Unanswered PINGREQs tolerated before the connection is declared dead
    pub keepalive_retries: u8,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            client_id: "mqttlink".to_string(),
            protocol_version: ProtocolVersion::default(),
            keep_alive: 30,
            clean_session: true,
            username: None,
            password: None,
            will: None,
            command_timeout: Duration::from_secs(5),
            max_handlers: DEFAULT_MAX_HANDLERS,
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
            keepalive_retries: 0,
        }
    }
}

/// Packet identifier source: 1..=65535, wrapping back to 1
#[derive(Debug, Clone)]
pub struct PacketIdAllocator {
    next: u16,
}

impl PacketIdAllocator {
    pub fn new() -> Self {
        Self { next: 1 }
    }

    pub fn next(&mut self) -> u16 {
        let id = self.next;
        self.next = self.next.wrapping_add(1);
        if self.next == 0 {
            self.next = 1;
        }
        id
    }
}

impl Default for PacketIdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

pub struct Session {
    options: SessionOptions,
    transport: Transport,
    state: SessionState,
    encoder: Encoder,
    decoder: Decoder,
    read_buf: BytesMut,
    write_buf: BytesMut,
    packet_ids: PacketIdAllocator,
    handlers: HandlerTable,
    default_handler: Option<Arc<dyn MessageHandler>>,
    /// `None` when keepalive is disabled
    keep_alive: Option<Duration>,
    last_sent: Instant,
    /// Any decoded packet from the broker counts as a sign of life
    last_received: Instant,
    /// When the most recent unanswered PINGREQ went out
    ping_sent_at: Option<Instant>,
    unanswered_pings: u8,
}

impl Session {
    pub fn new(transport: Transport, options: SessionOptions) -> Self {
        let keep_alive =
            (options.keep_alive > 0).then(|| Duration::from_secs(options.keep_alive as u64));

        Self {
            encoder: Encoder::new().with_max_packet_size(options.max_packet_size),
            decoder: Decoder::new().with_max_packet_size(options.max_packet_size),
            read_buf: BytesMut::with_capacity(options.max_packet_size),
            write_buf: BytesMut::with_capacity(options.max_packet_size),
            handlers: HandlerTable::new(options.max_handlers),
            transport,
            state: SessionState::Disconnected,
            packet_ids: PacketIdAllocator::new(),
            default_handler: None,
            keep_alive,
            last_sent: Instant::now(),
            last_received: Instant::now(),
            ping_sent_at: None,
            unanswered_pings: 0,
            options,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == SessionState::Connected
    }

    pub fn options(&self) -> &SessionOptions {
        &self.options
    }

    pub fn handlers(&self) -> &HandlerTable {
        &self.handlers
    }

    /// Whether a PINGREQ is awaiting its PINGRESP
    pub fn ping_outstanding(&self) -> bool {
        self.ping_sent_at.is_some()
    }

    /// Receives messages no subscription handler matches
    pub fn set_default_handler(&mut self, handler: Arc<dyn MessageHandler>) {
        self.default_handler = Some(handler);
    }

    // =========================================================================
    // Commands
    // =========================================================================

    /// Send CONNECT and wait up to the command timeout for the CONNACK.
    ///
    /// The session is `Connected` only when the broker accepted; any failure
    /// leaves it `Disconnected`.
    pub async fn connect(&mut self) -> Result<ConnAck, Error> {
        if self.state != SessionState::Disconnected {
            return Err(Error::InvalidState {
                operation: "connect",
                state: self.state,
            });
        }
        if !self.transport.is_open() {
            return Err(Error::Connection("transport is closed".to_string()));
        }

        self.state = SessionState::Connecting;
        let connect = Packet::Connect(Box::new(Connect {
            protocol_version: self.options.protocol_version,
            client_id: self.options.client_id.clone(),
            clean_session: self.options.clean_session,
            keep_alive: self.options.keep_alive,
            username: self.options.username.clone(),
            password: self.options.password.clone(),
            will: self.options.will.clone(),
        }));

        let result = match self.send(&connect).await {
            Ok(()) => self.await_connack().await,
            Err(e) => Err(e),
        };

        match result {
            Ok(ack) => {
                self.state = SessionState::Connected;
                self.reset_keepalive();
                info!(
                    client_id = %self.options.client_id,
                    session_present = ack.session_present,
                    "Connected to broker"
                );
                Ok(ack)
            }
            Err(e) => {
                self.state = SessionState::Disconnected;
                Err(e)
            }
        }
    }

    async fn await_connack(&mut self) -> Result<ConnAck, Error> {
        let deadline = Instant::now() + self.options.command_timeout;
        match self.read_packet(deadline).await? {
            Some(Packet::ConnAck(ack)) if ack.return_code.is_accepted() => Ok(ack),
            Some(Packet::ConnAck(ack)) => Err(Error::Connect(ConnectFailure::Refused(ack.return_code))),
            Some(other) => Err(Error::Connect(ConnectFailure::UnexpectedPacket(
                other.packet_type(),
            ))),
            None => Err(Error::Connect(ConnectFailure::Timeout)),
        }
    }

    /// Subscribe to `filter` and route its messages to `handler`.
    ///
    /// Blocks until the matching SUBACK (or the command timeout); messages
    /// arriving in the meantime are dispatched normally. Returns the QoS the
    /// broker granted. The handler is installed only on success.
    pub async fn subscribe(
        &mut self,
        filter: &str,
        qos: QoS,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<QoS, Error> {
        self.ensure_connected("subscribe")?;
        validate_topic_filter(filter).map_err(Error::InvalidArgument)?;
        if !self.handlers.has_room_for(filter) {
            return Err(Error::Capacity("subscription handler table full"));
        }

        let packet_id = self.packet_ids.next();
        let subscribe = Packet::Subscribe(Subscribe {
            packet_id,
            subscriptions: vec![Subscription {
                filter: filter.to_string(),
                qos,
            }],
        });
        self.send(&subscribe).await?;

        let ack = self
            .wait_for(|packet| match packet {
                Packet::SubAck(ack) if ack.packet_id == packet_id => Ok(ack),
                other => Err(other),
            })
            .await?
            .ok_or_else(|| Error::Subscribe(format!("no SUBACK for '{}'", filter)))?;

        match ack.return_codes.first() {
            Some(SubAckReturnCode::Granted(granted)) => {
                self.handlers.insert(filter, handler)?;
                info!(filter, granted = ?granted, "Subscribed");
                Ok(*granted)
            }
            _ => Err(Error::Subscribe(format!("broker rejected '{}'", filter))),
        }
    }

    /// Unsubscribe from `filter` and drop its handler once acknowledged
    pub async fn unsubscribe(&mut self, filter: &str) -> Result<(), Error> {
        self.ensure_connected("unsubscribe")?;
        validate_topic_filter(filter).map_err(Error::InvalidArgument)?;

        let packet_id = self.packet_ids.next();
        let unsubscribe = Packet::Unsubscribe(Unsubscribe {
            packet_id,
            filters: vec![filter.to_string()],
        });
        self.send(&unsubscribe).await?;

        self.wait_for(|packet| match packet {
            Packet::UnsubAck(ack) if ack.packet_id == packet_id => Ok(()),
            other => Err(other),
        })
        .await?
        .ok_or_else(|| Error::Subscribe(format!("no UNSUBACK for '{}'", filter)))?;

        self.handlers.remove(filter);
        info!(filter, "Unsubscribed");
        Ok(())
    }

    /// Publish one message. QoS 1 and 2 get a packet id but the call does not
    /// wait for the acknowledgement.
    pub async fn publish(
        &mut self,
        topic: &str,
        qos: QoS,
        retained: bool,
        payload: Bytes,
    ) -> Result<(), Error> {
        self.ensure_connected("publish")?;
        validate_topic_name(topic).map_err(Error::InvalidArgument)?;
        if topic.len() > MAX_TOPIC_LEN {
            return Err(Error::InvalidArgument("topic exceeds 256 bytes"));
        }
        if payload.is_empty() {
            return Err(Error::InvalidArgument("payload cannot be empty"));
        }
        if payload.len() > MAX_PAYLOAD_LEN {
            return Err(Error::InvalidArgument("payload exceeds 1024 bytes"));
        }

        let packet_id = (qos != QoS::AtMostOnce).then(|| self.packet_ids.next());
        let publish = Packet::Publish(Publish {
            dup: false,
            qos,
            retain: retained,
            topic: topic.to_string(),
            packet_id,
            payload,
        });
        self.send(&publish).await?;
        trace!(topic, ?packet_id, "Published");
        Ok(())
    }

    /// Publish a bridged message, consuming it
    pub async fn publish_message(&mut self, message: Message) -> Result<(), Error> {
        self.publish(
            message.topic(),
            message.qos(),
            message.retained(),
            message.payload().clone(),
        )
        .await
    }

    /// Process what the broker has sent and run keepalive.
    ///
    /// Drains every complete packet already available, waits up to `max_wait`
    /// only to finish a packet that has partially arrived, then checks the
    /// keepalive deadline. Returns the number of packets handled.
    pub async fn tick(&mut self, max_wait: Duration) -> Result<usize, Error> {
        self.ensure_connected("yield")?;
        let mut handled = 0;

        loop {
            while let Some(packet) = self.next_buffered()? {
                self.handle_packet(packet).await?;
                handled += 1;
            }
            if !self.fill(Duration::ZERO).await? {
                break;
            }
        }

        if !self.read_buf.is_empty() {
            let deadline = Instant::now() + max_wait;
            while let Some(packet) = self.read_packet(deadline).await? {
                self.handle_packet(packet).await?;
                handled += 1;
                if self.read_buf.is_empty() {
                    break;
                }
            }
        }

        self.keepalive().await?;
        Ok(handled)
    }

    /// Send a PINGREQ once a keepalive interval has passed without sending or
    /// without hearing from the broker, or fail with
    /// [`Error::KeepaliveTimeout`] when PINGREQs stayed unanswered for a full
    /// interval more often than `keepalive_retries` allows.
    ///
    /// Outgoing publishes never postpone an outstanding PINGREQ, so a silent
    /// broker is detected within two intervals however busy the client is.
    pub async fn keepalive(&mut self) -> Result<(), Error> {
        self.ensure_connected("keepalive")?;
        let Some(interval) = self.keep_alive else {
            return Ok(());
        };
        let now = Instant::now();

        match self.ping_sent_at {
            Some(sent_at) if now.duration_since(sent_at) < interval => return Ok(()),
            Some(_) if self.unanswered_pings > self.options.keepalive_retries => {
                warn!(
                    unanswered = self.unanswered_pings,
                    silent_for = ?now.duration_since(self.last_received),
                    "No PINGRESP from broker, connection is dead"
                );
                self.mark_lost();
                return Err(Error::KeepaliveTimeout);
            }
            Some(_) => {}
            None => {
                let idle_out = now.duration_since(self.last_sent) >= interval;
                let idle_in = now.duration_since(self.last_received) >= interval;
                if !idle_out && !idle_in {
                    return Ok(());
                }
            }
        }

        self.send(&Packet::PingReq).await?;
        self.ping_sent_at = Some(now);
        self.unanswered_pings = self.unanswered_pings.saturating_add(1);
        debug!(unanswered = self.unanswered_pings, "PINGREQ sent");
        Ok(())
    }

    /// Wait until at least one more chunk from the broker is buffered.
    ///
    /// Returns at once when a complete packet is already buffered. Cancel-safe,
    /// so it can sit in a `select!` next to other wake-up sources; follow it
    /// with [`Session::tick`] to process what arrived.
    pub async fn fill_read_buffer(&mut self) -> Result<(), Error> {
        self.ensure_connected("read")?;
        if !matches!(self.decoder.decode(&self.read_buf), Ok(None)) {
            return Ok(());
        }
        if let Err(e) = self.transport.read_buf(&mut self.read_buf).await {
            self.mark_lost();
            return Err(e);
        }
        Ok(())
    }

    /// Say goodbye (best effort) and close the transport. Safe to call in any
    /// state, any number of times.
    pub async fn disconnect(&mut self) {
        if self.state == SessionState::Connected {
            self.state = SessionState::Disconnecting;
            if let Err(e) = self.send(&Packet::Disconnect).await {
                debug!("DISCONNECT not delivered: {}", e);
            }
        }

        self.transport.disconnect().await;
        self.state = SessionState::Disconnected;
        self.ping_sent_at = None;
        self.unanswered_pings = 0;
        self.handlers.clear();
        self.read_buf = BytesMut::new();
        self.write_buf = BytesMut::new();
    }

    // =========================================================================
    // Packet plumbing
    // =========================================================================

    fn ensure_connected(&self, operation: &'static str) -> Result<(), Error> {
        if self.state == SessionState::Connected {
            Ok(())
        } else {
            Err(Error::InvalidState {
                operation,
                state: self.state,
            })
        }
    }

    fn reset_keepalive(&mut self) {
        let now = Instant::now();
        self.last_sent = now;
        self.last_received = now;
        self.ping_sent_at = None;
        self.unanswered_pings = 0;
    }

    /// The connection can no longer be trusted
    fn mark_lost(&mut self) {
        self.state = SessionState::Disconnected;
        self.ping_sent_at = None;
    }

    async fn send(&mut self, packet: &Packet) -> Result<(), Error> {
        self.write_buf.clear();
        self.encoder.encode(packet, &mut self.write_buf)?;

        if let Err(e) = self
            .transport
            .write(&self.write_buf, self.options.command_timeout)
            .await
        {
            self.mark_lost();
            return Err(e);
        }
        self.last_sent = Instant::now();
        Ok(())
    }

    /// Decode the next complete packet already in the read buffer
    fn next_buffered(&mut self) -> Result<Option<Packet>, Error> {
        match self.decoder.decode(&self.read_buf) {
            Ok(Some((packet, consumed))) => {
                self.read_buf.advance(consumed);
                self.last_received = Instant::now();
                Ok(Some(packet))
            }
            Ok(None) => Ok(None),
            Err(e) => {
                warn!("Malformed packet from broker: {}", e);
                self.mark_lost();
                Err(e.into())
            }
        }
    }

    /// Read one more chunk, waiting at most `wait`. `Ok(false)` if nothing came.
    async fn fill(&mut self, wait: Duration) -> Result<bool, Error> {
        match timeout(wait, self.transport.read_buf(&mut self.read_buf)).await {
            Err(_) => Ok(false),
            Ok(Ok(_)) => Ok(true),
            Ok(Err(e)) => {
                self.mark_lost();
                Err(e)
            }
        }
    }

    /// Next packet, reading as needed until `deadline`
    async fn read_packet(&mut self, deadline: Instant) -> Result<Option<Packet>, Error> {
        loop {
            if let Some(packet) = self.next_buffered()? {
                return Ok(Some(packet));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            if !self.fill(deadline - now).await? {
                return Ok(None);
            }
        }
    }

    /// Handle incoming packets until `select` claims one, or the command
    /// timeout passes (`Ok(None)`).
    async fn wait_for<T>(
        &mut self,
        mut select: impl FnMut(Packet) -> Result<T, Packet>,
    ) -> Result<Option<T>, Error> {
        let deadline = Instant::now() + self.options.command_timeout;
        while let Some(packet) = self.read_packet(deadline).await? {
            match select(packet) {
                Ok(found) => return Ok(Some(found)),
                Err(other) => self.handle_packet(other).await?,
            }
        }
        Ok(None)
    }

    async fn handle_packet(&mut self, packet: Packet) -> Result<(), Error> {
        match packet {
            Packet::Publish(publish) => self.deliver(publish).await,
            Packet::PingResp => {
                self.ping_sent_at = None;
                self.unanswered_pings = 0;
                trace!("PINGRESP received");
                Ok(())
            }
            Packet::PubRec(PubRec { packet_id }) => {
                self.send(&Packet::PubRel(PubRel { packet_id })).await
            }
            Packet::PubRel(PubRel { packet_id }) => {
                self.send(&Packet::PubComp(PubComp { packet_id })).await
            }
            Packet::PubAck(_)
            | Packet::PubComp(_)
            | Packet::ConnAck(_)
            | Packet::SubAck(_)
            | Packet::UnsubAck(_) => {
                debug!("Ignoring unsolicited {:?}", packet.packet_type());
                Ok(())
            }
            Packet::Connect(_)
            | Packet::Subscribe(_)
            | Packet::Unsubscribe(_)
            | Packet::PingReq
            | Packet::Disconnect => {
                warn!("Broker sent client-only packet {:?}", packet.packet_type());
                self.mark_lost();
                Err(ProtocolError::ProtocolViolation("client-only packet received from broker").into())
            }
        }
    }

    async fn deliver(&mut self, publish: Publish) -> Result<(), Error> {
        let Publish {
            qos,
            retain,
            topic,
            packet_id,
            payload,
            ..
        } = publish;

        match (qos, packet_id) {
            (QoS::AtLeastOnce, Some(packet_id)) => {
                self.send(&Packet::PubAck(PubAck { packet_id })).await?
            }
            (QoS::ExactlyOnce, Some(packet_id)) => {
                self.send(&Packet::PubRec(PubRec { packet_id })).await?
            }
            _ => {}
        }

        let message = match Message::new(topic, qos, retain, payload) {
            Ok(message) => message,
            Err(e) => {
                warn!("Dropping inbound message: {}", e);
                return Ok(());
            }
        };

        let handler = self
            .handlers
            .lookup(message.topic())
            .cloned()
            .or_else(|| self.default_handler.clone());
        match handler {
            Some(handler) => handler.on_message(message),
            None => debug!(topic = message.topic(), "No handler for message"),
        }
        Ok(())
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("client_id", &self.options.client_id)
            .field("state", &self.state)
            .field("transport", &self.transport)
            .field("handlers", &self.handlers)
            .finish()
    }
}
