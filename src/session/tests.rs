//! Session Tests
//!
//! Each test drives a real session over loopback TCP against a scripted peer
//! playing the broker.

use std::time::Duration;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

use super::*;
use crate::protocol::{ConnectReturnCode, PacketType, SubAck, UnsubAck};

/// The broker side of a test connection
struct Peer {
    stream: TcpStream,
    buf: BytesMut,
    decoder: Decoder,
    encoder: Encoder,
}

impl Peer {
    async fn try_recv(&mut self, wait: Duration) -> Option<Packet> {
        let deadline = Instant::now() + wait;
        loop {
            if let Some((packet, consumed)) = self.decoder.decode(&self.buf).unwrap() {
                self.buf.advance(consumed);
                return Some(packet);
            }
            let remaining = deadline.checked_duration_since(Instant::now())?;
            match timeout(remaining, self.stream.read_buf(&mut self.buf)).await {
                Ok(Ok(n)) if n > 0 => {}
                _ => return None,
            }
        }
    }

    async fn recv(&mut self) -> Packet {
        self.try_recv(Duration::from_secs(5))
            .await
            .expect("peer expected a packet")
    }

    async fn send(&mut self, packet: Packet) {
        let mut out = BytesMut::new();
        self.encoder.encode(&packet, &mut out).unwrap();
        self.stream.write_all(&out).await.unwrap();
    }

    async fn accept_connect(&mut self) -> Connect {
        let connect = match self.recv().await {
            Packet::Connect(connect) => *connect,
            other => panic!("expected CONNECT, got {:?}", other),
        };
        self.send(Packet::ConnAck(ConnAck::default())).await;
        connect
    }

    /// Answer the next SUBSCRIBE with `code`
    async fn answer_subscribe(&mut self, code: SubAckReturnCode) -> Subscribe {
        let subscribe = match self.recv().await {
            Packet::Subscribe(subscribe) => subscribe,
            other => panic!("expected SUBSCRIBE, got {:?}", other),
        };
        self.send(Packet::SubAck(SubAck {
            packet_id: subscribe.packet_id,
            return_codes: vec![code],
        }))
        .await;
        subscribe
    }
}

async fn session_pair(options: SessionOptions) -> (Session, Peer) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (client, server) = tokio::join!(TcpStream::connect(addr), listener.accept());

    let session = Session::new(Transport::from_tcp(client.unwrap()), options);
    let peer = Peer {
        stream: server.unwrap().0,
        buf: BytesMut::new(),
        decoder: Decoder::new(),
        encoder: Encoder::new(),
    };
    (session, peer)
}

async fn connected_pair(options: SessionOptions) -> (Session, Peer) {
    let (mut session, mut peer) = session_pair(options).await;
    let (result, _) = tokio::join!(session.connect(), peer.accept_connect());
    result.unwrap();
    (session, peer)
}

fn quick_options() -> SessionOptions {
    SessionOptions {
        command_timeout: Duration::from_millis(300),
        ..Default::default()
    }
}

type Log = Arc<Mutex<Vec<String>>>;

fn recorder(tag: &'static str, log: &Log) -> Arc<dyn MessageHandler> {
    let log = log.clone();
    Arc::new(move |m: Message| {
        let payload = String::from_utf8_lossy(m.payload()).into_owned();
        log.lock().push(format!("{}:{}:{}", tag, m.topic(), payload));
    })
}

fn publish_packet(topic: &str, qos: QoS, packet_id: Option<u16>, payload: &'static str) -> Packet {
    Packet::Publish(Publish {
        qos,
        topic: topic.to_string(),
        packet_id,
        payload: Bytes::from_static(payload.as_bytes()),
        ..Default::default()
    })
}

// =============================================================================
// Packet identifiers
// =============================================================================

#[test]
fn test_packet_ids_skip_zero_and_wrap() {
    let mut ids = PacketIdAllocator::new();
    assert_eq!(ids.next(), 1);
    assert_eq!(ids.next(), 2);

    let mut ids = PacketIdAllocator { next: u16::MAX };
    assert_eq!(ids.next(), u16::MAX);
    assert_eq!(ids.next(), 1);
}

// =============================================================================
// Connect
// =============================================================================

#[tokio::test]
async fn test_connect_sends_options_and_becomes_connected() {
    let options = SessionOptions {
        client_id: "sensor-01".to_string(),
        keep_alive: 45,
        username: Some("user".to_string()),
        password: Some(Bytes::from_static(b"secret")),
        ..quick_options()
    };
    let (mut session, mut peer) = session_pair(options).await;
    assert_eq!(session.state(), SessionState::Disconnected);

    let (result, connect) = tokio::join!(session.connect(), peer.accept_connect());
    let ack = result.unwrap();

    assert!(!ack.session_present);
    assert!(session.is_connected());
    assert_eq!(connect.client_id, "sensor-01");
    assert_eq!(connect.keep_alive, 45);
    assert_eq!(connect.protocol_version, ProtocolVersion::V311);
    assert_eq!(connect.username.as_deref(), Some("user"));
    assert_eq!(connect.password, Some(Bytes::from_static(b"secret")));
}

#[tokio::test]
async fn test_connect_refused() {
    let (mut session, mut peer) = session_pair(quick_options()).await;

    let broker = async {
        peer.recv().await;
        peer.send(Packet::ConnAck(ConnAck {
            session_present: false,
            return_code: ConnectReturnCode::NotAuthorized,
        }))
        .await;
    };
    let (result, _) = tokio::join!(session.connect(), broker);

    match result {
        Err(Error::Connect(ConnectFailure::Refused(code))) => {
            assert_eq!(code, ConnectReturnCode::NotAuthorized)
        }
        other => panic!("expected refusal, got {:?}", other),
    }
    assert_eq!(session.state(), SessionState::Disconnected);
}

#[tokio::test]
async fn test_connect_times_out_without_connack() {
    let (mut session, mut peer) = session_pair(quick_options()).await;

    let (result, _) = tokio::join!(session.connect(), peer.recv());
    assert!(matches!(result, Err(Error::Connect(ConnectFailure::Timeout))));
    assert_eq!(session.state(), SessionState::Disconnected);
}

#[tokio::test]
async fn test_connect_rejects_other_first_packet() {
    let (mut session, mut peer) = session_pair(quick_options()).await;

    let broker = async {
        peer.recv().await;
        peer.send(Packet::PingResp).await;
    };
    let (result, _) = tokio::join!(session.connect(), broker);
    assert!(matches!(
        result,
        Err(Error::Connect(ConnectFailure::UnexpectedPacket(PacketType::PingResp)))
    ));
}

#[tokio::test]
async fn test_connect_twice_is_invalid_state() {
    let (mut session, _peer) = connected_pair(quick_options()).await;
    let result = session.connect().await;
    assert!(matches!(
        result,
        Err(Error::InvalidState {
            operation: "connect",
            state: SessionState::Connected
        })
    ));
}

// =============================================================================
// Subscribe and dispatch
// =============================================================================

#[tokio::test]
async fn test_subscribe_and_dispatch_to_most_specific_handler() {
    let log: Log = Arc::new(Mutex::new(Vec::new()));
    let (mut session, mut peer) = connected_pair(quick_options()).await;
    session.set_default_handler(recorder("default", &log));

    let (granted, subscribe) = tokio::join!(
        session.subscribe("mico/+", QoS::AtLeastOnce, recorder("wild", &log)),
        peer.answer_subscribe(SubAckReturnCode::Granted(QoS::AtMostOnce))
    );
    assert_eq!(granted.unwrap(), QoS::AtMostOnce);
    assert_eq!(subscribe.subscriptions[0].filter, "mico/+");
    assert_eq!(subscribe.subscriptions[0].qos, QoS::AtLeastOnce);

    let (granted, _) = tokio::join!(
        session.subscribe("mico/recv", QoS::AtMostOnce, recorder("exact", &log)),
        peer.answer_subscribe(SubAckReturnCode::Granted(QoS::AtMostOnce))
    );
    granted.unwrap();

    peer.send(publish_packet("mico/recv", QoS::AtMostOnce, None, "a")).await;
    peer.send(publish_packet("mico/other", QoS::AtMostOnce, None, "b")).await;
    peer.send(publish_packet("elsewhere", QoS::AtMostOnce, None, "c")).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let handled = session.tick(Duration::from_millis(100)).await.unwrap();
    assert_eq!(handled, 3);
    assert_eq!(
        *log.lock(),
        vec![
            "exact:mico/recv:a",
            "wild:mico/other:b",
            "default:elsewhere:c",
        ]
    );
}

#[tokio::test]
async fn test_publish_during_subscribe_wait_is_dispatched() {
    let log: Log = Arc::new(Mutex::new(Vec::new()));
    let (mut session, mut peer) = connected_pair(quick_options()).await;
    session.set_default_handler(recorder("default", &log));

    let broker = async {
        let subscribe = match peer.recv().await {
            Packet::Subscribe(subscribe) => subscribe,
            other => panic!("expected SUBSCRIBE, got {:?}", other),
        };
        peer.send(publish_packet("early/bird", QoS::AtMostOnce, None, "x")).await;
        peer.send(Packet::SubAck(SubAck {
            packet_id: subscribe.packet_id,
            return_codes: vec![SubAckReturnCode::Granted(QoS::AtMostOnce)],
        }))
        .await;
    };
    let (granted, _) = tokio::join!(
        session.subscribe("t", QoS::AtMostOnce, recorder("t", &log)),
        broker
    );
    granted.unwrap();

    assert_eq!(*log.lock(), vec!["default:early/bird:x"]);
}

#[tokio::test]
async fn test_subscribe_rejected_by_broker() {
    let log: Log = Arc::new(Mutex::new(Vec::new()));
    let (mut session, mut peer) = connected_pair(quick_options()).await;

    let (result, _) = tokio::join!(
        session.subscribe("secret/#", QoS::AtMostOnce, recorder("s", &log)),
        peer.answer_subscribe(SubAckReturnCode::Failure)
    );
    assert!(matches!(result, Err(Error::Subscribe(_))));
    assert!(session.is_connected());
    assert!(session.handlers().is_empty());
}

#[tokio::test]
async fn test_subscribe_times_out_without_suback() {
    let log: Log = Arc::new(Mutex::new(Vec::new()));
    let (mut session, mut peer) = connected_pair(quick_options()).await;

    let (result, _) = tokio::join!(
        session.subscribe("t", QoS::AtMostOnce, recorder("t", &log)),
        peer.recv()
    );
    assert!(matches!(result, Err(Error::Subscribe(_))));
    assert!(session.is_connected());
}

#[tokio::test]
async fn test_sixth_filter_rejected_and_existing_five_kept() {
    let log: Log = Arc::new(Mutex::new(Vec::new()));
    let (mut session, mut peer) = connected_pair(quick_options()).await;
    assert_eq!(session.handlers().capacity(), DEFAULT_MAX_HANDLERS);

    let installed = ["a", "b/+", "c/#", "mico/test/send", "d/e"];
    for filter in installed {
        let (result, _) = tokio::join!(
            session.subscribe(filter, QoS::AtMostOnce, recorder(filter, &log)),
            peer.answer_subscribe(SubAckReturnCode::Granted(QoS::AtMostOnce))
        );
        result.unwrap();
    }

    let result = session
        .subscribe("f", QoS::AtMostOnce, recorder("f", &log))
        .await;
    assert!(matches!(result, Err(Error::Capacity(_))));
    assert!(peer.try_recv(Duration::from_millis(100)).await.is_none());
    assert_eq!(session.handlers().filters().collect::<Vec<_>>(), installed.to_vec());

    // The original handlers still receive their messages
    peer.send(publish_packet("mico/test/send", QoS::AtMostOnce, None, "hi"))
        .await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    session.tick(Duration::from_millis(100)).await.unwrap();
    assert_eq!(*log.lock(), vec!["mico/test/send:mico/test/send:hi".to_string()]);

    // Re-subscribing an existing filter still works when full
    let (result, _) = tokio::join!(
        session.subscribe("a", QoS::AtMostOnce, recorder("again", &log)),
        peer.answer_subscribe(SubAckReturnCode::Granted(QoS::AtMostOnce))
    );
    result.unwrap();
    assert_eq!(session.handlers().len(), 5);
    assert_eq!(session.handlers().filters().collect::<Vec<_>>(), installed.to_vec());
}

#[tokio::test]
async fn test_unsubscribe_removes_handler() {
    let log: Log = Arc::new(Mutex::new(Vec::new()));
    let (mut session, mut peer) = connected_pair(quick_options()).await;

    let (result, _) = tokio::join!(
        session.subscribe("a/b", QoS::AtMostOnce, recorder("x", &log)),
        peer.answer_subscribe(SubAckReturnCode::Granted(QoS::AtMostOnce))
    );
    result.unwrap();

    let broker = async {
        match peer.recv().await {
            Packet::Unsubscribe(unsub) => {
                assert_eq!(unsub.filters, vec!["a/b".to_string()]);
                peer.send(Packet::UnsubAck(UnsubAck {
                    packet_id: unsub.packet_id,
                }))
                .await;
            }
            other => panic!("expected UNSUBSCRIBE, got {:?}", other),
        }
    };
    let (result, _) = tokio::join!(session.unsubscribe("a/b"), broker);
    result.unwrap();
    assert!(session.handlers().is_empty());
}

#[tokio::test]
async fn test_invalid_filter_rejected_locally() {
    let log: Log = Arc::new(Mutex::new(Vec::new()));
    let (mut session, _peer) = connected_pair(quick_options()).await;
    let result = session
        .subscribe("a/#/b", QoS::AtMostOnce, recorder("x", &log))
        .await;
    assert!(matches!(result, Err(Error::InvalidArgument(_))));
}

// =============================================================================
// Publish
// =============================================================================

#[tokio::test]
async fn test_publish_wire_contents() {
    let (mut session, mut peer) = connected_pair(quick_options()).await;

    session
        .publish("mico/test/send", QoS::AtMostOnce, false, Bytes::from_static(b"hello"))
        .await
        .unwrap();
    session
        .publish("mico/test/send", QoS::AtLeastOnce, true, Bytes::from_static(b"again"))
        .await
        .unwrap();

    assert_eq!(
        peer.recv().await,
        publish_packet("mico/test/send", QoS::AtMostOnce, None, "hello")
    );
    match peer.recv().await {
        Packet::Publish(publish) => {
            assert_eq!(publish.packet_id, Some(1));
            assert!(publish.retain);
            assert_eq!(publish.payload, Bytes::from_static(b"again"));
        }
        other => panic!("expected PUBLISH, got {:?}", other),
    }
}

#[tokio::test]
async fn test_publish_argument_checks() {
    let (mut session, _peer) = connected_pair(quick_options()).await;

    let empty = session
        .publish("t", QoS::AtMostOnce, false, Bytes::new())
        .await;
    assert!(matches!(empty, Err(Error::InvalidArgument(_))));

    let wildcard = session
        .publish("t/+", QoS::AtMostOnce, false, Bytes::from_static(b"x"))
        .await;
    assert!(matches!(wildcard, Err(Error::InvalidArgument(_))));

    let oversized = session
        .publish("t", QoS::AtMostOnce, false, Bytes::from(vec![0u8; MAX_PAYLOAD_LEN + 1]))
        .await;
    assert!(matches!(oversized, Err(Error::InvalidArgument(_))));

    assert!(session.is_connected());
}

#[tokio::test]
async fn test_publish_before_connect_is_invalid_state() {
    let (mut session, _peer) = session_pair(quick_options()).await;
    let result = session
        .publish("t", QoS::AtMostOnce, false, Bytes::from_static(b"x"))
        .await;
    assert!(matches!(
        result,
        Err(Error::InvalidState {
            operation: "publish",
            state: SessionState::Disconnected
        })
    ));
}

// =============================================================================
// Inbound acknowledgements
// =============================================================================

#[tokio::test]
async fn test_inbound_qos1_is_acknowledged() {
    let log: Log = Arc::new(Mutex::new(Vec::new()));
    let (mut session, mut peer) = connected_pair(quick_options()).await;
    session.set_default_handler(recorder("d", &log));

    peer.send(publish_packet("q/1", QoS::AtLeastOnce, Some(7), "p")).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    session.tick(Duration::from_millis(100)).await.unwrap();

    assert_eq!(peer.recv().await, Packet::PubAck(PubAck { packet_id: 7 }));
    assert_eq!(*log.lock(), vec!["d:q/1:p"]);
}

#[tokio::test]
async fn test_inbound_qos2_handshake() {
    let (mut session, mut peer) = connected_pair(quick_options()).await;

    peer.send(publish_packet("q/2", QoS::ExactlyOnce, Some(9), "p")).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    session.tick(Duration::from_millis(100)).await.unwrap();
    assert_eq!(peer.recv().await, Packet::PubRec(PubRec { packet_id: 9 }));

    peer.send(Packet::PubRel(PubRel { packet_id: 9 })).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    session.tick(Duration::from_millis(100)).await.unwrap();
    assert_eq!(peer.recv().await, Packet::PubComp(PubComp { packet_id: 9 }));
}

#[tokio::test]
async fn test_packet_split_across_reads_is_reassembled() {
    let log: Log = Arc::new(Mutex::new(Vec::new()));
    let (mut session, mut peer) = connected_pair(quick_options()).await;
    session.set_default_handler(recorder("d", &log));

    let mut wire = BytesMut::new();
    Encoder::new()
        .encode(&publish_packet("split/topic", QoS::AtMostOnce, None, "whole"), &mut wire)
        .unwrap();
    let (head, tail) = wire.split_at(5);

    peer.stream.write_all(head).await.unwrap();
    tokio::time::sleep(Duration::from_millis(30)).await;

    let tail = tail.to_vec();
    let writer = async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        peer.stream.write_all(&tail).await.unwrap();
    };
    let (handled, _) = tokio::join!(session.tick(Duration::from_millis(500)), writer);

    assert_eq!(handled.unwrap(), 1);
    assert_eq!(*log.lock(), vec!["d:split/topic:whole"]);
}

// =============================================================================
// Keepalive
// =============================================================================

#[tokio::test]
async fn test_keepalive_pings_then_times_out() {
    let options = SessionOptions {
        keep_alive: 1,
        ..quick_options()
    };
    let (mut session, mut peer) = connected_pair(options).await;

    // Nothing due yet
    session.tick(Duration::ZERO).await.unwrap();
    assert!(!session.ping_outstanding());

    tokio::time::sleep(Duration::from_millis(1100)).await;
    session.tick(Duration::ZERO).await.unwrap();
    assert_eq!(peer.recv().await, Packet::PingReq);
    assert!(session.ping_outstanding());

    // Broker stays silent for another interval
    tokio::time::sleep(Duration::from_millis(1100)).await;
    let result = session.tick(Duration::ZERO).await;
    assert!(matches!(result, Err(Error::KeepaliveTimeout)));
    assert_eq!(session.state(), SessionState::Disconnected);
}

#[tokio::test]
async fn test_keepalive_answered_keeps_session_alive() {
    let options = SessionOptions {
        keep_alive: 1,
        ..quick_options()
    };
    let (mut session, mut peer) = connected_pair(options).await;

    for _ in 0..2 {
        tokio::time::sleep(Duration::from_millis(1100)).await;
        session.tick(Duration::ZERO).await.unwrap();
        assert_eq!(peer.recv().await, Packet::PingReq);

        peer.send(Packet::PingResp).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        session.tick(Duration::ZERO).await.unwrap();
        assert!(!session.ping_outstanding());
    }
    assert!(session.is_connected());
}

#[tokio::test]
async fn test_keepalive_disabled_never_pings() {
    let options = SessionOptions {
        keep_alive: 0,
        ..quick_options()
    };
    let (mut session, mut peer) = connected_pair(options).await;

    tokio::time::sleep(Duration::from_millis(200)).await;
    session.keepalive().await.unwrap();
    assert!(peer.try_recv(Duration::from_millis(100)).await.is_none());
}

#[tokio::test]
async fn test_steady_publishing_does_not_hide_silent_broker() {
    let options = SessionOptions {
        keep_alive: 1,
        ..quick_options()
    };
    let (mut session, mut peer) = connected_pair(options).await;
    let started = Instant::now();

    // Publish every 400ms; the broker never says a word after CONNACK
    let mut outcome = Ok(0);
    for _ in 0..8 {
        tokio::time::sleep(Duration::from_millis(400)).await;
        if let Err(e) = session
            .publish("mico/test/send", QoS::AtMostOnce, false, Bytes::from_static(b"x"))
            .await
        {
            outcome = Err(e);
            break;
        }
        outcome = session.tick(Duration::ZERO).await;
        if outcome.is_err() {
            break;
        }
    }

    assert!(matches!(outcome, Err(Error::KeepaliveTimeout)));
    assert_eq!(session.state(), SessionState::Disconnected);
    assert!(started.elapsed() < Duration::from_secs(3));

    let mut pings = 0;
    while let Some(packet) = peer.try_recv(Duration::from_millis(100)).await {
        if packet == Packet::PingReq {
            pings += 1;
        }
    }
    assert_eq!(pings, 1);
}

// =============================================================================
// Failures and disconnect
// =============================================================================

#[tokio::test]
async fn test_peer_close_is_fatal() {
    let (mut session, peer) = connected_pair(quick_options()).await;
    drop(peer);
    tokio::time::sleep(Duration::from_millis(50)).await;

    let err = session.tick(Duration::from_millis(100)).await.unwrap_err();
    assert!(err.is_fatal());
    assert_eq!(session.state(), SessionState::Disconnected);

    let again = session.tick(Duration::ZERO).await;
    assert!(matches!(again, Err(Error::InvalidState { .. })));
}

#[tokio::test]
async fn test_malformed_packet_is_protocol_error() {
    let (mut session, mut peer) = connected_pair(quick_options()).await;

    // PUBLISH whose topic length runs past the packet
    peer.stream
        .write_all(&[0x30, 0x03, 0x00, 0x05, b'a'])
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let err = session.tick(Duration::from_millis(100)).await.unwrap_err();
    assert!(matches!(err, Error::Protocol(_)));
    assert!(!session.is_connected());
}

#[tokio::test]
async fn test_server_only_packet_is_protocol_violation() {
    let (mut session, mut peer) = connected_pair(quick_options()).await;
    peer.send(Packet::PingReq).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let err = session.tick(Duration::from_millis(100)).await.unwrap_err();
    assert!(matches!(err, Error::Protocol(ProtocolError::ProtocolViolation(_))));
}

#[tokio::test]
async fn test_fill_read_buffer_wakes_on_data() {
    let (mut session, mut peer) = connected_pair(quick_options()).await;

    let sender = async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        peer.send(Packet::PingResp).await;
    };
    let (result, _) = tokio::join!(
        timeout(Duration::from_secs(2), session.fill_read_buffer()),
        sender
    );
    result.unwrap().unwrap();
    assert_eq!(session.tick(Duration::ZERO).await.unwrap(), 1);
}

#[tokio::test]
async fn test_disconnect_is_graceful_and_idempotent() {
    let (mut session, mut peer) = connected_pair(quick_options()).await;

    session.disconnect().await;
    assert_eq!(session.state(), SessionState::Disconnected);
    assert_eq!(peer.recv().await, Packet::Disconnect);

    session.disconnect().await;
    assert_eq!(session.state(), SessionState::Disconnected);

    // A closed session cannot be revived
    assert!(matches!(session.connect().await, Err(Error::Connection(_))));
}
