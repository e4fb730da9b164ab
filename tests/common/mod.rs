//! Loopback fake broker shared by the integration tests
//!
//! Accepts any CONNECT, grants every subscription at QoS 0 and echoes each
//! PUBLISH back to the same connection when one of its filters matches.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use mqttlink::codec::{Decoder, Encoder};
use mqttlink::protocol::{ConnAck, Packet, Publish, QoS, SubAck, SubAckReturnCode, UnsubAck};
use mqttlink::topic::topic_matches_filter;

#[derive(Debug, Default)]
pub struct BrokerStats {
    pub connections: AtomicUsize,
    pub subscriptions: AtomicUsize,
    pub publishes: AtomicUsize,
    pub pings: AtomicUsize,
}

pub struct FakeBroker {
    pub port: u16,
    pub stats: Arc<BrokerStats>,
    kick: watch::Sender<u64>,
    accept_task: JoinHandle<()>,
}

impl FakeBroker {
    /// Start a broker that answers PINGREQ
    pub async fn start() -> Self {
        Self::start_with(true).await
    }

    /// Start a broker, optionally ignoring PINGREQ so keepalive expires
    pub async fn start_with(answer_pings: bool) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let stats = Arc::new(BrokerStats::default());
        let (kick, kicked) = watch::channel(0u64);

        let accept_task = {
            let stats = stats.clone();
            tokio::spawn(async move {
                while let Ok((stream, _)) = listener.accept().await {
                    stats.connections.fetch_add(1, Ordering::SeqCst);
                    let stats = stats.clone();
                    // Only kicks issued after this connection count
                    let mut kicked = kicked.clone();
                    kicked.borrow_and_update();
                    tokio::spawn(serve(stream, stats, kicked, answer_pings));
                }
            })
        };

        Self {
            port,
            stats,
            kick,
            accept_task,
        }
    }

    /// Drop every open client connection
    pub fn kick_all(&self) {
        self.kick.send_modify(|generation| *generation += 1);
    }

    pub fn connections(&self) -> usize {
        self.stats.connections.load(Ordering::SeqCst)
    }

    pub fn subscriptions(&self) -> usize {
        self.stats.subscriptions.load(Ordering::SeqCst)
    }
}

impl Drop for FakeBroker {
    fn drop(&mut self) {
        self.accept_task.abort();
        self.kick_all();
    }
}

async fn serve(
    mut stream: TcpStream,
    stats: Arc<BrokerStats>,
    mut kicked: watch::Receiver<u64>,
    answer_pings: bool,
) {
    let decoder = Decoder::new();
    let encoder = Encoder::new();
    let mut buf = BytesMut::new();
    let mut filters: Vec<String> = Vec::new();

    loop {
        while let Ok(Some((packet, consumed))) = decoder.decode(&buf) {
            buf.advance(consumed);

            let reply = match packet {
                Packet::Connect(_) => Some(Packet::ConnAck(ConnAck::default())),
                Packet::Subscribe(subscribe) => {
                    stats.subscriptions.fetch_add(1, Ordering::SeqCst);
                    let return_codes = subscribe
                        .subscriptions
                        .iter()
                        .map(|_| SubAckReturnCode::Granted(QoS::AtMostOnce))
                        .collect();
                    filters.extend(subscribe.subscriptions.into_iter().map(|s| s.filter));
                    Some(Packet::SubAck(SubAck {
                        packet_id: subscribe.packet_id,
                        return_codes,
                    }))
                }
                Packet::Unsubscribe(unsubscribe) => {
                    filters.retain(|f| !unsubscribe.filters.contains(f));
                    Some(Packet::UnsubAck(UnsubAck {
                        packet_id: unsubscribe.packet_id,
                    }))
                }
                Packet::Publish(publish) => {
                    stats.publishes.fetch_add(1, Ordering::SeqCst);
                    let subscribed = filters.iter().any(|f| topic_matches_filter(&publish.topic, f));
                    subscribed.then(|| {
                        Packet::Publish(Publish {
                            topic: publish.topic,
                            payload: publish.payload,
                            ..Default::default()
                        })
                    })
                }
                Packet::PingReq => {
                    stats.pings.fetch_add(1, Ordering::SeqCst);
                    answer_pings.then_some(Packet::PingResp)
                }
                Packet::Disconnect => return,
                _ => None,
            };

            if let Some(reply) = reply {
                let mut out = BytesMut::new();
                if encoder.encode(&reply, &mut out).is_err() || stream.write_all(&out).await.is_err() {
                    return;
                }
            }
        }

        tokio::select! {
            read = stream.read_buf(&mut buf) => {
                if !matches!(read, Ok(n) if n > 0) {
                    return;
                }
            }
            _ = kicked.changed() => return,
        }
    }
}

/// Poll `condition` every 10ms until it holds or `within` passes
pub async fn eventually(within: Duration, condition: impl Fn() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + within;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
