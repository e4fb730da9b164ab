//! Network event loop
//!
//! Waits on "broker sent bytes" and "outbound queue has a message", bounded
//! by the yield interval, and runs the session exactly once per wakeup.

use std::time::Duration;

use tokio::time::sleep;
use tracing::{trace, warn};

use crate::bridge::MessageQueue;
use crate::error::Error;
use crate::session::Session;

/// How long a tick may wait for the tail of a partially received packet
const PARTIAL_PACKET_WAIT: Duration = Duration::from_millis(100);

/// What woke the loop up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wakeup {
    Socket,
    Outbound,
    Idle,
}

/// Serve `session` until it fails. The returned error says why.
pub async fn run(session: &mut Session, outbound: &MessageQueue, yield_interval: Duration) -> Error {
    loop {
        if let Err(e) = step(session, outbound, yield_interval).await {
            return e;
        }
    }
}

/// Wait for one wakeup and handle it
pub async fn step(
    session: &mut Session,
    outbound: &MessageQueue,
    yield_interval: Duration,
) -> Result<Wakeup, Error> {
    let wakeup = tokio::select! {
        result = session.fill_read_buffer() => {
            result?;
            Wakeup::Socket
        }
        _ = outbound.ready() => Wakeup::Outbound,
        _ = sleep(yield_interval) => Wakeup::Idle,
    };
    trace!(?wakeup, "Event loop woke up");

    match wakeup {
        Wakeup::Socket | Wakeup::Idle => {
            session.tick(PARTIAL_PACKET_WAIT).await?;
        }
        Wakeup::Outbound => {
            if let Some(message) = outbound.try_pop() {
                if let Err(e) = session.publish_message(message).await {
                    if e.is_fatal() {
                        return Err(e);
                    }
                    warn!("Dropping outbound message: {}", e);
                }
            }
            session.keepalive().await?;
        }
    }
    Ok(wakeup)
}
