//! Reconnect Supervisor
//!
//! Owns the connection lifecycle: acquire a transport, start a session over
//! it, connect, subscribe to the inbound topic and run the event loop. Any
//! failure tears the whole stack down and the sequence starts over after a
//! fixed delay, forever.

pub mod event_loop;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::bridge::{Bridge, InboundForwarder};
use crate::error::Error;
use crate::protocol::QoS;
use crate::session::{Session, SessionOptions, SessionState};
use crate::transport::{SecurityOptions, Transport};

/// Everything needed to (re)build a broker connection
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub host: String,
    pub port: u16,
    pub security: SecurityOptions,
    pub connect_timeout: Duration,
    pub session: SessionOptions,
    /// Inbound topic filter, forwarded to the inbound queue
    pub subscribe_topic: String,
    pub subscribe_qos: QoS,
    /// Upper bound on one multiplexer wait
    pub yield_interval: Duration,
    /// Delay after the transport could not be established
    pub connect_retry_delay: Duration,
    /// Delay after a failed handshake, failed subscribe or lost session
    pub reconnect_delay: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1883,
            security: SecurityOptions::plain(),
            connect_timeout: Duration::from_secs(10),
            session: SessionOptions::default(),
            subscribe_topic: "mico/test/send".to_string(),
            subscribe_qos: QoS::AtMostOnce,
            yield_interval: Duration::from_millis(5000),
            connect_retry_delay: Duration::from_secs(3),
            reconnect_delay: Duration::from_secs(5),
        }
    }
}

/// Shared view of the current session state
#[derive(Debug, Clone, Default)]
pub struct ConnectionStatus {
    state: Arc<RwLock<SessionState>>,
}

impl ConnectionStatus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> SessionState {
        *self.state.read()
    }

    pub fn set(&self, state: SessionState) {
        *self.state.write() = state;
    }

    pub fn is_connected(&self) -> bool {
        self.get() == SessionState::Connected
    }
}

/// Lifetime counters of the supervisor loop
#[derive(Debug, Default)]
pub struct SupervisorStats {
    connect_attempts: AtomicU64,
    transport_failures: AtomicU64,
    sessions_established: AtomicU64,
    sessions_lost: AtomicU64,
}

impl SupervisorStats {
    pub fn connect_attempts(&self) -> u64 {
        self.connect_attempts.load(Ordering::Relaxed)
    }

    pub fn transport_failures(&self) -> u64 {
        self.transport_failures.load(Ordering::Relaxed)
    }

    pub fn sessions_established(&self) -> u64 {
        self.sessions_established.load(Ordering::Relaxed)
    }

    pub fn sessions_lost(&self) -> u64 {
        self.sessions_lost.load(Ordering::Relaxed)
    }
}

pub struct Supervisor {
    config: SupervisorConfig,
    bridge: Bridge,
    status: ConnectionStatus,
    stats: Arc<SupervisorStats>,
}

impl Supervisor {
    pub fn new(config: SupervisorConfig, bridge: Bridge) -> Self {
        Self {
            config,
            bridge,
            status: ConnectionStatus::new(),
            stats: Arc::new(SupervisorStats::default()),
        }
    }

    /// Use an externally created status handle
    pub fn with_status(mut self, status: ConnectionStatus) -> Self {
        self.status = status;
        self
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status.clone()
    }

    pub fn stats(&self) -> Arc<SupervisorStats> {
        self.stats.clone()
    }

    /// Run the connect/serve/reconnect cycle. Never returns.
    pub async fn run(&self) {
        info!(
            "Supervisor starting for {}:{} (tls: {})",
            self.config.host, self.config.port, self.config.security.enabled
        );
        loop {
            let delay = self.run_once().await;
            debug!("Next connection attempt in {:?}", delay);
            sleep(delay).await;
        }
    }

    /// One full attempt, from transport setup to teardown. Returns how long to
    /// wait before the next one.
    pub async fn run_once(&self) -> Duration {
        self.stats.connect_attempts.fetch_add(1, Ordering::Relaxed);
        self.status.set(SessionState::Connecting);

        let transport = match Transport::connect(
            &self.config.host,
            self.config.port,
            &self.config.security,
            self.config.connect_timeout,
        )
        .await
        {
            Ok(transport) => transport,
            Err(e) => {
                self.stats.transport_failures.fetch_add(1, Ordering::Relaxed);
                self.status.set(SessionState::Disconnected);
                warn!(
                    "Cannot reach broker {}:{}: {}",
                    self.config.host, self.config.port, e
                );
                return self.config.connect_retry_delay;
            }
        };

        let mut session = Session::new(transport, self.config.session.clone());
        let err = self.connect_and_run(&mut session).await;

        self.status.set(SessionState::Disconnecting);
        session.disconnect().await;
        self.status.set(SessionState::Disconnected);

        match &err {
            Error::Connect(_) | Error::Subscribe(_) => error!("Session setup failed: {}", err),
            _ => warn!("Session ended: {}", err),
        }
        self.config.reconnect_delay
    }

    /// Connect, subscribe and serve until something fails
    async fn connect_and_run(&self, session: &mut Session) -> Error {
        if let Err(e) = session.connect().await {
            return e;
        }
        self.stats.sessions_established.fetch_add(1, Ordering::Relaxed);

        let forwarder = Arc::new(InboundForwarder::new(self.bridge.inbound().clone()));
        if let Err(e) = session
            .subscribe(&self.config.subscribe_topic, self.config.subscribe_qos, forwarder)
            .await
        {
            self.stats.sessions_lost.fetch_add(1, Ordering::Relaxed);
            return e;
        }
        // Producers only see Connected once inbound delivery is in place
        self.status.set(SessionState::Connected);

        let err = event_loop::run(session, self.bridge.outbound(), self.config.yield_interval).await;
        self.stats.sessions_lost.fetch_add(1, Ordering::Relaxed);
        err
    }
}
