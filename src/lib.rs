//! mqttlink - embedded MQTT v3.1/v3.1.1 client engine
//!
//! A client session state machine with keepalive and a reconnect supervisor,
//! running over plain TCP or TLS, bridged to the rest of the process through
//! two bounded message queues.

pub mod bridge;
pub mod codec;
pub mod config;
pub mod error;
pub mod protocol;
pub mod sensor;
pub mod session;
pub mod supervisor;
pub mod topic;
pub mod transport;

pub use bridge::{Bridge, Message, MessageQueue};
pub use config::Config;
pub use error::Error;
pub use protocol::{ProtocolVersion, QoS};
pub use session::{MessageHandler, Session, SessionOptions, SessionState};
pub use supervisor::{ConnectionStatus, Supervisor, SupervisorConfig};
pub use transport::{SecurityOptions, Transport};
