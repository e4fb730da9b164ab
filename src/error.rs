//! Session-level error taxonomy
//!
//! Every failure surfaced by the transport, the session and the bridge maps to
//! one [`Error`]. The reconnect supervisor is the single place that recovers
//! from them; [`Error::is_fatal`] tells it whether the session is still usable.

use std::fmt;
use std::io;

use crate::protocol::{ConnectReturnCode, DecodeError, EncodeError, PacketType, ProtocolError};
use crate::session::SessionState;

/// Why a CONNECT exchange did not produce a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectFailure {
    /// Broker answered with a non-zero return code
    Refused(ConnectReturnCode),
    /// No CONNACK within the command timeout
    Timeout,
    /// Broker answered with something other than CONNACK
    UnexpectedPacket(PacketType),
}

impl fmt::Display for ConnectFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Refused(code) => write!(f, "refused: {}", code),
            Self::Timeout => write!(f, "timed out waiting for CONNACK"),
            Self::UnexpectedPacket(kind) => write!(f, "expected CONNACK, got {:?}", kind),
        }
    }
}

/// Errors surfaced by the client engine
#[derive(Debug)]
pub enum Error {
    /// Transport unusable: DNS, connect, TLS handshake, reset or peer close
    Connection(String),
    /// Malformed packet or protocol violation
    Protocol(ProtocolError),
    /// CONNECT was not accepted
    Connect(ConnectFailure),
    /// SUBSCRIBE/UNSUBSCRIBE was rejected or not acknowledged in time
    Subscribe(String),
    /// A bounded table or queue is full; the operation was dropped
    Capacity(&'static str),
    /// No PINGRESP before the keepalive deadline
    KeepaliveTimeout,
    /// Operation not allowed in the current session state
    InvalidState {
        operation: &'static str,
        state: SessionState,
    },
    /// Caller supplied an unusable topic, payload or filter
    InvalidArgument(&'static str),
}

impl Error {
    /// Fatal errors mean the connection is gone and only a reconnect helps
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Connection(_) | Error::Protocol(_) | Error::KeepaliveTimeout
        )
    }

    pub(crate) fn io(context: &str, err: io::Error) -> Self {
        Error::Connection(format!("{}: {}", context, err))
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connection(msg) => write!(f, "connection error: {}", msg),
            Self::Protocol(e) => write!(f, "protocol error: {}", e),
            Self::Connect(e) => write!(f, "connect failed: {}", e),
            Self::Subscribe(msg) => write!(f, "subscribe failed: {}", msg),
            Self::Capacity(what) => write!(f, "capacity exceeded: {}", what),
            Self::KeepaliveTimeout => write!(f, "keepalive timeout: no PINGRESP from broker"),
            Self::InvalidState { operation, state } => {
                write!(f, "cannot {} while {:?}", operation, state)
            }
            Self::InvalidArgument(msg) => write!(f, "invalid argument: {}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Protocol(e) => Some(e),
            _ => None,
        }
    }
}

impl From<ProtocolError> for Error {
    fn from(e: ProtocolError) -> Self {
        Error::Protocol(e)
    }
}

impl From<DecodeError> for Error {
    fn from(e: DecodeError) -> Self {
        Error::Protocol(ProtocolError::Decode(e))
    }
}

impl From<EncodeError> for Error {
    fn from(e: EncodeError) -> Self {
        Error::Protocol(ProtocolError::Encode(e))
    }
}
