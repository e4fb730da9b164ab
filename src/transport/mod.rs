//! Transport Layer
//!
//! Uniform read/write/disconnect over a plain TCP socket or a TLS session on
//! top of one. The session drives whichever variant it was handed without
//! knowing which it is.

mod tls;

pub use tls::{build_connector, server_name, SecurityOptions, TlsError, TlsVersion};

use std::time::Duration;

use bytes::BytesMut;
use socket2::{SockRef, TcpKeepalive};
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::client::TlsStream;
use tracing::{debug, warn};

use crate::error::Error;

/// Interval between OS-level TCP keepalives on broker sockets
const TCP_KEEPALIVE: Duration = Duration::from_secs(60);

/// Upper bound on a graceful shutdown of a dead peer
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

/// Configure a freshly connected TCP stream
pub fn configure_stream(stream: &TcpStream) -> std::io::Result<()> {
    stream.set_nodelay(true)?;
    SockRef::from(stream).set_tcp_keepalive(&TcpKeepalive::new().with_time(TCP_KEEPALIVE))?;
    Ok(())
}

/// A broker connection, exclusively owned by one session
pub enum Transport {
    Tcp(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
    /// Never connected, or already disconnected
    Closed,
}

impl Transport {
    /// Connect to `host:port`, wrapping the socket in TLS when `security.enabled`.
    ///
    /// DNS, connect, handshake and CA failures all come back as
    /// [`Error::Connection`]; `connect_timeout` bounds each phase.
    pub async fn connect(
        host: &str,
        port: u16,
        security: &SecurityOptions,
        connect_timeout: Duration,
    ) -> Result<Self, Error> {
        let stream = timeout(connect_timeout, TcpStream::connect((host, port)))
            .await
            .map_err(|_| Error::Connection(format!("connect to {}:{} timed out", host, port)))?
            .map_err(|e| Error::io(&format!("connect to {}:{}", host, port), e))?;

        if let Err(e) = configure_stream(&stream) {
            warn!("Failed to configure socket options: {}", e);
        }

        if !security.enabled {
            debug!("TCP connection established to {}:{}", host, port);
            return Ok(Transport::Tcp(stream));
        }

        let connector = build_connector(security).map_err(|e| Error::Connection(e.to_string()))?;
        let domain = server_name(security, host).map_err(|e| Error::Connection(e.to_string()))?;

        let tls_stream = timeout(connect_timeout, connector.connect(domain, stream))
            .await
            .map_err(|_| Error::Connection("TLS handshake timed out".to_string()))?
            .map_err(|e| Error::io("TLS handshake", e))?;

        debug!("TLS connection established to {}:{}", host, port);
        Ok(Transport::Tls(Box::new(tls_stream)))
    }

    /// Wrap an already connected plain socket
    pub fn from_tcp(stream: TcpStream) -> Self {
        Transport::Tcp(stream)
    }

    pub fn is_open(&self) -> bool {
        !matches!(self, Transport::Closed)
    }

    /// Read into `buf`, waiting at most `wait`.
    ///
    /// Returns `Ok(0)` when nothing arrived in time. A closed stream is an
    /// error, never `Ok(0)`.
    pub async fn read(&mut self, buf: &mut [u8], wait: Duration) -> Result<usize, Error> {
        if buf.is_empty() {
            return Ok(0);
        }
        let result = match self {
            Transport::Tcp(s) => timeout(wait, s.read(buf)).await,
            Transport::Tls(s) => timeout(wait, s.read(buf)).await,
            Transport::Closed => return Err(closed()),
        };
        match result {
            Err(_) => Ok(0),
            Ok(read) => check_read(read),
        }
    }

    /// Append whatever the socket has to `buf`, waiting until something
    /// arrives. Cancel-safe: dropping the future loses no data.
    pub async fn read_buf(&mut self, buf: &mut BytesMut) -> Result<usize, Error> {
        buf.reserve(512);
        let read = match self {
            Transport::Tcp(s) => s.read_buf(buf).await,
            Transport::Tls(s) => s.read_buf(buf).await,
            Transport::Closed => return Err(closed()),
        };
        check_read(read)
    }

    /// Write and flush all of `buf` within `wait`
    pub async fn write(&mut self, buf: &[u8], wait: Duration) -> Result<usize, Error> {
        let result = match self {
            Transport::Tcp(s) => timeout(wait, write_all_flush(s, buf)).await,
            Transport::Tls(s) => timeout(wait, write_all_flush(s.as_mut(), buf)).await,
            Transport::Closed => return Err(closed()),
        };
        match result {
            Err(_) => Err(Error::Connection("write timed out".to_string())),
            Ok(Err(e)) => Err(Error::io("write failed", e)),
            Ok(Ok(())) => Ok(buf.len()),
        }
    }

    /// Close the connection. Safe to call any number of times.
    pub async fn disconnect(&mut self) {
        match std::mem::replace(self, Transport::Closed) {
            Transport::Tcp(mut s) => {
                let _ = timeout(SHUTDOWN_TIMEOUT, s.shutdown()).await;
            }
            Transport::Tls(mut s) => {
                // Sends close_notify before shutting down the socket
                let _ = timeout(SHUTDOWN_TIMEOUT, s.shutdown()).await;
            }
            Transport::Closed => {}
        }
    }
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self {
            Transport::Tcp(_) => "Tcp",
            Transport::Tls(_) => "Tls",
            Transport::Closed => "Closed",
        };
        f.debug_tuple("Transport").field(&kind).finish()
    }
}

async fn write_all_flush<S>(stream: &mut S, buf: &[u8]) -> std::io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    stream.write_all(buf).await?;
    stream.flush().await
}

fn check_read(read: std::io::Result<usize>) -> Result<usize, Error> {
    match read {
        Ok(0) => Err(Error::Connection("connection closed by peer".to_string())),
        Ok(n) => Ok(n),
        Err(e) => Err(Error::io("read failed", e)),
    }
}

fn closed() -> Error {
    Error::Connection("transport is closed".to_string())
}
