//! TLS client configuration
//!
//! Builds a rustls client connector that trusts exactly the CA certificate
//! supplied in the security options and enforces a minimum protocol version.

use std::fmt;
use std::sync::Arc;

use serde::Deserialize;
use tokio_rustls::rustls::pki_types::pem::PemObject;
use tokio_rustls::rustls::pki_types::{CertificateDer, ServerName};
use tokio_rustls::rustls::version::{TLS12, TLS13};
use tokio_rustls::rustls::{ClientConfig, RootCertStore, SupportedProtocolVersion};
use tokio_rustls::TlsConnector;

/// Lowest TLS version the client will negotiate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TlsVersion {
    #[default]
    Tls12,
    Tls13,
}

static TLS12_UP: &[&SupportedProtocolVersion] = &[&TLS13, &TLS12];
static TLS13_ONLY: &[&SupportedProtocolVersion] = &[&TLS13];

impl TlsVersion {
    fn protocol_versions(self) -> &'static [&'static SupportedProtocolVersion] {
        match self {
            TlsVersion::Tls12 => TLS12_UP,
            TlsVersion::Tls13 => TLS13_ONLY,
        }
    }
}

/// Transport security settings
#[derive(Debug, Clone, Default)]
pub struct SecurityOptions {
    pub enabled: bool,
    pub min_version: TlsVersion,
    /// PEM encoded CA certificate(s) to pin
    pub ca_certificate: Vec<u8>,
    /// Name to verify in the broker certificate; defaults to the host
    pub server_name: Option<String>,
}

impl SecurityOptions {
    /// Plain TCP
    pub fn plain() -> Self {
        Self::default()
    }

    /// TLS pinned to the given PEM CA certificate
    pub fn tls(ca_certificate: impl Into<Vec<u8>>, min_version: TlsVersion) -> Self {
        Self {
            enabled: true,
            min_version,
            ca_certificate: ca_certificate.into(),
            server_name: None,
        }
    }
}

/// Error type for TLS configuration
#[derive(Debug)]
pub enum TlsError {
    /// CA material missing or unparsable
    CertificateError(String),
    /// Broker name is not a valid DNS name or IP address
    InvalidServerName(String),
}

impl fmt::Display for TlsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TlsError::CertificateError(msg) => write!(f, "Certificate error: {}", msg),
            TlsError::InvalidServerName(name) => write!(f, "Invalid server name: {}", name),
        }
    }
}

impl std::error::Error for TlsError {}

/// Parse PEM CA certificates into a root store
fn load_ca_certs(pem: &[u8]) -> Result<RootCertStore, TlsError> {
    let certs: Vec<CertificateDer<'static>> = CertificateDer::pem_slice_iter(pem)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TlsError::CertificateError(format!("Failed to parse CA certificate: {}", e)))?;

    if certs.is_empty() {
        return Err(TlsError::CertificateError(
            "No certificates found in CA material".to_string(),
        ));
    }

    let mut root_store = RootCertStore::empty();
    for cert in certs {
        root_store.add(cert).map_err(|e| {
            TlsError::CertificateError(format!("Failed to add CA certificate: {}", e))
        })?;
    }

    Ok(root_store)
}

/// Create a TlsConnector trusting only the configured CA
pub fn build_connector(options: &SecurityOptions) -> Result<TlsConnector, TlsError> {
    let root_store = load_ca_certs(&options.ca_certificate)?;

    let config = ClientConfig::builder_with_protocol_versions(options.min_version.protocol_versions())
        .with_root_certificates(root_store)
        .with_no_client_auth();

    Ok(TlsConnector::from(Arc::new(config)))
}

/// Resolve the name presented for certificate verification
pub fn server_name(options: &SecurityOptions, host: &str) -> Result<ServerName<'static>, TlsError> {
    let name = options.server_name.as_deref().unwrap_or(host).to_string();
    ServerName::try_from(name.clone()).map_err(|_| TlsError::InvalidServerName(name))
}
