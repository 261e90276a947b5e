//! Upstream TLS configuration.
//!
//! The proxy terminates the client in cleartext on loopback and speaks
//! TLS only towards the realtime service:
//! - TLS 1.2 and 1.3 only
//! - webpki roots (Mozilla CA bundle)
//! - SNI set to the configured target host

use rustls::pki_types::ServerName;
use rustls::version::{TLS12, TLS13};
use rustls::{ClientConfig, RootCertStore};
use std::sync::Arc;
use thiserror::Error;
use tokio_rustls::TlsConnector;
use tracing::debug;
use webpki_roots::TLS_SERVER_ROOTS;

/// TLS configuration errors
#[derive(Debug, Error)]
pub enum TlsError {
    #[error("Invalid server name: {0}")]
    InvalidServerName(String),
}

/// Upstream TLS config (proxy acts as client with real verification)
pub struct UpstreamTls {
    config: Arc<ClientConfig>,
}

impl UpstreamTls {
    /// Build client config with webpki root certificates.
    pub fn new() -> Result<Self, TlsError> {
        let mut root_store = RootCertStore::empty();
        root_store.extend(TLS_SERVER_ROOTS.iter().cloned());

        let versions = [&TLS12, &TLS13];
        let config = ClientConfig::builder_with_protocol_versions(&versions)
            .with_root_certificates(root_store)
            .with_no_client_auth();

        debug!(
            roots_count = TLS_SERVER_ROOTS.len(),
            "Upstream TLS config created"
        );

        Ok(Self {
            config: Arc::new(config),
        })
    }

    /// Connector for opening upstream connections.
    pub fn connector(&self) -> TlsConnector {
        TlsConnector::from(Arc::clone(&self.config))
    }

    /// Parse hostname into ServerName for SNI
    pub fn server_name(hostname: &str) -> Result<ServerName<'static>, TlsError> {
        ServerName::try_from(hostname.to_owned())
            .map_err(|e| TlsError::InvalidServerName(format!("{}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upstream_tls_creation() {
        let config = UpstreamTls::new();
        assert!(config.is_ok());
    }

    #[test]
    fn test_server_name_parsing() {
        assert!(UpstreamTls::server_name("realtime.ably.io").is_ok());
        assert!(UpstreamTls::server_name("127.0.0.1").is_ok());
        assert!(
            UpstreamTls::server_name("").is_err(),
            "empty hostname should fail"
        );
    }
}
