//! Proxy layer: the two interception engines and their shared surface.
//!
//! - [`tcp::TcpTunnel`] forwards a TLS byte stream verbatim (layer 4)
//! - [`ws::WebSocketTerminator`] terminates the WebSocket on both sides
//!   and shuttles frames through an [`interceptor::Interceptor`] (layer 7)
//!
//! Both expose the same [`RealtimeProxy`] lifecycle so fault simulations
//! can hold either behind one seam.

pub mod interceptor;
pub mod params;
pub mod tcp;
pub mod ws;

use async_trait::async_trait;
use thiserror::Error;

use crate::tls::TlsError;

/// Proxy errors
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },

    #[error("TLS error: {0}")]
    Tls(#[from] TlsError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// The endpoints one proxy instance bridges.
#[derive(Debug, Clone)]
pub struct ProxySettings {
    pub listen_host: String,
    pub listen_port: u16,
    pub target_host: String,
    pub target_port: u16,
    /// Upstream over TLS. Tests point proxies at plaintext loopback
    /// fixtures by clearing this.
    pub target_tls: bool,
}

impl ProxySettings {
    pub fn listen_addr(&self, port: u16) -> String {
        format!("{}:{}", self.listen_host, port)
    }

    pub fn target_addr(&self) -> String {
        format!("{}:{}", self.target_host, self.target_port)
    }
}

/// Lifecycle surface shared by both proxy layers.
///
/// `start` is a no-op on an already-listening proxy; `stop` closes the
/// listener and every open connection and is safe to call repeatedly.
/// The listen port is stable across a stop/start cycle.
#[async_trait]
pub trait RealtimeProxy: Send + Sync {
    async fn start(&self) -> Result<(), ProxyError>;
    async fn stop(&self);
    fn listen_host(&self) -> &str;
    fn listen_port(&self) -> u16;
}
