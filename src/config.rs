use anyhow::{Context, Result};
use std::env;

use crate::proxy::ProxySettings;

/// Static process configuration.
///
/// The design assumes constants (loopback listener, one fixed upstream,
/// one control port); every value may still be overridden through the
/// environment for harnesses that need it.
#[derive(Debug, Clone)]
pub struct Config {
    /// Host the fault proxies listen on. Loopback by default.
    pub listen_host: String,
    /// Port the fault proxies listen on.
    pub listen_port: u16,
    /// Upstream realtime service host.
    pub target_host: String,
    /// Upstream realtime service port.
    pub target_port: u16,
    /// Whether the upstream connection is made over TLS.
    pub target_tls: bool,
    /// Port the REST control API listens on.
    pub control_port: u16,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok(); // Load .env file if present

        let listen_host =
            env::var("PROXY_LISTEN_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
        let listen_port = env::var("PROXY_LISTEN_PORT")
            .unwrap_or_else(|_| "13579".to_string())
            .parse()
            .context("Invalid PROXY_LISTEN_PORT")?;

        let target_host =
            env::var("PROXY_TARGET_HOST").unwrap_or_else(|_| "realtime.ably.io".to_string());
        if target_host.trim().is_empty() {
            return Err(anyhow::anyhow!("PROXY_TARGET_HOST cannot be empty"));
        }

        let target_port = env::var("PROXY_TARGET_PORT")
            .unwrap_or_else(|_| "443".to_string())
            .parse()
            .context("Invalid PROXY_TARGET_PORT")?;

        let target_tls = env::var("PROXY_TARGET_TLS")
            .unwrap_or_else(|_| "true".to_string())
            .parse()
            .context("Invalid PROXY_TARGET_TLS")?;

        let control_port = env::var("CONTROL_API_PORT")
            .unwrap_or_else(|_| "8080".to_string())
            .parse()
            .context("Invalid CONTROL_API_PORT")?;

        Ok(Config {
            listen_host,
            listen_port,
            target_host,
            target_port,
            target_tls,
            control_port,
        })
    }

    /// The slice of configuration a proxy instance needs.
    pub fn proxy_settings(&self) -> ProxySettings {
        ProxySettings {
            listen_host: self.listen_host.clone(),
            listen_port: self.listen_port,
            target_host: self.target_host.clone(),
            target_port: self.target_port,
            target_tls: self.target_tls,
        }
    }
}
