//! Faultline - Fault-injection proxy for realtime WebSocket SDKs
//!
//! Faultline interposes itself between a client SDK under test and the
//! remote realtime service and perturbs the connection in well-defined
//! ways so the client's recovery logic can be exercised. A test harness
//! drives it over a small REST API.
//!
//! ## Features
//!
//! - **Layer-4 tunnel**: forwards the TLS byte stream verbatim, rewrites
//!   the `Host` header during the WebSocket upgrade, and can refuse
//!   connections or black-hole traffic on demand
//! - **Layer-7 terminator**: terminates the WebSocket on both sides and
//!   shuttles frames through a pluggable interceptor
//! - **Fault catalog**: twelve reproducible failure modes with a
//!   `simulate` / `enable` / `resolve` / `clean_up` lifecycle
//! - **Control API**: list faults, spin up simulations, drive their
//!   lifecycle over HTTP/JSON
//!
//! ## Usage
//!
//! ```rust,no_run
//! use faultline::registry::SimulationRegistry;
//! use faultline::Config;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::from_env()?;
//!     let registry = SimulationRegistry::new(config.proxy_settings());
//!
//!     let simulation = registry.create_simulation("TcpConnectionRefused").await?;
//!     registry.enable(&simulation.id).await?;
//!     // ... exercise the SDK against 127.0.0.1:13579 ...
//!     registry.clean_up(&simulation.id).await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! - `proxy` - the two interception engines and the interceptor seam
//! - `fault` - the fault catalog and simulation lifecycle
//! - `protocol` - minimal realtime wire codec (JSON + binary)
//! - `registry` - keyed map of active simulations
//! - `control` - REST dispatcher over the registry
//! - `config` / `tls` - process configuration and upstream TLS

pub mod config;
pub mod control;
pub mod fault;
pub mod protocol;
pub mod proxy;
pub mod registry;
pub mod tls;

/// Configuration types
pub use config::Config;

/// Fault model
pub use fault::{catalog, Fault, FaultError, FaultSimulation, FaultType};

/// Proxy surfaces
pub use proxy::interceptor::{Action, Direction, Interceptor, PassThroughInterceptor};
pub use proxy::params::ConnectionParams;
pub use proxy::tcp::TcpTunnel;
pub use proxy::ws::WebSocketTerminator;
pub use proxy::{ProxyError, ProxySettings, RealtimeProxy};

/// Registry and control plane
pub use registry::{RegistryError, SimulationDescriptor, SimulationRegistry};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const NAME: &str = env!("CARGO_PKG_NAME");
