//! Transport-layer fault simulations.
//!
//! These faults perturb the raw TCP tunnel: refuse new connections or
//! black-hole traffic on open ones. The TLS byte stream is never
//! inspected.

use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::debug;

use crate::fault::{FaultError, FaultSimulation, FaultType, Lifecycle};
use crate::proxy::tcp::TcpTunnel;
use crate::proxy::{ProxySettings, RealtimeProxy};

/// How long `TcpConnectionUnresponsive` keeps the forwarding gate shut
/// before traffic resumes on its own.
pub(crate) const UNRESPONSIVE_WINDOW: Duration = Duration::from_secs(120);

enum Behavior {
    /// Fully transparent; lifecycle transitions are no-ops.
    None,
    /// Stop the listener so connect attempts fail with ECONNREFUSED.
    RefuseConnections,
    /// Drop forwarded bytes while keeping sockets open.
    DropTraffic,
}

struct TransportFaultSimulation {
    id: String,
    name: &'static str,
    fault_type: FaultType,
    behavior: Behavior,
    tunnel: Arc<TcpTunnel>,
    lifecycle: Lifecycle,
    timer: StdMutex<Option<JoinHandle<()>>>,
}

impl TransportFaultSimulation {
    fn create(
        id: String,
        name: &'static str,
        fault_type: FaultType,
        behavior: Behavior,
        settings: ProxySettings,
    ) -> Result<Arc<dyn FaultSimulation>, FaultError> {
        Ok(Arc::new(Self {
            id,
            name,
            fault_type,
            behavior,
            tunnel: Arc::new(TcpTunnel::new(settings)?),
            lifecycle: Lifecycle::new(),
            timer: StdMutex::new(None),
        }))
    }

    fn replace_timer(&self, handle: Option<JoinHandle<()>>) {
        let mut timer = self.timer.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(previous) = timer.take() {
            previous.abort();
        }
        *timer = handle;
    }
}

#[async_trait]
impl FaultSimulation for TransportFaultSimulation {
    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &'static str {
        self.name
    }

    fn fault_type(&self) -> FaultType {
        self.fault_type
    }

    fn proxy(&self) -> &dyn RealtimeProxy {
        self.tunnel.as_ref()
    }

    async fn enable(&self) -> Result<(), FaultError> {
        self.lifecycle.begin_enable()?;
        match self.behavior {
            Behavior::None => {}
            Behavior::RefuseConnections => {
                self.tunnel.stop().await;
                debug!(id = %self.id, "tunnel listener stopped; connects will be refused");
            }
            Behavior::DropTraffic => {
                self.tunnel.set_forwarding(false);
                let tunnel = Arc::clone(&self.tunnel);
                self.replace_timer(Some(tokio::spawn(async move {
                    sleep(UNRESPONSIVE_WINDOW).await;
                    tunnel.set_forwarding(true);
                })));
                debug!(id = %self.id, window_secs = UNRESPONSIVE_WINDOW.as_secs(), "tunnel black-holed");
            }
        }
        Ok(())
    }

    async fn resolve(&self) -> Result<(), FaultError> {
        self.lifecycle.begin_resolve()?;
        match self.behavior {
            Behavior::None => {}
            Behavior::RefuseConnections => {
                self.tunnel.start().await?;
                debug!(id = %self.id, "tunnel listener restarted");
            }
            Behavior::DropTraffic => {
                self.replace_timer(None);
                self.tunnel.set_forwarding(true);
                debug!(id = %self.id, "tunnel forwarding restored");
            }
        }
        Ok(())
    }

    async fn clean_up(&self) -> Result<(), FaultError> {
        if !self.lifecycle.destroy() {
            return Ok(());
        }
        // Timer first, then sockets.
        self.replace_timer(None);
        self.tunnel.stop().await;
        debug!(id = %self.id, "transport simulation destroyed");
        Ok(())
    }
}

pub(crate) fn null_transport(
    id: String,
    settings: ProxySettings,
) -> Result<Arc<dyn FaultSimulation>, FaultError> {
    TransportFaultSimulation::create(
        id,
        "NullTransportFault",
        FaultType::Nonfatal,
        Behavior::None,
        settings,
    )
}

pub(crate) fn connection_refused(
    id: String,
    settings: ProxySettings,
) -> Result<Arc<dyn FaultSimulation>, FaultError> {
    TransportFaultSimulation::create(
        id,
        "TcpConnectionRefused",
        FaultType::Nonfatal,
        Behavior::RefuseConnections,
        settings,
    )
}

pub(crate) fn connection_unresponsive(
    id: String,
    settings: ProxySettings,
) -> Result<Arc<dyn FaultSimulation>, FaultError> {
    TransportFaultSimulation::create(
        id,
        "TcpConnectionUnresponsive",
        FaultType::Nonfatal,
        Behavior::DropTraffic,
        settings,
    )
}
