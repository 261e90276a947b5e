//! The fault catalog and the simulation lifecycle.
//!
//! A [`Fault`] is a static descriptor; [`Fault::simulate`] instantiates
//! it as a [`FaultSimulation`] bound to its own proxy listener. The
//! lifecycle is
//!
//! ```text
//! idle -- enable() --> active -- resolve() --> resolved
//! {any} -- clean_up() --> destroyed   (idempotent)
//! ```
//!
//! Transport faults perturb the raw TCP tunnel; application faults work
//! on terminated WebSocket frames through an interceptor.

pub mod application;
pub mod transport;

use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::proxy::{ProxyError, ProxySettings, RealtimeProxy};

/// The observable effect class at the SDK level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FaultType {
    /// The client is expected to recover transparently within the
    /// connection.
    Nonfatal,
    /// Recovery requires a successful resume.
    NonfatalWithResume,
    /// The client is expected to surface a terminal failure.
    Fatal,
}

/// Fault lifecycle errors.
#[derive(Debug, Error)]
pub enum FaultError {
    #[error("cannot {op} a simulation in state {state}")]
    Lifecycle {
        op: &'static str,
        state: &'static str,
    },

    #[error(transparent)]
    Proxy(#[from] ProxyError),
}

/// Lifecycle states of a fault simulation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Idle,
    Active,
    Resolved,
    Destroyed,
}

impl LifecycleState {
    fn name(self) -> &'static str {
        match self {
            LifecycleState::Idle => "idle",
            LifecycleState::Active => "active",
            LifecycleState::Resolved => "resolved",
            LifecycleState::Destroyed => "destroyed",
        }
    }
}

/// Shared lifecycle state machine for simulations.
pub(crate) struct Lifecycle {
    state: StdMutex<LifecycleState>,
}

impl Lifecycle {
    pub(crate) fn new() -> Self {
        Self {
            state: StdMutex::new(LifecycleState::Idle),
        }
    }

    pub(crate) fn state(&self) -> LifecycleState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn begin_enable(&self) -> Result<(), FaultError> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        match *state {
            LifecycleState::Idle => {
                *state = LifecycleState::Active;
                Ok(())
            }
            other => Err(FaultError::Lifecycle {
                op: "enable",
                state: other.name(),
            }),
        }
    }

    pub(crate) fn begin_resolve(&self) -> Result<(), FaultError> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        match *state {
            LifecycleState::Active => {
                *state = LifecycleState::Resolved;
                Ok(())
            }
            other => Err(FaultError::Lifecycle {
                op: "resolve",
                state: other.name(),
            }),
        }
    }

    /// Move to destroyed. Returns false when already destroyed, in
    /// which case the caller skips teardown work.
    pub(crate) fn destroy(&self) -> bool {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if *state == LifecycleState::Destroyed {
            return false;
        }
        *state = LifecycleState::Destroyed;
        true
    }
}

/// A live instance of a fault with its own proxy listener.
#[async_trait]
pub trait FaultSimulation: Send + Sync {
    fn id(&self) -> &str;
    fn name(&self) -> &'static str;
    fn fault_type(&self) -> FaultType;
    fn proxy(&self) -> &dyn RealtimeProxy;

    /// Start injecting the failure mode.
    async fn enable(&self) -> Result<(), FaultError>;

    /// Restore normal behavior. The simulation stays alive.
    async fn resolve(&self) -> Result<(), FaultError>;

    /// Tear down the proxy and every open connection. Safe from any
    /// state; repeated calls are no-ops.
    async fn clean_up(&self) -> Result<(), FaultError>;
}

type Factory = fn(String, ProxySettings) -> Result<Arc<dyn FaultSimulation>, FaultError>;

/// Static fault descriptor.
pub struct Fault {
    pub name: &'static str,
    pub fault_type: FaultType,
    factory: Factory,
}

impl Fault {
    const fn new(name: &'static str, fault_type: FaultType, factory: Factory) -> Self {
        Self {
            name,
            fault_type,
            factory,
        }
    }

    /// Instantiate the fault. The returned simulation owns a proxy that
    /// has not been started yet.
    pub fn simulate(
        &self,
        id: String,
        settings: ProxySettings,
    ) -> Result<Arc<dyn FaultSimulation>, FaultError> {
        (self.factory)(id, settings)
    }
}

/// Every fault the proxy can inject.
pub fn catalog() -> Vec<Fault> {
    vec![
        Fault::new(
            "NullTransportFault",
            FaultType::Nonfatal,
            transport::null_transport,
        ),
        Fault::new(
            "NullApplicationLayerFault",
            FaultType::Nonfatal,
            application::null_application_layer,
        ),
        Fault::new(
            "TcpConnectionRefused",
            FaultType::Nonfatal,
            transport::connection_refused,
        ),
        Fault::new(
            "TcpConnectionUnresponsive",
            FaultType::Nonfatal,
            transport::connection_unresponsive,
        ),
        Fault::new(
            "AttachUnresponsive",
            FaultType::Nonfatal,
            application::attach_unresponsive,
        ),
        Fault::new(
            "DetachUnresponsive",
            FaultType::Nonfatal,
            application::detach_unresponsive,
        ),
        Fault::new(
            "DisconnectWithFailedResume",
            FaultType::Nonfatal,
            application::disconnect_with_failed_resume,
        ),
        Fault::new(
            "EnterFailedWithNonfatalNack",
            FaultType::Nonfatal,
            application::enter_failed_with_nonfatal_nack,
        ),
        Fault::new(
            "UpdateFailedWithNonfatalNack",
            FaultType::Nonfatal,
            application::update_failed_with_nonfatal_nack,
        ),
        Fault::new(
            "DisconnectAndSuspend",
            FaultType::Fatal,
            application::disconnect_and_suspend,
        ),
        Fault::new(
            "ReenterOnResumeFailed",
            FaultType::Nonfatal,
            application::reenter_on_resume_failed,
        ),
        Fault::new(
            "EnterUnresponsive",
            FaultType::Nonfatal,
            application::enter_unresponsive,
        ),
    ]
}
