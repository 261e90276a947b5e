//! Keyed map of active fault simulations.
//!
//! Mutations are serialized behind one lock; lifecycle calls operate on
//! a snapshot reference taken under the lock and released before any
//! proxy I/O happens.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

use crate::fault::{catalog, Fault, FaultError, FaultSimulation, FaultType};
use crate::proxy::{ProxySettings, RealtimeProxy};

/// Registry errors, mapped to HTTP statuses by the control layer.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("unknown fault: {0}")]
    UnknownFault(String),

    #[error("unknown simulation: {0}")]
    UnknownSimulation(String),

    #[error(transparent)]
    Fault(#[from] FaultError),
}

/// Wire shape of a freshly created simulation.
#[derive(Debug, Serialize)]
pub struct SimulationDescriptor {
    pub id: String,
    pub name: &'static str,
    #[serde(rename = "type")]
    pub fault_type: FaultType,
    pub proxy: ProxyDescriptor,
}

#[derive(Debug, Serialize)]
pub struct ProxyDescriptor {
    #[serde(rename = "listenPort")]
    pub listen_port: u16,
}

pub struct SimulationRegistry {
    faults: Vec<Fault>,
    settings: ProxySettings,
    active: Mutex<HashMap<String, Arc<dyn FaultSimulation>>>,
}

impl SimulationRegistry {
    pub fn new(settings: ProxySettings) -> Self {
        Self {
            faults: catalog(),
            settings,
            active: Mutex::new(HashMap::new()),
        }
    }

    /// Names of every fault in the catalog.
    pub fn fault_names(&self) -> Vec<&'static str> {
        self.faults.iter().map(|fault| fault.name).collect()
    }

    /// Instantiate a fault by name, start its proxy and register it.
    /// The same name may be simulated any number of times; every call
    /// mints a fresh id.
    pub async fn create_simulation(
        &self,
        name: &str,
    ) -> Result<SimulationDescriptor, RegistryError> {
        let fault = self
            .faults
            .iter()
            .find(|fault| fault.name == name)
            .ok_or_else(|| RegistryError::UnknownFault(name.to_string()))?;

        let id = Uuid::new_v4().to_string();
        let simulation = fault.simulate(id.clone(), self.settings.clone())?;
        simulation
            .proxy()
            .start()
            .await
            .map_err(FaultError::from)?;

        let descriptor = SimulationDescriptor {
            id: id.clone(),
            name: simulation.name(),
            fault_type: simulation.fault_type(),
            proxy: ProxyDescriptor {
                listen_port: simulation.proxy().listen_port(),
            },
        };

        self.active.lock().await.insert(id.clone(), simulation);
        info!(id = %id, name, listen_port = descriptor.proxy.listen_port, "simulation created");
        Ok(descriptor)
    }

    async fn lookup(&self, id: &str) -> Result<Arc<dyn FaultSimulation>, RegistryError> {
        let active = self.active.lock().await;
        active
            .get(id)
            .cloned()
            .ok_or_else(|| RegistryError::UnknownSimulation(id.to_string()))
    }

    pub async fn enable(&self, id: &str) -> Result<(), RegistryError> {
        let simulation = self.lookup(id).await?;
        simulation.enable().await?;
        info!(id, name = simulation.name(), "simulation enabled");
        Ok(())
    }

    pub async fn resolve(&self, id: &str) -> Result<(), RegistryError> {
        let simulation = self.lookup(id).await?;
        simulation.resolve().await?;
        info!(id, name = simulation.name(), "simulation resolved");
        Ok(())
    }

    /// Destroy and deregister a simulation. Unknown ids succeed so a
    /// repeated clean-up is a no-op.
    pub async fn clean_up(&self, id: &str) -> Result<(), RegistryError> {
        let simulation = { self.active.lock().await.remove(id) };
        match simulation {
            Some(simulation) => {
                simulation.clean_up().await?;
                info!(id, name = simulation.name(), "simulation cleaned up");
            }
            None => debug!(id, "clean-up of unknown simulation ignored"),
        }
        Ok(())
    }

    /// Tear down every active simulation (process shutdown).
    pub async fn clean_up_all(&self) {
        let simulations: Vec<_> = {
            let mut active = self.active.lock().await;
            active.drain().map(|(_, simulation)| simulation).collect()
        };
        for simulation in simulations {
            if let Err(e) = simulation.clean_up().await {
                debug!(id = simulation.id(), error = %e, "clean-up during shutdown failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_registry() -> SimulationRegistry {
        SimulationRegistry::new(ProxySettings {
            listen_host: "127.0.0.1".to_string(),
            listen_port: 0,
            target_host: "127.0.0.1".to_string(),
            target_port: 9,
            target_tls: false,
        })
    }

    #[test]
    fn test_fault_names_cover_the_catalog() {
        let registry = test_registry();
        let names = registry.fault_names();
        assert_eq!(names.len(), 12);
        assert!(names.contains(&"NullTransportFault"));
        assert!(names.contains(&"DisconnectAndSuspend"));
    }

    #[tokio::test]
    async fn test_create_simulation_starts_proxy_and_registers() {
        let registry = test_registry();
        let descriptor = registry
            .create_simulation("NullTransportFault")
            .await
            .expect("create should succeed");

        assert_eq!(descriptor.name, "NullTransportFault");
        assert_eq!(descriptor.fault_type, FaultType::Nonfatal);
        assert_ne!(descriptor.proxy.listen_port, 0);

        registry.enable(&descriptor.id).await.expect("enable");
        registry.resolve(&descriptor.id).await.expect("resolve");
        registry.clean_up(&descriptor.id).await.expect("clean up");
    }

    #[tokio::test]
    async fn test_create_unknown_fault_is_rejected() {
        let registry = test_registry();
        let result = registry.create_simulation("NoSuchFault").await;
        assert!(matches!(result, Err(RegistryError::UnknownFault(_))));
    }

    #[tokio::test]
    async fn test_duplicate_names_mint_fresh_ids() {
        let registry = test_registry();
        let first = registry.create_simulation("NullTransportFault").await.unwrap();
        let second = registry.create_simulation("NullTransportFault").await.unwrap();
        assert_ne!(first.id, second.id);

        registry.clean_up(&first.id).await.unwrap();
        registry.clean_up(&second.id).await.unwrap();
    }

    #[tokio::test]
    async fn test_lifecycle_on_unknown_id() {
        let registry = test_registry();
        assert!(matches!(
            registry.enable("missing").await,
            Err(RegistryError::UnknownSimulation(_))
        ));
        assert!(matches!(
            registry.resolve("missing").await,
            Err(RegistryError::UnknownSimulation(_))
        ));
        // clean-up of an unknown id is a success
        assert!(registry.clean_up("missing").await.is_ok());
    }

    #[tokio::test]
    async fn test_clean_up_is_idempotent() {
        let registry = test_registry();
        let descriptor = registry.create_simulation("NullTransportFault").await.unwrap();

        registry.clean_up(&descriptor.id).await.expect("first clean-up");
        registry.clean_up(&descriptor.id).await.expect("second clean-up");

        // lifecycle calls after clean-up are client errors
        assert!(registry.enable(&descriptor.id).await.is_err());
    }

    #[tokio::test]
    async fn test_descriptor_serializes_to_the_wire_shape() {
        let registry = test_registry();
        let descriptor = registry.create_simulation("DisconnectAndSuspend").await.unwrap();

        let json = serde_json::to_value(&descriptor).unwrap();
        assert_eq!(json["name"], "DisconnectAndSuspend");
        assert_eq!(json["type"], "Fatal");
        assert!(json["proxy"]["listenPort"].as_u64().is_some());
        assert!(json["id"].as_str().is_some());

        registry.clean_up(&descriptor.id).await.unwrap();
    }
}
