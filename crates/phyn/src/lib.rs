//! Phyn / Kohler leak detection integration
//!
//! Connects a Phyn or Kohler cloud account to the platform. The account is
//! added through [`config_flow::PhynConfigFlow`]; each loaded config entry
//! keeps an authenticated client in the [`ClientStore`], which the
//! `phyn.leak_test` service uses to reach devices.
//!
//! # Key Types
//!
//! - [`PhynIntegration`] - Entry setup/unload and registration with the host
//! - [`api::PhynConnector`] / [`api::PhynClient`] - Cloud API seam
//! - [`services::LeakTestHandler`] - Leak test service

pub mod api;
pub mod config_flow;
pub mod consts;
pub mod services;

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use hass_config_entries::{
    ConfigEntries, ConfigEntry, ConfigFlow, FlowManager, IntegrationSetup, SetupError,
};
use hass_registries::Registries;
use hass_services::SharedServiceRegistry;
use tracing::{debug, info, warn};

use crate::api::{Credentials, PhynClient, PhynConnector};
use crate::config_flow::PhynConfigFlow;
use crate::consts::{DOMAIN, SERVICE_LEAK_TEST};
use crate::services::{register_leak_test_service, ClientLookup, LeakTestHandler};

/// Authenticated clients keyed by config entry id
#[derive(Default)]
pub struct ClientStore {
    clients: DashMap<String, Arc<dyn PhynClient>>,
}

impl ClientStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, entry_id: impl Into<String>, client: Arc<dyn PhynClient>) {
        self.clients.insert(entry_id.into(), client);
    }

    pub fn get(&self, entry_id: &str) -> Option<Arc<dyn PhynClient>> {
        self.clients.get(entry_id).map(|c| c.value().clone())
    }

    pub fn remove(&self, entry_id: &str) -> Option<Arc<dyn PhynClient>> {
        self.clients.remove(entry_id).map(|(_, client)| client)
    }

    pub fn contains(&self, entry_id: &str) -> bool {
        self.clients.contains_key(entry_id)
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}

impl ClientLookup for ClientStore {
    fn client_for(&self, config_entry_ids: &[String]) -> Option<Arc<dyn PhynClient>> {
        // Devices registered before entries were tracked carry no entry id
        if config_entry_ids.is_empty() {
            if self.clients.len() == 1 {
                return self.clients.iter().next().map(|c| c.value().clone());
            }
            return None;
        }
        // A device never borrows another account's session
        config_entry_ids.iter().find_map(|id| self.get(id))
    }
}

pub struct PhynIntegration {
    connector: Arc<dyn PhynConnector>,
    clients: Arc<ClientStore>,
    services: SharedServiceRegistry,
    leak_test: Arc<LeakTestHandler>,
}

impl PhynIntegration {
    pub fn new(
        connector: Arc<dyn PhynConnector>,
        services: SharedServiceRegistry,
        registries: &Registries,
    ) -> Self {
        let clients = Arc::new(ClientStore::new());
        let leak_test = Arc::new(LeakTestHandler::new(
            registries.entities.clone(),
            registries.devices.clone(),
            clients.clone(),
        ));
        Self {
            connector,
            clients,
            services,
            leak_test,
        }
    }

    pub fn clients(&self) -> &Arc<ClientStore> {
        &self.clients
    }

    /// Hook the integration and its config flow into the host
    pub fn register(self: &Arc<Self>, entries: &ConfigEntries, flows: &FlowManager) {
        entries.register_integration(DOMAIN, self.clone());

        let connector = self.connector.clone();
        flows.register_flow(
            DOMAIN,
            Arc::new(move || Box::new(PhynConfigFlow::new(connector.clone())) as Box<dyn ConfigFlow>),
        );
        info!("Registered {} integration", DOMAIN);
    }
}

#[async_trait]
impl IntegrationSetup for PhynIntegration {
    async fn setup_entry(&self, entry: &ConfigEntry) -> Result<(), SetupError> {
        let credentials = Credentials::from_entry_data(&entry.data)
            .map_err(|e| SetupError::NotReady(format!("invalid entry data: {}", e)))?;

        let client = self
            .connector
            .connect(
                &credentials.username,
                &credentials.password,
                credentials.brand,
            )
            .await
            .map_err(|err| {
                if err.is_not_authorized() {
                    SetupError::AuthFailed(err.to_string())
                } else {
                    SetupError::NotReady(err.to_string())
                }
            })?;

        self.clients.insert(entry.entry_id.clone(), client);
        debug!("Stored client for entry {}", entry.entry_id);

        if !self.services.has_service(DOMAIN, SERVICE_LEAK_TEST) {
            register_leak_test_service(&self.services, self.leak_test.clone())
                .map_err(|e| SetupError::NotReady(e.to_string()))?;
        }
        Ok(())
    }

    async fn unload_entry(&self, entry: &ConfigEntry) -> Result<(), String> {
        if self.clients.remove(&entry.entry_id).is_none() {
            warn!("No client stored for entry {}", entry.entry_id);
        }
        if self.clients.is_empty() {
            self.services.unregister(DOMAIN, SERVICE_LEAK_TEST);
        }
        Ok(())
    }
}
