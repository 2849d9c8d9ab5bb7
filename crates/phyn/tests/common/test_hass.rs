//! Isolated host for integration tests
//!
//! Wires config entries, the flow manager, the service registry and the
//! registries to a temporary config dir, then registers the integration
//! against a [`FakeConnector`].

use std::sync::Arc;

use hass_config_entries::{
    ConfigEntries, ConfigEntry, ConfigEntrySource, FlowManager, FlowResult,
};
use hass_registries::{DeviceIdentifier, Registries, Storage};
use hass_services::{ServiceRegistry, SharedServiceRegistry};
use phyn::api::{Brand, Credentials};
use phyn::consts::{CONFIG_FLOW_MINOR_VERSION, CONFIG_FLOW_VERSION, DOMAIN};
use phyn::PhynIntegration;
use tempfile::TempDir;

use super::FakeConnector;

pub struct TestHass {
    pub dir: TempDir,
    pub storage: Arc<Storage>,
    pub api: Arc<FakeConnector>,
    pub entries: Arc<ConfigEntries>,
    pub flows: FlowManager,
    pub services: SharedServiceRegistry,
    pub registries: Registries,
    pub integration: Arc<PhynIntegration>,
}

impl TestHass {
    pub fn new() -> Self {
        super::init_tracing();

        let dir = TempDir::new().unwrap();
        let storage = Arc::new(Storage::new(dir.path()));
        let api = Arc::new(FakeConnector::new());
        let entries = Arc::new(ConfigEntries::new(storage.clone()));
        let flows = FlowManager::new(entries.clone());
        let services: SharedServiceRegistry = Arc::new(ServiceRegistry::new());
        let registries = Registries::new(storage.clone());

        let integration = Arc::new(PhynIntegration::new(
            api.clone(),
            services.clone(),
            &registries,
        ));
        integration.register(&entries, &flows);

        Self {
            dir,
            storage,
            api,
            entries,
            flows,
            services,
            registries,
            integration,
        }
    }

    /// Store an entry as the user flow would, without setting it up
    pub async fn add_entry(&self, username: &str, password: &str, brand: Brand) -> ConfigEntry {
        let entry = ConfigEntry::new(DOMAIN, "Home A")
            .with_data(Credentials::new(username, password, brand).to_entry_data())
            .with_unique_id(username)
            .with_version(CONFIG_FLOW_VERSION, CONFIG_FLOW_MINOR_VERSION);
        self.entries.add(entry).await.unwrap()
    }

    /// Store an entry and set it up
    pub async fn add_loaded_entry(
        &self,
        username: &str,
        password: &str,
        brand: Brand,
    ) -> ConfigEntry {
        let entry = self.add_entry(username, password, brand).await;
        self.entries.setup(&entry.entry_id).await.unwrap();
        self.entries.get(&entry.entry_id).unwrap()
    }

    /// Register a valve entity on a device carrying the given Phyn id
    pub fn add_valve(&self, entity_id: &str, phyn_device_id: &str, entry_id: &str) {
        let device = self.registries.devices.get_or_create(
            &[DeviceIdentifier::new(DOMAIN, phyn_device_id)],
            Some(entry_id),
            Some("Phyn Plus"),
        );
        self.registries
            .entities
            .register(entity_id, DOMAIN, Some(phyn_device_id), Some(&device.id), Some(entry_id))
            .unwrap();
    }

    pub async fn start_user_flow(&self) -> FlowResult {
        self.flows
            .init(DOMAIN, ConfigEntrySource::User, None, None)
            .await
            .unwrap()
    }

    pub async fn start_reconfigure_flow(&self, entry_id: &str) -> FlowResult {
        self.flows
            .init(DOMAIN, ConfigEntrySource::Reconfigure, Some(entry_id), None)
            .await
            .unwrap()
    }
}
