//! Registries
//!
//! Persistent registries of devices and entities, stored as versioned JSON
//! files in the `.storage/` directory of the config dir.

pub mod device_registry;
pub mod entity_registry;
pub mod storage;

pub use device_registry::{DeviceEntry, DeviceIdentifier, DeviceRegistry, DeviceRegistryData};
pub use entity_registry::{EntityEntry, EntityRegistry, EntityRegistryData, EntityRegistryError};
pub use storage::{Storable, Storage, StorageError, StorageFile, StorageResult};

use std::sync::Arc;

/// The registries an integration is handed together
pub struct Registries {
    pub storage: Arc<Storage>,
    pub devices: Arc<DeviceRegistry>,
    pub entities: Arc<EntityRegistry>,
}

impl Registries {
    pub fn new(storage: Arc<Storage>) -> Self {
        Self {
            devices: Arc::new(DeviceRegistry::new(storage.clone())),
            entities: Arc::new(EntityRegistry::new(storage.clone())),
            storage,
        }
    }

    pub async fn load_all(&self) -> StorageResult<()> {
        self.devices.load().await?;
        self.entities.load().await
    }

    pub async fn save_all(&self) -> StorageResult<()> {
        self.devices.save().await?;
        self.entities.save().await
    }
}
