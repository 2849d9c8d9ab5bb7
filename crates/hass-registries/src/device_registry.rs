//! Device Registry
//!
//! Tracks physical devices by the `(domain, id)` identifiers integrations
//! assign to them, and by the config entries that own them.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::storage::{Storable, Storage, StorageResult};

pub const STORAGE_KEY: &str = "core.device_registry";
pub const STORAGE_VERSION: u32 = 1;
pub const STORAGE_MINOR_VERSION: u32 = 12;

/// A `(domain, id)` pair, serialized as a two element array
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceIdentifier(pub String, pub String);

impl DeviceIdentifier {
    pub fn new(domain: impl Into<String>, id: impl Into<String>) -> Self {
        Self(domain.into(), id.into())
    }

    pub fn domain(&self) -> &str {
        &self.0
    }

    pub fn id(&self) -> &str {
        &self.1
    }

    fn key(&self) -> String {
        format!("{}:{}", self.0, self.1)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceEntry {
    pub id: String,

    #[serde(default)]
    pub identifiers: Vec<DeviceIdentifier>,

    /// Config entries that provide this device
    #[serde(default)]
    pub config_entries: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manufacturer: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,

    #[serde(default = "Utc::now")]
    pub modified_at: DateTime<Utc>,
}

impl DeviceEntry {
    pub fn new(name: Option<&str>) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().simple().to_string(),
            identifiers: Vec::new(),
            config_entries: Vec::new(),
            name: name.map(str::to_string),
            manufacturer: None,
            model: None,
            created_at: now,
            modified_at: now,
        }
    }

    pub fn with_identifier(mut self, domain: impl Into<String>, id: impl Into<String>) -> Self {
        self.identifiers.push(DeviceIdentifier::new(domain, id));
        self
    }

    pub fn with_config_entry(mut self, config_entry_id: impl Into<String>) -> Self {
        let id = config_entry_id.into();
        if !self.config_entries.contains(&id) {
            self.config_entries.push(id);
        }
        self
    }

    /// The id this device carries in the given integration's namespace
    pub fn identifier_for(&self, domain: &str) -> Option<&str> {
        self.identifiers
            .iter()
            .find(|ident| ident.domain() == domain)
            .map(DeviceIdentifier::id)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceRegistryData {
    pub devices: Vec<DeviceEntry>,
}

impl Storable for DeviceRegistryData {
    const KEY: &'static str = STORAGE_KEY;
    const VERSION: u32 = STORAGE_VERSION;
    const MINOR_VERSION: u32 = STORAGE_MINOR_VERSION;
}

pub struct DeviceRegistry {
    storage: Arc<Storage>,

    by_id: DashMap<String, Arc<DeviceEntry>>,

    /// "domain:id" -> device id
    by_identifier: DashMap<String, String>,

    /// config entry id -> device ids
    by_config_entry_id: DashMap<String, HashSet<String>>,
}

impl DeviceRegistry {
    pub fn new(storage: Arc<Storage>) -> Self {
        Self {
            storage,
            by_id: DashMap::new(),
            by_identifier: DashMap::new(),
            by_config_entry_id: DashMap::new(),
        }
    }

    pub async fn load(&self) -> StorageResult<()> {
        if let Some(file) = self.storage.load::<DeviceRegistryData>().await? {
            info!("Loading {} devices from storage", file.data.devices.len());
            for entry in file.data.devices {
                self.index(Arc::new(entry));
            }
        }
        Ok(())
    }

    pub async fn save(&self) -> StorageResult<()> {
        let data = DeviceRegistryData {
            devices: self.by_id.iter().map(|r| (**r.value()).clone()).collect(),
        };
        self.storage.save(&data).await?;
        debug!("Saved {} devices to storage", data.devices.len());
        Ok(())
    }

    fn index(&self, entry: Arc<DeviceEntry>) {
        for ident in &entry.identifiers {
            self.by_identifier.insert(ident.key(), entry.id.clone());
        }
        for config_entry_id in &entry.config_entries {
            self.by_config_entry_id
                .entry(config_entry_id.clone())
                .or_default()
                .insert(entry.id.clone());
        }
        self.by_id.insert(entry.id.clone(), entry);
    }

    fn unindex(&self, entry: &DeviceEntry) {
        for ident in &entry.identifiers {
            self.by_identifier.remove(&ident.key());
        }
        for config_entry_id in &entry.config_entries {
            if let Some(mut ids) = self.by_config_entry_id.get_mut(config_entry_id) {
                ids.remove(&entry.id);
            }
        }
        self.by_id.remove(&entry.id);
    }

    pub fn get(&self, device_id: &str) -> Option<Arc<DeviceEntry>> {
        self.by_id.get(device_id).map(|r| r.value().clone())
    }

    pub fn get_by_identifier(&self, domain: &str, id: &str) -> Option<Arc<DeviceEntry>> {
        let key = DeviceIdentifier::new(domain, id).key();
        let device_id = self.by_identifier.get(&key).map(|r| r.value().clone())?;
        self.get(&device_id)
    }

    pub fn get_by_config_entry_id(&self, config_entry_id: &str) -> Vec<Arc<DeviceEntry>> {
        self.by_config_entry_id
            .get(config_entry_id)
            .map(|ids| ids.iter().filter_map(|id| self.get(id)).collect())
            .unwrap_or_default()
    }

    /// Find a device by any of its identifiers, or register a new one
    ///
    /// An existing device picks up identifiers and the config entry it did not
    /// know about yet.
    pub fn get_or_create(
        &self,
        identifiers: &[DeviceIdentifier],
        config_entry_id: Option<&str>,
        name: Option<&str>,
    ) -> Arc<DeviceEntry> {
        let existing = identifiers
            .iter()
            .find_map(|ident| self.get_by_identifier(ident.domain(), ident.id()));

        let mut entry = match existing {
            Some(existing) => {
                let missing_ident = identifiers.iter().any(|i| !existing.identifiers.contains(i));
                let missing_entry = config_entry_id
                    .is_some_and(|id| !existing.config_entries.iter().any(|e| e == id));
                if !missing_ident && !missing_entry {
                    return existing;
                }
                self.unindex(&existing);
                let mut entry = (*existing).clone();
                entry.modified_at = Utc::now();
                entry
            }
            None => {
                debug!("Registering new device {:?}", name);
                DeviceEntry::new(name)
            }
        };

        for ident in identifiers {
            if !entry.identifiers.contains(ident) {
                entry.identifiers.push(ident.clone());
            }
        }
        if let Some(config_entry_id) = config_entry_id {
            entry = entry.with_config_entry(config_entry_id);
        }

        let entry = Arc::new(entry);
        self.index(entry.clone());
        entry
    }

    pub fn remove(&self, device_id: &str) -> Option<Arc<DeviceEntry>> {
        let entry = self.get(device_id)?;
        self.unindex(&entry);
        debug!("Removed device {}", device_id);
        Some(entry)
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}
