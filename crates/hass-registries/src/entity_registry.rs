//! Entity Registry
//!
//! Maps entity ids (e.g. `valve.kitchen_shutoff`) to the device and config
//! entry that provide them.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::storage::{Storable, Storage, StorageResult};

pub const STORAGE_KEY: &str = "core.entity_registry";
pub const STORAGE_VERSION: u32 = 1;
pub const STORAGE_MINOR_VERSION: u32 = 18;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EntityRegistryError {
    #[error("invalid entity id: {0}")]
    InvalidEntityId(String),

    #[error("entity id already registered: {0}")]
    AlreadyRegistered(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityEntry {
    pub id: String,

    /// `domain.object_id`
    pub entity_id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unique_id: Option<String>,

    /// Integration providing the entity
    pub platform: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_entry_id: Option<String>,

    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,

    #[serde(default = "Utc::now")]
    pub modified_at: DateTime<Utc>,
}

impl EntityEntry {
    pub fn domain(&self) -> &str {
        self.entity_id
            .split_once('.')
            .map_or(self.entity_id.as_str(), |(domain, _)| domain)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EntityRegistryData {
    pub entities: Vec<EntityEntry>,
}

impl Storable for EntityRegistryData {
    const KEY: &'static str = STORAGE_KEY;
    const VERSION: u32 = STORAGE_VERSION;
    const MINOR_VERSION: u32 = STORAGE_MINOR_VERSION;
}

fn is_valid_entity_id(entity_id: &str) -> bool {
    let valid_part = |part: &str| {
        !part.is_empty()
            && part
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
    };
    matches!(entity_id.split_once('.'), Some((domain, object_id)) if valid_part(domain) && valid_part(object_id))
}

pub struct EntityRegistry {
    storage: Arc<Storage>,

    by_entity_id: DashMap<String, Arc<EntityEntry>>,

    /// device id -> entity ids
    by_device_id: DashMap<String, HashSet<String>>,
}

impl EntityRegistry {
    pub fn new(storage: Arc<Storage>) -> Self {
        Self {
            storage,
            by_entity_id: DashMap::new(),
            by_device_id: DashMap::new(),
        }
    }

    pub async fn load(&self) -> StorageResult<()> {
        if let Some(file) = self.storage.load::<EntityRegistryData>().await? {
            info!("Loading {} entities from storage", file.data.entities.len());
            for entry in file.data.entities {
                self.index(Arc::new(entry));
            }
        }
        Ok(())
    }

    pub async fn save(&self) -> StorageResult<()> {
        let data = EntityRegistryData {
            entities: self
                .by_entity_id
                .iter()
                .map(|r| (**r.value()).clone())
                .collect(),
        };
        self.storage.save(&data).await?;
        debug!("Saved {} entities to storage", data.entities.len());
        Ok(())
    }

    fn index(&self, entry: Arc<EntityEntry>) {
        if let Some(ref device_id) = entry.device_id {
            self.by_device_id
                .entry(device_id.clone())
                .or_default()
                .insert(entry.entity_id.clone());
        }
        self.by_entity_id.insert(entry.entity_id.clone(), entry);
    }

    /// Register an entity provided by `platform`
    pub fn register(
        &self,
        entity_id: &str,
        platform: &str,
        unique_id: Option<&str>,
        device_id: Option<&str>,
        config_entry_id: Option<&str>,
    ) -> Result<Arc<EntityEntry>, EntityRegistryError> {
        if !is_valid_entity_id(entity_id) {
            return Err(EntityRegistryError::InvalidEntityId(entity_id.to_string()));
        }
        if self.by_entity_id.contains_key(entity_id) {
            return Err(EntityRegistryError::AlreadyRegistered(entity_id.to_string()));
        }

        let now = Utc::now();
        let entry = Arc::new(EntityEntry {
            id: ulid::Ulid::new().to_string().to_lowercase(),
            entity_id: entity_id.to_string(),
            unique_id: unique_id.map(str::to_string),
            platform: platform.to_string(),
            device_id: device_id.map(str::to_string),
            config_entry_id: config_entry_id.map(str::to_string),
            created_at: now,
            modified_at: now,
        });
        self.index(entry.clone());
        debug!("Registered entity {} for {}", entity_id, platform);
        Ok(entry)
    }

    pub fn get(&self, entity_id: &str) -> Option<Arc<EntityEntry>> {
        self.by_entity_id.get(entity_id).map(|r| r.value().clone())
    }

    pub fn get_by_device_id(&self, device_id: &str) -> Vec<Arc<EntityEntry>> {
        self.by_device_id
            .get(device_id)
            .map(|ids| ids.iter().filter_map(|id| self.get(id)).collect())
            .unwrap_or_default()
    }

    pub fn remove(&self, entity_id: &str) -> Option<Arc<EntityEntry>> {
        let (_, entry) = self.by_entity_id.remove(entity_id)?;
        if let Some(ref device_id) = entry.device_id {
            if let Some(mut ids) = self.by_device_id.get_mut(device_id) {
                ids.remove(entity_id);
            }
        }
        Some(entry)
    }

    pub fn len(&self) -> usize {
        self.by_entity_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_entity_id.is_empty()
    }
}
