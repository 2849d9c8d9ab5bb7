//! Config Entries Manager
//!
//! Owns every config entry, persists them and drives their setup, unload and
//! reload through the integration registered for the entry's domain.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use hass_registries::{Storable, Storage, StorageError, StorageResult};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::entry::{ConfigEntry, ConfigEntryState, ConfigEntryUpdate};

pub const STORAGE_KEY: &str = "core.config_entries";
pub const STORAGE_VERSION: u32 = 1;
pub const STORAGE_MINOR_VERSION: u32 = 5;

#[derive(Debug, Error)]
pub enum ConfigEntriesError {
    #[error("Entry not found: {0}")]
    NotFound(String),

    #[error("Entry already exists for domain {domain} with unique_id {unique_id}")]
    AlreadyExists { domain: String, unique_id: String },

    #[error("Cannot unload entry in state {0:?}")]
    CannotUnload(ConfigEntryState),

    #[error("Setup failed for {entry_id}: {reason}")]
    SetupFailed { entry_id: String, reason: String },

    /// Stored credentials were rejected; the entry needs reauthentication
    #[error("Authentication failed for {entry_id}: {reason}")]
    AuthFailed { entry_id: String, reason: String },

    #[error("Unload failed for {entry_id}: {reason}")]
    UnloadFailed { entry_id: String, reason: String },

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

pub type ConfigEntriesResult<T> = Result<T, ConfigEntriesError>;

/// Failure reported by an integration while setting up an entry
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SetupError {
    #[error("authentication failed: {0}")]
    AuthFailed(String),

    #[error("not ready: {0}")]
    NotReady(String),
}

/// Lifecycle hooks an integration provides for its entries
#[async_trait]
pub trait IntegrationSetup: Send + Sync {
    async fn setup_entry(&self, entry: &ConfigEntry) -> Result<(), SetupError>;

    async fn unload_entry(&self, entry: &ConfigEntry) -> Result<(), String>;
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigEntriesData {
    pub entries: Vec<ConfigEntry>,
}

impl Storable for ConfigEntriesData {
    const KEY: &'static str = STORAGE_KEY;
    const VERSION: u32 = STORAGE_VERSION;
    const MINOR_VERSION: u32 = STORAGE_MINOR_VERSION;
}

pub struct ConfigEntries {
    storage: Arc<Storage>,

    /// entry_id -> entry
    entries: DashMap<String, ConfigEntry>,

    /// domain -> entry ids
    by_domain: DashMap<String, HashSet<String>>,

    /// (domain, unique_id) -> entry id
    by_unique_id: DashMap<(String, String), String>,

    /// Serializes setup and unload across entries
    setup_lock: Mutex<()>,

    integrations: DashMap<String, Arc<dyn IntegrationSetup>>,
}

impl ConfigEntries {
    pub fn new(storage: Arc<Storage>) -> Self {
        Self {
            storage,
            entries: DashMap::new(),
            by_domain: DashMap::new(),
            by_unique_id: DashMap::new(),
            setup_lock: Mutex::new(()),
            integrations: DashMap::new(),
        }
    }

    pub async fn load(&self) -> StorageResult<()> {
        if let Some(file) = self.storage.load::<ConfigEntriesData>().await? {
            info!(
                "Loading {} config entries from storage (v{}.{})",
                file.data.entries.len(),
                file.version,
                file.minor_version
            );
            for entry in file.data.entries {
                if let Some(ref unique_id) = entry.unique_id {
                    self.by_unique_id.insert(
                        (entry.domain.clone(), unique_id.clone()),
                        entry.entry_id.clone(),
                    );
                }
                self.index_entry(entry);
            }
        }
        Ok(())
    }

    pub async fn save(&self) -> StorageResult<()> {
        let data = ConfigEntriesData {
            entries: self.entries.iter().map(|r| r.value().clone()).collect(),
        };
        self.storage.save(&data).await?;
        debug!("Saved {} config entries to storage", data.entries.len());
        Ok(())
    }

    /// Primary and domain indexes; the unique id index is maintained by callers
    fn index_entry(&self, entry: ConfigEntry) {
        self.by_domain
            .entry(entry.domain.clone())
            .or_default()
            .insert(entry.entry_id.clone());
        self.entries.insert(entry.entry_id.clone(), entry);
    }

    fn unindex_entry(&self, entry: &ConfigEntry) {
        if let Some(mut ids) = self.by_domain.get_mut(&entry.domain) {
            ids.remove(&entry.entry_id);
        }
        if let Some(ref unique_id) = entry.unique_id {
            self.by_unique_id
                .remove(&(entry.domain.clone(), unique_id.clone()));
        }
        self.entries.remove(&entry.entry_id);
    }

    pub fn get(&self, entry_id: &str) -> Option<ConfigEntry> {
        self.entries.get(entry_id).map(|r| r.value().clone())
    }

    pub fn get_by_domain(&self, domain: &str) -> Vec<ConfigEntry> {
        self.by_domain
            .get(domain)
            .map(|ids| ids.iter().filter_map(|id| self.get(id)).collect())
            .unwrap_or_default()
    }

    pub fn get_by_unique_id(&self, domain: &str, unique_id: &str) -> Option<ConfigEntry> {
        let entry_id = self
            .by_unique_id
            .get(&(domain.to_string(), unique_id.to_string()))
            .map(|r| r.value().clone())?;
        self.get(&entry_id)
    }

    /// Add a new entry, refusing a second entry with the same unique id
    pub async fn add(&self, entry: ConfigEntry) -> ConfigEntriesResult<ConfigEntry> {
        if let Some(ref unique_id) = entry.unique_id {
            match self
                .by_unique_id
                .entry((entry.domain.clone(), unique_id.clone()))
            {
                Entry::Occupied(_) => {
                    return Err(ConfigEntriesError::AlreadyExists {
                        domain: entry.domain.clone(),
                        unique_id: unique_id.clone(),
                    })
                }
                Entry::Vacant(slot) => {
                    slot.insert(entry.entry_id.clone());
                }
            }
        }

        self.index_entry(entry.clone());
        self.save().await?;

        info!(
            "Added config entry: {} ({}) [{}]",
            entry.title, entry.domain, entry.entry_id
        );
        Ok(entry)
    }

    /// Update an entry in place
    ///
    /// Moving the entry onto a unique id that another entry of the same domain
    /// already holds is refused and leaves the entry untouched.
    pub async fn update(
        &self,
        entry_id: &str,
        update: ConfigEntryUpdate,
    ) -> ConfigEntriesResult<ConfigEntry> {
        let entry = self
            .get(entry_id)
            .ok_or_else(|| ConfigEntriesError::NotFound(entry_id.to_string()))?;

        let unique_id_changes = matches!(update.unique_id, Some(ref new) if *new != entry.unique_id);
        if unique_id_changes {
            // Claim the new id before releasing the old one
            if let Some(Some(ref new_unique_id)) = update.unique_id {
                match self
                    .by_unique_id
                    .entry((entry.domain.clone(), new_unique_id.clone()))
                {
                    Entry::Occupied(owner) if *owner.get() != entry.entry_id => {
                        return Err(ConfigEntriesError::AlreadyExists {
                            domain: entry.domain.clone(),
                            unique_id: new_unique_id.clone(),
                        });
                    }
                    Entry::Occupied(_) => {}
                    Entry::Vacant(slot) => {
                        slot.insert(entry.entry_id.clone());
                    }
                }
            }
            if let Some(ref old_unique_id) = entry.unique_id {
                self.by_unique_id
                    .remove_if(&(entry.domain.clone(), old_unique_id.clone()), |_, owner| {
                        *owner == entry.entry_id
                    });
            }
        }

        let mut updated = entry;
        update.apply(&mut updated);
        self.entries.insert(updated.entry_id.clone(), updated.clone());
        self.save().await?;

        debug!("Updated config entry: {}", entry_id);
        Ok(updated)
    }

    /// Remove an entry, unloading it first when loaded
    pub async fn remove(&self, entry_id: &str) -> ConfigEntriesResult<ConfigEntry> {
        let entry = self
            .get(entry_id)
            .ok_or_else(|| ConfigEntriesError::NotFound(entry_id.to_string()))?;

        if entry.is_loaded() {
            self.unload(entry_id).await?;
        }

        self.unindex_entry(&entry);
        self.save().await?;

        info!(
            "Removed config entry: {} ({}) [{}]",
            entry.title, entry.domain, entry_id
        );
        Ok(entry)
    }

    pub fn set_state(&self, entry_id: &str, state: ConfigEntryState, reason: Option<String>) {
        if let Some(mut entry) = self.entries.get_mut(entry_id) {
            entry.state = state;
            entry.reason = reason;
            debug!("Entry {} state changed to {:?}", entry_id, state);
        }
    }

    pub fn register_integration(&self, domain: &str, integration: Arc<dyn IntegrationSetup>) {
        self.integrations.insert(domain.to_string(), integration);
        debug!("Registered integration for domain: {}", domain);
    }

    fn integration(&self, domain: &str) -> Option<Arc<dyn IntegrationSetup>> {
        self.integrations.get(domain).map(|r| r.value().clone())
    }

    pub async fn setup(&self, entry_id: &str) -> ConfigEntriesResult<()> {
        let _lock = self.setup_lock.lock().await;

        let entry = self
            .get(entry_id)
            .ok_or_else(|| ConfigEntriesError::NotFound(entry_id.to_string()))?;

        let Some(integration) = self.integration(&entry.domain) else {
            debug!(
                "No integration registered for domain {}, marking as loaded",
                entry.domain
            );
            self.set_state(entry_id, ConfigEntryState::Loaded, None);
            return Ok(());
        };

        self.set_state(entry_id, ConfigEntryState::SetupInProgress, None);

        match integration.setup_entry(&entry).await {
            Ok(()) => {
                self.set_state(entry_id, ConfigEntryState::Loaded, None);
                info!("Setup completed for entry: {} ({})", entry.title, entry_id);
                Ok(())
            }
            Err(err) => {
                warn!("Setup failed for entry {}: {}", entry_id, err);
                self.set_state(
                    entry_id,
                    ConfigEntryState::SetupError,
                    Some(err.to_string()),
                );
                Err(match err {
                    SetupError::AuthFailed(reason) => ConfigEntriesError::AuthFailed {
                        entry_id: entry_id.to_string(),
                        reason,
                    },
                    SetupError::NotReady(reason) => ConfigEntriesError::SetupFailed {
                        entry_id: entry_id.to_string(),
                        reason,
                    },
                })
            }
        }
    }

    pub async fn unload(&self, entry_id: &str) -> ConfigEntriesResult<()> {
        let _lock = self.setup_lock.lock().await;

        let entry = self
            .get(entry_id)
            .ok_or_else(|| ConfigEntriesError::NotFound(entry_id.to_string()))?;

        if !entry.state.is_recoverable() {
            return Err(ConfigEntriesError::CannotUnload(entry.state));
        }

        // Only a loaded entry holds integration resources
        let integration = match entry.state {
            ConfigEntryState::Loaded => self.integration(&entry.domain),
            _ => None,
        };

        if let Some(integration) = integration {
            self.set_state(entry_id, ConfigEntryState::UnloadInProgress, None);
            if let Err(reason) = integration.unload_entry(&entry).await {
                warn!("Unload failed for entry {}: {}", entry_id, reason);
                self.set_state(entry_id, ConfigEntryState::FailedUnload, Some(reason.clone()));
                return Err(ConfigEntriesError::UnloadFailed {
                    entry_id: entry_id.to_string(),
                    reason,
                });
            }
        }

        self.set_state(entry_id, ConfigEntryState::NotLoaded, None);
        info!("Unloaded entry: {} ({})", entry.title, entry_id);
        Ok(())
    }

    pub async fn reload(&self, entry_id: &str) -> ConfigEntriesResult<()> {
        self.unload(entry_id).await?;
        self.setup(entry_id).await
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::ConfigEntrySource;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    fn create_test_manager() -> (TempDir, ConfigEntries) {
        let temp_dir = TempDir::new().unwrap();
        let storage = Arc::new(Storage::new(temp_dir.path()));
        (temp_dir, ConfigEntries::new(storage))
    }

    #[derive(Default)]
    struct CountingIntegration {
        setups: AtomicUsize,
        unloads: AtomicUsize,
        fail_with: Option<SetupError>,
    }

    #[async_trait]
    impl IntegrationSetup for CountingIntegration {
        async fn setup_entry(&self, _entry: &ConfigEntry) -> Result<(), SetupError> {
            self.setups.fetch_add(1, Ordering::SeqCst);
            match &self.fail_with {
                Some(err) => Err(err.clone()),
                None => Ok(()),
            }
        }

        async fn unload_entry(&self, _entry: &ConfigEntry) -> Result<(), String> {
            self.unloads.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_duplicate_unique_id_rejected() {
        let (_dir, manager) = create_test_manager();

        manager
            .add(ConfigEntry::new("phyn", "Home").with_unique_id("a@example.com"))
            .await
            .unwrap();
        let result = manager
            .add(ConfigEntry::new("phyn", "Cabin").with_unique_id("a@example.com"))
            .await;

        assert!(matches!(
            result,
            Err(ConfigEntriesError::AlreadyExists { .. })
        ));
        assert_eq!(manager.len(), 1);

        // Same unique id under another domain is fine
        manager
            .add(ConfigEntry::new("other", "Other").with_unique_id("a@example.com"))
            .await
            .unwrap();
        assert_eq!(manager.get_by_domain("phyn").len(), 1);
    }

    #[tokio::test]
    async fn test_update_moves_unique_id() {
        let (_dir, manager) = create_test_manager();
        let entry = manager
            .add(ConfigEntry::new("phyn", "Home").with_unique_id("a@example.com"))
            .await
            .unwrap();

        manager
            .update(
                &entry.entry_id,
                ConfigEntryUpdate::new().unique_id("b@example.com"),
            )
            .await
            .unwrap();

        assert!(manager.get_by_unique_id("phyn", "a@example.com").is_none());
        assert_eq!(
            manager
                .get_by_unique_id("phyn", "b@example.com")
                .unwrap()
                .entry_id,
            entry.entry_id
        );
    }

    #[tokio::test]
    async fn test_update_refuses_taken_unique_id() {
        let (_dir, manager) = create_test_manager();
        let first = manager
            .add(ConfigEntry::new("phyn", "Home").with_unique_id("a@example.com"))
            .await
            .unwrap();
        manager
            .add(ConfigEntry::new("phyn", "Cabin").with_unique_id("b@example.com"))
            .await
            .unwrap();

        let result = manager
            .update(
                &first.entry_id,
                ConfigEntryUpdate::new().title("Moved").unique_id("b@example.com"),
            )
            .await;

        assert!(matches!(
            result,
            Err(ConfigEntriesError::AlreadyExists { .. })
        ));
        assert_eq!(manager.get(&first.entry_id).unwrap().title, "Home");
    }

    #[tokio::test]
    async fn test_update_releases_old_unique_id() {
        let (_dir, manager) = create_test_manager();
        let entry = manager
            .add(ConfigEntry::new("phyn", "Home").with_unique_id("a@example.com"))
            .await
            .unwrap();
        manager
            .update(
                &entry.entry_id,
                ConfigEntryUpdate::new().unique_id("b@example.com"),
            )
            .await
            .unwrap();

        let taken = manager
            .add(ConfigEntry::new("phyn", "Cabin").with_unique_id("b@example.com"))
            .await;
        assert!(matches!(
            taken,
            Err(ConfigEntriesError::AlreadyExists { ref unique_id, .. }) if unique_id == "b@example.com"
        ));

        let freed = manager
            .add(ConfigEntry::new("phyn", "Cabin").with_unique_id("a@example.com"))
            .await
            .unwrap();
        assert_eq!(
            manager.get_by_unique_id("phyn", "a@example.com").unwrap().entry_id,
            freed.entry_id
        );

        // Keeping the same id leaves the claim in place
        manager
            .update(
                &entry.entry_id,
                ConfigEntryUpdate::new().title("Renamed").unique_id("b@example.com"),
            )
            .await
            .unwrap();
        assert_eq!(
            manager.get_by_unique_id("phyn", "b@example.com").unwrap().title,
            "Renamed"
        );
        assert_eq!(manager.get_by_domain("phyn").len(), 2);
    }

    #[tokio::test]
    async fn test_setup_unload_reload() {
        let (_dir, manager) = create_test_manager();
        let integration = Arc::new(CountingIntegration::default());
        manager.register_integration("phyn", integration.clone());

        let entry = manager.add(ConfigEntry::new("phyn", "Home")).await.unwrap();
        manager.setup(&entry.entry_id).await.unwrap();
        assert!(manager.get(&entry.entry_id).unwrap().is_loaded());

        manager.reload(&entry.entry_id).await.unwrap();
        assert!(manager.get(&entry.entry_id).unwrap().is_loaded());
        assert_eq!(integration.setups.load(Ordering::SeqCst), 2);
        assert_eq!(integration.unloads.load(Ordering::SeqCst), 1);

        manager.remove(&entry.entry_id).await.unwrap();
        assert_eq!(integration.unloads.load(Ordering::SeqCst), 2);
        assert!(manager.is_empty());
    }

    #[tokio::test]
    async fn test_auth_failure_marks_setup_error() {
        let (_dir, manager) = create_test_manager();
        manager.register_integration(
            "phyn",
            Arc::new(CountingIntegration {
                fail_with: Some(SetupError::AuthFailed("NotAuthorizedException".to_string())),
                ..Default::default()
            }),
        );

        let entry = manager.add(ConfigEntry::new("phyn", "Home")).await.unwrap();
        let result = manager.setup(&entry.entry_id).await;

        assert!(matches!(result, Err(ConfigEntriesError::AuthFailed { .. })));
        let stored = manager.get(&entry.entry_id).unwrap();
        assert_eq!(stored.state, ConfigEntryState::SetupError);
        assert!(stored.reason.unwrap().contains("NotAuthorizedException"));
    }

    #[tokio::test]
    async fn test_unload_of_not_loaded_entry_skips_integration() {
        let (_dir, manager) = create_test_manager();
        let integration = Arc::new(CountingIntegration::default());
        manager.register_integration("phyn", integration.clone());

        let entry = manager.add(ConfigEntry::new("phyn", "Home")).await.unwrap();
        manager.unload(&entry.entry_id).await.unwrap();

        assert_eq!(integration.unloads.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let temp_dir = TempDir::new().unwrap();
        let storage = Arc::new(Storage::new(temp_dir.path()));

        {
            let manager = ConfigEntries::new(storage.clone());
            manager
                .add(
                    ConfigEntry::new("phyn", "Home")
                        .with_unique_id("a@example.com")
                        .with_source(ConfigEntrySource::Reconfigure)
                        .with_version(1, 2),
                )
                .await
                .unwrap();
        }

        let manager = ConfigEntries::new(storage);
        manager.load().await.unwrap();

        let entry = manager.get_by_unique_id("phyn", "a@example.com").unwrap();
        assert_eq!(entry.title, "Home");
        assert_eq!(entry.source, ConfigEntrySource::Reconfigure);
        assert_eq!(entry.minor_version, 2);
        assert_eq!(entry.state, ConfigEntryState::NotLoaded);
    }
}
