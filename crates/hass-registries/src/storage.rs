//! Versioned JSON persistence under `<config_dir>/.storage/`

use std::path::{Path, PathBuf};

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tracing::debug;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Unsupported version for {key}: stored {found}, supported {supported}")]
    UnsupportedVersion {
        key: String,
        found: u32,
        supported: u32,
    },
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Payload types that own a storage key
pub trait Storable: Serialize + DeserializeOwned {
    const KEY: &'static str;
    const VERSION: u32;
    const MINOR_VERSION: u32;
}

/// On-disk envelope
///
/// ```json
/// { "version": 1, "minor_version": 2, "key": "core.config_entries", "data": { } }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageFile<T> {
    pub version: u32,
    pub minor_version: u32,
    pub key: String,
    pub data: T,
}

#[derive(Debug, Clone)]
pub struct Storage {
    storage_dir: PathBuf,
}

impl Storage {
    /// `config_dir` is the platform config directory; files live in its `.storage/`
    pub fn new(config_dir: impl AsRef<Path>) -> Self {
        Self {
            storage_dir: config_dir.as_ref().join(".storage"),
        }
    }

    pub fn storage_dir(&self) -> &Path {
        &self.storage_dir
    }

    pub fn file_path(&self, key: &str) -> PathBuf {
        self.storage_dir.join(key)
    }

    /// Load a payload, `None` when nothing was saved yet
    ///
    /// Files written by a newer major version are refused rather than
    /// silently misread.
    pub async fn load<T: Storable>(&self) -> StorageResult<Option<StorageFile<T>>> {
        let path = self.file_path(T::KEY);
        if !fs::try_exists(&path).await? {
            debug!("Storage file not found: {}", T::KEY);
            return Ok(None);
        }

        let content = fs::read_to_string(&path).await?;
        let file: StorageFile<T> = serde_json::from_str(&content)?;

        if file.version > T::VERSION {
            return Err(StorageError::UnsupportedVersion {
                key: T::KEY.to_string(),
                found: file.version,
                supported: T::VERSION,
            });
        }

        debug!(
            "Loaded storage file: {} (v{}.{})",
            T::KEY,
            file.version,
            file.minor_version
        );
        Ok(Some(file))
    }

    /// Write through a temp file and rename so readers never see a partial file
    pub async fn save<T: Storable>(&self, data: &T) -> StorageResult<()> {
        fs::create_dir_all(&self.storage_dir).await?;

        let envelope = StorageFile {
            version: T::VERSION,
            minor_version: T::MINOR_VERSION,
            key: T::KEY.to_string(),
            data,
        };
        let content = serde_json::to_string_pretty(&envelope)?;

        let path = self.file_path(T::KEY);
        let temp_path = self.file_path(&format!("{}.tmp", T::KEY));
        fs::write(&temp_path, content).await?;
        fs::rename(&temp_path, &path).await?;

        debug!("Saved storage file: {}", T::KEY);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[derive(Debug, Default, Serialize, Deserialize, PartialEq)]
    struct Counter {
        value: u32,
    }

    impl Storable for Counter {
        const KEY: &'static str = "test.counter";
        const VERSION: u32 = 1;
        const MINOR_VERSION: u32 = 3;
    }

    #[tokio::test]
    async fn test_missing_file_loads_as_none() {
        let dir = TempDir::new().unwrap();
        let storage = Storage::new(dir.path());
        assert!(storage.load::<Counter>().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_save_writes_envelope() {
        let dir = TempDir::new().unwrap();
        let storage = Storage::new(dir.path());
        storage.save(&Counter { value: 7 }).await.unwrap();

        let raw = std::fs::read_to_string(storage.file_path("test.counter")).unwrap();
        let json: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(json["key"], "test.counter");
        assert_eq!(json["minor_version"], 3);
        assert_eq!(json["data"]["value"], 7);

        let loaded = storage.load::<Counter>().await.unwrap().unwrap();
        assert_eq!(loaded.data, Counter { value: 7 });
    }

    #[tokio::test]
    async fn test_newer_major_version_is_refused() {
        let dir = TempDir::new().unwrap();
        let storage = Storage::new(dir.path());
        std::fs::create_dir_all(storage.storage_dir()).unwrap();
        std::fs::write(
            storage.file_path("test.counter"),
            r#"{"version": 2, "minor_version": 1, "key": "test.counter", "data": {"value": 1}}"#,
        )
        .unwrap();

        let result = storage.load::<Counter>().await;
        assert!(matches!(
            result,
            Err(StorageError::UnsupportedVersion { found: 2, .. })
        ));
    }
}
