//! Storage layer for the data directory (settings JSON; tasks live in SQLite)

use crate::error::HubdlError;
use fs2::FileExt;
use hubdl_types::EngineSettings;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, warn};

const SETTINGS_FILE: &str = "settings.json";
const DATABASE_FILE: &str = "tasks.db";
const LOCK_FILE: &str = "hubdl.lock";

/// Exclusive hold on a data directory, released on drop
#[derive(Debug)]
pub struct DataDirLock {
    _file: std::fs::File,
}

/// Storage manager for hubdl data
#[derive(Clone, Debug)]
pub struct Storage {
    data_dir: PathBuf,
}

impl Storage {
    /// Create a new storage instance, creating the data directory
    pub async fn new(data_dir: PathBuf) -> Result<Self, HubdlError> {
        fs::create_dir_all(&data_dir).await?;
        Ok(Self { data_dir })
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join(DATABASE_FILE)
    }

    /// Take the data directory for this process without blocking
    pub fn lock(&self) -> Result<DataDirLock, HubdlError> {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(self.data_dir.join(LOCK_FILE))?;

        match file.try_lock_exclusive() {
            Ok(()) => {
                debug!("Locked {}", self.data_dir.display());
                Ok(DataDirLock { _file: file })
            }
            Err(e) if e.raw_os_error() == fs2::lock_contended_error().raw_os_error() => {
                Err(HubdlError::DataDirBusy {
                    path: self.data_dir.clone(),
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Load settings; a missing or unreadable file yields the defaults
    pub async fn load_settings(&self) -> Result<EngineSettings, HubdlError> {
        let path = self.data_dir.join(SETTINGS_FILE);
        let content = match fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(EngineSettings::default()),
            Err(e) => return Err(e.into()),
        };

        match serde_json::from_str(&content) {
            Ok(settings) => Ok(settings),
            Err(e) => {
                warn!("Ignoring malformed {}: {}", path.display(), e);
                Ok(EngineSettings::default())
            }
        }
    }

    /// Save settings as pretty JSON
    pub async fn save_settings(&self, settings: &EngineSettings) -> Result<(), HubdlError> {
        let content = serde_json::to_string_pretty(settings)?;
        fs::write(self.data_dir.join(SETTINGS_FILE), content).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_settings_round_trip_and_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::new(dir.path().to_path_buf()).await.unwrap();

        let settings = storage.load_settings().await.unwrap();
        assert_eq!(settings.transfer_workers, 8);

        let mut changed = settings.clone();
        changed.accelerator.split = 4;
        changed.auto_resume_incomplete = true;
        storage.save_settings(&changed).await.unwrap();

        let loaded = storage.load_settings().await.unwrap();
        assert_eq!(loaded.accelerator.split, 4);
        assert!(loaded.auto_resume_incomplete);
    }

    #[tokio::test]
    async fn test_data_dir_lock_is_exclusive() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::new(dir.path().to_path_buf()).await.unwrap();

        let held = storage.lock().unwrap();
        assert!(matches!(storage.lock(), Err(HubdlError::DataDirBusy { .. })));

        drop(held);
        assert!(storage.lock().is_ok());
    }

    #[tokio::test]
    async fn test_malformed_settings_fall_back() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("settings.json"), "{not json").unwrap();
        let storage = Storage::new(dir.path().to_path_buf()).await.unwrap();
        let settings = storage.load_settings().await.unwrap();
        assert_eq!(settings.cancel_grace_secs, 2);
    }
}
