use std::fs;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde_json::json;

use crate::config::AppConfig;
use crate::logging::{LogLevel, Logger};
use crate::parq::persistent::PersistedEntry;

use super::{
    expand_home_path, LoadedEntries, RecoveryFileStorage, SledMode, SledStorage, StorageBackend,
    StorageEngine, StorageError,
};

pub struct StorageFacade {
    engine: StorageEngine,
    data_path: PathBuf,
    backend: Box<dyn StorageBackend>,
}

impl StorageFacade {
    pub fn initialize(app_config: &AppConfig, logger: &Logger) -> Result<Self, StorageError> {
        let storage = &app_config.storage;
        let Some(engine) = StorageEngine::parse(&storage.engine) else {
            return Err(StorageError::UnsupportedEngine {
                engine: storage.engine.clone(),
            });
        };
        let data_path = expand_home_path(&storage.path)?;

        logger.log(
            LogLevel::Info,
            Some("storage::init"),
            "Initializing storage facade",
            Some(json!({
                "engine": engine.as_str(),
                "configured_path": storage.path,
                "resolved_path": data_path.display().to_string(),
                "sled": {
                    "cache_capacity": storage.sled.cache_capacity,
                    "mode": storage.sled.mode
                }
            })),
        );

        fs::create_dir_all(&data_path).map_err(|source| StorageError::CreateDataDir {
            path: data_path.clone(),
            source,
        })?;

        let backend: Box<dyn StorageBackend> = match engine {
            StorageEngine::RecoveryFile => Box::new(RecoveryFileStorage::open(&data_path)),
            StorageEngine::Sled => {
                let mode = match storage.sled.mode.as_deref() {
                    Some(raw) => Some(SledMode::parse(raw).ok_or_else(|| {
                        StorageError::InvalidSledMode {
                            mode: raw.to_owned(),
                        }
                    })?),
                    None => None,
                };

                Box::new(SledStorage::open(
                    &data_path,
                    storage.sled.cache_capacity,
                    mode,
                )?)
            }
        };

        logger.log(
            LogLevel::Info,
            Some("storage::init"),
            "Storage facade initialized",
            Some(json!({
                "engine": engine.as_str(),
                "resolved_path": data_path.display().to_string(),
            })),
        );

        Ok(Self {
            engine,
            data_path,
            backend,
        })
    }

    pub fn engine(&self) -> StorageEngine {
        self.engine
    }

    pub fn data_path(&self) -> &PathBuf {
        &self.data_path
    }

    pub fn flush(&self) -> Result<(), StorageError> {
        self.backend.flush()
    }

    pub fn load_entries(&self) -> Result<LoadedEntries, StorageError> {
        self.backend.load_entries()
    }

    pub fn replace_entries(
        &self,
        entries: &[PersistedEntry],
        saved_at: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        self.backend.replace_entries(entries, saved_at)
    }
}
