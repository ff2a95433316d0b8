use std::path::Path;

use chrono::{DateTime, Utc};

use crate::parq::persistent::PersistedEntry;

use super::{LoadedEntries, SledMode, StorageBackend, StorageError};

pub struct SledStorage {
    db: sled::Db,
}

const ENTRY_PREFIX: &[u8] = b"v1:parq:";
const SAVED_AT_KEY: &[u8] = b"v1:meta:saved_at";

impl SledStorage {
    pub fn open(
        data_path: &Path,
        cache_capacity: Option<u64>,
        mode: Option<SledMode>,
    ) -> Result<Self, StorageError> {
        let mut config = sled::Config::new().path(data_path);

        if let Some(cache_capacity) = cache_capacity {
            config = config.cache_capacity(cache_capacity);
        }

        if let Some(mode) = mode {
            config = config.mode(match mode {
                SledMode::LowSpace => sled::Mode::LowSpace,
                SledMode::HighThroughput => sled::Mode::HighThroughput,
            });
        }

        let db = config.open().map_err(StorageError::Sled)?;
        Ok(Self { db })
    }
}

/// Zero-padded so that key order is save order.
fn entry_key(index: usize) -> Vec<u8> {
    let mut key = Vec::with_capacity(ENTRY_PREFIX.len() + 8);
    key.extend_from_slice(ENTRY_PREFIX);
    key.extend_from_slice(format!("{index:08}").as_bytes());
    key
}

impl StorageBackend for SledStorage {
    fn flush(&self) -> Result<(), StorageError> {
        self.db.flush().map(|_| ()).map_err(StorageError::Sled)
    }

    fn load_entries(&self) -> Result<LoadedEntries, StorageError> {
        let mut loaded = LoadedEntries::default();
        for item in self.db.scan_prefix(ENTRY_PREFIX) {
            let (_, value) = item.map_err(StorageError::Sled)?;
            match serde_json::from_slice::<PersistedEntry>(value.as_ref()) {
                Ok(entry) => loaded.entries.push(entry),
                Err(source) => loaded.rejected.push(StorageError::DeserializeEntry(source)),
            }
        }
        Ok(loaded)
    }

    fn replace_entries(
        &self,
        entries: &[PersistedEntry],
        saved_at: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        let mut batch = sled::Batch::default();
        for item in self.db.scan_prefix(ENTRY_PREFIX) {
            let (key, _) = item.map_err(StorageError::Sled)?;
            batch.remove(key);
        }

        for (index, entry) in entries.iter().enumerate() {
            let value = serde_json::to_vec(entry).map_err(StorageError::SerializeEntry)?;
            batch.insert(entry_key(index), value);
        }
        batch.insert(SAVED_AT_KEY, saved_at.to_rfc3339().as_bytes());

        self.db.apply_batch(batch).map_err(StorageError::Sled)
    }
}
