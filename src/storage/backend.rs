use chrono::{DateTime, Utc};

use crate::parq::persistent::PersistedEntry;

use super::StorageError;

/// Records read back from storage, plus the ones that had to be skipped.
#[derive(Debug, Default)]
pub struct LoadedEntries {
    pub entries: Vec<PersistedEntry>,
    pub rejected: Vec<StorageError>,
}

pub trait StorageBackend: Send + Sync {
    fn flush(&self) -> Result<(), StorageError>;
    /// Entries in the order they were saved.
    fn load_entries(&self) -> Result<LoadedEntries, StorageError>;
    /// Drops whatever was stored before and writes `entries` in order.
    fn replace_entries(
        &self,
        entries: &[PersistedEntry],
        saved_at: DateTime<Utc>,
    ) -> Result<(), StorageError>;
}
