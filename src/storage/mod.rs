mod backend;
mod engine;
mod error;
mod facade;
mod path;
mod recovery_file;
mod sled_backend;

pub use backend::{LoadedEntries, StorageBackend};
pub use engine::{SledMode, StorageEngine};
pub use error::StorageError;
pub use facade::StorageFacade;
use path::expand_home_path;
pub use recovery_file::{RecoveryFileStorage, RECOVERY_FILE_NAME};
pub use sled_backend::SledStorage;
