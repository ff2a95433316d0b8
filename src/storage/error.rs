use std::fmt;
use std::path::PathBuf;

#[derive(Debug)]
pub enum StorageError {
    UnsupportedEngine {
        engine: String,
    },
    InvalidSledMode {
        mode: String,
    },
    HomeDirectoryUnavailable,
    CreateDataDir {
        path: PathBuf,
        source: std::io::Error,
    },
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    /// A recovery record that could not be read back; `line` is where the
    /// record ends (1-based).
    MalformedRecord {
        line: usize,
        detail: String,
    },
    SerializeEntry(serde_json::Error),
    DeserializeEntry(serde_json::Error),
    Sled(sled::Error),
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnsupportedEngine { engine } => write!(
                f,
                "unsupported storage.engine '{engine}'; allowed values: recovery_file, sled"
            ),
            Self::InvalidSledMode { mode } => write!(
                f,
                "invalid storage.sled.mode '{mode}'; allowed values: low_space, high_throughput"
            ),
            Self::HomeDirectoryUnavailable => {
                write!(f, "cannot resolve storage path because HOME is not set")
            }
            Self::CreateDataDir { path, source } => write!(
                f,
                "failed to create storage data directory '{}': {source}",
                path.display()
            ),
            Self::Io { path, source } => {
                write!(f, "recovery file I/O on '{}' failed: {source}", path.display())
            }
            Self::MalformedRecord { line, detail } => {
                write!(f, "malformed recovery record ending at line {line}: {detail}")
            }
            Self::SerializeEntry(source) => {
                write!(f, "failed to serialize queued entry for storage: {source}")
            }
            Self::DeserializeEntry(source) => {
                write!(f, "failed to deserialize queued entry from storage: {source}")
            }
            Self::Sled(source) => write!(f, "sled storage error: {source}"),
        }
    }
}

impl std::error::Error for StorageError {}
