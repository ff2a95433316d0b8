use std::env;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use toml::Value;

use crate::parq;

/// Built-in configuration, also shipped as `parqd.toml`.
pub const DEFAULT_CONFIG_TOML: &str = include_str!("../../parqd.toml");
pub const CONFIG_ENV_VAR: &str = "PARQD_CONFIG";
pub const CONFIG_FILE_NAME: &str = "parqd.toml";
/// Upper bound for settings measured in seconds.
pub const MAX_WINDOW_SECS: i64 = 7 * 24 * 3600;
const AT_LEAST_ONE: &str = "at least 1";
const WINDOW_RANGE: &str = "between 1 and 604800 seconds";

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AppConfig {
    pub logging: LoggingConfig,
    pub heartbeat: HeartbeatConfig,
    pub server: ServerConfig,
    pub uploads: UploadsConfig,
    pub parq: ParqConfig,
    pub callbacks: CallbacksConfig,
    pub storage: StorageConfig,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub human_friendly: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_owned(),
            human_friendly: false,
        }
    }
}

#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct HeartbeatConfig {
    pub interval_ms: u64,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self { interval_ms: 1_000 }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Host announced in outbound QUEUE lines; empty means the bound address.
    pub advertised_host: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_owned(),
            port: 6346,
            advertised_host: String::new(),
        }
    }
}

#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct UploadsConfig {
    pub max_uploads: usize,
    pub max_uploads_per_source: usize,
    /// Bytes per second, 0 when unknown.
    pub outbound_bandwidth: u64,
}

impl Default for UploadsConfig {
    fn default() -> Self {
        Self {
            max_uploads: 4,
            max_uploads_per_source: 1,
            outbound_bandwidth: 0,
        }
    }
}

#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ParqConfig {
    pub max_queue_size: usize,
    pub active_queue_size: usize,
    pub ban_window_secs: i64,
    pub keep_dead_entries: bool,
    pub dynamic_slot_borrowing: bool,
    pub startup_delay_ticks: u64,
    pub save_interval_ticks: u64,
    pub dead_scan_interval_secs: i64,
}

impl Default for ParqConfig {
    fn default() -> Self {
        Self {
            max_queue_size: parq::MAX_QUEUE_SIZE,
            active_queue_size: parq::ACTIVE_QUEUE_SIZE,
            ban_window_secs: parq::BAN_WINDOW_SECS,
            keep_dead_entries: true,
            dynamic_slot_borrowing: false,
            startup_delay_ticks: parq::STARTUP_DELAY_TICKS,
            save_interval_ticks: parq::SAVE_INTERVAL_TICKS,
            dead_scan_interval_secs: parq::DEAD_SCAN_INTERVAL_SECS,
        }
    }
}

#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CallbacksConfig {
    pub period_secs: i64,
    pub max_attempts: u32,
    pub max_refused: u32,
    pub max_outbound_connections: usize,
    pub connect_timeout_ms: u64,
}

impl Default for CallbacksConfig {
    fn default() -> Self {
        Self {
            period_secs: parq::CALLBACK_PERIOD_SECS,
            max_attempts: parq::MAX_CALLBACK_ATTEMPTS,
            max_refused: parq::MAX_CALLBACK_REFUSALS,
            max_outbound_connections: parq::MAX_OUTBOUND_CONNECTIONS,
            connect_timeout_ms: 10_000,
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct StorageConfig {
    pub engine: String,
    pub path: String,
    pub sled: SledConfig,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            engine: "recovery_file".to_owned(),
            path: "~/.parqd/data".to_owned(),
            sled: SledConfig::default(),
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SledConfig {
    pub cache_capacity: Option<u64>,
    pub mode: Option<String>,
}

/// Where the effective configuration came from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConfigSource {
    CliArgument(PathBuf),
    Environment(PathBuf),
    WorkingDirectory(PathBuf),
    BuiltInDefaults,
}

impl ConfigSource {
    pub fn describe(&self) -> String {
        match self {
            Self::CliArgument(path) => format!("--config {}", path.display()),
            Self::Environment(path) => format!("{CONFIG_ENV_VAR}={}", path.display()),
            Self::WorkingDirectory(path) => path.display().to_string(),
            Self::BuiltInDefaults => "built-in defaults".to_owned(),
        }
    }

    fn path(&self) -> Option<&Path> {
        match self {
            Self::CliArgument(path) | Self::Environment(path) | Self::WorkingDirectory(path) => {
                Some(path.as_path())
            }
            Self::BuiltInDefaults => None,
        }
    }
}

impl AppConfig {
    /// Resolves the config file from `--config <path>`, then `PARQD_CONFIG`,
    /// then `./parqd.toml`, falling back to the built-in defaults. Remaining
    /// arguments are `--section.key value` overrides.
    pub fn load_with_discovery(
        args: impl IntoIterator<Item = String>,
    ) -> Result<(Self, ConfigSource), ConfigError> {
        let working_dir = env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
        Self::load_with_discovery_from(args, env::var_os(CONFIG_ENV_VAR).map(PathBuf::from), &working_dir)
    }

    pub(crate) fn load_with_discovery_from(
        args: impl IntoIterator<Item = String>,
        env_path: Option<PathBuf>,
        working_dir: &Path,
    ) -> Result<(Self, ConfigSource), ConfigError> {
        let (config_arg, overrides) = split_config_arg(args)?;

        let source = if let Some(path) = config_arg {
            ConfigSource::CliArgument(path)
        } else if let Some(path) = env_path.filter(|path| !path.as_os_str().is_empty()) {
            ConfigSource::Environment(path)
        } else {
            let candidate = working_dir.join(CONFIG_FILE_NAME);
            if candidate.is_file() {
                ConfigSource::WorkingDirectory(candidate)
            } else {
                ConfigSource::BuiltInDefaults
            }
        };

        let config = match source.path() {
            Some(path) => Self::load_from_toml_with_args(path, overrides)?,
            None => Self::from_toml_str_with_args("<built-in>", DEFAULT_CONFIG_TOML, overrides)?,
        };
        Ok((config, source))
    }

    pub fn load_from_toml_with_args(
        path: impl AsRef<Path>,
        args: impl IntoIterator<Item = String>,
    ) -> Result<Self, ConfigError> {
        let toml_content = fs::read_to_string(path.as_ref()).map_err(|source| ConfigError::Io {
            path: path.as_ref().to_string_lossy().to_string(),
            source,
        })?;

        Self::from_toml_str_with_args(&path.as_ref().to_string_lossy(), &toml_content, args)
    }

    /// Layers `toml_content` over the defaults, applies the overrides and
    /// validates the result.
    fn from_toml_str_with_args(
        origin: &str,
        toml_content: &str,
        args: impl IntoIterator<Item = String>,
    ) -> Result<Self, ConfigError> {
        let mut root_value: Value =
            DEFAULT_CONFIG_TOML
                .parse()
                .map_err(|source| ConfigError::TomlParse {
                    path: "<built-in>".to_owned(),
                    source,
                })?;
        let file_value: Value = toml_content
            .parse()
            .map_err(|source| ConfigError::TomlParse {
                path: origin.to_owned(),
                source,
            })?;
        merge_tables(&mut root_value, file_value);

        let overrides = parse_cli_overrides(args)?;
        for (key_path, raw_value) in overrides {
            apply_override(&mut root_value, &key_path, &raw_value)?;
        }

        let config: Self = root_value.try_into().map_err(ConfigError::Deserialize)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let window = 1..=MAX_WINDOW_SECS;
        let checks = [
            ("uploads.max_uploads_per_source", self.uploads.max_uploads_per_source >= 1, AT_LEAST_ONE),
            ("parq.max_queue_size", self.parq.max_queue_size >= 1, AT_LEAST_ONE),
            ("parq.active_queue_size", self.parq.active_queue_size >= 1, AT_LEAST_ONE),
            ("parq.save_interval_ticks", self.parq.save_interval_ticks >= 1, AT_LEAST_ONE),
            ("parq.ban_window_secs", window.contains(&self.parq.ban_window_secs), WINDOW_RANGE),
            (
                "parq.dead_scan_interval_secs",
                window.contains(&self.parq.dead_scan_interval_secs),
                WINDOW_RANGE,
            ),
            ("callbacks.period_secs", window.contains(&self.callbacks.period_secs), WINDOW_RANGE),
            ("callbacks.connect_timeout_ms", self.callbacks.connect_timeout_ms >= 1, AT_LEAST_ONE),
        ];

        match checks.iter().find(|(_, ok, _)| !ok) {
            Some((key, _, expected)) => Err(ConfigError::OutOfRange {
                key: (*key).to_owned(),
                expected: *expected,
            }),
            None => Ok(()),
        }
    }
}

fn split_config_arg(
    args: impl IntoIterator<Item = String>,
) -> Result<(Option<PathBuf>, Vec<String>), ConfigError> {
    let mut config_path = None;
    let mut rest = Vec::new();
    let mut iter = args.into_iter();

    while let Some(arg) = iter.next() {
        if arg == "--config" {
            let value = iter.next().ok_or_else(|| ConfigError::MissingValueForArg {
                key: "config".to_owned(),
            })?;
            config_path = Some(PathBuf::from(value));
        } else {
            rest.push(arg);
        }
    }

    Ok((config_path, rest))
}

fn merge_tables(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Table(base_table), Value::Table(overlay_table)) => {
            for (key, value) in overlay_table {
                let nested = value.is_table() && base_table.get(&key).map_or(false, Value::is_table);
                if !nested {
                    base_table.insert(key, value);
                } else if let Some(existing) = base_table.get_mut(&key) {
                    merge_tables(existing, value);
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}

#[derive(Debug)]
pub enum ConfigError {
    Io {
        path: String,
        source: std::io::Error,
    },
    TomlParse {
        path: String,
        source: toml::de::Error,
    },
    Deserialize(toml::de::Error),
    MissingValueForArg {
        key: String,
    },
    InvalidArgFormat {
        arg: String,
    },
    InvalidPath {
        key: String,
    },
    UnknownPath {
        key: String,
    },
    UnsupportedOverrideType {
        key: String,
    },
    InvalidValueForType {
        key: String,
        expected: &'static str,
        value: String,
    },
    OutOfRange {
        key: String,
        expected: &'static str,
    },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io { path, source } => {
                write!(f, "failed to read config file '{path}': {source}")
            }
            Self::TomlParse { path, source } => {
                write!(f, "failed to parse TOML config '{path}': {source}")
            }
            Self::Deserialize(source) => write!(f, "failed to deserialize config: {source}"),
            Self::MissingValueForArg { key } => {
                write!(f, "missing value for CLI override '--{key}'")
            }
            Self::InvalidArgFormat { arg } => write!(
                f,
                "invalid CLI argument format '{arg}', expected '--section.key value'"
            ),
            Self::InvalidPath { key } => write!(f, "invalid override key path '{key}'"),
            Self::UnknownPath { key } => write!(f, "unknown override key path '{key}'"),
            Self::UnsupportedOverrideType { key } => {
                write!(f, "override not supported for complex TOML type at '{key}'")
            }
            Self::InvalidValueForType {
                key,
                expected,
                value,
            } => write!(
                f,
                "invalid value '{value}' for '{key}', expected type {expected}"
            ),
            Self::OutOfRange { key, expected } => write!(f, "'{key}' must be {expected}"),
        }
    }
}

impl std::error::Error for ConfigError {}

fn parse_cli_overrides(args: impl IntoIterator<Item = String>) -> Result<Vec<(String, String)>, ConfigError> {
    let mut parsed = Vec::new();
    let mut iter = args.into_iter();

    while let Some(arg) = iter.next() {
        let Some(stripped) = arg.strip_prefix("--") else {
            return Err(ConfigError::InvalidArgFormat { arg });
        };

        if stripped.is_empty() {
            return Err(ConfigError::InvalidArgFormat { arg });
        }

        let value = iter.next().ok_or_else(|| ConfigError::MissingValueForArg {
            key: stripped.to_owned(),
        })?;

        parsed.push((stripped.to_owned(), value));
    }

    Ok(parsed)
}

fn apply_override(root: &mut Value, key_path: &str, raw_value: &str) -> Result<(), ConfigError> {
    let parts: Vec<&str> = key_path.split('.').collect();
    if parts.is_empty() || parts.iter().any(|part| part.is_empty()) {
        return Err(ConfigError::InvalidPath {
            key: key_path.to_owned(),
        });
    }

    let mut current = root;
    for section in &parts[..parts.len() - 1] {
        let table = current
            .as_table_mut()
            .ok_or_else(|| ConfigError::UnknownPath {
                key: key_path.to_owned(),
            })?;
        current = table.get_mut(*section).ok_or_else(|| ConfigError::UnknownPath {
            key: key_path.to_owned(),
        })?;
    }

    let final_key = parts[parts.len() - 1];
    let table = current
        .as_table_mut()
        .ok_or_else(|| ConfigError::UnknownPath {
            key: key_path.to_owned(),
        })?;
    let current_value = table
        .get_mut(final_key)
        .ok_or_else(|| ConfigError::UnknownPath {
            key: key_path.to_owned(),
        })?;

    let parsed_value = parse_value_using_current_type(key_path, raw_value, current_value)?;
    *current_value = parsed_value;

    Ok(())
}

fn parse_value_using_current_type(
    key_path: &str,
    raw_value: &str,
    current_value: &Value,
) -> Result<Value, ConfigError> {
    match current_value {
        Value::String(_) => Ok(Value::String(raw_value.to_owned())),
        Value::Integer(_) => {
            let parsed = raw_value
                .parse::<i64>()
                .map_err(|_| ConfigError::InvalidValueForType {
                    key: key_path.to_owned(),
                    expected: "integer",
                    value: raw_value.to_owned(),
                })?;
            Ok(Value::Integer(parsed))
        }
        Value::Float(_) => {
            let parsed = raw_value
                .parse::<f64>()
                .map_err(|_| ConfigError::InvalidValueForType {
                    key: key_path.to_owned(),
                    expected: "float",
                    value: raw_value.to_owned(),
                })?;
            Ok(Value::Float(parsed))
        }
        Value::Boolean(_) => {
            let parsed = raw_value
                .parse::<bool>()
                .map_err(|_| ConfigError::InvalidValueForType {
                    key: key_path.to_owned(),
                    expected: "boolean",
                    value: raw_value.to_owned(),
                })?;
            Ok(Value::Boolean(parsed))
        }
        Value::Datetime(_) | Value::Array(_) | Value::Table(_) => {
            Err(ConfigError::UnsupportedOverrideType {
                key: key_path.to_owned(),
            })
        }
    }
}
