//! Engine configuration file handling
//!
//! Configuration is TOML. Every section is optional and falls back to the
//! defaults below, so an empty file is a valid in-memory setup.
//!
//! ```toml
//! [storage]
//! backend = "sqlite"
//! path = "/var/lib/agent/agent.db"
//!
//! [events]
//! action_timeout = "1m"
//! publish_timeout = "500ms"
//! action_channel_capacity = 16
//! state_queue_capacity = 64
//!
//! [logging]
//! level = "info"
//! ```

use crate::protocol::ActionEvent;
use crate::storage::{MemStoreProvider, SqliteStoreProvider, StorageResult, StoreProvider};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

/// Default log level
const DEFAULT_LOG_LEVEL: &str = "info";

/// Default time an action event may stay unanswered
const DEFAULT_ACTION_TIMEOUT: Duration = Duration::from_secs(60);

/// Default time a full state-event queue may delay one event
const DEFAULT_PUBLISH_TIMEOUT: Duration = Duration::from_millis(500);

const DEFAULT_ACTION_CHANNEL_CAPACITY: usize = 16;

const DEFAULT_STATE_QUEUE_CAPACITY: usize = 64;

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write config file '{path}': {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file '{path}': {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
}

/// Engine configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Store provider used for connection records, the DID store and protocol threads
    #[serde(default)]
    pub storage: StorageConfig,

    /// Action/state event delivery
    #[serde(default)]
    pub events: EventsConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Store backend selection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    Memory,
    Sqlite,
}

/// Storage configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: StorageBackend,

    /// SQLite database file (defaults to [`default_store_path`])
    pub path: Option<PathBuf>,
}

impl StorageConfig {
    /// Build the configured store provider.
    pub async fn open_provider(&self) -> StorageResult<Arc<dyn StoreProvider>> {
        match self.backend {
            StorageBackend::Memory => Ok(Arc::new(MemStoreProvider::new())),
            StorageBackend::Sqlite => {
                let path = self.path.clone().unwrap_or_else(default_store_path);
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent).map_err(|e| {
                        crate::storage::StorageError::Backend(format!(
                            "Failed to create store directory '{}': {}",
                            parent.display(),
                            e
                        ))
                    })?;
                }
                tracing::info!(path = %path.display(), "Opening SQLite store");
                Ok(Arc::new(SqliteStoreProvider::open(&path).await?))
            }
        }
    }
}

/// Event delivery configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventsConfig {
    /// How long a thread waits for an action event decision
    #[serde(default = "default_action_timeout", with = "duration_str")]
    pub action_timeout: Duration,

    /// How long a full state-event queue may hold up one event before it is dropped
    #[serde(default = "default_publish_timeout", with = "duration_str")]
    pub publish_timeout: Duration,

    /// Capacity of action channels created with [`EventsConfig::action_channel`]
    #[serde(default = "default_action_channel_capacity")]
    pub action_channel_capacity: usize,

    /// Per-subscriber state-event queue; events published while it is full are dropped
    #[serde(default = "default_state_queue_capacity")]
    pub state_queue_capacity: usize,
}

impl EventsConfig {
    /// Bounded action-event channel sized from this config.
    pub fn action_channel<O>(&self) -> (mpsc::Sender<ActionEvent<O>>, mpsc::Receiver<ActionEvent<O>>) {
        mpsc::channel(self.action_channel_capacity.max(1))
    }
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            action_timeout: DEFAULT_ACTION_TIMEOUT,
            publish_timeout: DEFAULT_PUBLISH_TIMEOUT,
            action_channel_capacity: DEFAULT_ACTION_CHANNEL_CAPACITY,
            state_queue_capacity: DEFAULT_STATE_QUEUE_CAPACITY,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: DEFAULT_LOG_LEVEL.to_string(),
        }
    }
}

fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}

fn default_action_timeout() -> Duration {
    DEFAULT_ACTION_TIMEOUT
}

fn default_publish_timeout() -> Duration {
    DEFAULT_PUBLISH_TIMEOUT
}

fn default_action_channel_capacity() -> usize {
    DEFAULT_ACTION_CHANNEL_CAPACITY
}

fn default_state_queue_capacity() -> usize {
    DEFAULT_STATE_QUEUE_CAPACITY
}

/// Human-readable durations ("30s", "1m", "500ms") via humantime.
mod duration_str {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&humantime::format_duration(*value).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(deserializer)?;
        humantime::parse_duration(&raw)
            .map_err(|e| serde::de::Error::custom(format!("Invalid duration '{}': {}", raw, e)))
    }
}

impl EngineConfig {
    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Save configuration to a TOML file
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let contents = toml::to_string_pretty(self)?;
        write_file(path, &contents)
    }

    /// Generate default configuration content as a string with comments
    pub fn generate_default_toml(store_path: &Path) -> String {
        format!(
            r#"# DIDComm engine configuration

[storage]
# Store backend: "memory" (lost on exit) or "sqlite" (resumes mid-exchange after restart)
backend = "sqlite"
path = "{store_path}"

[events]
# How long a protocol thread waits for an application decision on an action event.
# An unanswered event fails that step; the caller must re-drive it.
action_timeout = "1m"

# How long a full state-event subscriber queue may hold up one event before it is dropped
publish_timeout = "500ms"

# Capacity of the action-event channel
action_channel_capacity = {capacity}

# Per-subscriber state-event queue; events published while it is full are dropped
state_queue_capacity = {queue}

[logging]
# Log level: trace, debug, info, warn, error (RUST_LOG overrides)
level = "{level}"
"#,
            store_path = store_path.display(),
            capacity = DEFAULT_ACTION_CHANNEL_CAPACITY,
            queue = DEFAULT_STATE_QUEUE_CAPACITY,
            level = DEFAULT_LOG_LEVEL,
        )
    }

    /// Create and save a default configuration file
    pub fn create_default(config_path: &Path, store_path: &Path) -> Result<(), ConfigError> {
        write_file(config_path, &Self::generate_default_toml(store_path))
    }
}

fn write_file(path: &Path, contents: &str) -> Result<(), ConfigError> {
    let to_err = |source| ConfigError::Write {
        path: path.to_path_buf(),
        source,
    };

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(to_err)?;
    }
    fs::write(path, contents).map_err(to_err)
}

/// Install the global tracing subscriber.
///
/// `RUST_LOG` wins over the configured level. Calling this more than once is harmless.
pub fn init_tracing(logging: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

/// Get the default store path
pub fn default_store_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("didcomm-engine")
        .join("agent.db")
}

/// Get the default config file path (next to the store)
pub fn default_config_path(store_path: &Path) -> PathBuf {
    store_path
        .parent()
        .unwrap_or(store_path)
        .join("config.toml")
}
