//! `BrokerpollConfig`: every tunable of the ingestion engine as TOML.
//!
//! Each section implements `Default`, so absent sections and keys fall back
//! to the constants in [`super::defaults`].

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

use super::defaults;
use crate::types::ClassifierId;

/// Environment variable naming the config file.
pub const CONFIG_ENV_VAR: &str = "BROKERPOLL_CONFIG";

/// Config file looked up in the working directory.
pub const LOCAL_CONFIG_FILE: &str = "brokerpoll.toml";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BrokerpollConfig {
    #[serde(default)]
    pub source: SourceConfig,

    #[serde(default)]
    pub poll: PollConfig,

    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub views: ViewsConfig,
}

/// Where messages come from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    /// Directory of the sled database (topics, store, views).
    pub data_dir: PathBuf,
    /// Topics this consumer subscribes to.
    pub topics: Vec<String>,
    /// Offsets are tracked per consumer group.
    pub consumer_group: String,
    /// brokerClassification schema document. Bundled schema when unset.
    pub schema_path: Option<PathBuf>,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(defaults::DATA_DIR),
            topics: vec![defaults::CLASSIFICATION_TOPIC.to_string()],
            consumer_group: defaults::CONSUMER_GROUP.to_string(),
            schema_path: None,
        }
    }
}

/// Poll loop bounds. Unset stop conditions never trigger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollConfig {
    pub batch_size: usize,
    pub poll_timeout_ms: u64,
    pub stop_after_secs: Option<u64>,
    pub max_messages: Option<u64>,
    pub max_empty_polls: Option<u32>,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            batch_size: defaults::POLL_BATCH_SIZE,
            poll_timeout_ms: defaults::POLL_TIMEOUT_MS,
            stop_after_secs: None,
            max_messages: None,
            max_empty_polls: None,
        }
    }
}

impl PollConfig {
    pub const fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    pub fn stop_after(&self) -> Option<Duration> {
        self.stop_after_secs.map(Duration::from_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Classifier ids that get a dedicated partition. Everything else lands
    /// in the default partition.
    pub partitions: Vec<u64>,
    /// Attempts per message when the backend reports a transient failure.
    pub write_attempts: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            partitions: Vec::new(),
            write_attempts: defaults::WRITE_ATTEMPTS,
        }
    }
}

impl StoreConfig {
    pub fn partition_ids(&self) -> Vec<ClassifierId> {
        self.partitions.iter().copied().map(ClassifierId).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ViewsConfig {
    /// Recompute materialized views when an ingest run stops.
    pub refresh_after_ingest: bool,
    pub snapshot_retries: u32,
    /// Days after an object's first detection before forced photometry counts.
    pub forced_source_lag_days: f64,
}

impl Default for ViewsConfig {
    fn default() -> Self {
        Self {
            refresh_after_ingest: false,
            snapshot_retries: defaults::VIEW_SNAPSHOT_RETRIES,
            forced_source_lag_days: defaults::FORCED_SOURCE_LAG_DAYS,
        }
    }
}

impl BrokerpollConfig {
    /// Load using the standard search order, falling back to defaults when
    /// no file is found or the file is unusable.
    pub fn load() -> Self {
        if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
            let p = PathBuf::from(&path);
            if p.exists() {
                match Self::load_from_file(&p) {
                    Ok(config) => {
                        info!(path = %p.display(), "Loaded config from {}", CONFIG_ENV_VAR);
                        return config;
                    }
                    Err(e) => {
                        warn!(path = %p.display(), error = %e, "Failed to load config, falling back");
                    }
                }
            } else {
                warn!(path = %path, "{} points to non-existent file, falling back", CONFIG_ENV_VAR);
            }
        }

        let local = PathBuf::from(LOCAL_CONFIG_FILE);
        if local.exists() {
            match Self::load_from_file(&local) {
                Ok(config) => {
                    info!("Loaded config from ./{}", LOCAL_CONFIG_FILE);
                    return config;
                }
                Err(e) => {
                    warn!(error = %e, "Failed to load ./{}, using defaults", LOCAL_CONFIG_FILE);
                }
            }
        }

        info!("No {} found, using built-in defaults", LOCAL_CONFIG_FILE);
        Self::default()
    }

    /// Load and validate a specific file. Unknown keys are logged, not fatal.
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents =
            std::fs::read_to_string(path).map_err(|e| ConfigError::Io(path.to_path_buf(), e))?;
        Self::from_toml_str(&contents).map_err(|e| match e {
            ConfigError::Parse(_, err) => ConfigError::Parse(path.to_path_buf(), err),
            other => other,
        })
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        for w in super::validation::validate_unknown_keys(contents) {
            warn!("{}", w);
        }
        let config: Self =
            toml::from_str(contents).map_err(|e| ConfigError::Parse(PathBuf::new(), e))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(ConfigError::Serialize)
    }

    /// Check every section, reporting all problems at once.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors: Vec<String> = Vec::new();

        if self.source.topics.is_empty() {
            errors.push("source.topics: at least one topic is required".to_string());
        }
        for topic in &self.source.topics {
            if !crate::acquisition::is_valid_topic_name(topic) {
                errors.push(format!("source.topics: invalid topic name '{topic}'"));
            }
        }
        if self.source.consumer_group.trim().is_empty() {
            errors.push("source.consumer_group: must not be empty".to_string());
        }

        if self.poll.batch_size == 0 {
            errors.push("poll.batch_size: must be > 0".to_string());
        }
        if self.poll.poll_timeout_ms == 0 {
            errors.push("poll.poll_timeout_ms: must be > 0".to_string());
        }
        if self.poll.max_messages == Some(0) {
            errors.push("poll.max_messages: must be > 0 when set".to_string());
        }

        let mut seen = HashSet::new();
        for id in &self.store.partitions {
            if !seen.insert(id) {
                errors.push(format!("store.partitions: classifier {id} listed twice"));
            }
        }
        if self.store.write_attempts == 0 {
            errors.push("store.write_attempts: must be >= 1".to_string());
        }

        if self.views.snapshot_retries == 0 {
            errors.push("views.snapshot_retries: must be >= 1".to_string());
        }
        if !(self.views.forced_source_lag_days.is_finite() && self.views.forced_source_lag_days >= 0.0) {
            errors.push("views.forced_source_lag_days: must be a non-negative number".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Validation(errors))
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Config I/O error ({}): {}", .0.display(), .1)]
    Io(PathBuf, std::io::Error),
    #[error("Config parse error ({}): {}", .0.display(), .1)]
    Parse(PathBuf, toml::de::Error),
    #[error("Config serialization error: {0}")]
    Serialize(toml::ser::Error),
    #[error("Config validation failed: {}", .0.join("; "))]
    Validation(Vec<String>),
}
