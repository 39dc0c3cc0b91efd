use std::collections::HashMap;

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Group used when a job does not name one.
pub const DEFAULT_GROUP: &str = "default";
/// Jobs in the same group run one at a time unless configured otherwise.
pub const DEFAULT_GROUP_CONCURRENCY: usize = 1;

/// Top-level config (tasklane.toml + TASKLANE_* env overrides).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TasklaneConfig {
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Concurrency of any group not listed in `groups`.
    #[serde(default = "default_concurrency")]
    pub default_concurrency: usize,
    /// Per-group concurrency overrides, e.g. `uploads = 2`.
    #[serde(default)]
    pub groups: HashMap<String, usize>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            default_concurrency: DEFAULT_GROUP_CONCURRENCY,
            groups: HashMap::new(),
        }
    }
}

impl QueueConfig {
    /// Slots for `group`; never less than one.
    pub fn concurrency_for(&self, group: &str) -> usize {
        self.groups
            .get(group)
            .copied()
            .unwrap_or(self.default_concurrency)
            .max(1)
    }

    pub fn with_group(mut self, group: impl Into<String>, concurrency: usize) -> Self {
        self.groups.insert(group.into(), concurrency);
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

fn default_concurrency() -> usize {
    DEFAULT_GROUP_CONCURRENCY
}

fn default_db_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.tasklane/tasklane.db", home)
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.tasklane/tasklane.toml", home)
}

impl TasklaneConfig {
    /// Load config from a TOML file with TASKLANE_* env var overrides.
    ///
    /// Nested keys use a double underscore:
    /// `TASKLANE_QUEUE__DEFAULT_CONCURRENCY=4`, `TASKLANE_QUEUE__GROUPS__UPLOADS=2`.
    /// A missing file is not an error; every section has defaults.
    pub fn load(config_path: Option<&str>) -> Result<Self, ConfigError> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("TASKLANE_").split("__"))
            .extract()
            .map_err(|e| ConfigError(e.to_string()))
    }
}
