//! Unified configuration for the key allocation service.
//!
//! Configuration is loaded with precedence: overrides > Env vars > Config file > Defaults
//!
//! # Example config file (occukey.toml)
//! ```toml
//! lookup_table = "prod_occurrence_lookup"
//! counter_table = "prod_occurrence_counter"
//! occurrence_table = "prod_occurrence"
//! dataset_id = "50c9509d-22c7-4a22-a47d-8c48425ef4a7"
//!
//! [tuning]
//! batch_size = 100
//! stale_lock_ms = 300000
//! ```

mod defaults;

pub use defaults::*;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

/// Main configuration for the key allocation service.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KeygenConfig {
    /// Logical name of the lookup table
    pub lookup_table: String,
    /// Logical name of the counter table
    pub counter_table: String,
    /// Logical name of the occurrence table
    pub occurrence_table: String,
    /// Column family shared by all three tables
    pub column_family: String,
    /// Default scope applied when the `*_default` operations are used,
    /// typically a dataset identifier
    pub dataset_id: Option<String>,
    /// Protocol tuning (advanced)
    pub tuning: KeygenTuning,
}

impl Default for KeygenConfig {
    fn default() -> Self {
        Self {
            lookup_table: DEFAULT_LOOKUP_TABLE.to_string(),
            counter_table: DEFAULT_COUNTER_TABLE.to_string(),
            occurrence_table: DEFAULT_OCCURRENCE_TABLE.to_string(),
            column_family: DEFAULT_COLUMN_FAMILY.to_string(),
            dataset_id: None,
            tuning: KeygenTuning::default(),
        }
    }
}

impl KeygenConfig {
    /// Load configuration with precedence: overrides > Env > File > Defaults
    ///
    /// # Arguments
    /// * `config_path` - Optional path to TOML config file
    /// * `overrides` - Programmatic overrides to apply on top
    pub fn load(
        config_path: Option<&str>,
        overrides: ConfigOverrides,
    ) -> Result<Self, ConfigError> {
        let mut figment = Figment::new().merge(Serialized::defaults(KeygenConfig::default()));

        // Layer 1: Config file (if provided)
        if let Some(path) = config_path {
            figment = figment.merge(Toml::file(path));
        }

        // Layer 2: Environment variables with OCCUKEY_ prefix
        figment = figment.merge(Env::prefixed("OCCUKEY_").split("__"));

        // Layer 3: Overrides
        figment = figment.merge(Serialized::defaults(overrides));

        figment.extract().map_err(ConfigError::from)
    }

    /// Load from environment and optional config file only (no overrides)
    pub fn from_env(config_path: Option<&str>) -> Result<Self, ConfigError> {
        Self::load(config_path, ConfigOverrides::default())
    }

    /// Same configuration with a different default scope.
    pub fn with_dataset_id(mut self, dataset_id: impl Into<String>) -> Self {
        self.dataset_id = Some(dataset_id.into());
        self
    }
}

/// Lock protocol and counter tuning (advanced).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KeygenTuning {
    /// Keys reserved per counter increment
    pub batch_size: i64,
    /// Base wait after a lock conflict (milliseconds)
    pub wait_before_retry_ms: u64,
    /// Jitter window around the base wait (milliseconds)
    pub wait_skew_ms: u64,
    /// Age at which a held lock may be taken over (milliseconds)
    pub stale_lock_ms: i64,
    /// Rows per scan page
    pub scan_batch_size: usize,
}

impl Default for KeygenTuning {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            wait_before_retry_ms: DEFAULT_WAIT_BEFORE_RETRY_MS,
            wait_skew_ms: DEFAULT_WAIT_SKEW_MS,
            stale_lock_ms: DEFAULT_STALE_LOCK_MS,
            scan_batch_size: DEFAULT_SCAN_BATCH_SIZE,
        }
    }
}

/// Programmatic overrides that take precedence over file and env config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lookup_table: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub counter_table: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub occurrence_table: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub column_family: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dataset_id: Option<String>,
}

/// Configuration error.
#[derive(Debug)]
pub struct ConfigError {
    pub message: String,
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "configuration error: {}", self.message)
    }
}

impl std::error::Error for ConfigError {}

impl From<figment::Error> for ConfigError {
    fn from(e: figment::Error) -> Self {
        Self {
            message: e.to_string(),
        }
    }
}
