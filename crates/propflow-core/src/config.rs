//! Configuration management for the workflow engine

use crate::error::{Result, WorkflowError};
use crate::workflow::register::StatusRegister;
use once_cell::sync::Lazy;
use propflow_types::RequestKind;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

/// Prefix for environment overrides, e.g. `PROPFLOW__ENGINE__MAX_RETRIES=5`
pub const ENV_PREFIX: &str = "PROPFLOW";

static STEP_CODE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z][a-z0-9_]*$").expect("step code pattern is valid"));

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PropflowConfig {
    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub engine: EngineConfig,

    #[serde(default)]
    pub events: EventsConfig,

    /// Per-kind step template overrides; kinds not listed keep the built-in template
    #[serde(default)]
    pub templates: HashMap<RequestKind, Vec<StepTemplateConfig>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackend {
    Memory,
    File,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_backend")]
    pub backend: StorageBackend,

    #[serde(alias = "data_dir", default = "default_data_root")]
    pub data_root: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Attempts per operation before `ConcurrentModification` reaches the caller
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,

    /// Kinds whose steps must be acted on in `step_order`
    #[serde(default)]
    pub strict_step_order: Vec<RequestKind>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventsConfig {
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,

    /// Write every event to the on-disk outbox as well as the in-process channel
    #[serde(default = "default_outbox")]
    pub outbox: bool,

    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepTemplateConfig {
    pub code: String,

    #[serde(default)]
    pub auto_approve_by_creator: bool,
}

// Default functions
fn default_backend() -> StorageBackend {
    StorageBackend::File
}

fn default_data_root() -> PathBuf {
    PathBuf::from(crate::paths::DEFAULT_DATA_ROOT)
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_backoff_ms() -> u64 {
    25
}

fn default_channel_capacity() -> usize {
    256
}

fn default_outbox() -> bool {
    true
}

fn default_poll_interval_secs() -> u64 {
    5
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            data_root: default_data_root(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
            strict_step_order: Vec::new(),
        }
    }
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            channel_capacity: default_channel_capacity(),
            outbox: default_outbox(),
            poll_interval_secs: default_poll_interval_secs(),
        }
    }
}

impl PropflowConfig {
    /// Load configuration from a JSON file layered with `PROPFLOW__*` environment overrides
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let settings = config::Config::builder()
            .add_source(config::File::from(path).format(config::FileFormat::Json))
            .add_source(Self::environment())
            .build()
            .map_err(|e| WorkflowError::Config(format!("Failed to read config file {}: {}", path.display(), e)))?;

        Self::from_settings(settings)
    }

    /// Defaults plus environment overrides, for running without a config file
    pub fn from_env() -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(Self::environment())
            .build()
            .map_err(|e| WorkflowError::Config(format!("Failed to read environment: {}", e)))?;

        Self::from_settings(settings)
    }

    /// Load configuration from a JSON string
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| WorkflowError::Config(format!("Failed to parse config: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    fn environment() -> config::Environment {
        config::Environment::with_prefix(ENV_PREFIX)
            .prefix_separator("__")
            .separator("__")
            .try_parsing(true)
    }

    fn from_settings(settings: config::Config) -> Result<Self> {
        let config: Self = settings
            .try_deserialize()
            .map_err(|e| WorkflowError::Config(format!("Failed to parse config: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.engine.max_retries == 0 {
            return Err(WorkflowError::Config("engine.max_retries must be at least 1".to_string()));
        }

        if self.events.channel_capacity == 0 {
            return Err(WorkflowError::Config("events.channel_capacity must be at least 1".to_string()));
        }

        if self.storage.backend == StorageBackend::File && self.storage.data_root.as_os_str().is_empty() {
            return Err(WorkflowError::Config("storage.data_root is required for the file backend".to_string()));
        }

        for (kind, steps) in &self.templates {
            if steps.is_empty() {
                return Err(WorkflowError::Config(format!("Template for {} has no steps", kind)));
            }

            if StatusRegister::global().rejection_status(*kind).is_none() {
                return Err(WorkflowError::Config(format!(
                    "{} has no rejection status and cannot carry approval steps",
                    kind
                )));
            }

            let mut seen = HashSet::new();
            for step in steps {
                if !STEP_CODE.is_match(&step.code) {
                    return Err(WorkflowError::Config(format!(
                        "Invalid step code '{}' in {} template",
                        step.code, kind
                    )));
                }
                if !seen.insert(step.code.as_str()) {
                    return Err(WorkflowError::Config(format!(
                        "Duplicate step code '{}' in {} template",
                        step.code, kind
                    )));
                }
            }
        }

        Ok(())
    }
}
