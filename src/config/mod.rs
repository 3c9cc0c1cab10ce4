//! Backend configuration.
//!
//! Provides layered configuration loading with priority:
//! 1. Default values (hardcoded)
//! 2. Config file (TOML)
//! 3. Environment variables, `RSTORE_` prefixed (highest priority)


use std::path::PathBuf;

use config::Config;
use config::Environment;
use config::File;
use serde::Deserialize;

use crate::constants::DEFAULT_MAX_COMMAND_SIZE_BYTES;
use crate::Result;

#[derive(Debug, Deserialize, Clone)]
pub struct BackendConfig {
    /// Data directory for the local store and the node identity file
    pub path: PathBuf,

    /// Whether the applied index/term are durably persisted with every apply.
    ///
    /// When disabled, the applied position lives only in process memory and is
    /// re-derived from log replay or snapshot install after a restart. The
    /// replicated cluster configuration is persisted regardless.
    #[serde(default = "default_store_latest_state")]
    pub store_latest_state: bool,

    /// Serialized command size ceiling, enforced before submission
    #[serde(default = "default_max_command_size_bytes")]
    pub max_command_size_bytes: usize,
}

fn default_store_latest_state() -> bool {
    true
}

fn default_max_command_size_bytes() -> usize {
    DEFAULT_MAX_COMMAND_SIZE_BYTES
}

impl BackendConfig {
    /// Default configuration rooted at `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            store_latest_state: default_store_latest_state(),
            max_command_size_bytes: default_max_command_size_bytes(),
        }
    }

    /// Load configuration from an optional TOML file, then apply `RSTORE_`
    /// environment variable overrides.
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let mut builder = Config::builder();

        if let Some(path) = config_path {
            builder = builder.add_source(File::with_name(path));
        }

        let config = builder
            .add_source(Environment::with_prefix("RSTORE"))
            .build()?
            .try_deserialize()?;

        Ok(config)
    }
}
