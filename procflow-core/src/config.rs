//! Engine configuration, loaded from YAML.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::types::Principal;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// `EnvFilter` directive used when `PROCFLOW_LOG` is unset.
    pub log_filter: String,
    /// Owner of process instances started without one.
    pub default_owner: String,
    /// Upper bound on tickle-queue drains per `run_tickles` call.
    pub max_tickle_passes: usize,
    /// Events retained in memory before the oldest are dropped.
    pub event_log_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            log_filter: "info,procflow_core=debug".to_string(),
            default_owner: "system".to_string(),
            max_tickle_passes: 3,
            event_log_capacity: 10_000,
        }
    }
}

impl EngineConfig {
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).context("Parsing engine config")
    }

    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content =
            std::fs::read_to_string(path).with_context(|| format!("Reading {}", path.display()))?;
        serde_yaml::from_str(&content).with_context(|| format!("Parsing {}", path.display()))
    }

    pub fn default_owner(&self) -> Principal {
        Principal::new(self.default_owner.clone())
    }
}
