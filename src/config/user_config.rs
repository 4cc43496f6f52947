//! User configuration file parsing

use crate::config::ServerDefinition;
use crate::types::LspError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserConfig {
    #[serde(default)]
    pub launcher: LauncherSettings,
    #[serde(default)]
    pub servers: HashMap<String, ServerDefinition>,
    /// Every other table is a configuration section (`[dwsls]`, `[dws]`, ...)
    #[serde(flatten)]
    pub sections: toml::Table,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LauncherSettings {
    pub debounce_ms: u64,
    pub grace_period_ms: u64,
    pub poll_interval_ms: u64,
}

impl Default for LauncherSettings {
    fn default() -> Self {
        Self {
            debounce_ms: 250,
            grace_period_ms: 2000,
            poll_interval_ms: 1000,
        }
    }
}

impl LauncherSettings {
    /// Intervals that must be positive are rejected when zero.
    pub fn validate(&self) -> Result<(), LspError> {
        if self.poll_interval_ms == 0 {
            return Err(LspError::invalid_key(
                "launcher.poll_interval_ms",
                "must be greater than zero",
            ));
        }
        Ok(())
    }
}
