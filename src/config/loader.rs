//! Configuration loader
//!
//! Server definitions come from two places (highest priority first):
//! 1. `[servers.<id>]` tables in the user config
//! 2. The embedded registry (`registry/*.toml`)
//!
//! The user config itself is the first file found among `./.lslaunch.toml`,
//! `$LSLAUNCH_CONFIG` and `~/.config/lslaunch/config.toml`.

use crate::config::{ConfigStore, LauncherSettings, ServerDefinition, UserConfig};
use crate::types::LspError;
use include_dir::{include_dir, Dir};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

// Embed the registry directory at compile time
static REGISTRY_DIR: Dir = include_dir!("$CARGO_MANIFEST_DIR/registry");

pub struct ConfigLoader {
    registry: HashMap<String, ServerDefinition>,
    user_config: UserConfig,
    source: Option<PathBuf>,
}

impl ConfigLoader {
    /// Load the registry and discover the user config
    pub fn new() -> Result<Self, LspError> {
        let discovered = Self::discover_user_config()?;
        let (source, user_config) = match discovered {
            Some((path, config)) => (Some(path), config),
            None => (None, UserConfig::default()),
        };
        Self::with_user_config(user_config, source)
    }

    /// Load the registry plus an explicit config file
    pub fn from_path(path: &Path) -> Result<Self, LspError> {
        let user_config = Self::read_user_config(path)?;
        Self::with_user_config(user_config, Some(path.to_path_buf()))
    }

    pub fn with_user_config(
        user_config: UserConfig,
        source: Option<PathBuf>,
    ) -> Result<Self, LspError> {
        user_config.launcher.validate()?;
        let registry = Self::load_registry()?;
        info!("Loaded {} server definitions from registry", registry.len());
        if let Some(path) = &source {
            info!("Loaded user configuration from {}", path.display());
        }

        Ok(Self {
            registry,
            user_config,
            source,
        })
    }

    fn load_registry() -> Result<HashMap<String, ServerDefinition>, LspError> {
        let mut registry = HashMap::new();

        for file in REGISTRY_DIR.files() {
            let Some(file_name) = file.path().file_name() else {
                continue;
            };
            let file_name_str = file_name.to_string_lossy();
            if !file_name_str.ends_with(".toml") {
                continue;
            }

            let content = file.contents_utf8().ok_or_else(|| {
                LspError::ProtocolError(format!("Invalid UTF-8 in registry file {}", file_name_str))
            })?;

            match toml::from_str::<ServerDefinition>(content) {
                Ok(mut definition) => {
                    if definition.id.is_empty() {
                        definition.id = file_name_str.trim_end_matches(".toml").to_string();
                    }
                    debug!("Loaded registry entry: {} ({})", definition.id, definition.name);
                    registry.insert(definition.id.clone(), definition);
                }
                Err(e) => {
                    warn!("Failed to parse registry file {}: {}", file_name_str, e);
                }
            }
        }

        Ok(registry)
    }

    fn discover_user_config() -> Result<Option<(PathBuf, UserConfig)>, LspError> {
        let mut candidates = Vec::new();

        // Project-specific config
        if let Ok(cwd) = std::env::current_dir() {
            candidates.push(cwd.join(".lslaunch.toml"));
        }

        // Environment variable
        if let Ok(config_path) = std::env::var("LSLAUNCH_CONFIG") {
            candidates.push(PathBuf::from(config_path));
        }

        // User-global config
        if let Some(config_dir) = dirs::config_dir() {
            candidates.push(config_dir.join("lslaunch").join("config.toml"));
        }

        for path in candidates {
            if path.exists() {
                let config = Self::read_user_config(&path)?;
                return Ok(Some((path, config)));
            }
        }

        debug!("No user config file found");
        Ok(None)
    }

    fn read_user_config(path: &Path) -> Result<UserConfig, LspError> {
        debug!("Loading user config from: {}", path.display());
        let content = std::fs::read_to_string(path).map_err(|e| {
            LspError::invalid_key(path.display().to_string(), format!("could not be read: {}", e))
        })?;

        toml::from_str(&content).map_err(|e| {
            LspError::invalid_key(path.display().to_string(), format!("could not be parsed: {}", e))
        })
    }

    /// Where the user config came from, if any
    pub fn source(&self) -> Option<&Path> {
        self.source.as_deref()
    }

    /// Look up a server definition; user definitions win over the registry
    pub fn server(&self, id: &str) -> Result<ServerDefinition, LspError> {
        if let Some(definition) = self.user_config.servers.get(id) {
            debug!("Using user definition for server {}", id);
            let mut definition = definition.clone();
            if definition.id.is_empty() {
                definition.id = id.to_string();
            }
            return Ok(definition);
        }

        self.registry
            .get(id)
            .cloned()
            .ok_or_else(|| LspError::UnknownServer(id.to_string()))
    }

    /// All known servers, sorted by id
    pub fn list_servers(&self) -> Vec<ServerDefinition> {
        let mut ids: Vec<&String> = self
            .registry
            .keys()
            .chain(self.user_config.servers.keys())
            .collect();
        ids.sort();
        ids.dedup();

        ids.into_iter()
            .filter_map(|id| self.server(id).ok())
            .collect()
    }

    pub fn settings(&self) -> &LauncherSettings {
        &self.user_config.launcher
    }

    /// Configuration sections as a dotted-key store
    pub fn config_store(&self) -> ConfigStore {
        ConfigStore::from_table(self.user_config.sections.clone())
    }
}
