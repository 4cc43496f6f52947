use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LspError {
    #[error("Configuration error: '{key}' {reason}")]
    Configuration { key: String, reason: String },

    #[error("Failed to spawn {}: {source}", .program.display())]
    Spawn {
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("LSP server exited unexpectedly: {0}")]
    TransportClosedUnexpectedly(String),

    #[error("Failed to register file watch '{glob}': {reason}")]
    WatchRegistration { glob: String, reason: String },

    #[error("Invalid sync policy: {0}")]
    InvalidPolicy(String),

    #[error("Transport is not open")]
    TransportClosed,

    #[error("Unknown server: {0}")]
    UnknownServer(String),

    #[error("Invalid file path: {}", .0.display())]
    InvalidPath(PathBuf),

    #[error("LSP protocol error: {0}")]
    ProtocolError(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl LspError {
    pub(crate) fn missing_key(key: impl Into<String>) -> Self {
        LspError::Configuration {
            key: key.into(),
            reason: "is not set".to_string(),
        }
    }

    pub(crate) fn invalid_key(key: impl Into<String>, reason: impl Into<String>) -> Self {
        LspError::Configuration {
            key: key.into(),
            reason: reason.into(),
        }
    }

    /// The configuration key named by a `Configuration` error.
    pub fn config_key(&self) -> Option<&str> {
        match self {
            LspError::Configuration { key, .. } => Some(key),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_configuration_error_names_key() {
        let err = LspError::missing_key("dwsls.path");
        assert_eq!(err.config_key(), Some("dwsls.path"));
        assert!(err.to_string().contains("dwsls.path"));
    }

    #[test]
    fn test_spawn_error_mentions_program() {
        let err = LspError::Spawn {
            program: PathBuf::from("/opt/dws/bin/dwsc.exe"),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "not found"),
        };
        let msg = err.to_string();
        assert!(msg.contains("/opt/dws/bin/dwsc.exe"));
        assert!(msg.contains("not found"));
        assert_eq!(err.config_key(), None);
    }
}
