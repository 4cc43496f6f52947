//! Notifications the launcher itself sends to a server

use crate::sync::FileChange;
use crate::types::LspError;
use lsp_types::notification::{DidChangeConfiguration, DidChangeWatchedFiles, Notification};
use lsp_types::{DidChangeConfigurationParams, DidChangeWatchedFilesParams, FileEvent};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use url::Url;

#[derive(Debug, Serialize, Deserialize)]
struct JsonRpcNotification {
    jsonrpc: String,
    method: String,
    params: Value,
}

/// Serialize a notification body (without framing)
pub(crate) fn notification<N: Notification>(params: N::Params) -> Result<String, LspError> {
    let message = JsonRpcNotification {
        jsonrpc: "2.0".to_string(),
        method: N::METHOD.to_string(),
        params: serde_json::to_value(params)?,
    };
    Ok(serde_json::to_string(&message)?)
}

pub(crate) fn watched_files_changed(change: &FileChange) -> Result<String, LspError> {
    let uri = Url::from_file_path(&change.path)
        .map_err(|_| LspError::InvalidPath(change.path.clone()))?;

    notification::<DidChangeWatchedFiles>(DidChangeWatchedFilesParams {
        changes: vec![FileEvent {
            uri,
            typ: change.kind.to_lsp(),
        }],
    })
}

/// `settings` is keyed by section name, the shape VS Code clients send.
pub(crate) fn configuration_changed(section: &str, value: Value) -> Result<String, LspError> {
    let mut settings = serde_json::Map::new();
    settings.insert(section.to_string(), value);

    notification::<DidChangeConfiguration>(DidChangeConfigurationParams {
        settings: Value::Object(settings),
    })
}
