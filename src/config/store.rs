//! Namespaced key-value configuration
//!
//! Settings are addressed with dotted keys (`dwsls.path`). Sessions read a
//! snapshot at launch time and subscribe to later changes through a
//! [`ConfigHandle`].

use crate::types::LspError;
use serde_json::{Map, Value as JsonValue};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::watch;
use toml::Value;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConfigStore {
    values: BTreeMap<String, Value>,
}

impl ConfigStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Flatten nested TOML tables into dotted keys. Arrays stay whole.
    pub fn from_table(table: toml::Table) -> Self {
        let mut store = Self::new();
        for (key, value) in table {
            store.insert_flattened(key, value);
        }
        store
    }

    pub fn from_toml_str(content: &str) -> Result<Self, LspError> {
        let table: toml::Table = toml::from_str(content)?;
        Ok(Self::from_table(table))
    }

    fn insert_flattened(&mut self, key: String, value: Value) {
        match value {
            Value::Table(table) => {
                for (child, value) in table {
                    self.insert_flattened(format!("{}.{}", key, child), value);
                }
            }
            other => {
                self.values.insert(key, other);
            }
        }
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.values.insert(key.into(), value.into());
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.values.remove(key)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Read a string value. A present value of another type is a
    /// configuration error rather than "unset".
    pub fn get_str(&self, key: &str) -> Result<Option<&str>, LspError> {
        match self.values.get(key) {
            None => Ok(None),
            Some(Value::String(s)) => Ok(Some(s.as_str())),
            Some(other) => Err(LspError::invalid_key(
                key,
                format!("must be a string, found {}", other.type_str()),
            )),
        }
    }

    pub fn get_string_list(&self, key: &str) -> Result<Option<Vec<String>>, LspError> {
        let Some(value) = self.values.get(key) else {
            return Ok(None);
        };

        let items = value.as_array().ok_or_else(|| {
            LspError::invalid_key(key, format!("must be a list of strings, found {}", value.type_str()))
        })?;

        items
            .iter()
            .map(|item| {
                item.as_str().map(str::to_string).ok_or_else(|| {
                    LspError::invalid_key(key, "must contain only strings")
                })
            })
            .collect::<Result<Vec<_>, _>>()
            .map(Some)
    }

    /// JSON view of every key under `section`, nested back into objects.
    ///
    /// This is the payload forwarded with `workspace/didChangeConfiguration`.
    pub fn section(&self, section: &str) -> JsonValue {
        let prefix = format!("{}.", section);
        let mut root = Map::new();

        for (key, value) in &self.values {
            let Some(rest) = key.strip_prefix(&prefix) else {
                continue;
            };
            let json = serde_json::to_value(value).unwrap_or(JsonValue::Null);

            let parts: Vec<&str> = rest.split('.').collect();
            insert_path(&mut root, &parts, json);
        }

        JsonValue::Object(root)
    }
}

/// Insert `value` at `path`, replacing scalars that stand where an object is needed.
fn insert_path(map: &mut Map<String, JsonValue>, path: &[&str], value: JsonValue) {
    match path {
        [] => {}
        [leaf] => {
            map.insert(leaf.to_string(), value);
        }
        [head, rest @ ..] => {
            let entry = map
                .entry(head.to_string())
                .or_insert_with(|| JsonValue::Object(Map::new()));
            if !entry.is_object() {
                *entry = JsonValue::Object(Map::new());
            }
            if let JsonValue::Object(child) = entry {
                insert_path(child, rest, value);
            }
        }
    }
}

/// Host-owned configuration that sessions can observe.
#[derive(Clone)]
pub struct ConfigHandle {
    tx: Arc<watch::Sender<ConfigStore>>,
}

impl ConfigHandle {
    pub fn new(store: ConfigStore) -> Self {
        let (tx, _rx) = watch::channel(store);
        Self { tx: Arc::new(tx) }
    }

    pub fn snapshot(&self) -> ConfigStore {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConfigStore> {
        self.tx.subscribe()
    }

    pub fn update(&self, edit: impl FnOnce(&mut ConfigStore)) {
        self.tx.send_modify(edit);
    }

    pub fn replace(&self, store: ConfigStore) {
        self.tx.send_replace(store);
    }
}

impl Default for ConfigHandle {
    fn default() -> Self {
        Self::new(ConfigStore::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flattens_nested_tables() {
        let store = ConfigStore::from_toml_str(
            r#"
            [dwsls]
            path = "/usr/bin/mono"
            args = ["--verbose"]

            [dws.format]
            indent = 2
            "#,
        )
        .unwrap();

        assert_eq!(store.get_str("dwsls.path").unwrap(), Some("/usr/bin/mono"));
        assert_eq!(
            store.get_string_list("dwsls.args").unwrap(),
            Some(vec!["--verbose".to_string()])
        );
        assert_eq!(store.get("dws.format.indent"), Some(&Value::Integer(2)));
    }

    #[test]
    fn test_wrong_type_is_configuration_error() {
        let mut store = ConfigStore::new();
        store.set("dwsls.path", 42);
        let err = store.get_str("dwsls.path").unwrap_err();
        assert_eq!(err.config_key(), Some("dwsls.path"));

        store.set("dwsls.args", "not-a-list");
        let err = store.get_string_list("dwsls.args").unwrap_err();
        assert_eq!(err.config_key(), Some("dwsls.args"));
    }

    #[test]
    fn test_missing_key_is_none() {
        let store = ConfigStore::new();
        assert_eq!(store.get_str("dwsls.path").unwrap(), None);
        assert_eq!(store.get_string_list("dwsls.args").unwrap(), None);
    }

    #[test]
    fn test_section_rebuilds_objects() {
        let mut store = ConfigStore::new();
        store.set("dws.trace", "verbose");
        store.set("dws.format.indent", 4);
        store.set("dwsls.path", "/bin/dws");

        let section = store.section("dws");
        assert_eq!(section["trace"], "verbose");
        assert_eq!(section["format"]["indent"], 4);
        assert!(section.get("path").is_none());

        assert_eq!(store.section("missing"), serde_json::json!({}));
    }

    #[test]
    fn test_section_nested_key_overrides_scalar() {
        let mut store = ConfigStore::new();
        store.set("dws.format", "compact");
        store.set("dws.format.indent", 2);
        store.set("dws.format.tabs", false);

        assert_eq!(
            store.section("dws"),
            serde_json::json!({"format": {"indent": 2, "tabs": false}})
        );
    }

    #[tokio::test]
    async fn test_handle_notifies_subscribers() {
        let handle = ConfigHandle::default();
        let mut rx = handle.subscribe();

        handle.update(|store| store.set("dws.trace", "off"));
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow().get_str("dws.trace").unwrap(), Some("off"));
        assert_eq!(handle.snapshot().get_str("dws.trace").unwrap(), Some("off"));
    }
}
