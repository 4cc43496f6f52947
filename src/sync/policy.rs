use crate::types::LspError;
use std::collections::BTreeSet;

/// Which editor events a session forwards to its server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncPolicy {
    document_selector: BTreeSet<String>,
    config_section: String,
    watch_globs: Vec<String>,
}

impl SyncPolicy {
    /// An empty `config_section` disables configuration forwarding.
    pub fn new<I, S>(
        document_selector: I,
        config_section: impl Into<String>,
        watch_globs: Vec<String>,
    ) -> Result<Self, LspError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let document_selector: BTreeSet<String> =
            document_selector.into_iter().map(Into::into).collect();

        if document_selector.is_empty() {
            return Err(LspError::InvalidPolicy(
                "document selector must name at least one language".to_string(),
            ));
        }
        if document_selector.iter().any(|id| id.trim().is_empty()) {
            return Err(LspError::InvalidPolicy(
                "document selector contains an empty language id".to_string(),
            ));
        }

        Ok(Self {
            document_selector,
            config_section: config_section.into(),
            watch_globs,
        })
    }

    pub fn document_selector(&self) -> &BTreeSet<String> {
        &self.document_selector
    }

    pub fn handles_language(&self, language_id: &str) -> bool {
        self.document_selector.contains(language_id)
    }

    pub fn config_section(&self) -> &str {
        &self.config_section
    }

    pub fn syncs_configuration(&self) -> bool {
        !self.config_section.is_empty()
    }

    pub fn watch_globs(&self) -> &[String] {
        &self.watch_globs
    }
}
