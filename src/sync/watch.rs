//! File-watch registration
//!
//! The host owns the actual watch primitive ([`FileWatcher`]). A session
//! registers one watch per glob and receives matching changes through a
//! [`WatchSink`]; dropping the returned [`WatchRegistration`] deregisters it.

use crate::types::LspError;
use async_trait::async_trait;
use globset::{GlobBuilder, GlobMatcher};
use lsp_types::FileChangeType;
use path_clean::PathClean;
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileChangeKind {
    Created,
    Changed,
    Deleted,
}

impl FileChangeKind {
    pub fn to_lsp(self) -> FileChangeType {
        match self {
            FileChangeKind::Created => FileChangeType::CREATED,
            FileChangeKind::Changed => FileChangeType::CHANGED,
            FileChangeKind::Deleted => FileChangeType::DELETED,
        }
    }
}

/// A file-system event; `path` is absolute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileChange {
    pub path: PathBuf,
    pub kind: FileChangeKind,
}

/// A POSIX-style glob matched against workspace-relative paths.
///
/// `*` and `?` never cross a `/`; `**` does.
#[derive(Debug, Clone)]
pub struct GlobPattern {
    source: String,
    matcher: GlobMatcher,
}

impl GlobPattern {
    pub fn new(glob: &str) -> Result<Self, LspError> {
        let compiled = GlobBuilder::new(glob)
            .literal_separator(true)
            .build()
            .map_err(|e| LspError::WatchRegistration {
                glob: glob.to_string(),
                reason: e.to_string(),
            })?;

        Ok(Self {
            source: glob.to_string(),
            matcher: compiled.compile_matcher(),
        })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    pub fn is_match(&self, relative: &Path) -> bool {
        self.matcher.is_match(relative)
    }
}

/// `path` relative to `root`, or `None` when it lies outside the workspace.
pub fn workspace_relative(root: &Path, path: &Path) -> Option<PathBuf> {
    let root = root.clean();
    let path = path.clean();
    path.strip_prefix(&root).ok().map(Path::to_path_buf)
}

/// Delivery end of one watch registration.
#[derive(Clone)]
pub struct WatchSink {
    glob: String,
    tx: mpsc::UnboundedSender<FileChange>,
}

impl WatchSink {
    pub(crate) fn new(glob: impl Into<String>, tx: mpsc::UnboundedSender<FileChange>) -> Self {
        Self {
            glob: glob.into(),
            tx,
        }
    }

    pub fn glob(&self) -> &str {
        &self.glob
    }

    /// Returns `false` once the owning session is gone.
    pub fn notify(&self, change: FileChange) -> bool {
        self.tx.send(change).is_ok()
    }
}

impl fmt::Debug for WatchSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WatchSink").field("glob", &self.glob).finish()
    }
}

/// Scoped guard for a registered watch. Deregisters on drop.
pub struct WatchRegistration {
    on_drop: Option<Box<dyn FnOnce() + Send>>,
}

impl WatchRegistration {
    pub fn new(on_drop: impl FnOnce() + Send + 'static) -> Self {
        Self {
            on_drop: Some(Box::new(on_drop)),
        }
    }

    /// A registration with nothing to undo
    pub fn noop() -> Self {
        Self { on_drop: None }
    }
}

impl Drop for WatchRegistration {
    fn drop(&mut self) {
        if let Some(on_drop) = self.on_drop.take() {
            on_drop();
        }
    }
}

/// Host file-system watch primitive.
#[async_trait]
pub trait FileWatcher: Send + Sync {
    async fn watch(
        &self,
        pattern: &GlobPattern,
        sink: WatchSink,
    ) -> Result<WatchRegistration, LspError>;
}

#[derive(Default)]
struct Watches {
    next_id: u64,
    entries: BTreeMap<u64, (GlobPattern, WatchSink)>,
}

/// In-process watcher: the host reports events with [`EventWatcher::emit`]
/// and they are dispatched to every registration whose glob matches.
#[derive(Clone)]
pub struct EventWatcher {
    root: PathBuf,
    watches: Arc<Mutex<Watches>>,
}

impl EventWatcher {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into().clean(),
            watches: Arc::new(Mutex::new(Watches::default())),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Watches> {
        self.watches.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn watch_count(&self) -> usize {
        self.lock().entries.len()
    }

    /// Dispatch one event. `path` may be absolute or workspace-relative.
    /// Returns the number of registrations it was delivered to.
    pub fn emit(&self, path: &Path, kind: FileChangeKind) -> usize {
        let absolute = if path.is_absolute() {
            path.clean()
        } else {
            self.root.join(path).clean()
        };

        let Some(relative) = workspace_relative(&self.root, &absolute) else {
            debug!("Ignoring event outside workspace: {}", absolute.display());
            return 0;
        };

        // Deliver outside the lock
        let sinks: Vec<WatchSink> = self
            .lock()
            .entries
            .values()
            .filter(|(pattern, _)| pattern.is_match(&relative))
            .map(|(_, sink)| sink.clone())
            .collect();

        sinks
            .iter()
            .filter(|sink| {
                sink.notify(FileChange {
                    path: absolute.clone(),
                    kind,
                })
            })
            .count()
    }
}

#[async_trait]
impl FileWatcher for EventWatcher {
    async fn watch(
        &self,
        pattern: &GlobPattern,
        sink: WatchSink,
    ) -> Result<WatchRegistration, LspError> {
        let id = {
            let mut watches = self.lock();
            let id = watches.next_id;
            watches.next_id += 1;
            watches.entries.insert(id, (pattern.clone(), sink));
            id
        };
        debug!("Registered watch {} for {}", id, pattern.as_str());

        let watches = Arc::downgrade(&self.watches);
        Ok(WatchRegistration::new(move || {
            if let Some(watches) = watches.upgrade() {
                watches
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .entries
                    .remove(&id);
            }
        }))
    }
}
