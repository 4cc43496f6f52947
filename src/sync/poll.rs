//! Polling file watcher
//!
//! Periodically snapshots modification times under the workspace root and
//! turns the differences into created/changed/deleted events.

use crate::sync::watch::{EventWatcher, FileChange, FileChangeKind, FileWatcher, GlobPattern};
use crate::sync::{WatchRegistration, WatchSink};
use crate::types::LspError;
use async_trait::async_trait;
use ignore::WalkBuilder;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, trace};

type Snapshot = HashMap<PathBuf, SystemTime>;

const MIN_INTERVAL: Duration = Duration::from_millis(1);

pub struct PollingWatcher {
    events: EventWatcher,
    task: JoinHandle<()>,
}

impl PollingWatcher {
    /// Start polling `root`. Files that exist now produce no events.
    /// A zero interval polls as fast as `MIN_INTERVAL` allows.
    pub fn spawn(root: impl Into<PathBuf>, interval: Duration) -> Self {
        let interval = interval.max(MIN_INTERVAL);
        let events = EventWatcher::new(root);
        let task = tokio::spawn(Self::poll_loop(events.clone(), interval));
        Self { events, task }
    }

    pub fn events(&self) -> &EventWatcher {
        &self.events
    }

    async fn poll_loop(events: EventWatcher, interval: Duration) {
        let root = events.root().to_path_buf();
        let mut previous = scan_blocking(root.clone()).await;
        debug!(
            "Polling {} files under {} every {:?}",
            previous.len(),
            root.display(),
            interval
        );

        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let current = scan_blocking(root.clone()).await;
            for change in diff(&previous, &current) {
                trace!("{:?} {}", change.kind, change.path.display());
                events.emit(&change.path, change.kind);
            }
            previous = current;
        }
    }
}

impl Drop for PollingWatcher {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[async_trait]
impl FileWatcher for PollingWatcher {
    async fn watch(
        &self,
        pattern: &GlobPattern,
        sink: WatchSink,
    ) -> Result<WatchRegistration, LspError> {
        self.events.watch(pattern, sink).await
    }
}

async fn scan_blocking(root: PathBuf) -> Snapshot {
    tokio::task::spawn_blocking(move || scan(&root))
        .await
        .unwrap_or_default()
}

/// Modification times of every file under `root`. Hidden and git-ignored
/// entries are skipped.
pub(crate) fn scan(root: &Path) -> Snapshot {
    let walker = WalkBuilder::new(root)
        .hidden(true)
        .git_ignore(true)
        .git_global(true)
        .git_exclude(true)
        .build();

    walker
        .flatten()
        .filter(|entry| entry.file_type().is_some_and(|ft| ft.is_file()))
        .filter_map(|entry| {
            let modified = entry.metadata().ok()?.modified().ok()?;
            Some((entry.into_path(), modified))
        })
        .collect()
}

/// Changes between two snapshots, sorted by path.
pub(crate) fn diff(previous: &Snapshot, current: &Snapshot) -> Vec<FileChange> {
    let mut changes: Vec<FileChange> = current
        .iter()
        .filter_map(|(path, modified)| {
            let kind = match previous.get(path) {
                None => FileChangeKind::Created,
                Some(before) if before != modified => FileChangeKind::Changed,
                Some(_) => return None,
            };
            Some(FileChange {
                path: path.clone(),
                kind,
            })
        })
        .chain(
            previous
                .keys()
                .filter(|path| !current.contains_key(*path))
                .map(|path| FileChange {
                    path: path.clone(),
                    kind: FileChangeKind::Deleted,
                }),
        )
        .collect();

    changes.sort_by(|a, b| a.path.cmp(&b.path));
    changes
}
