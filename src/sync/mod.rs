//! Editor-to-server synchronization: sync policies and file watching

mod poll;
mod policy;
mod watch;

pub use poll::PollingWatcher;
pub use policy::SyncPolicy;
pub use watch::{
    workspace_relative, EventWatcher, FileChange, FileChangeKind, FileWatcher, GlobPattern,
    WatchRegistration, WatchSink,
};
