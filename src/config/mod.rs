//! Configuration system for lslaunch
//!
//! Server definitions come from the embedded registry and the user config;
//! settings sections are exposed as a dotted-key [`ConfigStore`] that sessions
//! read at launch time.

mod loader;
mod registry;
mod store;
mod user_config;

pub use loader::ConfigLoader;
pub use registry::{LaunchTemplate, ServerDefinition, SyncTemplate};
pub use store::{ConfigHandle, ConfigStore};
pub use user_config::{LauncherSettings, UserConfig};
