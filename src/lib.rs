//! lslaunch - language server launcher
//!
//! Starts language servers as child processes, speaks `Content-Length`
//! framed JSON-RPC over their stdio, forwards file-system and configuration
//! changes to them and manages their lifecycle, one session per server.

pub mod config;
pub mod host;
pub mod lsp;
pub mod sync;
pub mod types;

pub use config::{ConfigHandle, ConfigLoader, ServerDefinition};
pub use host::{activate, deactivate, Activation, ActivationContext};
pub use lsp::{ClientSession, LaunchSpec, SessionRegistry, SessionState};
pub use sync::SyncPolicy;
pub use types::LspError;
