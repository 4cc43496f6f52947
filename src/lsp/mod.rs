//! Server launch, transport and session lifecycle

pub mod codec;
pub mod launch;
pub mod manager;
pub(crate) mod protocol;
pub mod session;
pub mod transport;

pub use launch::{LaunchContext, LaunchSpec, ModuleMode, ResolvedCommand};
pub use manager::SessionRegistry;
pub use session::{ClientSession, SessionEnv, SessionOptions, SessionState, SessionStatus};
pub use transport::{
    DiagnosticSink, ProcessTransport, TracingSink, TransportExit, TransportIo, TransportState,
};
