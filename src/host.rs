//! Host activation
//!
//! `activate` turns a [`ServerDefinition`] into a started session and hands
//! back an [`Activation`]; disposing it (or dropping it) disposes the session.
//! `deactivate` disposes everything at host shutdown.

use crate::config::{ConfigHandle, ServerDefinition};
use crate::lsp::{
    ClientSession, DiagnosticSink, ModuleMode, SessionEnv, SessionOptions, SessionRegistry,
    TracingSink,
};
use crate::sync::FileWatcher;
use crate::types::LspError;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};

/// What the host provides to every session it activates.
#[derive(Clone)]
pub struct ActivationContext {
    registry: Arc<SessionRegistry>,
    config: ConfigHandle,
    install_dir: PathBuf,
    workspace_root: PathBuf,
    watcher: Arc<dyn FileWatcher>,
    diagnostics: Arc<dyn DiagnosticSink>,
    options: SessionOptions,
    mode: ModuleMode,
}

impl ActivationContext {
    pub fn new(
        config: ConfigHandle,
        install_dir: impl Into<PathBuf>,
        workspace_root: impl Into<PathBuf>,
        watcher: Arc<dyn FileWatcher>,
    ) -> Self {
        Self {
            registry: Arc::new(SessionRegistry::new()),
            config,
            install_dir: install_dir.into(),
            workspace_root: workspace_root.into(),
            watcher,
            diagnostics: Arc::new(TracingSink),
            options: SessionOptions::default(),
            mode: ModuleMode::Run,
        }
    }

    pub fn with_diagnostics(mut self, diagnostics: Arc<dyn DiagnosticSink>) -> Self {
        self.diagnostics = diagnostics;
        self
    }

    pub fn with_options(mut self, options: SessionOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_mode(mut self, mode: ModuleMode) -> Self {
        self.mode = mode;
        self
    }

    /// Share a registry between contexts
    pub fn with_registry(mut self, registry: Arc<SessionRegistry>) -> Self {
        self.registry = registry;
        self
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &ConfigHandle {
        &self.config
    }

    fn session_env(&self) -> SessionEnv {
        SessionEnv {
            config: self.config.clone(),
            install_dir: self.install_dir.clone(),
            workspace_root: self.workspace_root.clone(),
            watcher: self.watcher.clone(),
            diagnostics: self.diagnostics.clone(),
            options: self.options,
        }
    }
}

/// Disposes the session it was created for, at most once. A newer session
/// registered under the same id is left alone.
pub struct Disposable {
    registry: Arc<SessionRegistry>,
    session: Option<ClientSession>,
}

impl Disposable {
    fn new(registry: Arc<SessionRegistry>, session: ClientSession) -> Self {
        Self {
            registry,
            session: Some(session),
        }
    }

    pub async fn dispose(mut self) {
        if let Some(session) = self.session.take() {
            self.registry.dispose_session(&session).await;
        }
    }
}

impl Drop for Disposable {
    fn drop(&mut self) {
        let Some(session) = self.session.take() else {
            return;
        };
        // Can't await in Drop; finish on the runtime if there is one
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let registry = self.registry.clone();
                handle.spawn(async move {
                    registry.dispose_session(&session).await;
                });
            }
            Err(_) => debug!("No runtime to dispose session {}", session.id()),
        }
    }
}

/// A started session plus the handle that disposes it.
pub struct Activation {
    session: ClientSession,
    disposable: Disposable,
}

impl Activation {
    pub fn session(&self) -> &ClientSession {
        &self.session
    }

    pub async fn dispose(self) {
        self.disposable.dispose().await;
    }
}

/// Get or create the session for `server` and start it.
///
/// Launch failures are not returned here; they surface as a `Failed`
/// session status. Only an unusable definition is an error.
pub fn activate(ctx: &ActivationContext, server: &ServerDefinition) -> Result<Activation, LspError> {
    let policy = server.sync_policy()?;
    let spec = server.launch_spec(ctx.mode);

    info!("Activating {} ({}, {} launch)", server.name, server.id, spec.kind());
    let session = ctx
        .registry
        .get_or_create(&server.id, spec, policy, ctx.session_env());
    session.start();

    Ok(Activation {
        disposable: Disposable::new(ctx.registry.clone(), session.clone()),
        session,
    })
}

/// Dispose every session the context has activated.
pub async fn deactivate(ctx: &ActivationContext) {
    ctx.registry.dispose_all().await;
}
