//! Client session
//!
//! A [`ClientSession`] is a cheap handle to an actor task that owns one
//! server's transport, its file watches and its configuration subscription.
//! The actor is the only writer of session state; handles send commands
//! and observe [`SessionStatus`] through a watch channel.

use crate::config::{ConfigHandle, ConfigStore, LauncherSettings};
use crate::lsp::launch::{LaunchContext, LaunchSpec};
use crate::lsp::protocol;
use crate::lsp::transport::{DiagnosticSink, ProcessTransport, TransportExit, TransportIo};
use crate::sync::{FileChange, FileWatcher, GlobPattern, SyncPolicy, WatchRegistration, WatchSink};
use crate::types::LspError;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use std::collections::VecDeque;
use std::fmt;
use std::future::pending;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::Sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Starting,
    Running,
    Stopping,
    Stopped,
    Failed,
}

impl SessionState {
    /// `Stopped` and `Failed` never lead back to `Running`.
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Stopped | SessionState::Failed)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Idle => "idle",
            SessionState::Starting => "starting",
            SessionState::Running => "running",
            SessionState::Stopping => "stopping",
            SessionState::Stopped => "stopped",
            SessionState::Failed => "failed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone)]
pub struct SessionStatus {
    pub state: SessionState,
    /// Why the session failed. Kept when a failed session is stopped.
    pub failure: Option<Arc<LspError>>,
    pub since: DateTime<Utc>,
    pub pid: Option<u32>,
}

impl SessionStatus {
    fn idle() -> Self {
        Self {
            state: SessionState::Idle,
            failure: None,
            since: Utc::now(),
            pid: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionOptions {
    /// How long `stop()` waits for the server to exit before killing it
    pub grace_period: Duration,
    /// Window that coalesces configuration changes
    pub debounce: Duration,
}

impl From<&LauncherSettings> for SessionOptions {
    fn from(settings: &LauncherSettings) -> Self {
        Self {
            grace_period: Duration::from_millis(settings.grace_period_ms),
            debounce: Duration::from_millis(settings.debounce_ms),
        }
    }
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self::from(&LauncherSettings::default())
    }
}

/// Everything a session borrows from its host.
#[derive(Clone)]
pub struct SessionEnv {
    pub config: ConfigHandle,
    pub install_dir: PathBuf,
    pub workspace_root: PathBuf,
    pub watcher: Arc<dyn FileWatcher>,
    pub diagnostics: Arc<dyn DiagnosticSink>,
    pub options: SessionOptions,
}

enum Command {
    Start,
    Stop,
    Send(String),
}

struct SessionShared {
    id: String,
    spec: LaunchSpec,
    policy: SyncPolicy,
    options: SessionOptions,
    commands: mpsc::UnboundedSender<Command>,
    status: watch::Receiver<SessionStatus>,
    transitions: broadcast::Sender<SessionStatus>,
    incoming: Mutex<Option<mpsc::UnboundedReceiver<String>>>,
}

/// Handle to one server session. Clones share the same session; the
/// session shuts down when the last handle is dropped.
#[derive(Clone)]
pub struct ClientSession {
    inner: Arc<SessionShared>,
}

impl ClientSession {
    /// Create an `Idle` session. Must be called inside a tokio runtime.
    pub fn new(id: impl Into<String>, spec: LaunchSpec, policy: SyncPolicy, env: SessionEnv) -> Self {
        let id = id.into();
        let options = env.options;
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(SessionStatus::idle());
        let (transitions_tx, _) = broadcast::channel(32);
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
        let (file_tx, file_rx) = mpsc::unbounded_channel();

        let config_rx = env.config.subscribe();
        let last_section = policy
            .syncs_configuration()
            .then(|| config_rx.borrow().section(policy.config_section()));

        let actor = SessionActor {
            id: id.clone(),
            spec: spec.clone(),
            policy: policy.clone(),
            options,
            state: SessionState::Idle,
            failure: None,
            status: status_tx,
            transitions: transitions_tx.clone(),
            commands: commands_rx,
            file_tx,
            file_rx,
            incoming_tx,
            config_live: policy.syncs_configuration(),
            config_rx,
            last_section,
            debounce: None,
            env,
            transport: None,
            spawn: None,
            exit_rx: None,
            registrations: Vec::new(),
            pending: VecDeque::new(),
        };
        tokio::spawn(actor.run());

        Self {
            inner: Arc::new(SessionShared {
                id,
                spec,
                policy,
                options,
                commands: commands_tx,
                status: status_rx,
                transitions: transitions_tx,
                incoming: Mutex::new(Some(incoming_rx)),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn spec(&self) -> &LaunchSpec {
        &self.inner.spec
    }

    pub fn policy(&self) -> &SyncPolicy {
        &self.inner.policy
    }

    pub fn options(&self) -> SessionOptions {
        self.inner.options
    }

    /// Whether both handles refer to the same session, not just the same id.
    pub fn same_session(&self, other: &ClientSession) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn state(&self) -> SessionState {
        self.inner.status.borrow().state
    }

    pub fn status(&self) -> SessionStatus {
        self.inner.status.borrow().clone()
    }

    /// Request a start. Returns immediately; a session that is not `Idle`
    /// ignores it.
    pub fn start(&self) {
        self.command(Command::Start);
    }

    /// Request a stop. Returns immediately; safe from every state.
    pub fn stop(&self) {
        self.command(Command::Stop);
    }

    /// Send a raw JSON-RPC body. Queued until the transport is open.
    pub fn send_message(&self, body: impl Into<String>) -> Result<(), LspError> {
        self.inner
            .commands
            .send(Command::Send(body.into()))
            .map_err(|_| LspError::TransportClosed)
    }

    /// Messages the server writes. There is exactly one consumer.
    pub fn take_incoming(&self) -> Option<mpsc::UnboundedReceiver<String>> {
        self.inner
            .incoming
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionStatus> {
        self.inner.status.clone()
    }

    /// Every state change from now on
    pub fn transitions(&self) -> broadcast::Receiver<SessionStatus> {
        self.inner.transitions.subscribe()
    }

    /// Wait until the status satisfies `predicate`. If the session task is
    /// gone the last published status is returned as is.
    pub async fn wait_for(&self, mut predicate: impl FnMut(&SessionStatus) -> bool) -> SessionStatus {
        let mut rx = self.inner.status.clone();
        let reached = rx.wait_for(|status| predicate(status)).await.map(|s| s.clone());
        reached.unwrap_or_else(|_| rx.borrow().clone())
    }

    /// Wait until the session is `Running` or terminal.
    pub async fn wait_settled(&self) -> SessionStatus {
        self.wait_for(|status| status.state == SessionState::Running || status.state.is_terminal())
            .await
    }

    fn command(&self, command: Command) {
        if self.inner.commands.send(command).is_err() {
            warn!("Session {} is no longer running", self.inner.id);
        }
    }
}

impl fmt::Debug for ClientSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientSession")
            .field("id", &self.inner.id)
            .field("state", &self.state())
            .finish()
    }
}

struct PendingSpawn {
    cancel: CancellationToken,
    result: oneshot::Receiver<Result<ProcessTransport, LspError>>,
}

struct SessionActor {
    id: String,
    spec: LaunchSpec,
    policy: SyncPolicy,
    options: SessionOptions,
    env: SessionEnv,

    state: SessionState,
    failure: Option<Arc<LspError>>,
    status: watch::Sender<SessionStatus>,
    transitions: broadcast::Sender<SessionStatus>,

    commands: mpsc::UnboundedReceiver<Command>,
    file_tx: mpsc::UnboundedSender<FileChange>,
    file_rx: mpsc::UnboundedReceiver<FileChange>,
    incoming_tx: mpsc::UnboundedSender<String>,

    config_rx: watch::Receiver<ConfigStore>,
    config_live: bool,
    last_section: Option<JsonValue>,
    debounce: Option<Pin<Box<Sleep>>>,

    transport: Option<ProcessTransport>,
    spawn: Option<PendingSpawn>,
    exit_rx: Option<oneshot::Receiver<TransportExit>>,
    registrations: Vec<WatchRegistration>,
    /// Outgoing bodies held until the transport opens
    pending: VecDeque<String>,
}

impl SessionActor {
    async fn run(mut self) {
        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Start) => self.start().await,
                    Some(Command::Stop) => self.stop().await,
                    Some(Command::Send(body)) => self.dispatch(body),
                    None => break,
                },
                Some(change) = self.file_rx.recv() => self.on_file_change(change),
                result = spawn_result(&mut self.spawn) => {
                    self.spawn = None;
                    self.on_spawned(result).await;
                }
                exit = exit_signal(&mut self.exit_rx) => {
                    self.exit_rx = None;
                    if let Some(exit) = exit {
                        self.on_exit(exit).await;
                    }
                }
                changed = self.config_rx.changed(), if self.config_live => {
                    if changed.is_ok() {
                        self.on_config_changed();
                    } else {
                        self.config_live = false;
                    }
                }
                _ = debounce_elapsed(&mut self.debounce) => {
                    self.debounce = None;
                    self.flush_configuration();
                }
            }
        }

        debug!("All handles to session {} dropped", self.id);
        if let Some(spawn) = self.spawn.take() {
            spawn.cancel.cancel();
        }
        self.shutdown_transport().await;
        if !self.state.is_terminal() {
            self.transition(SessionState::Stopped);
        }
    }

    fn transition(&mut self, state: SessionState) {
        info!("Session {}: {} -> {}", self.id, self.state, state);
        self.state = state;
        let status = SessionStatus {
            state,
            failure: self.failure.clone(),
            since: Utc::now(),
            pid: self.transport.as_ref().and_then(ProcessTransport::pid),
        };
        self.status.send_replace(status.clone());
        let _ = self.transitions.send(status);
    }

    fn fail(&mut self, error: LspError) {
        error!("Session {} failed: {}", self.id, error);
        self.failure = Some(Arc::new(error));
        self.transition(SessionState::Failed);
    }

    async fn start(&mut self) {
        if self.state != SessionState::Idle {
            debug!("Ignoring start for session {}: {}", self.id, self.state);
            return;
        }
        self.transition(SessionState::Starting);

        let config = self.env.config.snapshot();
        let ctx = LaunchContext {
            config: &config,
            install_dir: &self.env.install_dir,
            workspace_root: &self.env.workspace_root,
        };
        let command = match self.spec.resolve(&ctx) {
            Ok(command) => command,
            Err(e) => {
                self.fail(e);
                return;
            }
        };

        self.register_watches().await;

        let mut transport = ProcessTransport::new(self.id.clone(), self.options.grace_period);
        let io = TransportIo {
            diagnostics: self.env.diagnostics.clone(),
            incoming: self.incoming_tx.clone(),
        };
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let (result_tx, result_rx) = oneshot::channel();

        tokio::spawn(async move {
            let result = tokio::select! {
                biased;
                _ = token.cancelled() => Err(LspError::TransportClosed),
                result = async { transport.open(&command, io).map(|()| transport) } => result,
            };
            // A dropped receiver drops the transport, which reaps the process
            let _ = result_tx.send(result);
        });

        self.spawn = Some(PendingSpawn {
            cancel,
            result: result_rx,
        });
    }

    async fn register_watches(&mut self) {
        for glob in self.policy.watch_globs().to_vec() {
            let pattern = match GlobPattern::new(&glob) {
                Ok(pattern) => pattern,
                Err(e) => {
                    warn!("Session {}: {}", self.id, e);
                    continue;
                }
            };
            let sink = WatchSink::new(glob.as_str(), self.file_tx.clone());
            match self.env.watcher.watch(&pattern, sink).await {
                Ok(registration) => self.registrations.push(registration),
                Err(e) => warn!("Session {}: {}", self.id, e),
            }
        }

        // Changes reported during registration queue ahead of later messages
        while let Ok(change) = self.file_rx.try_recv() {
            self.on_file_change(change);
        }
    }

    async fn on_spawned(&mut self, result: Result<ProcessTransport, LspError>) {
        match (self.state, result) {
            (SessionState::Starting, Ok(mut transport)) => {
                self.exit_rx = transport.take_exit_signal();
                self.transport = Some(transport);
                let queued = self.pending.len();
                while let Some(body) = self.pending.pop_front() {
                    self.write(body);
                }
                if queued > 0 {
                    debug!("Session {}: flushed {} queued messages", self.id, queued);
                }
                self.transition(SessionState::Running);
            }
            (SessionState::Starting, Err(e)) => {
                self.registrations.clear();
                self.pending.clear();
                self.fail(e);
            }
            (SessionState::Stopping, Ok(transport)) => {
                self.transport = Some(transport);
                self.shutdown_transport().await;
                self.transition(SessionState::Stopped);
            }
            (SessionState::Stopping, Err(_)) => {
                self.transition(SessionState::Stopped);
            }
            (state, _) => {
                debug!("Session {}: spawn result ignored while {}", self.id, state);
            }
        }
    }

    async fn on_exit(&mut self, exit: TransportExit) {
        if self.state != SessionState::Running {
            return;
        }
        self.registrations.clear();
        self.shutdown_transport().await;
        self.fail(LspError::TransportClosedUnexpectedly(exit.to_string()));
    }

    async fn stop(&mut self) {
        match self.state {
            SessionState::Idle | SessionState::Failed => {
                self.pending.clear();
                self.transition(SessionState::Stopped);
            }
            SessionState::Starting => {
                self.transition(SessionState::Stopping);
                self.registrations.clear();
                self.pending.clear();
                match &self.spawn {
                    // The spawn result finishes the stop
                    Some(spawn) => spawn.cancel.cancel(),
                    None => {
                        self.shutdown_transport().await;
                        self.transition(SessionState::Stopped);
                    }
                }
            }
            SessionState::Running => {
                self.transition(SessionState::Stopping);
                self.shutdown_transport().await;
                self.transition(SessionState::Stopped);
            }
            SessionState::Stopping | SessionState::Stopped => {}
        }
    }

    /// Deregister watches, then close the transport.
    async fn shutdown_transport(&mut self) {
        self.registrations.clear();
        self.exit_rx = None;
        self.debounce = None;
        self.pending.clear();
        if let Some(mut transport) = self.transport.take() {
            transport.close().await;
        }
    }

    /// Send now when running, queue while starting, drop otherwise.
    fn dispatch(&mut self, body: String) {
        match self.state {
            SessionState::Idle | SessionState::Starting => self.pending.push_back(body),
            SessionState::Running => self.write(body),
            state => debug!("Session {}: dropping message while {}", self.id, state),
        }
    }

    fn write(&self, body: String) {
        if let Some(transport) = &self.transport {
            if let Err(e) = transport.send(body) {
                warn!("Session {}: {}", self.id, e);
            }
        }
    }

    fn on_file_change(&mut self, change: FileChange) {
        debug!(
            "Session {}: {:?} {}",
            self.id,
            change.kind,
            change.path.display()
        );
        match protocol::watched_files_changed(&change) {
            Ok(body) => self.dispatch(body),
            Err(e) => warn!("Session {}: {}", self.id, e),
        }
    }

    fn on_config_changed(&mut self) {
        let section = self.config_rx.borrow().section(self.policy.config_section());
        if self.debounce.is_none() && self.last_section.as_ref() != Some(&section) {
            self.debounce = Some(Box::pin(tokio::time::sleep(self.options.debounce)));
        }
    }

    fn flush_configuration(&mut self) {
        let section = self.config_rx.borrow().section(self.policy.config_section());
        if self.last_section.as_ref() == Some(&section) {
            return;
        }
        match protocol::configuration_changed(self.policy.config_section(), section.clone()) {
            Ok(body) => {
                info!(
                    "Session {}: forwarding configuration section '{}'",
                    self.id,
                    self.policy.config_section()
                );
                self.last_section = Some(section);
                self.dispatch(body);
            }
            Err(e) => warn!("Session {}: {}", self.id, e),
        }
    }
}

async fn spawn_result(spawn: &mut Option<PendingSpawn>) -> Result<ProcessTransport, LspError> {
    match spawn {
        Some(spawn) => (&mut spawn.result)
            .await
            .unwrap_or(Err(LspError::TransportClosed)),
        None => pending().await,
    }
}

/// `None` when the transport was closed on request.
async fn exit_signal(exit_rx: &mut Option<oneshot::Receiver<TransportExit>>) -> Option<TransportExit> {
    match exit_rx {
        Some(rx) => rx.await.ok(),
        None => pending().await,
    }
}

async fn debounce_elapsed(timer: &mut Option<Pin<Box<Sleep>>>) {
    match timer {
        Some(timer) => timer.as_mut().await,
        None => pending().await,
    }
}
