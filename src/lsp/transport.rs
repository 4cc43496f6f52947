//! Process transport
//!
//! Owns one server process. stdin/stdout carry `Content-Length` framed
//! messages; stderr goes to a [`DiagnosticSink`] and never reaches the
//! protocol stream.

use crate::lsp::codec::{self, FrameReader};
use crate::lsp::launch::ResolvedCommand;
use crate::types::LspError;
use futures::StreamExt;
use std::fmt;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{timeout_at, Instant};
use tokio_util::codec::{BytesCodec, FramedRead};
use tracing::{debug, error, info, warn};

/// Receives server stderr, chunk by chunk, exactly as read.
pub trait DiagnosticSink: Send + Sync {
    fn on_stderr(&self, server: &str, chunk: &[u8]);
}

/// Logs server stderr under the `lslaunch::server` target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl DiagnosticSink for TracingSink {
    fn on_stderr(&self, server: &str, chunk: &[u8]) {
        let text = String::from_utf8_lossy(chunk);
        for line in text.lines().filter(|line| !line.trim().is_empty()) {
            info!(target: "lslaunch::server", server = %server, "{}", line);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Unstarted,
    Starting,
    Open,
    Closed,
}

/// How a server process ended on its own.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportExit {
    pub code: Option<i32>,
    pub detail: String,
}

impl TransportExit {
    fn from_wait(result: std::io::Result<ExitStatus>) -> Self {
        match result {
            Ok(status) => Self {
                code: status.code(),
                detail: status.to_string(),
            },
            Err(e) => Self {
                code: None,
                detail: format!("wait failed: {}", e),
            },
        }
    }
}

impl fmt::Display for TransportExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.detail)
    }
}

/// Where the transport delivers what the server writes.
pub struct TransportIo {
    pub diagnostics: Arc<dyn DiagnosticSink>,
    /// Message bodies read from the server's stdout
    pub incoming: mpsc::UnboundedSender<String>,
}

struct TransportTasks {
    writer: JoinHandle<()>,
    reader: JoinHandle<()>,
    stderr: JoinHandle<()>,
    supervisor: JoinHandle<()>,
}

pub struct ProcessTransport {
    server: String,
    state: TransportState,
    grace_period: Duration,
    pid: Option<u32>,
    outgoing: Option<mpsc::UnboundedSender<String>>,
    exit_rx: Option<oneshot::Receiver<TransportExit>>,
    close_tx: Option<oneshot::Sender<Instant>>,
    tasks: Option<TransportTasks>,
}

impl ProcessTransport {
    pub fn new(server: impl Into<String>, grace_period: Duration) -> Self {
        Self {
            server: server.into(),
            state: TransportState::Unstarted,
            grace_period,
            pid: None,
            outgoing: None,
            exit_rx: None,
            close_tx: None,
            tasks: None,
        }
    }

    pub fn state(&self) -> TransportState {
        self.state
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Spawn the server. A transport opens at most once.
    pub fn open(&mut self, command: &ResolvedCommand, io: TransportIo) -> Result<(), LspError> {
        if self.state != TransportState::Unstarted {
            return Err(LspError::TransportClosed);
        }
        self.state = TransportState::Starting;

        info!(
            "Spawning LSP server {}: {} {:?}",
            self.server,
            command.program.display(),
            command.args
        );

        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if command.cwd.is_dir() {
            cmd.current_dir(&command.cwd);
        }

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(source) => {
                self.state = TransportState::Closed;
                return Err(LspError::Spawn {
                    program: command.program.clone(),
                    source,
                });
            }
        };

        let (stdin, stdout, stderr) = match (child.stdin.take(), child.stdout.take(), child.stderr.take()) {
            (Some(stdin), Some(stdout), Some(stderr)) => (stdin, stdout, stderr),
            _ => {
                self.state = TransportState::Closed;
                return Err(LspError::ProtocolError(
                    "Failed to capture server stdio".to_string(),
                ));
            }
        };

        self.pid = child.id();

        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
        let (close_tx, close_rx) = oneshot::channel();
        let (exit_tx, exit_rx) = oneshot::channel();

        let tasks = TransportTasks {
            writer: tokio::spawn(write_loop(stdin, outgoing_rx, self.server.clone())),
            reader: tokio::spawn(read_loop(stdout, io.incoming, self.server.clone())),
            stderr: tokio::spawn(stderr_loop(stderr, io.diagnostics, self.server.clone())),
            supervisor: tokio::spawn(supervise(
                child,
                close_rx,
                exit_tx,
                self.grace_period,
                self.server.clone(),
            )),
        };

        self.outgoing = Some(outgoing_tx);
        self.close_tx = Some(close_tx);
        self.exit_rx = Some(exit_rx);
        self.tasks = Some(tasks);
        self.state = TransportState::Open;

        info!("LSP server {} started (pid {:?})", self.server, self.pid);
        Ok(())
    }

    /// Queue one message body for the server.
    pub fn send(&self, body: String) -> Result<(), LspError> {
        match (&self.state, &self.outgoing) {
            (TransportState::Open, Some(tx)) => tx.send(body).map_err(|_| LspError::TransportClosed),
            _ => Err(LspError::TransportClosed),
        }
    }

    /// Resolves with the exit details if the process ends before `close()`.
    /// The sender is dropped without a value when the exit was requested.
    pub fn take_exit_signal(&mut self) -> Option<oneshot::Receiver<TransportExit>> {
        self.exit_rx.take()
    }

    /// Close stdin, wait for exit until the grace period runs out, then kill.
    pub async fn close(&mut self) {
        let was_open = self.state == TransportState::Open;
        self.state = TransportState::Closed;
        if !was_open {
            return;
        }

        let deadline = Instant::now() + self.grace_period;

        // The writer drains what is queued, then drops stdin
        self.outgoing.take();
        let Some(tasks) = self.tasks.take() else {
            return;
        };
        let TransportTasks {
            mut writer,
            mut reader,
            mut stderr,
            supervisor,
        } = tasks;

        if timeout_at(deadline, &mut writer).await.is_err() {
            debug!("Writer for {} still busy at deadline", self.server);
            writer.abort();
        }

        if let Some(close_tx) = self.close_tx.take() {
            let _ = close_tx.send(deadline);
        }
        if let Err(e) = supervisor.await {
            error!("Supervisor for {} failed: {}", self.server, e);
        }

        // The process is gone; both pipes are at EOF or about to be
        let drain_deadline = Instant::now() + self.grace_period;
        for task in [&mut reader, &mut stderr] {
            if timeout_at(drain_deadline, &mut *task).await.is_err() {
                task.abort();
            }
        }

        info!("LSP server {} stopped", self.server);
    }
}

async fn write_loop(
    mut stdin: ChildStdin,
    mut outgoing: mpsc::UnboundedReceiver<String>,
    server: String,
) {
    while let Some(body) = outgoing.recv().await {
        if let Err(e) = codec::write_frame(&mut stdin, &body).await {
            error!("Failed to write to {}: {}", server, e);
            break;
        }
    }
    debug!("Writer for {} finished, closing stdin", server);
}

async fn read_loop(stdout: ChildStdout, incoming: mpsc::UnboundedSender<String>, server: String) {
    let mut reader = FrameReader::new(stdout);
    loop {
        match reader.read_frame().await {
            Ok(Some(body)) => {
                debug!("Received {} bytes from {}", body.len(), server);
                let _ = incoming.send(body);
            }
            Ok(None) => {
                debug!("LSP server {} closed stdout", server);
                break;
            }
            Err(LspError::ProtocolError(e)) => {
                warn!("Malformed frame from {}: {}", server, e);
            }
            Err(e) => {
                warn!("Failed to read from {}: {}", server, e);
                break;
            }
        }
    }
}

async fn stderr_loop(stderr: ChildStderr, sink: Arc<dyn DiagnosticSink>, server: String) {
    let mut chunks = FramedRead::new(stderr, BytesCodec::new());
    while let Some(chunk) = chunks.next().await {
        match chunk {
            Ok(chunk) => sink.on_stderr(&server, &chunk),
            Err(e) => {
                debug!("stderr of {} unreadable: {}", server, e);
                break;
            }
        }
    }
}

async fn supervise(
    mut child: Child,
    mut close_rx: oneshot::Receiver<Instant>,
    exit_tx: oneshot::Sender<TransportExit>,
    grace_period: Duration,
    server: String,
) {
    tokio::select! {
        status = child.wait() => {
            let exit = TransportExit::from_wait(status);
            warn!("LSP server {} exited on its own: {}", server, exit);
            let _ = exit_tx.send(exit);
        }
        request = &mut close_rx => {
            // A dropped transport counts as a close request
            let deadline = request.unwrap_or_else(|_| Instant::now() + grace_period);
            match timeout_at(deadline, child.wait()).await {
                Ok(status) => {
                    debug!("LSP server {} exited: {}", server, TransportExit::from_wait(status));
                }
                Err(_) => {
                    warn!("LSP server {} did not exit in time, killing", server);
                    if let Err(e) = child.kill().await {
                        error!("Failed to kill {}: {}", server, e);
                    }
                }
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::sync::Mutex;

    #[derive(Default)]
    struct CollectSink(Mutex<Vec<u8>>);

    impl DiagnosticSink for CollectSink {
        fn on_stderr(&self, _server: &str, chunk: &[u8]) {
            self.0.lock().unwrap().extend_from_slice(chunk);
        }
    }

    fn command(program: &str, args: &[&str]) -> ResolvedCommand {
        ResolvedCommand {
            program: PathBuf::from(program),
            args: args.iter().map(|a| a.to_string()).collect(),
            cwd: std::env::temp_dir(),
        }
    }

    fn io(sink: Arc<dyn DiagnosticSink>) -> (TransportIo, mpsc::UnboundedReceiver<String>) {
        let (incoming, rx) = mpsc::unbounded_channel();
        (
            TransportIo {
                diagnostics: sink,
                incoming,
            },
            rx,
        )
    }

    #[tokio::test]
    async fn test_roundtrip_through_cat() {
        let mut transport = ProcessTransport::new("cat", Duration::from_secs(2));
        let (io, mut incoming) = io(Arc::new(TracingSink));

        transport.open(&command("cat", &[]), io).unwrap();
        assert_eq!(transport.state(), TransportState::Open);
        assert!(transport.pid().is_some());

        transport.send(r#"{"jsonrpc":"2.0","method":"ping"}"#.to_string()).unwrap();
        let echoed = tokio::time::timeout(Duration::from_secs(5), incoming.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(echoed, r#"{"jsonrpc":"2.0","method":"ping"}"#);

        let mut exit = transport.take_exit_signal().unwrap();
        transport.close().await;
        assert_eq!(transport.state(), TransportState::Closed);
        // Requested close is not reported as an exit
        assert!(exit.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_missing_binary_is_spawn_error() {
        let mut transport = ProcessTransport::new("missing", Duration::from_secs(1));
        let (io, _incoming) = io(Arc::new(TracingSink));

        let err = transport
            .open(&command("/definitely/not/a/server", &[]), io)
            .unwrap_err();
        assert!(matches!(err, LspError::Spawn { .. }));
        assert_eq!(transport.state(), TransportState::Closed);
        assert!(transport.pid().is_none());
    }

    #[tokio::test]
    async fn test_stderr_goes_to_sink_only() {
        let sink = Arc::new(CollectSink::default());
        let mut transport = ProcessTransport::new("sh", Duration::from_secs(2));
        let (io, mut incoming) = io(sink.clone());

        transport
            .open(&command("sh", &["-c", "echo oops 1>&2; exec cat"]), io)
            .unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while sink.0.lock().unwrap().is_empty() && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        transport.close().await;

        assert_eq!(sink.0.lock().unwrap().as_slice(), b"oops\n");
        assert!(incoming.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_natural_exit_is_signalled() {
        let mut transport = ProcessTransport::new("echo", Duration::from_secs(1));
        let (io, _incoming) = io(Arc::new(TracingSink));

        transport.open(&command("/bin/echo", &[]), io).unwrap();
        let exit = tokio::time::timeout(Duration::from_secs(5), transport.take_exit_signal().unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(exit.code, Some(0));

        transport.close().await;
        assert_eq!(transport.state(), TransportState::Closed);
    }

    #[tokio::test]
    async fn test_close_kills_after_grace_period() {
        let mut transport = ProcessTransport::new("sleep", Duration::from_millis(100));
        let (io, _incoming) = io(Arc::new(TracingSink));

        transport.open(&command("sleep", &["30"]), io).unwrap();
        let started = Instant::now();
        transport.close().await;
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_final() {
        let mut unstarted = ProcessTransport::new("never", Duration::from_secs(1));
        unstarted.close().await;
        assert_eq!(unstarted.state(), TransportState::Closed);

        let mut transport = ProcessTransport::new("cat", Duration::from_secs(1));
        let (io_first, _incoming) = io(Arc::new(TracingSink));
        transport.open(&command("cat", &[]), io_first).unwrap();
        transport.close().await;
        transport.close().await;

        assert!(matches!(
            transport.send("{}".to_string()),
            Err(LspError::TransportClosed)
        ));
        let (io_again, _incoming) = io(Arc::new(TracingSink));
        assert!(matches!(
            transport.open(&command("cat", &[]), io_again),
            Err(LspError::TransportClosed)
        ));
    }
}
