use anyhow::{anyhow, bail, Context, Result};
use clap::Parser;
use lslaunch::config::ConfigLoader;
use lslaunch::lsp::codec::{self, FrameReader};
use lslaunch::lsp::{ClientSession, ModuleMode, SessionOptions, SessionState};
use lslaunch::sync::PollingWatcher;
use lslaunch::{activate, deactivate, ActivationContext, ConfigHandle};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, EnvFilter};

/// Language server launcher
///
/// Starts a language server and bridges it to this process's stdio: frames
/// written to stdin go to the server, frames the server writes come out on
/// stdout.
#[derive(Parser, Debug)]
#[command(name = "lslaunch")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Workspace root directory
    ///
    /// If not specified, attempts to auto-detect from:
    /// 1. Current directory's git root
    /// 2. Current working directory
    #[arg(short, long)]
    workspace: Option<PathBuf>,

    /// Server id to launch
    #[arg(short, long, default_value = "dwsls")]
    server: String,

    /// Installation directory that relative server paths are resolved against
    /// (defaults to the directory of this executable)
    #[arg(long)]
    install_dir: Option<PathBuf>,

    /// Config file (skips discovery)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Launch module servers in debug mode
    #[arg(long)]
    debug: bool,

    /// List known servers and exit
    #[arg(long)]
    list: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Log to file instead of stderr
    #[arg(long)]
    log_file: Option<PathBuf>,
}

fn setup_logging(log_level: &str, log_file: Option<PathBuf>) -> Result<()> {
    let level = match log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env().add_directive(level.into());

    let subscriber = fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true);

    // stdout carries protocol frames
    if let Some(log_path) = log_file {
        let file = std::fs::File::create(log_path)?;
        subscriber.with_ansi(false).with_writer(file).init();
    } else {
        subscriber.with_writer(std::io::stderr).init();
    }

    Ok(())
}

fn detect_workspace_root(provided: Option<PathBuf>) -> Result<PathBuf> {
    if let Some(path) = provided {
        return path
            .canonicalize()
            .with_context(|| format!("Workspace {} not found", path.display()));
    }

    // Try to find git root
    let current_dir = std::env::current_dir()?;
    let mut dir = current_dir.as_path();

    loop {
        if dir.join(".git").exists() {
            info!("Detected git root: {}", dir.display());
            return Ok(dir.to_path_buf());
        }

        match dir.parent() {
            Some(parent) => dir = parent,
            None => break,
        }
    }

    info!("Using current directory as workspace root");
    Ok(current_dir)
}

fn default_install_dir() -> Result<PathBuf> {
    let exe = std::env::current_exe()?;
    exe.parent()
        .map(|dir| dir.to_path_buf())
        .ok_or_else(|| anyhow!("Cannot determine install directory from {}", exe.display()))
}

fn print_servers(loader: &ConfigLoader) {
    for server in loader.list_servers() {
        println!(
            "{:<10} {:<12} {:<20} {}",
            server.id,
            server.launch.kind(),
            server.languages.join(","),
            server.name
        );
    }
}

/// Read frames from stdin on a task of its own; reads are not cancel-safe.
fn spawn_stdin_reader() -> mpsc::UnboundedReceiver<Result<String, lslaunch::LspError>> {
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        let mut reader = FrameReader::new(tokio::io::stdin());
        loop {
            match reader.read_frame().await {
                Ok(Some(body)) => {
                    if tx.send(Ok(body)).is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    let _ = tx.send(Err(e));
                    break;
                }
            }
        }
    });
    rx
}

/// Copy server output to stdout until cancelled, then drain what is left.
async fn forward_output(mut incoming: mpsc::UnboundedReceiver<String>, shutdown: CancellationToken) {
    let mut stdout = tokio::io::stdout();
    loop {
        tokio::select! {
            biased;
            body = incoming.recv() => {
                let Some(body) = body else { break };
                if let Err(e) = codec::write_frame(&mut stdout, &body).await {
                    error!("Failed to write to stdout: {}", e);
                    return;
                }
            }
            _ = shutdown.cancelled() => {
                while let Ok(body) = incoming.try_recv() {
                    if let Err(e) = codec::write_frame(&mut stdout, &body).await {
                        error!("Failed to write to stdout: {}", e);
                        return;
                    }
                }
                break;
            }
        }
    }
}

fn failure(session: &ClientSession) -> Result<()> {
    let status = session.status();
    if status.state != SessionState::Failed {
        return Ok(());
    }
    let cause = status
        .failure
        .map(|e| e.to_string())
        .unwrap_or_else(|| "unknown error".to_string());
    Err(anyhow!("Server {} failed: {}", session.id(), cause))
}

/// Bridge stdin to the session until stdin closes, ctrl-c, or the session fails.
async fn run_proxy(session: &ClientSession) -> Result<()> {
    let mut frames = spawn_stdin_reader();
    let mut status = session.subscribe();
    status.mark_changed();

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            frame = frames.recv() => match frame {
                Some(Ok(body)) => session.send_message(body)?,
                Some(Err(e)) => bail!("Invalid frame on stdin: {}", e),
                None => {
                    info!("stdin closed");
                    // A start that is still in flight decides the exit code
                    session.wait_settled().await;
                    return failure(session);
                }
            },
            _ = &mut ctrl_c => {
                info!("Interrupted");
                return Ok(());
            }
            changed = status.changed() => {
                if changed.is_err() {
                    return failure(session);
                }
                let state = status.borrow_and_update().state;
                if state == SessionState::Failed {
                    return failure(session);
                }
            }
        }
    }
}

async fn run(args: Args) -> Result<()> {
    info!("Starting lslaunch v{}", env!("CARGO_PKG_VERSION"));

    let loader = match &args.config {
        Some(path) => ConfigLoader::from_path(path)?,
        None => ConfigLoader::new()?,
    };

    if args.list {
        print_servers(&loader);
        return Ok(());
    }

    let server = loader.server(&args.server)?;

    let workspace_root = detect_workspace_root(args.workspace)?;
    info!("Workspace root: {}", workspace_root.display());

    let install_dir = match args.install_dir {
        Some(dir) => dir,
        None => default_install_dir()?,
    };

    let settings = loader.settings().clone();
    let watcher = Arc::new(PollingWatcher::spawn(
        &workspace_root,
        Duration::from_millis(settings.poll_interval_ms),
    ));
    let mode = if args.debug {
        ModuleMode::Debug
    } else {
        ModuleMode::Run
    };

    let ctx = ActivationContext::new(
        ConfigHandle::new(loader.config_store()),
        install_dir,
        &workspace_root,
        watcher,
    )
    .with_options(SessionOptions::from(&settings))
    .with_mode(mode);

    let activation = activate(&ctx, &server)?;
    let session = activation.session().clone();

    let shutdown = CancellationToken::new();
    let incoming = session
        .take_incoming()
        .ok_or_else(|| anyhow!("Server output already taken"))?;
    let forwarder = tokio::spawn(forward_output(incoming, shutdown.clone()));

    let outcome = run_proxy(&session).await;
    if let Err(e) = &outcome {
        warn!("Shutting down: {}", e);
    }

    // The stop waits for the server to exit, so its last output is queued
    activation.dispose().await;
    shutdown.cancel();
    forwarder.await?;

    deactivate(&ctx).await;
    info!("lslaunch shut down");
    outcome
}

fn main() -> Result<()> {
    let args = Args::parse();

    setup_logging(&args.log_level, args.log_file.clone())?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    let outcome = runtime.block_on(run(args));

    // A pending stdin read would otherwise hold shutdown open
    runtime.shutdown_timeout(Duration::from_millis(250));
    outcome
}
