use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::os::unix::net::UnixStream as StdUnixStream;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use notify::{recommended_watcher, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::Instant;

use storaged_core::{DaemonConfig, PeerId};

use crate::bus::{MethodCall, PeerCredentials, SocketPeers};
use crate::daemon::Daemon;
use crate::error::{io_err, DaemonError, MethodError};
use crate::liveness::Quiescence;
use crate::methods::handle_call;
use crate::protocol::DaemonResponse;

/// Start the daemon runtime and block the current thread until it exits.
pub fn start_blocking(config: DaemonConfig) -> Result<(), DaemonError> {
    init_tracing();
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| io_err("tokio-runtime", e))?;
    runtime.block_on(run(config))
}

/// Run the daemon against the host's sysfs and the configured authority.
pub async fn run(config: DaemonConfig) -> Result<(), DaemonError> {
    let peers = Arc::new(SocketPeers::new());
    let daemon = Daemon::from_config(config, peers.clone())?;
    serve(daemon, peers).await
}

/// Serve an already assembled daemon until shutdown.
pub async fn serve(daemon: Arc<Daemon>, peers: Arc<SocketPeers>) -> Result<(), DaemonError> {
    ensure_runtime_dirs(daemon.config())?;
    let socket = daemon.config().socket_path.clone();
    prepare_socket_for_bind(&socket)?;
    let listener = UnixListener::bind(&socket).map_err(|e| io_err(&socket, e))?;
    set_socket_permissions(&socket)?;
    tracing::info!(socket = %socket.display(), "listening");

    let watcher_handle = {
        let daemon = daemon.clone();
        let shutdown_rx = daemon.subscribe_shutdown();
        tokio::spawn(async move {
            let result = watcher_task(daemon.clone(), shutdown_rx).await;
            daemon.shutdown();
            result
        })
    };

    let socket_handle = {
        let daemon = daemon.clone();
        let shutdown_rx = daemon.subscribe_shutdown();
        tokio::spawn(async move {
            let result = socket_server_task(listener, socket, daemon.clone(), peers, shutdown_rx).await;
            daemon.shutdown();
            result
        })
    };

    let idle_handle = {
        let daemon = daemon.clone();
        let shutdown_rx = daemon.subscribe_shutdown();
        tokio::spawn(async move {
            let result = idle_exit_task(
                daemon.liveness().subscribe(),
                daemon.config().idle_exit_delay(),
                shutdown_rx,
            )
            .await;
            daemon.shutdown();
            result
        })
    };

    let signal_handle = {
        let daemon = daemon.clone();
        let mut shutdown_rx = daemon.subscribe_shutdown();
        tokio::spawn(async move {
            let mut terminate = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .map_err(|e| io_err("SIGTERM handler", e))?;
            tokio::select! {
                _ = shutdown_rx.recv() => Ok(()),
                _ = terminate.recv() => {
                    tracing::info!("received SIGTERM, shutting down daemon");
                    daemon.shutdown();
                    Ok(())
                }
                signal = tokio::signal::ctrl_c() => {
                    match signal {
                        Ok(()) => {
                            tracing::info!("received ctrl-c, shutting down daemon");
                            daemon.shutdown();
                            Ok(())
                        }
                        Err(err) => Err(DaemonError::Protocol(format!("ctrl-c handler failed: {err}"))),
                    }
                }
            }
        })
    };

    let (watcher_result, socket_result, idle_result, signal_result) =
        tokio::join!(watcher_handle, socket_handle, idle_handle, signal_handle);

    handle_join("watcher", watcher_result)?;
    handle_join("socket_server", socket_result)?;
    handle_join("idle_exit", idle_result)?;
    handle_join("signal_handler", signal_result)?;
    tracing::info!("daemon stopped");
    Ok(())
}

/// Trigger a resync whenever device nodes come or go.
async fn watcher_task(daemon: Arc<Daemon>, mut shutdown_rx: broadcast::Receiver<()>) -> Result<(), DaemonError> {
    let dev_dir = daemon.config().dev_dir.clone();
    if !dev_dir.is_dir() {
        tracing::warn!(dir = %dev_dir.display(), "device directory missing; hotplug watching disabled");
        let _ = shutdown_rx.recv().await;
        return Ok(());
    }

    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<notify::Result<Event>>();
    let mut _watcher: RecommendedWatcher = recommended_watcher(move |event| {
        let _ = event_tx.send(event);
    })?;
    _watcher.watch(&dev_dir, RecursiveMode::NonRecursive)?;
    tracing::debug!(dir = %dev_dir.display(), "watching device directory");

    let threshold = daemon.config().debounce_window();
    let mut debounce = HashMap::<PathBuf, Instant>::new();

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            event = event_rx.recv() => {
                let Some(event) = event else { break };
                let event = match event {
                    Ok(event) => event,
                    Err(err) => {
                        tracing::warn!(error = %err, "watcher event error");
                        continue;
                    }
                };
                if !is_relevant_event_kind(&event.kind) {
                    continue;
                }
                let mut triggered = false;
                for path in &event.paths {
                    if should_process_event_with_threshold(&mut debounce, path, Instant::now(), threshold) {
                        tracing::debug!(path = %path.display(), "device node changed");
                        triggered = true;
                    }
                }
                if triggered {
                    daemon.request_resync("watcher");
                }
            }
        }
    }

    Ok(())
}

async fn socket_server_task(
    listener: UnixListener,
    socket: PathBuf,
    daemon: Arc<Daemon>,
    peers: Arc<SocketPeers>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            accepted = listener.accept() => {
                let (stream, _) = accepted.map_err(|e| io_err(&socket, e))?;
                let credentials = match stream.peer_cred() {
                    Ok(cred) => Some(PeerCredentials { uid: cred.uid(), pid: cred.pid() }),
                    Err(err) => {
                        tracing::warn!(error = %err, "cannot read peer credentials");
                        None
                    }
                };
                let peer = peers.connect(credentials);
                let daemon = daemon.clone();
                let peers = peers.clone();
                tokio::spawn(async move {
                    if let Err(err) = handle_socket_client(stream, &peer, daemon).await {
                        tracing::error!(peer = %peer, error = %err, "socket client error");
                    }
                    peers.disconnect(&peer);
                });
            }
        }
    }

    if socket.exists() {
        let _ = fs::remove_file(&socket);
    }
    Ok(())
}

async fn handle_socket_client(stream: UnixStream, peer: &PeerId, daemon: Arc<Daemon>) -> Result<(), DaemonError> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    while let Some(line) = lines
        .next_line()
        .await
        .map_err(|e| io_err("daemon socket read", e))?
    {
        if line.trim().is_empty() {
            continue;
        }

        let call: MethodCall = match serde_json::from_str(&line) {
            Ok(call) => call,
            Err(err) => {
                let err = MethodError::InvalidArgs(format!("invalid request JSON: {err}"));
                write_response(&mut writer, &DaemonResponse::error(&err)).await?;
                continue;
            }
        };

        let response = DaemonResponse::from_result(handle_call(&daemon, peer, call).await);
        write_response(&mut writer, &response).await?;
    }

    Ok(())
}

/// Ends once the daemon has been quiescent for `delay`.
async fn idle_exit_task(
    mut state: watch::Receiver<Quiescence>,
    delay: Duration,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    loop {
        let quiet = state.borrow_and_update().may_exit();
        if quiet {
            tokio::select! {
                _ = shutdown_rx.recv() => return Ok(()),
                _ = tokio::time::sleep(delay) => {
                    if state.borrow().may_exit() {
                        tracing::info!("no clients and no jobs; exiting");
                        return Ok(());
                    }
                }
                changed = state.changed() => {
                    if changed.is_err() {
                        return Ok(());
                    }
                }
            }
        } else {
            tokio::select! {
                _ = shutdown_rx.recv() => return Ok(()),
                changed = state.changed() => {
                    if changed.is_err() {
                        return Ok(());
                    }
                }
            }
        }
    }
}

fn is_relevant_event_kind(kind: &EventKind) -> bool {
    matches!(kind, EventKind::Create(_) | EventKind::Remove(_))
}

fn prepare_socket_for_bind(socket: &Path) -> Result<(), DaemonError> {
    if !socket.exists() {
        return Ok(());
    }

    match StdUnixStream::connect(socket) {
        Ok(_) => {
            return Err(DaemonError::Protocol(format!(
                "daemon socket already in use: {}",
                socket.display()
            )));
        }
        Err(err) => {
            tracing::warn!(
                socket = %socket.display(),
                error = %err,
                "removing stale daemon socket before bind",
            );
        }
    }

    match fs::remove_file(socket) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(io_err(socket, err)),
    }
}

fn should_process_event_with_threshold(
    debounce: &mut HashMap<PathBuf, Instant>,
    path: &Path,
    now: Instant,
    threshold: Duration,
) -> bool {
    debounce.retain(|_, seen_at| now.duration_since(*seen_at) <= Duration::from_secs(30));
    match debounce.get(path) {
        Some(last_seen) if now.duration_since(*last_seen) < threshold => false,
        _ => {
            debounce.insert(path.to_path_buf(), now);
            true
        }
    }
}

fn ensure_runtime_dirs(config: &DaemonConfig) -> Result<(), DaemonError> {
    let mut dirs = vec![config.state_dir.clone()];
    dirs.extend(config.socket_path.parent().map(Path::to_path_buf));
    for dir in dirs {
        if !dir.as_os_str().is_empty() && !dir.exists() {
            fs::create_dir_all(&dir).map_err(|e| io_err(&dir, e))?;
        }
    }
    Ok(())
}

async fn write_response(writer: &mut OwnedWriteHalf, response: &DaemonResponse) -> Result<(), DaemonError> {
    let payload = serde_json::to_string(response)?;
    writer
        .write_all(payload.as_bytes())
        .await
        .map_err(|e| io_err("daemon socket write", e))?;
    writer
        .write_all(b"\n")
        .await
        .map_err(|e| io_err("daemon socket write", e))?;
    writer
        .flush()
        .await
        .map_err(|e| io_err("daemon socket flush", e))?;
    Ok(())
}

fn handle_join(
    task: &str,
    result: Result<Result<(), DaemonError>, tokio::task::JoinError>,
) -> Result<(), DaemonError> {
    match result {
        Ok(inner) => inner,
        Err(err) => Err(DaemonError::Protocol(format!(
            "{task} task join failure: {err}"
        ))),
    }
}

fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

fn set_socket_permissions(path: &Path) -> Result<(), DaemonError> {
    use std::os::unix::fs::PermissionsExt;
    // Callers of any uid connect; authorization happens per call.
    fs::set_permissions(path, fs::Permissions::from_mode(0o666)).map_err(|e| io_err(path, e))
}
