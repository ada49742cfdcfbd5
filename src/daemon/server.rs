//! Daemon server: lifecycle, accept loop and request dispatch.
//!
//! ```text
//! Initializing ──► Ready ──► ShuttingDown ──► Stopped
//!   lock, bind,     accept,     finish recheck, grace period,
//!   fresh or load,  dispatch,   stop watcher, remove socket
//!   watcher         recheck     and pid file, release lock
//! ```
//!
//! All mutable server state lives in one [`Shared`] value behind a single
//! mutex. Queries clone the `Arc` of the current [`AnalysisState`] and work
//! on that snapshot. Rechecks are serialized through one worker task which
//! analyzes a private copy and swaps it in under the lock, so a reader sees
//! either the state before a recheck or the state after it.

use chrono::{DateTime, Utc};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use super::lock::{FileGuard, ProjectLock};
use super::paths;
use super::protocol::{decode, read_frame, write_message, Request, Response, ServerStatus};
use super::registry::{ClientId, ConnectionHandle, ConnectionState};
use super::saved_state;
use crate::analysis::{normalize_path, AnalysisState, Analyzer, RecheckSummary};
use crate::config::{SavedStateAction, ServerConfiguration};
use crate::error::{CheckdError, Result};
use crate::watcher::{self, WatchEvent, WatcherHandle};

/// Process-wide mutable state. Only ever touched through [`Context::shared`].
struct Shared {
    analysis: Arc<AnalysisState>,
    connections: ConnectionState,
}

/// A batch of paths to recheck. `reply` fires once the result is committed.
struct RecheckJob {
    paths: Vec<PathBuf>,
    reply: Option<oneshot::Sender<()>>,
}

struct Context {
    config: ServerConfiguration,
    analyzer: Arc<dyn Analyzer>,
    shared: Mutex<Shared>,
    rechecks: mpsc::UnboundedSender<RecheckJob>,
    shutdown: broadcast::Sender<()>,
    /// Tells open connections to finish; sent once rechecks have stopped.
    closing: broadcast::Sender<()>,
    started_at: DateTime<Utc>,
    started: Instant,
}

/// Files and processes owned by a running server, released in order on
/// shutdown.
struct Resources {
    lock: ProjectLock,
    socket: FileGuard,
    pid_file: Option<FileGuard>,
    watcher: Option<WatcherHandle>,
}

/// A server in the `Ready` state.
pub struct Server {
    socket: PathBuf,
    shutdown: broadcast::Sender<()>,
    task: JoinHandle<()>,
}

impl Server {
    /// Initialize a server and start serving in the background.
    ///
    /// Returns once the server is ready. Any failure before that point
    /// releases whatever was acquired (lock, socket) and is returned here.
    pub async fn start(config: ServerConfiguration, analyzer: Arc<dyn Analyzer>) -> Result<Self> {
        let configuration = &config.configuration;
        info!(root = %configuration.project_root.display(), "initializing server");

        let lock = ProjectLock::acquire(&paths::lock_path(configuration, true)?)?;

        let socket_path = paths::socket_path(configuration, true)?;
        remove_stale_socket(&socket_path)?;
        let listener = UnixListener::bind(&socket_path)?;
        let socket = FileGuard::new(&socket_path);
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&socket_path, fs::Permissions::from_mode(0o600))?;
        }
        info!(socket = %socket_path.display(), "socket bound");

        let analysis = initial_state(&config, Arc::clone(&analyzer)).await?;

        if let SavedStateAction::Save(path) = &config.saved_state {
            let state = analysis.clone();
            let configuration = configuration.clone();
            let path = path.clone();
            tokio::task::spawn_blocking(move || saved_state::save(&state, &configuration, &path))
                .await
                .map_err(join_error)??;
        }

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let watcher = watcher::start(&config.watcher, configuration, events_tx)?;
        let watcher_pid = watcher.as_ref().and_then(WatcherHandle::pid);
        let pid_file = match watcher_pid {
            Some(pid) => Some(FileGuard::write(
                paths::pid_path(configuration, true)?,
                &pid.to_string(),
            )?),
            None => None,
        };

        let mut connections = ConnectionState::listening_on(socket_path.clone());
        connections.set_watcher_pid(watcher_pid);

        let (shutdown, _) = broadcast::channel(1);
        let (rechecks, jobs) = mpsc::unbounded_channel();
        let context = Arc::new(Context {
            config,
            analyzer,
            shared: Mutex::new(Shared {
                analysis,
                connections,
            }),
            rechecks,
            shutdown: shutdown.clone(),
            closing: broadcast::channel(1).0,
            started_at: Utc::now(),
            started: Instant::now(),
        });

        let worker = tokio::spawn(recheck_worker(
            Arc::clone(&context),
            jobs,
            shutdown.subscribe(),
        ));
        let resources = Resources {
            lock,
            socket,
            pid_file,
            watcher,
        };
        let shutdown_rx = shutdown.subscribe();
        let task = tokio::spawn(serve(
            context, listener, events_rx, worker, resources, shutdown_rx,
        ));

        info!(
            socket = %socket_path.display(),
            watcher_pid = ?watcher_pid,
            "server ready"
        );
        Ok(Self {
            socket: socket_path,
            shutdown,
            task,
        })
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket
    }

    /// Sender that triggers a graceful shutdown when sent to.
    pub fn shutdown_trigger(&self) -> broadcast::Sender<()> {
        self.shutdown.clone()
    }

    pub fn stop(&self) {
        let _ = self.shutdown.send(());
    }

    /// Wait until the server has stopped and released its files.
    pub async fn wait(self) -> Result<()> {
        self.task.await.map_err(join_error)
    }
}

/// Run a server in the foreground until `Stop`, Ctrl-C or SIGTERM.
pub async fn run(config: ServerConfiguration, analyzer: Arc<dyn Analyzer>) -> Result<()> {
    let server = Server::start(config, analyzer).await?;
    let trigger = server.shutdown_trigger();
    tokio::spawn(async move {
        match wait_for_signal().await {
            Ok(signal) => {
                info!(signal, "signal received");
                let _ = trigger.send(());
            }
            Err(e) => warn!(error = %e, "cannot listen for signals"),
        }
    });
    server.wait().await
}

async fn wait_for_signal() -> std::io::Result<&'static str> {
    use tokio::signal::unix::{signal, SignalKind};
    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result.map(|_| "SIGINT"),
        _ = terminate.recv() => Ok("SIGTERM"),
    }
}

/// Holding the lock means nobody is listening on an existing socket file.
fn remove_stale_socket(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => {
            debug!(socket = %path.display(), "removed stale socket");
            Ok(())
        }
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

async fn initial_state(
    config: &ServerConfiguration,
    analyzer: Arc<dyn Analyzer>,
) -> Result<Arc<AnalysisState>> {
    let configuration = config.configuration.clone();
    let action = config.saved_state.clone();
    let state = tokio::task::spawn_blocking(move || match action {
        SavedStateAction::Load {
            snapshot,
            changed_files,
        } => saved_state::load(
            &configuration,
            analyzer.as_ref(),
            &snapshot,
            changed_files.as_deref(),
        )
        .map(|loaded| loaded.state),
        SavedStateAction::None | SavedStateAction::Save(_) => {
            analyzer.analyze_fresh(&configuration)
        }
    })
    .await
    .map_err(join_error)??;
    Ok(Arc::new(state))
}

fn join_error(e: tokio::task::JoinError) -> CheckdError {
    CheckdError::Io(std::io::Error::other(e.to_string()))
}

async fn serve(
    context: Arc<Context>,
    listener: UnixListener,
    mut watch_events: mpsc::UnboundedReceiver<WatchEvent>,
    worker: JoinHandle<()>,
    mut resources: Resources,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => {
                    let stop = context.closing.subscribe();
                    connections.spawn(handle_connection(Arc::clone(&context), stream, stop));
                }
                Err(e) => error!(error = %e, "accept failed"),
            },
            Some(event) = watch_events.recv() => match event {
                WatchEvent::FilesChanged(paths) => {
                    debug!(files = paths.len(), "watcher reported changes");
                    let _ = context.rechecks.send(RecheckJob { paths, reply: None });
                }
                WatchEvent::Exited { reason } => {
                    warn!(reason = %reason, "watcher exited; serving without file watching");
                    context.shared().connections.set_watcher_pid(None);
                    resources.pid_file = None;
                }
            },
            Some(joined) = connections.join_next() => {
                if let Err(e) = joined {
                    warn!(error = %e, "connection task failed");
                }
            }
            _ = shutdown.recv() => break,
        }
    }

    info!("shutting down");
    drop(listener);

    // An in-flight recheck commits and reaches subscribers before any
    // connection is told to close.
    if let Err(e) = worker.await {
        warn!(error = %e, "recheck worker failed");
    }
    let _ = context.closing.send(());

    let grace = context.config.grace_period;
    let drained = tokio::time::timeout(grace, async {
        while connections.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
        warn!(
            remaining = connections.len(),
            grace_ms = grace.as_millis() as u64,
            "grace period elapsed; closing connections"
        );
        connections.shutdown().await;
    }

    if let Some(handle) = resources.watcher.take() {
        handle.terminate().await;
    }
    context.shared().connections.clear();

    let Resources {
        lock,
        socket,
        pid_file,
        watcher: _,
    } = resources;
    drop(socket);
    drop(pid_file);
    drop(lock);
    info!("server stopped");
}

impl Context {
    fn shared(&self) -> MutexGuard<'_, Shared> {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn snapshot(&self) -> Arc<AnalysisState> {
        Arc::clone(&self.shared().analysis)
    }

    async fn dispatch(
        &self,
        request: Request,
        handle: &ConnectionHandle,
        registrations: &mut Vec<ClientId>,
    ) -> Response {
        match request {
            Request::FlushDiagnostics => Response::Diagnostics {
                diagnostics: self.snapshot().diagnostics(),
            },
            Request::TypeQuery { expression } => {
                let state = self.snapshot();
                match self.analyzer.type_of(&state, &expression) {
                    Ok(Some(info)) => Response::QueryResult { info },
                    Ok(None) => Response::error(format!("no type information for `{expression}`")),
                    Err(e) => Response::error(e.to_string()),
                }
            }
            Request::FileChanged { paths } => {
                let (reply, committed) = oneshot::channel();
                let job = RecheckJob {
                    paths,
                    reply: Some(reply),
                };
                if self.rechecks.send(job).is_err() {
                    return Response::error("server is shutting down");
                }
                match committed.await {
                    Ok(()) => Response::Ack,
                    Err(_) => Response::error("server is shutting down"),
                }
            }
            Request::Stop => {
                info!("stop requested");
                let _ = self.shutdown.send(());
                Response::Ack
            }
            Request::Subscribe => {
                let client_id = self
                    .shared()
                    .connections
                    .register_persistent(handle.clone());
                registrations.push(client_id);
                Response::Subscribed { client_id }
            }
            Request::RegisterFileNotifier => {
                let client_id = self
                    .shared()
                    .connections
                    .register_file_notifier(handle.clone());
                registrations.push(client_id);
                Response::Ack
            }
            Request::Ping => Response::Pong,
            Request::Status => Response::Status {
                status: self.status(),
            },
            Request::SaveState { path } => {
                let path = if path.is_absolute() {
                    path
                } else {
                    self.config.configuration.project_root.join(path)
                };
                let state = self.snapshot();
                let configuration = self.config.configuration.clone();
                let saved = tokio::task::spawn_blocking(move || {
                    saved_state::save(&state, &configuration, &path)
                })
                .await
                .map_err(join_error)
                .and_then(|result| result);
                match saved {
                    Ok(()) => Response::Ack,
                    Err(e) => Response::error(e.to_string()),
                }
            }
        }
    }

    fn status(&self) -> ServerStatus {
        let shared = self.shared();
        ServerStatus {
            pid: std::process::id(),
            socket: shared.connections.socket().map(Path::to_path_buf),
            project_root: self.config.configuration.project_root.clone(),
            started_at: self.started_at,
            uptime_secs: self.started.elapsed().as_secs(),
            files: shared.analysis.file_count(),
            diagnostics: shared.analysis.diagnostic_count(),
            persistent_clients: shared.connections.persistent_count(),
            file_notifiers: shared.connections.list_file_notifiers().len(),
            watcher_pid: shared.connections.watcher_pid(),
            fingerprint: self.config.configuration.fingerprint().digest(),
        }
    }

    /// Recheck `paths` against a private copy of the state, then install it
    /// and push the new diagnostics to persistent clients.
    async fn recheck(self: &Arc<Self>, paths: Vec<PathBuf>) {
        let start = Instant::now();
        let current = self.snapshot();
        let context = Arc::clone(self);
        let job_paths = paths.clone();
        let outcome = tokio::task::spawn_blocking(move || {
            let mut next = (*current).clone();
            let result = context.analyzer.reanalyze_files(
                &context.config.configuration,
                &mut next,
                &job_paths,
            );
            match result {
                Ok(summary) => (next, summary),
                Err(e) => {
                    error!(error = %e, "recheck failed");
                    context.mark_failed(&current, &job_paths, &e.to_string())
                }
            }
        })
        .await;

        let (next, summary) = match outcome {
            Ok(done) => done,
            Err(e) => {
                error!(error = %e, "recheck panicked");
                let failure = CheckdError::AnalyzerInternalError(e.to_string());
                self.mark_failed(&self.snapshot(), &paths, &failure.to_string())
            }
        };

        let delivered = {
            let mut shared = self.shared();
            shared.analysis = Arc::new(next);
            let diagnostics = shared.analysis.diagnostics();
            shared
                .connections
                .broadcast(&Response::Diagnostics { diagnostics })
        };
        info!(
            reparsed = summary.reparsed,
            removed = summary.removed,
            failed = summary.failed,
            rechecked = summary.rechecked_modules,
            subscribers = delivered,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "recheck committed"
        );
    }

    /// `current` with an internal-error diagnostic on each path the project
    /// could own.
    fn mark_failed(
        &self,
        current: &AnalysisState,
        paths: &[PathBuf],
        message: &str,
    ) -> (AnalysisState, RecheckSummary) {
        let configuration = &self.config.configuration;
        let mut next = current.clone();
        let failed: Vec<PathBuf> = paths
            .iter()
            .map(|p| normalize_path(configuration, p))
            .filter(|p| configuration.owns_file(p) || current.is_known(p))
            .collect();
        let summary = next.mark_failed(&failed, message, configuration.strict);
        (next, summary)
    }
}

/// Serializes rechecks and coalesces whatever queued up while one ran.
async fn recheck_worker(
    context: Arc<Context>,
    mut jobs: mpsc::UnboundedReceiver<RecheckJob>,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        let first = tokio::select! {
            biased;
            _ = shutdown.recv() => break,
            job = jobs.recv() => match job {
                Some(job) => job,
                None => break,
            },
        };

        let mut batch = vec![first];
        while let Ok(job) = jobs.try_recv() {
            batch.push(job);
        }
        let mut paths: Vec<PathBuf> = batch
            .iter()
            .flat_map(|job| job.paths.iter().cloned())
            .collect();
        paths.sort();
        paths.dedup();

        context.recheck(paths).await;
        for job in batch {
            if let Some(reply) = job.reply {
                let _ = reply.send(());
            }
        }
    }
    debug!("recheck worker stopped");
}

/// Serve one connection: requests are answered in arrival order, and pushes
/// for a subscribed connection share the same writer.
async fn handle_connection(
    context: Arc<Context>,
    stream: UnixStream,
    mut closing: broadcast::Receiver<()>,
) {
    let (mut reader, mut writer) = stream.into_split();
    let (sender, mut outgoing) = mpsc::unbounded_channel::<Response>();
    let writer_task = tokio::spawn(async move {
        while let Some(response) = outgoing.recv().await {
            if let Err(e) = write_message(&mut writer, &response).await {
                debug!(error = %e, "client went away");
                break;
            }
        }
    });

    let handle = ConnectionHandle::new(sender);
    let mut registrations = Vec::new();

    loop {
        let frame = tokio::select! {
            frame = read_frame(&mut reader) => frame,
            _ = closing.recv() => break,
        };
        let payload = match frame {
            Ok(Some(payload)) => payload,
            Ok(None) => break,
            Err(CheckdError::ProtocolError(message)) => {
                warn!(error = %message, "dropping connection");
                handle.send(Response::error(message));
                break;
            }
            Err(e) => {
                debug!(error = %e, "connection read failed");
                break;
            }
        };

        let (response, stop) = match decode::<Request>(&payload) {
            Ok(request) => {
                debug!(?request, "request");
                let stop = request == Request::Stop;
                let response = context.dispatch(request, &handle, &mut registrations).await;
                (response, stop)
            }
            Err(e) => {
                warn!(error = %e, "bad request");
                (Response::error(e.to_string()), false)
            }
        };
        if !handle.send(response) || stop {
            break;
        }
    }

    if !registrations.is_empty() {
        let mut shared = context.shared();
        for id in &registrations {
            shared.connections.unregister(*id);
        }
    }
    drop(handle);
    let _ = writer_task.await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remove_stale_socket() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("server.sock");
        drop(std::os::unix::net::UnixListener::bind(&path).unwrap());
        assert!(path.exists());

        remove_stale_socket(&path).unwrap();
        assert!(!path.exists());
        // Nothing to remove is fine too.
        remove_stale_socket(&path).unwrap();
    }

    #[tokio::test]
    async fn test_load_failure_releases_lock_and_socket() {
        let dir = tempfile::tempdir().unwrap();
        let configuration = crate::config::Configuration::discover(dir.path()).unwrap();
        let config = ServerConfiguration::new(configuration.clone()).with_saved_state(
            SavedStateAction::Load {
                snapshot: dir.path().join("missing.bin"),
                changed_files: None,
            },
        );
        let analyzer: Arc<dyn Analyzer> = Arc::new(crate::analysis::PythonAnalyzer::new());
        let err = Server::start(config, analyzer).await.err().unwrap();
        assert!(err.is_snapshot_rejection(), "{err:?}");

        assert!(!paths::socket_path(&configuration, false).unwrap().exists());
        ProjectLock::acquire(&paths::lock_path(&configuration, false).unwrap()).unwrap();
    }
}
