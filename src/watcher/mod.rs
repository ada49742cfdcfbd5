//! File watching.
//!
//! A watcher reports changed source files to the server as
//! [`WatchEvent`]s on a channel the serve loop selects on. Two kinds exist:
//! the in-process `notify` watcher, and an external command that prints
//! one changed path per line on stdout (its pid is recorded so operators
//! can find it).

use notify_debouncer_mini::{new_debouncer, DebouncedEvent, DebouncedEventKind, Debouncer};
use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;
use std::str::FromStr;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::Configuration;
use crate::error::{CheckdError, Result};

/// Debounce window for native file events.
const DEBOUNCE: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum WatcherKind {
    #[default]
    None,
    Native,
    /// External program and its arguments.
    Command(Vec<String>),
}

impl FromStr for WatcherKind {
    type Err = CheckdError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "none" => Ok(WatcherKind::None),
            "native" => Ok(WatcherKind::Native),
            other => Err(CheckdError::Config(format!(
                "unknown watcher kind `{other}` (expected `none` or `native`)"
            ))),
        }
    }
}

impl fmt::Display for WatcherKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WatcherKind::None => write!(f, "none"),
            WatcherKind::Native => write!(f, "native"),
            WatcherKind::Command(argv) => write!(f, "command `{}`", argv.join(" ")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    FilesChanged(Vec<PathBuf>),
    /// The watcher stopped on its own.
    Exited { reason: String },
}

/// Keeps a watcher running. Call [`WatcherHandle::terminate`] to stop it.
pub enum WatcherHandle {
    Native {
        _debouncer: Debouncer<notify::RecommendedWatcher>,
    },
    Command {
        pid: Option<u32>,
        stop: oneshot::Sender<()>,
        task: JoinHandle<()>,
    },
}

impl fmt::Debug for WatcherHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WatcherHandle::Native { .. } => write!(f, "WatcherHandle::Native"),
            WatcherHandle::Command { pid, .. } => write!(f, "WatcherHandle::Command({pid:?})"),
        }
    }
}

impl WatcherHandle {
    /// Process id of the watcher subprocess, if there is one.
    pub fn pid(&self) -> Option<u32> {
        match self {
            WatcherHandle::Native { .. } => None,
            WatcherHandle::Command { pid, .. } => *pid,
        }
    }

    /// Stop watching, killing and reaping the subprocess if any.
    pub async fn terminate(self) {
        match self {
            WatcherHandle::Native { .. } => debug!("native watcher stopped"),
            WatcherHandle::Command { pid, stop, task } => {
                let _ = stop.send(());
                if let Err(e) = task.await {
                    warn!(error = %e, "watcher task failed");
                }
                debug!(pid = ?pid, "watcher subprocess terminated");
            }
        }
    }
}

/// Start the watcher `kind` describes. `WatcherKind::None` starts nothing.
pub fn start(
    kind: &WatcherKind,
    config: &Configuration,
    events: mpsc::UnboundedSender<WatchEvent>,
) -> Result<Option<WatcherHandle>> {
    match kind {
        WatcherKind::None => Ok(None),
        WatcherKind::Native => start_native(config, events).map(Some),
        WatcherKind::Command(argv) => start_command(argv, config, events).map(Some),
    }
}

fn start_native(
    config: &Configuration,
    events: mpsc::UnboundedSender<WatchEvent>,
) -> Result<WatcherHandle> {
    let filter = config.clone();
    let mut debouncer = new_debouncer(
        DEBOUNCE,
        move |result: std::result::Result<Vec<DebouncedEvent>, notify::Error>| match result {
            Ok(batch) => {
                let paths = changed_sources(&batch, &filter);
                if !paths.is_empty() {
                    debug!(count = paths.len(), "file events");
                    let _ = events.send(WatchEvent::FilesChanged(paths));
                }
            }
            Err(e) => warn!(error = %e, "file watcher error"),
        },
    )?;

    for root in &config.search_paths {
        debouncer
            .watcher()
            .watch(root, notify::RecursiveMode::Recursive)?;
    }

    info!(
        roots = config.search_paths.len(),
        debounce_ms = DEBOUNCE.as_millis() as u64,
        "native file watcher started"
    );
    Ok(WatcherHandle::Native {
        _debouncer: debouncer,
    })
}

/// Settled events for source files the configuration owns, deduplicated.
fn changed_sources(batch: &[DebouncedEvent], config: &Configuration) -> Vec<PathBuf> {
    let paths: BTreeSet<PathBuf> = batch
        .iter()
        .filter(|event| matches!(event.kind, DebouncedEventKind::Any))
        .filter(|event| config.owns_file(&event.path))
        .map(|event| event.path.clone())
        .collect();
    paths.into_iter().collect()
}

fn start_command(
    argv: &[String],
    config: &Configuration,
    events: mpsc::UnboundedSender<WatchEvent>,
) -> Result<WatcherHandle> {
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| CheckdError::Watcher("empty watcher command".to_string()))?;

    let mut child = Command::new(program)
        .args(args)
        .current_dir(&config.project_root)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| CheckdError::Watcher(format!("failed to spawn `{program}`: {e}")))?;

    let pid = child.id();
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| CheckdError::Watcher("watcher stdout unavailable".to_string()))?;
    let (stop, mut stopped) = oneshot::channel::<()>();
    let root = config.project_root.clone();

    let task = tokio::spawn(async move {
        let mut lines = BufReader::new(stdout).lines();
        loop {
            tokio::select! {
                _ = &mut stopped => {
                    if let Err(e) = child.kill().await {
                        warn!(error = %e, "failed to kill watcher");
                    }
                    return;
                }
                line = lines.next_line() => match line {
                    Ok(Some(line)) => {
                        let line = line.trim();
                        if line.is_empty() {
                            continue;
                        }
                        let path = PathBuf::from(line);
                        let path = if path.is_absolute() { path } else { root.join(path) };
                        let _ = events.send(WatchEvent::FilesChanged(vec![path]));
                    }
                    Ok(None) | Err(_) => {
                        let reason = match child.wait().await {
                            Ok(status) => format!("watcher exited with {status}"),
                            Err(e) => format!("watcher lost: {e}"),
                        };
                        let _ = events.send(WatchEvent::Exited { reason });
                        return;
                    }
                },
            }
        }
    });

    info!(pid = ?pid, program = %program, "watcher subprocess started");
    Ok(WatcherHandle::Command { pid, stop, task })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tokio::time::timeout;

    fn sh(script: &str) -> WatcherKind {
        WatcherKind::Command(vec!["sh".into(), "-c".into(), script.into()])
    }

    #[test]
    fn test_parse_kind() {
        assert_eq!("none".parse::<WatcherKind>().unwrap(), WatcherKind::None);
        assert_eq!("native".parse::<WatcherKind>().unwrap(), WatcherKind::Native);
        assert!(matches!(
            "watchman".parse::<WatcherKind>(),
            Err(CheckdError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_none_starts_nothing() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let config = Configuration::new("/tmp");
        assert!(start(&WatcherKind::None, &config, tx).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_command_watcher_reports_lines_then_exit() {
        let dir = tempfile::tempdir().unwrap();
        let config = Configuration::discover(dir.path()).unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = start(&sh("echo a.py; echo; echo /abs/b.py"), &config, tx)
            .unwrap()
            .unwrap();
        assert!(handle.pid().is_some());

        let first = timeout(Duration::from_secs(10), rx.recv()).await.unwrap();
        assert_eq!(
            first,
            Some(WatchEvent::FilesChanged(vec![config.project_root.join("a.py")]))
        );
        let second = timeout(Duration::from_secs(10), rx.recv()).await.unwrap();
        assert_eq!(
            second,
            Some(WatchEvent::FilesChanged(vec![PathBuf::from("/abs/b.py")]))
        );
        let third = timeout(Duration::from_secs(10), rx.recv()).await.unwrap();
        assert!(matches!(third, Some(WatchEvent::Exited { .. })));

        handle.terminate().await;
    }

    #[tokio::test]
    async fn test_terminate_kills_subprocess() {
        let dir = tempfile::tempdir().unwrap();
        let config = Configuration::discover(dir.path()).unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = start(&sh("sleep 60"), &config, tx).unwrap().unwrap();

        timeout(Duration::from_secs(10), handle.terminate())
            .await
            .expect("terminate should not wait for the subprocess to finish");
        // Terminated on request: no exit event.
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_missing_program_is_watcher_error() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let config = Configuration::new("/tmp");
        let kind = WatcherKind::Command(vec!["/definitely/not/a/program".into()]);
        assert!(matches!(
            start(&kind, &config, tx),
            Err(CheckdError::Watcher(_))
        ));
    }

    #[tokio::test]
    async fn test_native_watcher_sees_python_edits() {
        let dir = tempfile::tempdir().unwrap();
        let config = Configuration::discover(dir.path()).unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = start(&WatcherKind::Native, &config, tx).unwrap().unwrap();
        assert_eq!(handle.pid(), None);

        tokio::time::sleep(Duration::from_millis(100)).await;
        fs::write(config.project_root.join("notes.txt"), "ignored").unwrap();
        fs::write(config.project_root.join("m.py"), "x = 1\n").unwrap();

        let event = timeout(Duration::from_secs(10), rx.recv()).await.unwrap();
        assert_eq!(
            event,
            Some(WatchEvent::FilesChanged(vec![config.project_root.join("m.py")]))
        );
        handle.terminate().await;
    }
}
