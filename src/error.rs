//! Error types for checkd.

use std::path::PathBuf;
use thiserror::Error;

/// Every failure the library can report.
#[derive(Error, Debug)]
pub enum CheckdError {
    /// No daemon answered on the socket after all retries.
    #[error("could not connect to server at {} after {attempts} attempt(s)", .socket.display())]
    ConnectionFailure { socket: PathBuf, attempts: usize },

    /// The snapshot was produced under a configuration that disagrees with the current one.
    #[error("incompatible saved state: {0}")]
    IncompatibleState(String),

    #[error("corrupt saved state at {}: {reason}", .path.display())]
    CorruptSnapshot { path: PathBuf, reason: String },

    /// Another daemon already owns the project lock.
    #[error("another server is already running (lock held on {})", .0.display())]
    LockHeld(PathBuf),

    #[error("protocol error: {0}")]
    ProtocolError(String),

    /// The server answered a request with an error message.
    #[error("server error: {0}")]
    Server(String),

    #[error("analyzer internal error: {0}")]
    AnalyzerInternalError(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("failed to initialize parser for {0}: {1}")]
    ParserInit(PathBuf, String),

    #[error("tree-sitter produced no tree for {0}")]
    TreeSitterParseFailed(PathBuf),

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("watcher error: {0}")]
    Watcher(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl CheckdError {
    /// Process exit code for a failure of this kind.
    ///
    /// A held lock exits distinctly so callers can tell "already running"
    /// apart from a broken start.
    pub fn exit_code(&self) -> i32 {
        match self {
            CheckdError::LockHeld(_) => 2,
            CheckdError::ConnectionFailure { .. } => 3,
            CheckdError::IncompatibleState(_) | CheckdError::CorruptSnapshot { .. } => 4,
            CheckdError::Config(_) => 5,
            _ => 1,
        }
    }

    /// Whether a fresh, non-incremental start is the right fallback.
    pub fn is_snapshot_rejection(&self) -> bool {
        matches!(
            self,
            CheckdError::IncompatibleState(_) | CheckdError::CorruptSnapshot { .. }
        )
    }
}

impl From<notify::Error> for CheckdError {
    fn from(e: notify::Error) -> Self {
        CheckdError::Watcher(e.to_string())
    }
}

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, CheckdError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes_are_distinct() {
        let held = CheckdError::LockHeld(PathBuf::from("/tmp/x.lock"));
        let refused = CheckdError::ConnectionFailure {
            socket: PathBuf::from("/tmp/x.sock"),
            attempts: 3,
        };
        let stale = CheckdError::IncompatibleState("strict differs".to_string());

        assert_eq!(held.exit_code(), 2);
        assert_eq!(refused.exit_code(), 3);
        assert_eq!(stale.exit_code(), 4);
        assert_ne!(held.exit_code(), 0);
    }

    #[test]
    fn test_snapshot_rejection_kinds() {
        assert!(CheckdError::IncompatibleState("x".into()).is_snapshot_rejection());
        assert!(CheckdError::CorruptSnapshot {
            path: PathBuf::from("s.bin"),
            reason: "bad magic".into()
        }
        .is_snapshot_rejection());
        assert!(!CheckdError::LockHeld(PathBuf::from("l")).is_snapshot_rejection());
    }

    #[test]
    fn test_connection_failure_message() {
        let err = CheckdError::ConnectionFailure {
            socket: PathBuf::from("/run/checkd.sock"),
            attempts: 5,
        };
        let msg = err.to_string();
        assert!(msg.contains("/run/checkd.sock"));
        assert!(msg.contains("5 attempt"));
    }
}
