//! # checkd
//!
//! An analysis daemon: keeps a project's analysis state in memory, rechecks
//! only what changed, and restarts from a saved snapshot in time
//! proportional to how stale the snapshot is.
//!
//! ## Key Features
//!
//! - **One server per project**: an advisory lock file guards it
//! - **Incremental**: changed files and their importers are rechecked
//! - **Saved state**: snapshot on demand, restore with a changed-files list
//! - **Push**: persistent clients receive diagnostics after every recheck
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use checkd::{Analyzer, Configuration, PythonAnalyzer};
//! use std::path::Path;
//!
//! let config = Configuration::discover(Path::new(".")).unwrap();
//! let state = PythonAnalyzer::new().analyze_fresh(&config).unwrap();
//! for diagnostic in state.diagnostics() {
//!     println!("{diagnostic}");
//! }
//! ```

pub mod analysis;
pub mod config;
pub mod daemon;
pub mod error;
pub mod graph;
pub mod log;
pub mod parser;
pub mod watcher;

// Re-exports for convenience
pub use error::{CheckdError, Result};

pub use analysis::{AnalysisState, Analyzer, Diagnostic, DiagnosticCode, PythonAnalyzer, TypeInfo};
pub use config::{Configuration, SavedStateAction, ServerConfiguration};
pub use daemon::{DaemonClient, Request, Response, Server};
pub use graph::{CallGraph, EdgeKind, NodeKind};
pub use watcher::WatcherKind;
