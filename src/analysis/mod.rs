//! Static analysis behind the daemon.
//!
//! The daemon only talks to the [`Analyzer`] trait. [`PythonAnalyzer`] is
//! the implementation it runs with: a small nominal type checker for Python
//! built on the tree-sitter extraction in [`crate::parser`].

pub mod checker;
pub mod environment;
pub mod python;
pub mod state;
pub mod types;

pub use environment::{Environment, Symbol, SymbolKind};
pub use python::{normalize_path, PythonAnalyzer};
pub use state::{AnalysisState, FileOutcome};
pub use types::{Diagnostic, DiagnosticCode, RecheckSummary, Type, TypeInfo};

use std::path::PathBuf;

use crate::config::Configuration;
use crate::error::Result;

/// The analysis engine the daemon drives.
///
/// Implementations must be deterministic: `reanalyze_files` applied to a
/// state produced by `analyze_fresh` has to yield the state `analyze_fresh`
/// would produce for the updated files.
pub trait Analyzer: Send + Sync {
    /// Analyze every file the configuration owns.
    fn analyze_fresh(&self, config: &Configuration) -> Result<AnalysisState>;

    /// Replace what `paths` contribute to `state` with their current
    /// contents. Paths that no longer exist are dropped.
    fn reanalyze_files(
        &self,
        config: &Configuration,
        state: &mut AnalysisState,
        paths: &[PathBuf],
    ) -> Result<RecheckSummary>;

    /// Type of a qualified name (`pkg.mod.name`), if it names anything.
    fn type_of(&self, state: &AnalysisState, expression: &str) -> Result<Option<TypeInfo>>;
}
