//! The in-memory analysis state and its incremental update.
//!
//! Fresh analysis and rechecks both go through [`AnalysisState::apply_changes`]:
//! a fresh start is a recheck of every file against an empty state. A module's
//! diagnostics and call edges are a function of its own extraction and the
//! environment, so rechecking the changed modules plus everything that
//! (transitively) imports them yields the same state a fresh run would.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use super::checker::Checker;
use super::environment::Environment;
use super::types::{Diagnostic, DiagnosticCode, RecheckSummary};
use crate::graph::{CallGraph, NodeKind};
use crate::parser::ModuleExtraction;

/// Result of reading and parsing one changed path.
#[derive(Debug)]
pub enum FileOutcome {
    Parsed(ModuleExtraction),
    /// Deleted, unreadable as a source, or no longer part of the project.
    Missing,
    /// Analysis failed; the message becomes an internal-error diagnostic.
    Failed(String),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnalysisState {
    /// Per-file extraction, keyed by absolute path.
    pub sources: BTreeMap<PathBuf, ModuleExtraction>,
    pub environment: Environment,
    pub call_graph: CallGraph,
    /// Non-empty diagnostic lists, keyed by path.
    pub diagnostics: BTreeMap<PathBuf, Vec<Diagnostic>>,
}

impl AnalysisState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every diagnostic, sorted by path and position.
    pub fn diagnostics(&self) -> Vec<Diagnostic> {
        self.diagnostics.values().flatten().cloned().collect()
    }

    pub fn diagnostic_count(&self) -> usize {
        self.diagnostics.values().map(Vec::len).sum()
    }

    pub fn file_count(&self) -> usize {
        self.sources.len()
    }

    pub fn is_known(&self, path: &Path) -> bool {
        self.sources.contains_key(path) || self.diagnostics.contains_key(path)
    }

    /// Record an internal error on each of `paths`, dropping whatever they
    /// contributed before.
    pub fn mark_failed(&mut self, paths: &[PathBuf], message: &str, strict: bool) -> RecheckSummary {
        let changes = paths
            .iter()
            .map(|p| (p.clone(), FileOutcome::Failed(message.to_string())))
            .collect();
        self.apply_changes(changes, strict)
    }

    /// Replace the contributions of the given files and recheck every module
    /// that can observe the difference.
    pub fn apply_changes(
        &mut self,
        changes: Vec<(PathBuf, FileOutcome)>,
        strict: bool,
    ) -> RecheckSummary {
        let mut summary = RecheckSummary::default();
        let mut touched = BTreeSet::new();

        for (path, outcome) in changes {
            if let Some(previous) = self.sources.remove(&path) {
                touched.insert(previous.module);
            }
            self.diagnostics.remove(&path);

            match outcome {
                FileOutcome::Parsed(extraction) => {
                    touched.insert(extraction.module.clone());
                    self.sources.insert(path, extraction);
                    summary.reparsed += 1;
                }
                FileOutcome::Missing => summary.removed += 1,
                FileOutcome::Failed(message) => {
                    warn!(path = %path.display(), error = %message, "analysis failed");
                    self.diagnostics.insert(
                        path.clone(),
                        vec![Diagnostic {
                            path,
                            line: 1,
                            column: 1,
                            code: DiagnosticCode::AnalyzerInternalError,
                            message: format!("Could not analyze file: {message}"),
                        }],
                    );
                    summary.failed += 1;
                }
            }
        }

        for module in &touched {
            self.rebuild_module(module);
        }

        let recheck = self.dependents_of(&touched);
        for module in &recheck {
            self.call_graph.clear_outgoing(module);
        }

        let checker = Checker::new(&self.environment);
        let mut edges = Vec::new();
        for extraction in self.sources.values() {
            if !recheck.contains(&extraction.module) {
                continue;
            }
            let report = checker.check_module(extraction, strict);
            if report.diagnostics.is_empty() {
                self.diagnostics.remove(&extraction.path);
            } else {
                self.diagnostics
                    .insert(extraction.path.clone(), report.diagnostics);
            }
            edges.extend(report.edges);
        }
        for (from, to, kind) in edges {
            self.call_graph.add_edge(&from, &to, kind);
        }

        summary.rechecked_modules = recheck.len();
        debug!(
            touched = touched.len(),
            rechecked = recheck.len(),
            "applied changes"
        );
        summary
    }

    /// First file, in path order, that defines `module`.
    fn defining_source(&self, module: &str) -> Option<&ModuleExtraction> {
        self.sources.values().find(|e| e.module == module)
    }

    fn rebuild_module(&mut self, module: &str) {
        self.environment.remove_module(module);
        self.call_graph.remove_module(module);

        let Some(extraction) = self.defining_source(module).cloned() else {
            return;
        };
        self.environment.insert_module(&extraction);

        self.call_graph.add_node(module, module, NodeKind::Module);
        for function in &extraction.functions {
            self.call_graph.add_node(
                &format!("{module}.{}", function.name),
                module,
                NodeKind::Function,
            );
        }
        for class in &extraction.classes {
            let class_name = format!("{module}.{}", class.name);
            self.call_graph.add_node(&class_name, module, NodeKind::Class);
            for method in &class.methods {
                self.call_graph.add_node(
                    &format!("{class_name}.{}", method.name),
                    module,
                    NodeKind::Method,
                );
            }
        }
    }

    /// `changed` plus every module that imports one of them, transitively.
    fn dependents_of(&self, changed: &BTreeSet<String>) -> BTreeSet<String> {
        let mut importers: BTreeMap<String, BTreeSet<&str>> = BTreeMap::new();
        for extraction in self.sources.values() {
            for dependency in extraction.dependencies() {
                importers
                    .entry(dependency)
                    .or_default()
                    .insert(extraction.module.as_str());
            }
        }

        let mut result: BTreeSet<String> = changed.clone();
        let mut queue: VecDeque<String> = changed.iter().cloned().collect();
        while let Some(module) = queue.pop_front() {
            let Some(dependents) = importers.get(&module) else {
                continue;
            };
            for dependent in dependents {
                if result.insert(dependent.to_string()) {
                    queue.push_back(dependent.to_string());
                }
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::extract_module;

    fn parsed(module: &str, source: &str) -> (PathBuf, FileOutcome) {
        let path = PathBuf::from(format!("/p/{}.py", module.replace('.', "/")));
        let extraction = extract_module(&path, module, source).unwrap();
        (path, FileOutcome::Parsed(extraction))
    }

    fn fresh(files: &[(&str, &str)]) -> AnalysisState {
        let mut state = AnalysisState::new();
        state.apply_changes(files.iter().map(|(m, s)| parsed(m, s)).collect(), false);
        state
    }

    const LIB: &str = "class C:\n    pass\n\ndef make() -> C:\n    return C()\n";
    const USER: &str = "from lib import C, make\n\ndef use(c: C) -> int:\n    return make()\n";

    #[test]
    fn test_fresh_state() {
        let state = fresh(&[("lib", LIB), ("user", USER)]);
        assert_eq!(state.file_count(), 2);
        assert_eq!(state.diagnostic_count(), 1);
        assert_eq!(
            state.diagnostics()[0].code,
            DiagnosticCode::IncompatibleReturnType
        );
        assert_eq!(state.call_graph.callers("lib.make"), vec!["user.use"]);
    }

    #[test]
    fn test_change_in_dependency_rechecks_importer() {
        let mut state = fresh(&[("lib", LIB), ("user", USER)]);

        let fixed = "class C:\n    pass\n\ndef make() -> int:\n    return 1\n";
        let summary = state.apply_changes(vec![parsed("lib", fixed)], false);
        assert_eq!(summary.reparsed, 1);
        assert_eq!(summary.rechecked_modules, 2);
        assert_eq!(state.diagnostic_count(), 0);

        assert_eq!(state, fresh(&[("lib", fixed), ("user", USER)]));
    }

    #[test]
    fn test_transitive_importers_rechecked() {
        let mid = "from lib import make as build\n";
        let top = "from mid import build\n\ndef run() -> int:\n    return build()\n";
        let mut state = fresh(&[("lib", LIB), ("mid", mid), ("top", top)]);
        assert_eq!(state.diagnostic_count(), 1);

        let fixed = "def make() -> int:\n    return 1\n";
        state.apply_changes(vec![parsed("lib", fixed)], false);
        assert_eq!(state.diagnostic_count(), 0);
        assert_eq!(state, fresh(&[("lib", fixed), ("mid", mid), ("top", top)]));
    }

    #[test]
    fn test_deleted_file_drops_everything() {
        let mut state = fresh(&[("lib", LIB), ("user", USER)]);
        let summary = state.apply_changes(
            vec![(PathBuf::from("/p/user.py"), FileOutcome::Missing)],
            false,
        );
        assert_eq!(summary.removed, 1);
        assert_eq!(state.diagnostic_count(), 0);
        assert!(state.call_graph.node("user.use").is_none());
        assert!(!state.environment.has_module("user"));
        assert_eq!(state, fresh(&[("lib", LIB)]));
    }

    #[test]
    fn test_removed_name_reports_importer() {
        let mut state = fresh(&[("pkg", "x = 1\n"), ("user", "from pkg import x\n")]);
        assert_eq!(state.diagnostic_count(), 0);
        state.apply_changes(vec![parsed("pkg", "y = 1\n")], false);
        assert_eq!(
            state.diagnostics()[0].code,
            DiagnosticCode::UndefinedImport
        );
    }

    #[test]
    fn test_failure_becomes_diagnostic() {
        let mut state = fresh(&[("lib", LIB)]);
        let summary = state.apply_changes(
            vec![(
                PathBuf::from("/p/lib.py"),
                FileOutcome::Failed("stream did not contain valid UTF-8".to_string()),
            )],
            false,
        );
        assert_eq!(summary.failed, 1);
        let diagnostics = state.diagnostics();
        assert_eq!(diagnostics.len(), 1);
        assert_eq!(diagnostics[0].code, DiagnosticCode::AnalyzerInternalError);
        assert!(state.is_known(Path::new("/p/lib.py")));
        assert_eq!(state.file_count(), 0);
    }

    #[test]
    fn test_unknown_missing_path_is_noop() {
        let mut state = fresh(&[("lib", LIB)]);
        let before = state.clone();
        state.apply_changes(
            vec![(PathBuf::from("/p/other.py"), FileOutcome::Missing)],
            false,
        );
        assert_eq!(state, before);
    }

    #[test]
    fn test_bincode_round_trip() {
        let state = fresh(&[("lib", LIB), ("user", USER)]);
        let bytes = bincode::serialize(&state).unwrap();
        let loaded: AnalysisState = bincode::deserialize(&bytes).unwrap();
        assert_eq!(loaded, state);
        assert_eq!(loaded.diagnostics(), state.diagnostics());
    }
}
