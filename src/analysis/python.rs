//! The Python analyzer shipped with the daemon.

use ignore::WalkBuilder;
use rayon::prelude::*;
use std::collections::BTreeSet;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, info, warn};

use super::checker::Checker;
use super::environment::Entry;
use super::state::{AnalysisState, FileOutcome};
use super::types::{RecheckSummary, Type, TypeInfo};
use super::Analyzer;
use crate::config::Configuration;
use crate::error::Result;
use crate::parser::extract_module;

#[derive(Debug, Clone, Copy, Default)]
pub struct PythonAnalyzer;

impl PythonAnalyzer {
    pub fn new() -> Self {
        Self
    }

    /// Every source file the configuration owns, sorted.
    ///
    /// Only the configuration's own excludes apply (no ignore files), so a
    /// file is walked here exactly when [`Configuration::owns_file`] accepts
    /// it and a later recheck of that path agrees with a fresh run.
    pub fn discover(&self, config: &Configuration) -> Vec<PathBuf> {
        let mut files = BTreeSet::new();
        for root in &config.search_paths {
            if !root.is_dir() {
                warn!(path = %root.display(), "search path is not a directory");
                continue;
            }
            let walker = WalkBuilder::new(root)
                .standard_filters(false)
                .follow_links(false)
                .filter_entry({
                    let config = config.clone();
                    move |entry| !config.is_excluded(entry.path())
                })
                .build();
            for entry in walker.filter_map(|e| e.ok()) {
                if entry.file_type().is_some_and(|ft| ft.is_file())
                    && config.owns_file(entry.path())
                {
                    files.insert(entry.into_path());
                }
            }
        }
        files.into_iter().collect()
    }

    fn analyze_path(config: &Configuration, path: &Path) -> FileOutcome {
        if !config.owns_file(path) {
            return FileOutcome::Missing;
        }
        let Some(module) = config.module_name(path) else {
            return FileOutcome::Missing;
        };
        match fs::read_to_string(path) {
            Ok(source) => match extract_module(path, &module, &source) {
                Ok(extraction) => FileOutcome::Parsed(extraction),
                Err(e) => FileOutcome::Failed(e.to_string()),
            },
            Err(e) if e.kind() == ErrorKind::NotFound => FileOutcome::Missing,
            Err(e) => FileOutcome::Failed(e.to_string()),
        }
    }
}

/// Absolute, symlink-free form of a reported path, so it matches the keys
/// produced by the project walk. Deleted files keep their canonical parent.
pub fn normalize_path(config: &Configuration, path: &Path) -> PathBuf {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        config.project_root.join(path)
    };
    if let Ok(canonical) = absolute.canonicalize() {
        return canonical;
    }
    match (absolute.parent(), absolute.file_name()) {
        (Some(parent), Some(name)) => parent
            .canonicalize()
            .map(|p| p.join(name))
            .unwrap_or(absolute),
        _ => absolute,
    }
}

impl Analyzer for PythonAnalyzer {
    fn analyze_fresh(&self, config: &Configuration) -> Result<AnalysisState> {
        let start = Instant::now();
        let files = self.discover(config);
        let changes: Vec<(PathBuf, FileOutcome)> = files
            .into_par_iter()
            .map(|path| {
                let outcome = Self::analyze_path(config, &path);
                (path, outcome)
            })
            .collect();

        let mut state = AnalysisState::new();
        state.apply_changes(changes, config.strict);
        info!(
            files = state.file_count(),
            diagnostics = state.diagnostic_count(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "fresh analysis complete"
        );
        Ok(state)
    }

    fn reanalyze_files(
        &self,
        config: &Configuration,
        state: &mut AnalysisState,
        paths: &[PathBuf],
    ) -> Result<RecheckSummary> {
        let paths: BTreeSet<PathBuf> = paths
            .iter()
            .map(|p| normalize_path(config, p))
            .filter(|p| config.owns_file(p) || state.is_known(p))
            .collect();
        if paths.is_empty() {
            return Ok(RecheckSummary::default());
        }

        let changes: Vec<(PathBuf, FileOutcome)> = paths
            .into_par_iter()
            .map(|path| {
                let outcome = Self::analyze_path(config, &path);
                (path, outcome)
            })
            .collect();
        debug!(files = changes.len(), "rechecking");
        Ok(state.apply_changes(changes, config.strict))
    }

    fn type_of(&self, state: &AnalysisState, expression: &str) -> Result<Option<TypeInfo>> {
        let expression = expression.trim();
        let env = &state.environment;
        let checker = Checker::new(env);
        let info = match env.lookup(expression) {
            Some(Entry::Symbol(symbol)) => Some(TypeInfo {
                expression: expression.to_string(),
                type_name: checker.symbol_type(symbol).to_string(),
                path: env.module_path(&symbol.module).map(Path::to_path_buf),
                line: Some(symbol.position.line),
            }),
            Some(Entry::Module(module)) => Some(TypeInfo {
                expression: expression.to_string(),
                type_name: Type::Module(module.to_string()).to_string(),
                path: env.module_path(module).map(Path::to_path_buf),
                line: None,
            }),
            None => None,
        };
        Ok(info)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::DiagnosticCode;

    fn project(files: &[(&str, &str)]) -> (tempfile::TempDir, Configuration) {
        let dir = tempfile::tempdir().unwrap();
        for (name, source) in files {
            let path = dir.path().join(name);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(path, source).unwrap();
        }
        let config = Configuration::discover(dir.path()).unwrap();
        (dir, config)
    }

    #[test]
    fn test_discover_skips_excluded_and_foreign_files() {
        let (_dir, config) = project(&[
            ("a.py", ""),
            ("pkg/__init__.py", ""),
            ("pkg/b.py", ""),
            ("notes.txt", ""),
            (".venv/lib/site.py", ""),
            (".checkd/junk.py", ""),
        ]);
        let files = PythonAnalyzer::new().discover(&config);
        let names: Vec<_> = files
            .iter()
            .map(|p| p.strip_prefix(&config.project_root).unwrap().to_path_buf())
            .collect();
        assert_eq!(
            names,
            vec![
                PathBuf::from("a.py"),
                PathBuf::from("pkg/__init__.py"),
                PathBuf::from("pkg/b.py")
            ]
        );
    }

    #[test]
    fn test_fresh_and_query() {
        let (_dir, config) = project(&[(
            "a.py",
            "class C:\n    pass\n\nclass D:\n    pass\n\ndef foo(d: D) -> C:\n    return d\n\nx = C()\n",
        )]);
        let analyzer = PythonAnalyzer::new();
        let state = analyzer.analyze_fresh(&config).unwrap();
        assert_eq!(state.diagnostic_count(), 1);

        let info = analyzer.type_of(&state, "a.x").unwrap().unwrap();
        assert_eq!(info.type_name, "a.C");
        assert_eq!(info.line, Some(10));
        assert_eq!(
            analyzer.type_of(&state, "a.C").unwrap().unwrap().type_name,
            "type[a.C]"
        );
        assert!(analyzer.type_of(&state, "a.nothing").unwrap().is_none());
    }

    #[test]
    fn test_reanalyze_matches_fresh() {
        let (dir, config) = project(&[
            ("lib.py", "def make() -> int:\n    return 1\n"),
            ("user.py", "from lib import make\n\ndef go() -> int:\n    return make()\n"),
        ]);
        let analyzer = PythonAnalyzer::new();
        let mut state = analyzer.analyze_fresh(&config).unwrap();
        assert_eq!(state.diagnostic_count(), 0);

        fs::write(dir.path().join("lib.py"), "def make() -> str:\n    return 's'\n").unwrap();
        fs::write(dir.path().join("new.py"), "y: int = 'no'\n").unwrap();
        let summary = analyzer
            .reanalyze_files(
                &config,
                &mut state,
                &[PathBuf::from("lib.py"), dir.path().join("new.py")],
            )
            .unwrap();
        assert_eq!(summary.reparsed, 2);

        let fresh = analyzer.analyze_fresh(&config).unwrap();
        assert_eq!(state, fresh);
        assert_eq!(state.diagnostic_count(), 2);
    }

    #[test]
    fn test_reanalyze_deleted_and_ignored_paths() {
        let (dir, config) = project(&[("a.py", "x: int = 's'\n"), ("b.py", "")]);
        let analyzer = PythonAnalyzer::new();
        let mut state = analyzer.analyze_fresh(&config).unwrap();
        assert_eq!(state.diagnostic_count(), 1);

        fs::remove_file(dir.path().join("a.py")).unwrap();
        let summary = analyzer
            .reanalyze_files(
                &config,
                &mut state,
                &[dir.path().join("a.py"), dir.path().join("README.md")],
            )
            .unwrap();
        assert_eq!(summary.removed, 1);
        assert_eq!(state.diagnostic_count(), 0);
        assert_eq!(state.file_count(), 1);
    }

    #[test]
    fn test_undecodable_file_is_internal_error() {
        let (dir, config) = project(&[("a.py", "")]);
        fs::write(dir.path().join("bad.py"), [0xff, 0xfe, 0x00]).unwrap();
        let state = PythonAnalyzer::new().analyze_fresh(&config).unwrap();
        let diagnostics = state.diagnostics();
        assert_eq!(diagnostics.len(), 1);
        assert_eq!(diagnostics[0].code, DiagnosticCode::AnalyzerInternalError);
    }
}
