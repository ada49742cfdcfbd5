//! Project and server configuration.
//!
//! A [`Configuration`] identifies *what* is analyzed; a
//! [`ServerConfiguration`] adds *how* one daemon invocation starts
//! (fresh, save a snapshot, or restore one). Only the analysis-relevant part
//! of a configuration, its [`ConfigurationFingerprint`], is stored inside
//! saved state and compared on load.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use crate::error::{CheckdError, Result};
use crate::watcher::WatcherKind;

/// Optional per-project settings file, looked up in the project root.
pub const PROJECT_CONFIG_FILE: &str = ".checkd.toml";

/// Default rendezvous directory name, relative to the project root.
pub const DEFAULT_DOT_DIRECTORY: &str = ".checkd";

/// Default Python language version assumed by the analyzer.
pub const DEFAULT_PYTHON_VERSION: &str = "3.12";

/// How long in-flight dispatches get to finish once shutdown starts.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_millis(500);

/// Directories never analyzed.
const DEFAULT_EXCLUDES: &[&str] = &[
    ".git",
    "node_modules",
    "__pycache__",
    ".venv",
    "venv",
    ".mypy_cache",
    "dist",
    "build",
];

/// Immutable description of a project to analyze.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Configuration {
    /// Absolute project root.
    pub project_root: PathBuf,
    /// Directory holding lock, pid, log, socket and saved-state files.
    pub dot_directory: PathBuf,
    /// Roots that module names are resolved against. Absolute.
    pub search_paths: Vec<PathBuf>,
    /// Directory names skipped while walking the project.
    pub excludes: Vec<String>,
    /// Report missing annotations.
    pub strict: bool,
    pub python_version: String,
}

/// The subset of a [`Configuration`] that determines analysis results.
///
/// The project root and the rendezvous directory are deliberately absent:
/// two checkouts of the same project at different paths produce
/// interchangeable snapshots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigurationFingerprint {
    pub analyzer_version: String,
    pub python_version: String,
    pub strict: bool,
    /// Search paths relative to the project root where possible.
    pub search_paths: Vec<PathBuf>,
    pub excludes: Vec<String>,
}

impl ConfigurationFingerprint {
    /// Short stable digest, used in status output and logs.
    pub fn digest(&self) -> String {
        let encoded = serde_json::to_vec(self).unwrap_or_default();
        let hash = blake3::hash(&encoded).to_hex();
        hash.as_str()[..16].to_string()
    }
}

impl Configuration {
    /// Configuration with default settings for `project_root`.
    pub fn new(project_root: impl Into<PathBuf>) -> Self {
        let project_root = project_root.into();
        Self {
            dot_directory: project_root.join(DEFAULT_DOT_DIRECTORY),
            search_paths: vec![project_root.clone()],
            excludes: DEFAULT_EXCLUDES.iter().map(|s| s.to_string()).collect(),
            strict: false,
            python_version: DEFAULT_PYTHON_VERSION.to_string(),
            project_root,
        }
    }

    /// Canonicalize `root` and apply `.checkd.toml` if the project has one.
    pub fn discover(root: &Path) -> Result<Self> {
        let root = root.canonicalize()?;
        let mut configuration = Self::new(&root);
        if let Some(file) = ProjectFile::load(&root)? {
            file.apply_to(&mut configuration);
        }
        Ok(configuration)
    }

    pub fn with_search_paths(mut self, paths: Vec<PathBuf>) -> Self {
        if !paths.is_empty() {
            self.search_paths = paths
                .into_iter()
                .map(|p| absolutize(&self.project_root, &p))
                .collect();
        }
        self
    }

    pub fn with_strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    pub fn with_dot_directory(mut self, dir: impl AsRef<Path>) -> Self {
        self.dot_directory = absolutize(&self.project_root, dir.as_ref());
        self
    }

    pub fn fingerprint(&self) -> ConfigurationFingerprint {
        ConfigurationFingerprint {
            analyzer_version: env!("CARGO_PKG_VERSION").to_string(),
            python_version: self.python_version.clone(),
            strict: self.strict,
            search_paths: self
                .search_paths
                .iter()
                .map(|p| {
                    p.strip_prefix(&self.project_root)
                        .map(Path::to_path_buf)
                        .unwrap_or_else(|_| p.clone())
                })
                .collect(),
            excludes: self.excludes.clone(),
        }
    }

    /// Fail with [`CheckdError::IncompatibleState`] unless a snapshot taken
    /// under `stored` may be reused by this configuration.
    pub fn check_compatible(&self, stored: &ConfigurationFingerprint) -> Result<()> {
        let current = self.fingerprint();
        let reason = if stored.analyzer_version != current.analyzer_version {
            format!(
                "analyzer version differs (snapshot {}, current {})",
                stored.analyzer_version, current.analyzer_version
            )
        } else if stored.python_version != current.python_version {
            format!(
                "python version differs (snapshot {}, current {})",
                stored.python_version, current.python_version
            )
        } else if stored.strict != current.strict {
            format!(
                "strict mode differs (snapshot {}, current {})",
                stored.strict, current.strict
            )
        } else if stored.search_paths != current.search_paths {
            format!(
                "search paths differ (snapshot {:?}, current {:?})",
                stored.search_paths, current.search_paths
            )
        } else if stored.excludes != current.excludes {
            format!(
                "excludes differ (snapshot {:?}, current {:?})",
                stored.excludes, current.excludes
            )
        } else {
            return Ok(());
        };
        Err(CheckdError::IncompatibleState(reason))
    }

    /// Whether any component of `path` is an excluded directory or the
    /// rendezvous directory.
    pub fn is_excluded(&self, path: &Path) -> bool {
        if path.starts_with(&self.dot_directory) {
            return true;
        }
        let relative = path.strip_prefix(&self.project_root).unwrap_or(path);
        relative.components().any(|component| match component {
            Component::Normal(name) => {
                let name = name.to_string_lossy();
                self.excludes.iter().any(|e| e.as_str() == name.as_ref())
            }
            _ => false,
        })
    }

    /// Whether `path` is a source file this configuration analyzes.
    pub fn owns_file(&self, path: &Path) -> bool {
        path.extension().is_some_and(|ext| ext == "py")
            && !self.is_excluded(path)
            && self.search_root_for(path).is_some()
    }

    /// Dotted module name of `path`, resolved against the deepest search
    /// path that contains it.
    pub fn module_name(&self, path: &Path) -> Option<String> {
        let root = self.search_root_for(path)?;
        let relative = path.strip_prefix(root).ok()?.with_extension("");
        let mut parts: Vec<String> = relative
            .components()
            .filter_map(|c| match c {
                Component::Normal(name) => Some(name.to_string_lossy().to_string()),
                _ => None,
            })
            .collect();
        if parts.last().is_some_and(|last| last == "__init__") {
            parts.pop();
        }
        if parts.is_empty() {
            return None;
        }
        Some(parts.join("."))
    }

    fn search_root_for(&self, path: &Path) -> Option<&Path> {
        self.search_paths
            .iter()
            .filter(|root| path.starts_with(root))
            .max_by_key(|root| root.components().count())
            .map(PathBuf::as_path)
    }
}

/// What a daemon does with saved state when it starts.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SavedStateAction {
    #[default]
    None,
    /// Write a snapshot once initialization completes.
    Save(PathBuf),
    /// Restore from `snapshot`, then recheck the files listed in
    /// `changed_files` (absent means no changes).
    Load {
        snapshot: PathBuf,
        changed_files: Option<PathBuf>,
    },
}

/// Everything one daemon invocation needs. Immutable once built.
#[derive(Debug, Clone)]
pub struct ServerConfiguration {
    pub configuration: Configuration,
    pub saved_state: SavedStateAction,
    pub watcher: WatcherKind,
    pub grace_period: Duration,
}

impl ServerConfiguration {
    pub fn new(configuration: Configuration) -> Self {
        Self {
            configuration,
            saved_state: SavedStateAction::None,
            watcher: WatcherKind::None,
            grace_period: DEFAULT_GRACE_PERIOD,
        }
    }

    pub fn with_saved_state(mut self, action: SavedStateAction) -> Self {
        self.saved_state = action;
        self
    }

    pub fn with_watcher(mut self, watcher: WatcherKind) -> Self {
        self.watcher = watcher;
        self
    }
}

/// Contents of `.checkd.toml`.
///
/// ```toml
/// search_paths = ["src"]
/// strict = true
///
/// [watcher]
/// command = ["watchman-wait", "--fields", "name", "."]
/// ```
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProjectFile {
    pub search_paths: Option<Vec<PathBuf>>,
    pub excludes: Option<Vec<String>>,
    pub strict: Option<bool>,
    pub python_version: Option<String>,
    pub dot_directory: Option<PathBuf>,
    pub watcher: Option<WatcherSection>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WatcherSection {
    /// `"none"` or `"native"`; ignored when `command` is set.
    pub kind: Option<String>,
    pub command: Option<Vec<String>>,
}

impl ProjectFile {
    /// Read `<root>/.checkd.toml`, if present.
    pub fn load(root: &Path) -> Result<Option<Self>> {
        let path = root.join(PROJECT_CONFIG_FILE);
        if !path.exists() {
            return Ok(None);
        }
        let text = fs::read_to_string(&path)?;
        Self::parse(&text)
            .map(Some)
            .map_err(|e| CheckdError::Config(format!("{}: {}", path.display(), e)))
    }

    pub fn parse(text: &str) -> std::result::Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    pub fn apply_to(&self, configuration: &mut Configuration) {
        if let Some(paths) = &self.search_paths {
            *configuration = configuration.clone().with_search_paths(paths.clone());
        }
        if let Some(excludes) = &self.excludes {
            configuration.excludes = excludes.clone();
        }
        if let Some(strict) = self.strict {
            configuration.strict = strict;
        }
        if let Some(version) = &self.python_version {
            configuration.python_version = version.clone();
        }
        if let Some(dir) = &self.dot_directory {
            *configuration = configuration.clone().with_dot_directory(dir);
        }
    }

    pub fn watcher_kind(&self) -> Result<Option<WatcherKind>> {
        let Some(section) = &self.watcher else {
            return Ok(None);
        };
        if let Some(command) = &section.command {
            if command.is_empty() {
                return Err(CheckdError::Config("watcher command is empty".to_string()));
            }
            return Ok(Some(WatcherKind::Command(command.clone())));
        }
        match section.kind.as_deref() {
            None => Ok(None),
            Some(kind) => kind.parse().map(Some),
        }
    }
}

fn absolutize(root: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        root.join(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_module_name_resolution() {
        let config = Configuration::new("/proj");
        assert_eq!(config.module_name(Path::new("/proj/a.py")).as_deref(), Some("a"));
        assert_eq!(
            config.module_name(Path::new("/proj/pkg/b.py")).as_deref(),
            Some("pkg.b")
        );
        assert_eq!(
            config.module_name(Path::new("/proj/pkg/__init__.py")).as_deref(),
            Some("pkg")
        );
        assert_eq!(config.module_name(Path::new("/elsewhere/c.py")), None);
    }

    #[test]
    fn test_deepest_search_path_wins() {
        let config = Configuration::new("/proj")
            .with_search_paths(vec![PathBuf::from("."), PathBuf::from("src")]);
        assert_eq!(
            config.module_name(Path::new("/proj/src/app/main.py")).as_deref(),
            Some("app.main")
        );
    }

    #[test]
    fn test_owns_file_respects_excludes_and_dot_directory() {
        let config = Configuration::new("/proj");
        assert!(config.owns_file(Path::new("/proj/a.py")));
        assert!(!config.owns_file(Path::new("/proj/a.txt")));
        assert!(!config.owns_file(Path::new("/proj/.venv/lib/x.py")));
        assert!(!config.owns_file(Path::new("/proj/.checkd/x.py")));
        assert!(!config.owns_file(Path::new("/other/a.py")));
    }

    #[test]
    fn test_fingerprint_ignores_root() {
        let a = Configuration::new("/checkout/one");
        let b = Configuration::new("/checkout/two");
        assert_eq!(a.fingerprint(), b.fingerprint());
        assert!(b.check_compatible(&a.fingerprint()).is_ok());
    }

    #[test]
    fn test_fingerprint_includes_flags() {
        let lax = Configuration::new("/proj");
        let strict = Configuration::new("/proj").with_strict(true);
        let err = strict.check_compatible(&lax.fingerprint()).unwrap_err();
        match err {
            CheckdError::IncompatibleState(reason) => assert!(reason.contains("strict")),
            other => panic!("expected IncompatibleState, got {other:?}"),
        }
    }

    #[test]
    fn test_search_paths_affect_compatibility() {
        let base = Configuration::new("/proj");
        let narrowed = Configuration::new("/proj").with_search_paths(vec![PathBuf::from("src")]);
        assert!(narrowed.check_compatible(&base.fingerprint()).is_err());
        assert_ne!(base.fingerprint().digest(), narrowed.fingerprint().digest());
    }

    #[test]
    fn test_project_file_applies() {
        let file = ProjectFile::parse(
            r#"
search_paths = ["src"]
strict = true
python_version = "3.11"

[watcher]
command = ["my-watcher", "--stdout"]
"#,
        )
        .unwrap();

        let mut config = Configuration::new("/proj");
        file.apply_to(&mut config);
        assert_eq!(config.search_paths, vec![PathBuf::from("/proj/src")]);
        assert!(config.strict);
        assert_eq!(config.python_version, "3.11");
        assert_eq!(
            file.watcher_kind().unwrap(),
            Some(WatcherKind::Command(vec![
                "my-watcher".to_string(),
                "--stdout".to_string()
            ]))
        );
    }

    #[test]
    fn test_project_file_rejects_unknown_keys() {
        assert!(ProjectFile::parse("colour = \"blue\"").is_err());
    }

    #[test]
    fn test_discover_reads_project_file() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(PROJECT_CONFIG_FILE), "strict = true\n").unwrap();
        let config = Configuration::discover(dir.path()).unwrap();
        assert!(config.strict);
        assert_eq!(config.project_root, dir.path().canonicalize().unwrap());
    }
}
