//! Saved state: snapshot and restore of the analysis state.
//!
//! File layout:
//!
//! ```text
//! b"CHKD" | format version (u32 BE) | fingerprint length (u32 BE)
//!         | bincode(ConfigurationFingerprint) | bincode(AnalysisState)
//! ```
//!
//! The fingerprint sits in front of the state so a load can reject an
//! incompatible snapshot before decoding (let alone installing) any of it.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, info};
use uuid::Uuid;

use crate::analysis::{AnalysisState, Analyzer, RecheckSummary};
use crate::config::{Configuration, ConfigurationFingerprint};
use crate::error::{CheckdError, Result};

const MAGIC: &[u8; 4] = b"CHKD";
const FORMAT_VERSION: u32 = 1;
const HEADER_LEN: usize = 12;

/// Write `state`, computed under `config`, to `path` atomically.
pub fn save(state: &AnalysisState, config: &Configuration, path: &Path) -> Result<()> {
    info!(path = %path.display(), files = state.file_count(), "saving state");

    let fingerprint = bincode::serialize(&config.fingerprint())
        .map_err(|e| CheckdError::Serialize(e.to_string()))?;
    let body = bincode::serialize(state).map_err(|e| CheckdError::Serialize(e.to_string()))?;

    let mut bytes = Vec::with_capacity(HEADER_LEN + fingerprint.len() + body.len());
    bytes.extend_from_slice(MAGIC);
    bytes.extend_from_slice(&FORMAT_VERSION.to_be_bytes());
    bytes.extend_from_slice(&(fingerprint.len() as u32).to_be_bytes());
    bytes.extend_from_slice(&fingerprint);
    bytes.extend_from_slice(&body);

    let tmp_path = temporary_path(path);
    if let Err(e) = write_synced(&tmp_path, &bytes).and_then(|()| fs::rename(&tmp_path, path)) {
        let _ = fs::remove_file(&tmp_path);
        return Err(e.into());
    }

    debug!(bytes = bytes.len(), "state saved");
    Ok(())
}

/// A snapshot read into memory whose state has not been decoded yet.
#[derive(Debug)]
pub struct Snapshot {
    path: PathBuf,
    pub fingerprint: ConfigurationFingerprint,
    body: Vec<u8>,
}

impl Snapshot {
    /// Read and validate the header of the snapshot at `path`.
    pub fn read(path: &Path) -> Result<Self> {
        let corrupt = |reason: String| CheckdError::CorruptSnapshot {
            path: path.to_path_buf(),
            reason,
        };

        let bytes = fs::read(path).map_err(|e| corrupt(format!("cannot read: {e}")))?;
        if bytes.len() < HEADER_LEN || &bytes[..4] != MAGIC {
            return Err(corrupt("not a saved-state file".to_string()));
        }

        let version = u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        if version != FORMAT_VERSION {
            return Err(CheckdError::IncompatibleState(format!(
                "snapshot format version {version}, expected {FORMAT_VERSION}"
            )));
        }

        let fingerprint_len = u32::from_be_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]) as usize;
        let fingerprint_end = HEADER_LEN
            .checked_add(fingerprint_len)
            .filter(|end| *end <= bytes.len())
            .ok_or_else(|| corrupt("truncated fingerprint".to_string()))?;
        let fingerprint: ConfigurationFingerprint =
            bincode::deserialize(&bytes[HEADER_LEN..fingerprint_end])
                .map_err(|e| corrupt(format!("fingerprint: {e}")))?;

        Ok(Self {
            path: path.to_path_buf(),
            fingerprint,
            body: bytes[fingerprint_end..].to_vec(),
        })
    }

    /// Decode the state, provided `config` may use it.
    pub fn into_state(self, config: &Configuration) -> Result<AnalysisState> {
        config.check_compatible(&self.fingerprint)?;
        bincode::deserialize(&self.body).map_err(|e| CheckdError::CorruptSnapshot {
            path: self.path,
            reason: format!("state: {e}"),
        })
    }
}

/// State restored from a snapshot, with the changed files applied.
#[derive(Debug)]
pub struct LoadedState {
    pub state: AnalysisState,
    pub changed_files: usize,
    pub summary: RecheckSummary,
}

/// Restore the snapshot at `snapshot` and fold in `changed_files`.
///
/// Nothing is returned unless the snapshot is compatible and decodes
/// cleanly, so a failed load leaves the caller exactly as it was.
pub fn load(
    config: &Configuration,
    analyzer: &dyn Analyzer,
    snapshot: &Path,
    changed_files: Option<&Path>,
) -> Result<LoadedState> {
    let start = Instant::now();
    info!(path = %snapshot.display(), "loading saved state");

    let mut state = Snapshot::read(snapshot)?.into_state(config)?;
    let changed = match changed_files {
        Some(path) => read_changed_files(path, &config.project_root)?,
        None => Vec::new(),
    };

    let summary = if changed.is_empty() {
        RecheckSummary::default()
    } else {
        analyzer.reanalyze_files(config, &mut state, &changed)?
    };

    info!(
        files = state.file_count(),
        changed = changed.len(),
        rechecked = summary.rechecked_modules,
        elapsed_ms = start.elapsed().as_millis() as u64,
        "saved state loaded"
    );
    Ok(LoadedState {
        state,
        changed_files: changed.len(),
        summary,
    })
}

/// One path per line; blank lines are skipped and relative paths are
/// taken relative to `root`.
pub fn read_changed_files(path: &Path, root: &Path) -> Result<Vec<PathBuf>> {
    let text = fs::read_to_string(path)?;
    Ok(text
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| {
            let p = PathBuf::from(line);
            if p.is_absolute() {
                p
            } else {
                root.join(p)
            }
        })
        .collect())
}

fn write_synced(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let mut file = fs::File::create(path)?;
    file.write_all(bytes)?;
    file.sync_all()
}

/// Sibling of `path`, unique per call so concurrent saves never share it.
fn temporary_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(format!(".{}.tmp", Uuid::new_v4().simple()));
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::PythonAnalyzer;

    fn project(source: &str) -> (tempfile::TempDir, Configuration, AnalysisState) {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.py"), source).unwrap();
        let config = Configuration::discover(dir.path()).unwrap();
        let state = PythonAnalyzer::new().analyze_fresh(&config).unwrap();
        (dir, config, state)
    }

    fn leftover_temporaries(dir: &Path) -> Vec<PathBuf> {
        fs::read_dir(dir)
            .unwrap()
            .map(|entry| entry.unwrap().path())
            .filter(|p| p.extension().is_some_and(|ext| ext == "tmp"))
            .collect()
    }

    #[test]
    fn test_save_load_round_trip() {
        let (dir, config, state) = project("def f() -> int:\n    return 's'\n");
        let path = dir.path().join("state.bin");
        save(&state, &config, &path).unwrap();
        assert!(leftover_temporaries(dir.path()).is_empty());

        let loaded = load(&config, &PythonAnalyzer::new(), &path, None).unwrap();
        assert_eq!(loaded.state, state);
        assert_eq!(loaded.changed_files, 0);
        assert_eq!(loaded.state.diagnostic_count(), 1);
    }

    #[test]
    fn test_incompatible_rejected_before_decoding() {
        let (dir, config, state) = project("x = 1\n");
        let path = dir.path().join("state.bin");
        save(&state, &config, &path).unwrap();

        // Corrupt the body: a compatible load would report corruption, an
        // incompatible one must not get that far.
        let mut bytes = fs::read(&path).unwrap();
        let len = bytes.len();
        bytes.truncate(len - 3);
        fs::write(&path, bytes).unwrap();

        let strict = config.clone().with_strict(true);
        let err = load(&strict, &PythonAnalyzer::new(), &path, None).unwrap_err();
        assert!(matches!(err, CheckdError::IncompatibleState(_)), "{err:?}");

        let err = load(&config, &PythonAnalyzer::new(), &path, None).unwrap_err();
        assert!(matches!(err, CheckdError::CorruptSnapshot { .. }), "{err:?}");
    }

    #[test]
    fn test_garbage_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let config = Configuration::discover(dir.path()).unwrap();
        let path = dir.path().join("state.bin");
        fs::write(&path, b"definitely not a snapshot").unwrap();
        assert!(matches!(
            Snapshot::read(&path),
            Err(CheckdError::CorruptSnapshot { .. })
        ));
        assert!(matches!(
            load(&config, &PythonAnalyzer::new(), &dir.path().join("missing.bin"), None),
            Err(CheckdError::CorruptSnapshot { .. })
        ));
    }

    #[test]
    fn test_format_version_mismatch_is_incompatible() {
        let (dir, config, state) = project("");
        let path = dir.path().join("state.bin");
        save(&state, &config, &path).unwrap();
        let mut bytes = fs::read(&path).unwrap();
        bytes[4..8].copy_from_slice(&99u32.to_be_bytes());
        fs::write(&path, bytes).unwrap();
        assert!(matches!(
            Snapshot::read(&path),
            Err(CheckdError::IncompatibleState(_))
        ));
    }

    #[test]
    fn test_load_applies_changed_files() {
        let (dir, config, state) = project("def f() -> int:\n    return 's'\n");
        let path = dir.path().join("state.bin");
        save(&state, &config, &path).unwrap();

        fs::write(dir.path().join("a.py"), "def f() -> int:\n    return 1\n").unwrap();
        let changed = dir.path().join("changed.txt");
        fs::write(&changed, "\na.py\n\n").unwrap();

        let analyzer = PythonAnalyzer::new();
        let loaded = load(&config, &analyzer, &path, Some(&changed)).unwrap();
        assert_eq!(loaded.changed_files, 1);
        assert_eq!(loaded.state.diagnostic_count(), 0);
        assert_eq!(loaded.state, analyzer.analyze_fresh(&config).unwrap());
    }

    #[test]
    fn test_read_changed_files() {
        let dir = tempfile::tempdir().unwrap();
        let list = dir.path().join("changed");
        fs::write(&list, "/abs/a.py\n  \nrel/b.py\n").unwrap();
        assert_eq!(
            read_changed_files(&list, Path::new("/root")).unwrap(),
            vec![PathBuf::from("/abs/a.py"), PathBuf::from("/root/rel/b.py")]
        );
        fs::write(&list, "").unwrap();
        assert!(read_changed_files(&list, Path::new("/root")).unwrap().is_empty());
    }

    #[test]
    fn test_temporary_paths_are_unique_siblings() {
        let path = Path::new("/state/snap.bin");
        let (a, b) = (temporary_path(path), temporary_path(path));
        assert_ne!(a, b);
        assert_eq!(a.parent(), path.parent());
        assert!(a.to_string_lossy().starts_with("/state/snap.bin."));
    }

    #[test]
    fn test_concurrent_saves_to_one_path() {
        let (dir, config, state) = project("def f() -> int:\n    return 's'\n");
        let path = dir.path().join("state.bin");
        std::thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|_| scope.spawn(|| save(&state, &config, &path)))
                .collect();
            for handle in handles {
                handle.join().unwrap().unwrap();
            }
        });

        let loaded = load(&config, &PythonAnalyzer::new(), &path, None).unwrap();
        assert_eq!(loaded.state, state);
        assert!(leftover_temporaries(dir.path()).is_empty());
    }

    #[test]
    fn test_failed_rename_removes_temporary() {
        let (dir, config, state) = project("");
        // A non-empty directory cannot be replaced by a file.
        let target = dir.path().join("state.bin");
        fs::create_dir(&target).unwrap();
        fs::write(target.join("keep"), "").unwrap();

        assert!(matches!(
            save(&state, &config, &target),
            Err(CheckdError::Io(_))
        ));
        assert!(leftover_temporaries(dir.path()).is_empty());
        assert!(target.join("keep").exists());
    }

    #[test]
    fn test_save_to_unwritable_target_is_io_error() {
        let (dir, config, state) = project("");
        let target = dir.path().join("no-such-dir").join("state.bin");
        assert!(matches!(
            save(&state, &config, &target),
            Err(CheckdError::Io(_))
        ));
    }
}
