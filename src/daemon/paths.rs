//! Rendezvous paths shared by every process working on one project.
//!
//! All paths are pure functions of the [`Configuration`]; independently
//! started servers and clients compute the same locations. The project
//! directory is only created when the caller asks for it.

use std::fs;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

use crate::config::Configuration;
use crate::error::Result;

const SOCKET_FILE: &str = "server.sock";
const LOCK_FILE: &str = "server.lock";
const PID_FILE: &str = "watcher.pid";
const LOG_FILE: &str = "server.log";
const SAVED_STATE_FILE: &str = "saved_state.bin";

/// `sun_path` is 108 bytes on Linux and 104 on macOS; stay under both.
const MAX_SOCKET_PATH_BYTES: usize = 100;

/// Unix socket the server listens on.
///
/// Deep project directories would overflow `sun_path`, so long paths fall
/// back to a name in the system temp directory derived from a hash of the
/// project root.
pub fn socket_path(config: &Configuration, create_directory: bool) -> Result<PathBuf> {
    let preferred = project_file(config, SOCKET_FILE, create_directory)?;
    if preferred.as_os_str().as_bytes().len() <= MAX_SOCKET_PATH_BYTES {
        return Ok(preferred);
    }
    let digest = blake3::hash(config.project_root.as_os_str().as_bytes()).to_hex();
    Ok(std::env::temp_dir().join(format!("checkd-{}.sock", &digest.as_str()[..16])))
}

/// Advisory lock file held for the server's whole lifetime.
pub fn lock_path(config: &Configuration, create_directory: bool) -> Result<PathBuf> {
    project_file(config, LOCK_FILE, create_directory)
}

/// File holding the watcher subprocess id while one runs.
pub fn pid_path(config: &Configuration, create_directory: bool) -> Result<PathBuf> {
    project_file(config, PID_FILE, create_directory)
}

pub fn log_path(config: &Configuration, create_directory: bool) -> Result<PathBuf> {
    project_file(config, LOG_FILE, create_directory)
}

/// Default location for snapshots when none is given explicitly.
pub fn saved_state_path(config: &Configuration, create_directory: bool) -> Result<PathBuf> {
    project_file(config, SAVED_STATE_FILE, create_directory)
}

fn project_file(config: &Configuration, name: &str, create_directory: bool) -> Result<PathBuf> {
    let dir = project_directory(config);
    if create_directory && !dir.exists() {
        fs::create_dir_all(dir)?;
    }
    Ok(dir.join(name))
}

fn project_directory(config: &Configuration) -> &Path {
    &config.dot_directory
}
