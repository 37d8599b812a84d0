//! Central path resolution for SiteSync data files.
//!
//! Resolved once at startup from: CLI `--data-dir` > `SITESYNC_DATA_DIR` env > `~/.sitesync`.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

static DATA_DIR: RwLock<Option<PathBuf>> = RwLock::new(None);

const DEFAULT_DIR_NAME: &str = ".sitesync";

/// Initialize the global data directory. Returns the resolved path.
///
/// Priority: `explicit` arg > `SITESYNC_DATA_DIR` env > `~/.sitesync`, falling
/// back to the system temp dir when there is no home directory.
pub fn init_data_dir(explicit: Option<&Path>) -> PathBuf {
    let dir = resolve_data_dir(explicit, std::env::var("SITESYNC_DATA_DIR").ok());

    match DATA_DIR.write() {
        Ok(mut guard) => *guard = Some(dir.clone()),
        Err(poisoned) => *poisoned.into_inner() = Some(dir.clone()),
    }
    dir
}

fn resolve_data_dir(explicit: Option<&Path>, env_value: Option<String>) -> PathBuf {
    if let Some(p) = explicit {
        p.to_path_buf()
    } else if let Some(env_val) = env_value.filter(|v| !v.is_empty()) {
        PathBuf::from(env_val)
    } else {
        dirs::home_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join(DEFAULT_DIR_NAME)
    }
}

/// Current data directory. Resolves from the environment if
/// `init_data_dir` has not run yet.
pub fn data_dir() -> PathBuf {
    let current = match DATA_DIR.read() {
        Ok(guard) => guard.clone(),
        Err(poisoned) => poisoned.into_inner().clone(),
    };
    current.unwrap_or_else(|| init_data_dir(None))
}

pub fn log_dir() -> PathBuf {
    data_dir().join("logs")
}

pub fn token_file_path() -> PathBuf {
    data_dir().join("auth-token")
}

/// Create all required subdirectories under the data dir.
pub fn ensure_dirs() -> io::Result<()> {
    let base = data_dir();
    std::fs::create_dir_all(&base)?;
    std::fs::create_dir_all(base.join("logs"))?;
    Ok(())
}
