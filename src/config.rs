//! Configuration
//!
//! Paths come from built-in defaults, the shell-style rc config file
//! (`/etc/conf.d/rc`) and command-line overrides, in that order.

use std::path::{Path, PathBuf};

use crate::cache::CACHE_FILE_NAME;

/// Shell-style file holding `svcdir=...`
pub const RC_CONF_FILE: &str = "/etc/conf.d/rc";
/// Key naming the service directory
pub const SVCDIR_ENTRY: &str = "svcdir";

pub const DEFAULT_SVCDIR: &str = "/var/lib/init.d";
pub const DEFAULT_INIT_DIR: &str = "/etc/init.d";
pub const DEFAULT_RUNLEVELS_DIR: &str = "/etc/runlevels";

/// Read one `KEY=value` entry from a shell-style config file.
///
/// Blank lines and `#` comments are skipped, an `export ` prefix is
/// accepted and quoting is removed the way a shell would. When a key is
/// assigned more than once the last assignment wins.
pub fn get_config_entry(file: &Path, key: &str) -> Result<Option<String>, ConfigError> {
    let content = std::fs::read_to_string(file).map_err(|source| ConfigError::Read {
        path: file.display().to_string(),
        source,
    })?;

    let mut found = None;
    for (idx, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let line = line.strip_prefix("export ").unwrap_or(line).trim_start();
        let Some((name, value)) = line.split_once('=') else {
            continue;
        };
        if name != key {
            continue;
        }

        let words = shlex::split(value).ok_or_else(|| ConfigError::Quoting {
            path: file.display().to_string(),
            line: idx + 1,
        })?;
        found = Some(words.join(" "));
    }
    Ok(found)
}

/// Like [`get_config_entry`], but a missing or empty entry is an error
pub fn require_config_entry(file: &Path, key: &str) -> Result<String, ConfigError> {
    match get_config_entry(file, key)? {
        Some(value) if !value.is_empty() => Ok(value),
        _ => Err(ConfigError::MissingEntry {
            path: file.display().to_string(),
            key: key.to_string(),
        }),
    }
}

/// Locations the manager works with
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    /// Root of the var-directory skeleton and the cache
    pub svcdir: PathBuf,
    /// Cache file name inside `svcdir`
    pub cache_file: String,
    /// Where init scripts live
    pub init_dir: PathBuf,
    /// One subdirectory per runlevel
    pub runlevels_dir: PathBuf,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            svcdir: PathBuf::from(DEFAULT_SVCDIR),
            cache_file: CACHE_FILE_NAME.to_string(),
            init_dir: PathBuf::from(DEFAULT_INIT_DIR),
            runlevels_dir: PathBuf::from(DEFAULT_RUNLEVELS_DIR),
        }
    }
}

impl Settings {
    /// Defaults with `svcdir` taken from the rc config file
    pub fn from_config_file(path: &Path) -> Result<Self, ConfigError> {
        let svcdir = require_config_entry(path, SVCDIR_ENTRY)?;
        log::debug!("svcdir is {} (from {})", svcdir, path.display());
        Ok(Self {
            svcdir: PathBuf::from(svcdir),
            ..Self::default()
        })
    }

    /// Settings rooted in a single directory, for sandboxes and tests
    pub fn rooted(root: &Path) -> Self {
        Self {
            svcdir: root.join("svcdir"),
            cache_file: CACHE_FILE_NAME.to_string(),
            init_dir: root.join("init.d"),
            runlevels_dir: root.join("runlevels"),
        }
    }

    pub fn cache_path(&self) -> PathBuf {
        self.svcdir.join(&self.cache_file)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to get config entry '{key}' from {path}")]
    MissingEntry { path: String, key: String },

    #[error("{path}:{line}: unbalanced quotes")]
    Quoting { path: String, line: usize },
}
