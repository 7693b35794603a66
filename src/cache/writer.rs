//! Atomic cache replacement
//!
//! The new cache is written to `<name>.XXXXXX` next to the final path,
//! synced, then renamed over the old one. Readers see either the old file
//! or the complete new one. Until the rename the temporary file belongs to a
//! [`StagedCache`]; dropping it uncommitted removes the file.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use tempfile::NamedTempFile;

/// Leftover temporary files older than this are assumed to belong to a
/// killed writer
pub const STALE_TEMP_AGE: Duration = Duration::from_secs(300);

/// Length of the random suffix on temporary cache files
const TEMP_SUFFIX_LEN: usize = 6;

/// A fully written and synced temporary file awaiting rename
#[derive(Debug)]
pub struct StagedCache {
    temp: NamedTempFile,
    final_path: PathBuf,
}

impl StagedCache {
    pub fn temp_path(&self) -> &Path {
        self.temp.path()
    }

    pub fn final_path(&self) -> &Path {
        &self.final_path
    }

    /// Rename the staged file over the final path
    pub fn commit(self) -> Result<(), CacheWriteError> {
        let from = self.temp.path().display().to_string();
        let final_path = self.final_path;

        // On failure the returned error owns the temp file and removes it on drop
        self.temp
            .persist(&final_path)
            .map_err(|e| CacheWriteError::Rename {
                from,
                to: final_path.display().to_string(),
                source: e.error,
            })?;

        // The rename already happened; a failed directory sync only weakens durability
        if let Some(dir) = final_path.parent() {
            if let Err(e) = sync_dir(dir) {
                log::warn!("Failed to sync directory {}: {}", dir.display(), e);
            }
        }

        log::debug!("Committed cache {}", final_path.display());
        Ok(())
    }
}

/// Write `payload` to a temporary file beside `final_path` and sync it
pub fn stage(final_path: &Path, payload: &[u8]) -> Result<StagedCache, CacheWriteError> {
    let (dir, file_name) = split(final_path)?;

    let mut temp = tempfile::Builder::new()
        .prefix(&format!("{}.", file_name))
        .rand_bytes(TEMP_SUFFIX_LEN)
        .tempfile_in(dir)
        .map_err(|source| CacheWriteError::CreateTemp {
            dir: dir.display().to_string(),
            source,
        })?;

    let temp_display = temp.path().display().to_string();
    temp.write_all(payload)
        .and_then(|_| temp.flush())
        .map_err(|source| CacheWriteError::Write {
            path: temp_display.clone(),
            source,
        })?;
    temp.as_file()
        .sync_all()
        .map_err(|source| CacheWriteError::Sync {
            path: temp_display,
            source,
        })?;

    Ok(StagedCache {
        temp,
        final_path: final_path.to_path_buf(),
    })
}

/// Replace `final_path` with `payload`, or leave it untouched on error
pub fn commit(final_path: &Path, payload: &[u8]) -> Result<(), CacheWriteError> {
    stage(final_path, payload)?.commit()
}

/// Remove temporary files a killed writer left beside `final_path`.
///
/// Only files older than [`STALE_TEMP_AGE`] are touched so a concurrent
/// writer's staged file survives. Returns the number of files removed.
pub fn sweep_stale_temps(final_path: &Path) -> Result<usize, CacheWriteError> {
    let pattern = format!(
        "{}.{}",
        glob::Pattern::escape(&final_path.to_string_lossy()),
        "?".repeat(TEMP_SUFFIX_LEN)
    );
    let entries = glob::glob(&pattern).map_err(|e| CacheWriteError::Pattern(e.to_string()))?;

    let now = SystemTime::now();
    let mut removed = 0;
    for path in entries.flatten() {
        let Ok(meta) = std::fs::symlink_metadata(&path) else {
            continue;
        };
        if !meta.is_file() {
            continue;
        }
        let age = meta
            .modified()
            .ok()
            .and_then(|m| now.duration_since(m).ok())
            .unwrap_or_default();
        if age < STALE_TEMP_AGE {
            continue;
        }

        match std::fs::remove_file(&path) {
            Ok(()) => {
                log::info!("Removed stale temporary cache {}", path.display());
                removed += 1;
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(source) => {
                return Err(CacheWriteError::Remove {
                    path: path.display().to_string(),
                    source,
                })
            }
        }
    }
    Ok(removed)
}

fn split(final_path: &Path) -> Result<(&Path, String), CacheWriteError> {
    let invalid = || CacheWriteError::InvalidPath(final_path.display().to_string());
    let file_name = final_path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(invalid)?;
    let dir = match final_path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        Some(_) => Path::new("."),
        None => return Err(invalid()),
    };
    Ok((dir, file_name.to_string()))
}

fn sync_dir(dir: &Path) -> std::io::Result<()> {
    std::fs::File::open(dir)?.sync_all()
}

#[derive(Debug, thiserror::Error)]
pub enum CacheWriteError {
    #[error("Invalid cache path: {0}")]
    InvalidPath(String),

    #[error("Failed to create temporary file in {dir}: {source}")]
    CreateTemp {
        dir: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write {path}: {source}")]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to sync {path}: {source}")]
    Sync {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to move {from} to {to}: {source}")]
    Rename {
        from: String,
        to: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to remove {path}: {source}")]
    Remove {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid temporary file pattern: {0}")]
    Pattern(String),
}
