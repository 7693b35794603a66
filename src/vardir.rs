//! Var-directory skeleton
//!
//! The service directory (`svcdir`) holds the cache file and one
//! subdirectory per concern. Persistent subdirectories survive across
//! boots; volatile ones are wiped by [`prune_volatile`] at every update.

use std::fs;
use std::io::ErrorKind;
use std::os::unix::fs::DirBuilderExt;
use std::path::Path;

/// Mode for the root and every subdirectory
pub const DIR_MODE: u32 = 0o755;

/// Subdirectories kept across updates
pub const PERSISTENT_SUBDIRS: &[&str] = &[
    "softscripts",
    "options",
    "inactive",
    "starting",
    "started",
    "stopping",
];

/// Subdirectories removed by [`prune_volatile`]
pub const VOLATILE_SUBDIRS: &[&str] = &["snapshot", "broken"];

/// Create `root` and every persistent and volatile subdirectory.
///
/// A non-directory entry (including a symlink, even one pointing at a
/// directory) occupying one of those names is removed and replaced.
pub fn ensure_skeleton(root: &Path) -> Result<(), VarDirError> {
    ensure_dir(root)?;
    for name in PERSISTENT_SUBDIRS.iter().chain(VOLATILE_SUBDIRS) {
        ensure_dir(&root.join(name))?;
    }
    Ok(())
}

/// Recursively remove the volatile subdirectories of `root`.
///
/// A missing root or subdirectory is not an error.
pub fn prune_volatile(root: &Path) -> Result<(), VarDirError> {
    for name in VOLATILE_SUBDIRS {
        let path = root.join(name);
        let meta = match fs::symlink_metadata(&path) {
            Ok(meta) => meta,
            Err(e) if e.kind() == ErrorKind::NotFound => continue,
            Err(e) => return Err(VarDirError::new("stat", &path, e)),
        };

        let removed = if meta.is_dir() {
            fs::remove_dir_all(&path)
        } else {
            fs::remove_file(&path)
        };
        match removed {
            Ok(()) => log::debug!("Pruned {}", path.display()),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(VarDirError::new("remove", &path, e)),
        }
    }
    Ok(())
}

fn ensure_dir(path: &Path) -> Result<(), VarDirError> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => return Ok(()),
        Ok(_) => {
            log::warn!("Replacing non-directory {}", path.display());
            fs::remove_file(path).map_err(|e| VarDirError::new("remove", path, e))?;
        }
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => return Err(VarDirError::new("stat", path, e)),
    }

    match fs::DirBuilder::new().mode(DIR_MODE).create(path) {
        Ok(()) => {
            log::debug!("Created {}", path.display());
            Ok(())
        }
        // Another process created it in the meantime
        Err(e) if e.kind() == ErrorKind::AlreadyExists && path.is_dir() => Ok(()),
        Err(e) => Err(VarDirError::new("create", path, e)),
    }
}

#[derive(Debug, thiserror::Error)]
#[error("Failed to {op} {path}: {source}")]
pub struct VarDirError {
    pub op: &'static str,
    pub path: String,
    #[source]
    pub source: std::io::Error,
}

impl VarDirError {
    fn new(op: &'static str, path: &Path, source: std::io::Error) -> Self {
        Self {
            op,
            path: path.display().to_string(),
            source,
        }
    }
}
