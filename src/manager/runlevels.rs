//! Runlevel registry
//!
//! A runlevel is a named, ordered set of services. The registry is owned by
//! whoever drives a run and handed to the resolver explicitly.
//!
//! On disk a runlevel is a directory whose entries are named after the
//! services in it (usually symlinks into the init directory):
//!
//! ```text
//! /etc/runlevels/boot/localmount -> /etc/init.d/localmount
//! /etc/runlevels/default/sshd    -> /etc/init.d/sshd
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Members of one runlevel, duplicates collapsed, first insertion wins
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunlevelDefinition {
    name: String,
    members: Vec<String>,
}

impl RunlevelDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            members: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Members in insertion order
    pub fn members(&self) -> &[String] {
        &self.members
    }

    pub fn contains(&self, service: &str) -> bool {
        self.members.iter().any(|m| m == service)
    }

    /// Append a member; returns false if it was already present
    pub fn push(&mut self, service: impl Into<String>) -> bool {
        let service = service.into();
        if self.contains(&service) {
            return false;
        }
        self.members.push(service);
        true
    }
}

#[derive(Debug, Default, Clone)]
pub struct RunlevelRegistry {
    runlevels: BTreeMap<String, RunlevelDefinition>,
}

impl RunlevelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read every runlevel directory under `dir`; a missing `dir` gives an
    /// empty registry
    pub fn load(dir: &Path) -> Result<Self, RunlevelError> {
        let mut registry = Self::new();
        if !dir.exists() {
            log::debug!("No runlevel directory at {}", dir.display());
            return Ok(registry);
        }

        for entry in read_dir_sorted(dir)? {
            if !entry.is_dir() {
                continue;
            }
            let Some(name) = file_name(&entry) else {
                continue;
            };
            let members: Vec<String> = read_dir_sorted(&entry)?
                .iter()
                .filter_map(|p| file_name(p))
                .collect();
            log::debug!("Runlevel {}: {} services", name, members.len());
            registry.define(name, members);
        }

        Ok(registry)
    }

    /// Add or replace a runlevel
    pub fn define<I, S>(&mut self, name: impl Into<String>, members: I) -> &RunlevelDefinition
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let name = name.into();
        let mut definition = RunlevelDefinition::new(name.clone());
        for member in members {
            definition.push(member);
        }
        self.runlevels.insert(name.clone(), definition);
        &self.runlevels[&name]
    }

    pub fn get(&self, name: &str) -> Option<&RunlevelDefinition> {
        self.runlevels.get(name)
    }

    pub fn is_runlevel(&self, name: &str) -> bool {
        self.runlevels.contains_key(name)
    }

    /// Runlevel names in sorted order
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.runlevels.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.runlevels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.runlevels.is_empty()
    }
}

fn read_dir_sorted(dir: &Path) -> Result<Vec<PathBuf>, RunlevelError> {
    let io_err = |source| RunlevelError::Io {
        path: dir.display().to_string(),
        source,
    };
    let mut paths = std::fs::read_dir(dir)
        .map_err(io_err)?
        .map(|e| e.map(|e| e.path()))
        .collect::<Result<Vec<_>, _>>()
        .map_err(io_err)?;
    paths.sort();
    Ok(paths)
}

/// Visible entry name, if it is valid UTF-8
fn file_name(path: &Path) -> Option<String> {
    let name = path.file_name()?.to_str()?;
    (!name.starts_with('.')).then(|| name.to_string())
}

#[derive(Debug, thiserror::Error)]
pub enum RunlevelError {
    #[error("Failed to read runlevel directory {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}
