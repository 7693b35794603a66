//! Cache staleness check
//!
//! Works on header metadata and descriptor modification times only; the
//! cache body is never parsed here.

use super::{SnapshotMeta, FORMAT_VERSION};
use crate::units::ServiceDescriptor;

/// Why a cache must (or need not) be rebuilt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Staleness {
    Fresh,
    /// No cache on disk
    Missing,
    /// Written by a different format version
    VersionMismatch { found: u32 },
    /// A script changed after the cache was generated
    ModifiedSince { service: String },
}

impl Staleness {
    pub fn is_stale(&self) -> bool {
        !matches!(self, Self::Fresh)
    }
}

impl std::fmt::Display for Staleness {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Fresh => write!(f, "cache is current"),
            Self::Missing => write!(f, "no cache"),
            Self::VersionMismatch { found } => {
                write!(f, "cache format {} (expected {})", found, FORMAT_VERSION)
            }
            Self::ModifiedSince { service } => write!(f, "{} changed since last scan", service),
        }
    }
}

/// Compare a cache header against the current descriptor set
pub fn check(meta: Option<&SnapshotMeta>, descriptors: &[ServiceDescriptor]) -> Staleness {
    let Some(meta) = meta else {
        return Staleness::Missing;
    };
    if meta.format_version != FORMAT_VERSION {
        return Staleness::VersionMismatch {
            found: meta.format_version,
        };
    }
    match descriptors
        .iter()
        .find(|d| d.source_mtime > meta.generated_at)
    {
        Some(d) => Staleness::ModifiedSince {
            service: d.name.clone(),
        },
        None => Staleness::Fresh,
    }
}

pub fn is_stale(meta: Option<&SnapshotMeta>, descriptors: &[ServiceDescriptor]) -> bool {
    check(meta, descriptors).is_stale()
}
