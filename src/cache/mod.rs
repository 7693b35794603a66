//! Dependency cache
//!
//! A snapshot of the dependency graph, stored as a fixed header followed by
//! a MessagePack body. The header alone answers "is this cache current?",
//! so validation never has to decode the body.
//!
//! ```text
//! offset  size  field
//! 0       8     magic "DEPSCAN\0"
//! 8       4     format version (u32 LE)
//! 12      8     generated_at, seconds since the epoch (i64 LE)
//! 20      4     generated_at, nanoseconds (u32 LE)
//! 24      8     body length (u64 LE)
//! 32      n     body: array of services, fields by name
//! ```
//!
//! Each body entry carries `name`, `source_path`, `source_mtime_secs`,
//! `source_mtime_nanos` and `dependencies` as `[kind, target]` pairs with
//! kind one of `need`, `use`, `before`, `after`, `provide`.

mod validate;
mod writer;

pub use validate::{check, is_stale, Staleness};
pub use writer::{commit, stage, sweep_stale_temps, CacheWriteError, StagedCache, STALE_TEMP_AGE};

use std::collections::HashSet;
use std::io::Read;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::manager::DependencyGraph;
use crate::units::{Dependency, DependencyKind, ServiceDescriptor};

/// Current cache format version
pub const FORMAT_VERSION: u32 = 1;

pub const MAGIC: &[u8; 8] = b"DEPSCAN\0";

/// Size of the fixed header preceding the body
pub const HEADER_LEN: usize = 32;

/// Default cache file name inside svcdir
pub const CACHE_FILE_NAME: &str = "depcache";

/// Header fields of a cache file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotMeta {
    pub format_version: u32,
    pub generated_at: DateTime<Utc>,
}

/// A complete cache: header fields plus the graph
#[derive(Debug, Clone)]
pub struct CacheSnapshot {
    pub format_version: u32,
    pub generated_at: DateTime<Utc>,
    pub graph: DependencyGraph,
}

impl CacheSnapshot {
    /// Snapshot in the current format
    pub fn new(graph: DependencyGraph, generated_at: DateTime<Utc>) -> Self {
        Self {
            format_version: FORMAT_VERSION,
            generated_at,
            graph,
        }
    }

    pub fn meta(&self) -> SnapshotMeta {
        SnapshotMeta {
            format_version: self.format_version,
            generated_at: self.generated_at,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct WireService {
    name: String,
    source_path: String,
    source_mtime_secs: i64,
    source_mtime_nanos: u32,
    dependencies: Vec<(String, String)>,
}

impl WireService {
    fn from_descriptor(svc: &ServiceDescriptor) -> Self {
        Self {
            name: svc.name.clone(),
            source_path: svc.source_path.to_string_lossy().into_owned(),
            source_mtime_secs: svc.source_mtime.timestamp(),
            source_mtime_nanos: svc.source_mtime.timestamp_subsec_nanos(),
            dependencies: svc
                .dependencies
                .iter()
                .map(|d| (d.kind.as_str().to_string(), d.target.clone()))
                .collect(),
        }
    }

    fn into_descriptor(self) -> Result<ServiceDescriptor, ParseError> {
        let source_mtime = DateTime::<Utc>::from_timestamp(self.source_mtime_secs, self.source_mtime_nanos)
            .ok_or(ParseError::InvalidTimestamp)?;

        let mut dependencies = Vec::with_capacity(self.dependencies.len());
        for (kind, target) in self.dependencies {
            let kind: DependencyKind = kind.parse().map_err(|_| ParseError::UnknownEdgeKind {
                service: self.name.clone(),
                kind,
            })?;
            dependencies.push(Dependency { kind, target });
        }

        Ok(ServiceDescriptor {
            name: self.name,
            source_path: PathBuf::from(self.source_path),
            source_mtime,
            dependencies,
        })
    }
}

/// Serialize a snapshot to the on-disk format
pub fn encode(snapshot: &CacheSnapshot) -> Result<Vec<u8>, EncodeError> {
    let services: Vec<WireService> = snapshot
        .graph
        .descriptors()
        .map(WireService::from_descriptor)
        .collect();
    let body = rmp_serde::to_vec_named(&services)?;

    let mut out = Vec::with_capacity(HEADER_LEN + body.len());
    out.extend_from_slice(MAGIC);
    out.extend_from_slice(&snapshot.format_version.to_le_bytes());
    out.extend_from_slice(&snapshot.generated_at.timestamp().to_le_bytes());
    out.extend_from_slice(&snapshot.generated_at.timestamp_subsec_nanos().to_le_bytes());
    out.extend_from_slice(&(body.len() as u64).to_le_bytes());
    out.extend_from_slice(&body);
    Ok(out)
}

/// Parse only the header. The version is returned as found; rejecting a
/// foreign version is up to the caller.
pub fn read_meta(bytes: &[u8]) -> Result<SnapshotMeta, ParseError> {
    if bytes.len() < HEADER_LEN {
        return Err(ParseError::Truncated {
            expected: HEADER_LEN,
            found: bytes.len(),
        });
    }
    if &bytes[..8] != MAGIC {
        return Err(ParseError::BadMagic);
    }

    let format_version = u32::from_le_bytes(field(bytes, 8));
    let secs = i64::from_le_bytes(field(bytes, 12));
    let nanos = u32::from_le_bytes(field(bytes, 20));
    let generated_at = DateTime::<Utc>::from_timestamp(secs, nanos).ok_or(ParseError::InvalidTimestamp)?;

    Ok(SnapshotMeta {
        format_version,
        generated_at,
    })
}

/// Parse a complete cache file
pub fn decode(bytes: &[u8]) -> Result<CacheSnapshot, ParseError> {
    let meta = read_meta(bytes)?;
    if meta.format_version != FORMAT_VERSION {
        return Err(ParseError::UnsupportedVersion(meta.format_version));
    }

    let body_len = u64::from_le_bytes(field(bytes, 24));
    let available = (bytes.len() - HEADER_LEN) as u64;
    if available < body_len {
        return Err(ParseError::Truncated {
            expected: HEADER_LEN.saturating_add(body_len as usize),
            found: bytes.len(),
        });
    }
    if available > body_len {
        return Err(ParseError::TrailingData);
    }

    let services: Vec<WireService> =
        rmp_serde::from_slice(&bytes[HEADER_LEN..]).map_err(|e| ParseError::Body(e.to_string()))?;

    let mut seen = HashSet::new();
    let mut descriptors = Vec::with_capacity(services.len());
    for wire in services {
        if !seen.insert(wire.name.clone()) {
            return Err(ParseError::DuplicateService(wire.name));
        }
        descriptors.push(wire.into_descriptor()?);
    }

    Ok(CacheSnapshot {
        format_version: meta.format_version,
        generated_at: meta.generated_at,
        graph: DependencyGraph::from_descriptors(descriptors),
    })
}

/// Read just the header of the cache at `path`; `None` if there is no cache
pub fn load_meta(path: &Path) -> Result<Option<SnapshotMeta>, CacheReadError> {
    let mut file = match std::fs::File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(CacheReadError::io(path, e)),
    };

    let mut header = Vec::with_capacity(HEADER_LEN);
    file.by_ref()
        .take(HEADER_LEN as u64)
        .read_to_end(&mut header)
        .map_err(|e| CacheReadError::io(path, e))?;

    read_meta(&header)
        .map(Some)
        .map_err(|source| CacheReadError::Parse {
            path: path.display().to_string(),
            source,
        })
}

/// Read and decode the cache at `path`; `None` if there is no cache
pub fn load(path: &Path) -> Result<Option<CacheSnapshot>, CacheReadError> {
    let bytes = match std::fs::read(path) {
        Ok(b) => b,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(CacheReadError::io(path, e)),
    };

    decode(&bytes).map(Some).map_err(|source| CacheReadError::Parse {
        path: path.display().to_string(),
        source,
    })
}

/// Copy a fixed-size header field; callers have checked the length
fn field<const N: usize>(bytes: &[u8], at: usize) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&bytes[at..at + N]);
    out
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("Cache truncated: expected {expected} bytes, found {found}")]
    Truncated { expected: usize, found: usize },

    #[error("Not a dependency cache (bad magic)")]
    BadMagic,

    #[error("Unsupported cache format version {0} (expected {expected})", expected = FORMAT_VERSION)]
    UnsupportedVersion(u32),

    #[error("Service {service} has unknown dependency kind '{kind}'")]
    UnknownEdgeKind { service: String, kind: String },

    #[error("Service {0} appears more than once")]
    DuplicateService(String),

    #[error("Cache has trailing data after the body")]
    TrailingData,

    #[error("Invalid timestamp in cache")]
    InvalidTimestamp,

    #[error("Malformed cache body: {0}")]
    Body(String),
}

#[derive(Debug, thiserror::Error)]
#[error("Failed to encode cache: {0}")]
pub struct EncodeError(#[from] rmp_serde::encode::Error);

#[derive(Debug, thiserror::Error)]
pub enum CacheReadError {
    #[error("Failed to read cache {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid cache {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: ParseError,
    },
}

impl CacheReadError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.display().to_string(),
            source,
        }
    }
}
