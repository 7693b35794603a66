//! Service descriptors and their dependency declarations
//!
//! A descriptor is what the catalog extracts from one init script: a
//! service name, where it came from, when that file last changed, and the
//! ordered list of `depend()` declarations.

mod catalog;
mod parser;

pub use catalog::{ServiceCatalog, IGNORED_SUFFIXES};
pub use parser::{parse_depend, parse_descriptor, ParseError};

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};

/// Kind of a dependency declaration inside `depend()`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DependencyKind {
    /// Hard requirement; resolution fails when the target is missing
    Need,
    /// Soft requirement; orders against the target only when it is started anyway
    Use,
    /// Advisory: start this service before the target
    Before,
    /// Advisory: start this service after the target
    After,
    /// Declares a virtual name this service satisfies
    Provide,
}

impl DependencyKind {
    pub const ALL: [DependencyKind; 5] = [
        Self::Need,
        Self::Use,
        Self::Before,
        Self::After,
        Self::Provide,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Need => "need",
            Self::Use => "use",
            Self::Before => "before",
            Self::After => "after",
            Self::Provide => "provide",
        }
    }

    /// Need and use edges take part in cycle detection
    pub fn is_hard(&self) -> bool {
        matches!(self, Self::Need | Self::Use)
    }

    pub fn is_advisory(&self) -> bool {
        matches!(self, Self::Before | Self::After)
    }
}

impl fmt::Display for DependencyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error for a dependency keyword outside the closed set
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown dependency kind '{0}'")]
pub struct UnknownKind(pub String);

impl FromStr for DependencyKind {
    type Err = UnknownKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "need" => Ok(Self::Need),
            "use" => Ok(Self::Use),
            "before" => Ok(Self::Before),
            "after" => Ok(Self::After),
            "provide" => Ok(Self::Provide),
            other => Err(UnknownKind(other.to_string())),
        }
    }
}

/// One `(kind, target)` declaration
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Dependency {
    pub kind: DependencyKind,
    pub target: String,
}

impl Dependency {
    pub fn new(kind: DependencyKind, target: impl Into<String>) -> Self {
        Self {
            kind,
            target: target.into(),
        }
    }
}

/// A discovered service and its declared relations
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceDescriptor {
    /// Unique service name (the init script's file name)
    pub name: String,
    /// Script the descriptor was read from
    pub source_path: PathBuf,
    /// Modification time of `source_path` when it was read
    pub source_mtime: DateTime<Utc>,
    /// Declarations in source order
    pub dependencies: Vec<Dependency>,
}

impl ServiceDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            source_path: PathBuf::from(&name),
            name,
            source_mtime: DateTime::<Utc>::from(std::time::UNIX_EPOCH),
            dependencies: Vec::new(),
        }
    }

    /// Builder-style helper used by tests and generators
    pub fn with(mut self, kind: DependencyKind, target: &str) -> Self {
        self.dependencies.push(Dependency::new(kind, target));
        self
    }

    pub fn with_mtime(mut self, mtime: DateTime<Utc>) -> Self {
        self.source_mtime = mtime;
        self
    }

    /// Targets of every declaration of the given kind, in source order
    pub fn targets(&self, kind: DependencyKind) -> impl Iterator<Item = &str> {
        self.dependencies
            .iter()
            .filter(move |d| d.kind == kind)
            .map(|d| d.target.as_str())
    }

    /// Virtual names this service provides
    pub fn provides(&self) -> impl Iterator<Item = &str> {
        self.targets(DependencyKind::Provide)
    }
}
