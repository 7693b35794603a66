//! depscan - dependency cache and service state for rc-script init
//!
//! Reads the `depend()` block of every init script, orders services by
//! their declared relations, caches the result on disk and tracks each
//! service's lifecycle state as a marker file.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────┐
//! │                    depscan                       │
//! ├─────────────────────────────────────────────────┤
//! │  Catalog  │  Dependency Graph  │  State Store   │
//! ├─────────────────────────────────────────────────┤
//! │      Cache codec / writer    │  Var-dir skeleton │
//! └─────────────────────────────────────────────────┘
//! ```

pub mod cache;
pub mod config;
pub mod manager;
pub mod units;
pub mod vardir;

pub use config::Settings;
pub use manager::{DependencyGraph, Direction, Manager, ManagerError, ServiceState};
pub use units::{Dependency, DependencyKind, ServiceDescriptor};
