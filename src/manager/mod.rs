//! Service manager core
//!
//! Ties the catalog, dependency graph, on-disk cache, var-directory
//! skeleton and state store together. [`Manager::update`] is the
//! depscan pass run before every runlevel change; [`Manager::order`]
//! answers "in which order do these services start (or stop)?".

mod deps;
mod runlevels;
mod state;

pub use deps::{CyclicDependencyError, DependencyGraph, Direction, ResolveError};
pub use runlevels::{RunlevelDefinition, RunlevelError, RunlevelRegistry};
pub use state::{Recovered, ServiceState, ServiceStateStore, StateError};

use std::path::PathBuf;

use chrono::Utc;

use crate::cache::{self, CacheReadError, CacheSnapshot, CacheWriteError, EncodeError, Staleness};
use crate::config::{ConfigError, Settings};
use crate::units::{self, ServiceCatalog, ServiceDescriptor};
use crate::vardir::{self, VarDirError};

/// Outcome of [`Manager::update`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateReport {
    /// Staleness of the cache found on disk
    pub staleness: Staleness,
    /// Whether a new cache was written
    pub rebuilt: bool,
    /// Number of services in the catalog
    pub services: usize,
    /// Leftover temporary cache files removed
    pub swept: usize,
}

/// Run context for one invocation
pub struct Manager {
    settings: Settings,
    catalog: ServiceCatalog,
    /// Refuse mutations unless running as root
    require_root: bool,
}

impl Manager {
    pub fn new(settings: Settings) -> Self {
        let catalog = ServiceCatalog::new(settings.init_dir.clone());
        Self {
            settings,
            catalog,
            require_root: true,
        }
    }

    /// Allow mutations without root (sandboxes and tests)
    pub fn skip_root_check(mut self) -> Self {
        self.require_root = false;
        self
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn catalog(&self) -> &ServiceCatalog {
        &self.catalog
    }

    pub fn cache_path(&self) -> PathBuf {
        self.settings.cache_path()
    }

    /// Fail with [`ManagerError::Permission`] unless mutations are allowed
    pub fn check_privileges(&self) -> Result<(), ManagerError> {
        if self.require_root && !nix::unistd::geteuid().is_root() {
            return Err(ManagerError::Permission);
        }
        Ok(())
    }

    /// Refresh the skeleton and the dependency cache.
    ///
    /// Volatile directories are pruned and the skeleton recreated (broken
    /// services are reset to inactive), then the cache is rebuilt when it is
    /// stale (or `force` is set). Every service in the catalog ends up with
    /// a state marker.
    pub async fn update(&self, force: bool) -> Result<UpdateReport, ManagerError> {
        self.check_privileges()?;
        let svcdir = &self.settings.svcdir;

        self.reset_volatile()?;

        let cache_path = self.cache_path();
        let swept = cache::sweep_stale_temps(&cache_path)?;

        // Taken before the scan so a script edited mid-scan is seen as newer
        let generated_at = Utc::now();
        let descriptors = self.catalog.scan().await?;

        let meta = match cache::load_meta(&cache_path) {
            Ok(meta) => meta,
            Err(e @ CacheReadError::Parse { .. }) => {
                log::warn!("{}; rebuilding", e);
                None
            }
            Err(e) => return Err(e.into()),
        };
        let staleness = cache::check(meta.as_ref(), &descriptors);
        let rebuilt = force || staleness.is_stale();

        let names: Vec<String> = descriptors.iter().map(|d| d.name.clone()).collect();
        if rebuilt {
            log::info!("Caching service dependencies ({})", staleness);
            let snapshot = CacheSnapshot::new(validated_graph(descriptors)?, generated_at);
            self.store(&snapshot)?;
        } else {
            log::debug!("Dependency cache is current");
        }

        let store = ServiceStateStore::open(svcdir)?;
        for name in &names {
            store.register(name)?;
        }

        Ok(UpdateReport {
            staleness,
            rebuilt,
            services: names.len(),
            swept,
        })
    }

    /// The current dependency graph.
    ///
    /// Comes from the cache when it is fresh; otherwise rebuilt from the
    /// catalog and, when permitted, written back.
    pub async fn graph(&self) -> Result<DependencyGraph, ManagerError> {
        let generated_at = Utc::now();
        let descriptors = self.catalog.scan().await?;

        let cache_path = self.cache_path();
        let cached = match cache::load(&cache_path) {
            Ok(snapshot) => snapshot,
            Err(e @ CacheReadError::Parse { .. }) => {
                log::warn!("{}; rebuilding", e);
                None
            }
            Err(e) => return Err(e.into()),
        };

        let staleness = cache::check(cached.as_ref().map(|s| s.meta()).as_ref(), &descriptors);
        if let (Staleness::Fresh, Some(snapshot)) = (&staleness, cached) {
            log::debug!("Using cached dependencies from {}", cache_path.display());
            return Ok(snapshot.graph);
        }

        log::info!("Rebuilding dependency graph ({})", staleness);
        let snapshot = CacheSnapshot::new(validated_graph(descriptors)?, generated_at);
        if self.check_privileges().is_ok() && self.settings.svcdir.is_dir() {
            if let Err(e) = self.store(&snapshot) {
                log::warn!("Failed to store dependency cache: {}", e);
            }
        }
        Ok(snapshot.graph)
    }

    pub fn runlevels(&self) -> Result<RunlevelRegistry, ManagerError> {
        Ok(RunlevelRegistry::load(&self.settings.runlevels_dir)?)
    }

    /// Order the named services, or every member of a runlevel when the
    /// only target names one (a service of the same name wins)
    pub async fn order(
        &self,
        targets: &[String],
        direction: Direction,
    ) -> Result<Vec<String>, ManagerError> {
        let graph = self.graph().await?;

        if let [single] = targets {
            if !graph.contains(single) {
                let registry = self.runlevels()?;
                if registry.is_runlevel(single) {
                    return Ok(graph.resolve_runlevel(&registry, single, direction)?);
                }
            }
        }

        Ok(graph.resolve(targets, direction)?)
    }

    pub fn state_store(&self) -> Result<ServiceStateStore, ManagerError> {
        Ok(ServiceStateStore::open(&self.settings.svcdir)?)
    }

    pub fn transition(
        &self,
        service: &str,
        from: ServiceState,
        to: ServiceState,
    ) -> Result<(), ManagerError> {
        self.check_privileges()?;
        Ok(self.state_store()?.transition(service, from, to)?)
    }

    /// Crash recovery, run once at boot before anything is started
    pub fn recover(&self) -> Result<Vec<Recovered>, ManagerError> {
        self.check_privileges()?;
        vardir::ensure_skeleton(&self.settings.svcdir)?;
        Ok(self.state_store()?.recover_on_startup()?)
    }

    pub fn prune(&self) -> Result<(), ManagerError> {
        self.check_privileges()?;
        self.reset_volatile()
    }

    /// Wipe the volatile directories and rebuild the skeleton.
    ///
    /// Services marked broken lose that marker with `broken/`; they are
    /// registered as inactive again before anything else can fail, so no
    /// service is ever left without a state.
    fn reset_volatile(&self) -> Result<(), ManagerError> {
        let svcdir = &self.settings.svcdir;

        let broken = match ServiceStateStore::open(svcdir) {
            Ok(store) => store.in_state(ServiceState::Broken)?,
            Err(StateError::MissingContainer(_)) => Vec::new(),
            Err(e) => return Err(e.into()),
        };

        vardir::prune_volatile(svcdir)?;
        vardir::ensure_skeleton(svcdir)?;

        let store = ServiceStateStore::open(svcdir)?;
        for service in &broken {
            if store.states_of(service)?.is_empty() {
                log::warn!("Resetting broken service {} to inactive", service);
                store.register(service)?;
            }
        }
        Ok(())
    }

    fn store(&self, snapshot: &CacheSnapshot) -> Result<(), ManagerError> {
        let bytes = cache::encode(snapshot)?;
        cache::commit(&self.cache_path(), &bytes)?;
        log::info!(
            "Cached dependencies of {} services in {}",
            snapshot.graph.len(),
            self.cache_path().display()
        );
        Ok(())
    }
}

/// Build the graph and resolve every service once, so a cycle or missing
/// need fails here instead of at boot
pub fn validated_graph(
    descriptors: impl IntoIterator<Item = ServiceDescriptor>,
) -> Result<DependencyGraph, ResolveError> {
    let graph = DependencyGraph::from_descriptors(descriptors);
    {
        let names: Vec<&str> = graph.names().collect();
        graph.resolve(&names, Direction::Start)?;
    }
    Ok(graph)
}

#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    #[error("Must be root")]
    Permission,

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Failed to read service scripts: {0}")]
    Catalog(#[from] units::ParseError),

    #[error(transparent)]
    CacheRead(#[from] CacheReadError),

    #[error(transparent)]
    Encode(#[from] EncodeError),

    #[error("Failed to write dependency cache: {0}")]
    CacheWrite(#[from] CacheWriteError),

    #[error("Failed to resolve dependencies: {0}")]
    Resolve(#[from] ResolveError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    VarDir(#[from] VarDirError),

    #[error(transparent)]
    Runlevel(#[from] RunlevelError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::units::DependencyKind;

    #[test]
    fn test_validated_graph_rejects_cycle() {
        let err = validated_graph([
            ServiceDescriptor::new("a").with(DependencyKind::Need, "b"),
            ServiceDescriptor::new("b").with(DependencyKind::Need, "a"),
        ])
        .unwrap_err();
        assert!(matches!(err, ResolveError::Cycle(_)));
    }

    #[test]
    fn test_validated_graph_rejects_missing_need() {
        let err = validated_graph([ServiceDescriptor::new("a").with(DependencyKind::Need, "net")])
            .unwrap_err();
        assert_eq!(
            err,
            ResolveError::MissingDependency {
                service: "a".into(),
                target: "net".into(),
            }
        );
    }

    #[test]
    fn test_validated_graph_ok() {
        let graph = validated_graph([
            ServiceDescriptor::new("sshd").with(DependencyKind::Need, "net"),
            ServiceDescriptor::new("net"),
        ])
        .unwrap();
        assert_eq!(graph.len(), 2);
    }

    #[test]
    fn test_permission_error_message() {
        assert_eq!(ManagerError::Permission.to_string(), "Must be root");
    }
}
