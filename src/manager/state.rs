//! Service state store
//!
//! ```text
//!     ┌──────────┐   reset   ┌────────┐
//!     │ Inactive │◄──────────│ Broken │◄─── failure (from any state)
//!     └────┬─────┘           └────────┘
//!          │ start-request        ▲
//!     ┌────▼─────┐                │ crash recovery
//!     │ Starting │────────────────┤
//!     └────┬─────┘                │
//!          │ start-success        │
//!     ┌────▼─────┐                │
//!     │ Started  │                │
//!     └────┬─────┘                │
//!          │ stop-request         │
//!     ┌────▼─────┐                │
//!     │ Stopping │────────────────┘
//!     └────┬─────┘
//!          │ stop-success
//!          ▼
//!       Inactive
//! ```
//!
//! Each service has an empty marker file in exactly one of
//! `<svcdir>/{inactive,starting,started,stopping,broken}`. A transition is
//! a single `rename` between those directories, so a reader never finds a
//! service in zero or two of them.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Lifecycle state of a service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ServiceState {
    Inactive,
    Starting,
    Started,
    Stopping,
    Broken,
}

impl ServiceState {
    pub const ALL: [ServiceState; 5] = [
        Self::Inactive,
        Self::Starting,
        Self::Started,
        Self::Stopping,
        Self::Broken,
    ];

    /// Name of the state, which is also its directory under svcdir
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Inactive => "inactive",
            Self::Starting => "starting",
            Self::Started => "started",
            Self::Stopping => "stopping",
            Self::Broken => "broken",
        }
    }

    /// A service caught here at startup was interrupted mid-transition
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Starting | Self::Stopping)
    }

    pub fn can_transition_to(&self, to: ServiceState) -> bool {
        use ServiceState::*;
        matches!(
            (*self, to),
            (Inactive, Starting)
                | (Starting, Started)
                | (Started, Stopping)
                | (Stopping, Inactive)
                | (_, Broken)
                | (Broken, Inactive)
        )
    }
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ServiceState {
    type Err = StateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| StateError::UnknownState(s.to_string()))
    }
}

/// A marker moved to `broken` by crash recovery
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recovered {
    pub service: String,
    /// Every state the service was found in (more than one only after
    /// outside tampering)
    pub found_in: Vec<ServiceState>,
}

/// Directory-backed lifecycle state for every known service
#[derive(Debug, Clone)]
pub struct ServiceStateStore {
    svcdir: PathBuf,
}

impl ServiceStateStore {
    /// Open the store under `svcdir`; every state directory must exist
    pub fn open(svcdir: impl Into<PathBuf>) -> Result<Self, StateError> {
        let store = Self {
            svcdir: svcdir.into(),
        };
        for state in ServiceState::ALL {
            let dir = store.container(state);
            if !dir.is_dir() {
                return Err(StateError::MissingContainer(dir.display().to_string()));
            }
        }
        Ok(store)
    }

    pub fn svcdir(&self) -> &Path {
        &self.svcdir
    }

    fn container(&self, state: ServiceState) -> PathBuf {
        self.svcdir.join(state.as_str())
    }

    fn marker(&self, state: ServiceState, service: &str) -> PathBuf {
        self.container(state).join(service)
    }

    /// Every state a marker for `service` exists in
    pub fn states_of(&self, service: &str) -> Result<Vec<ServiceState>, StateError> {
        validate_name(service)?;
        let mut found = Vec::new();
        for state in ServiceState::ALL {
            let path = self.marker(state, service);
            match std::fs::symlink_metadata(&path) {
                Ok(_) => found.push(state),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(source) => return Err(StateError::io("stat", &path, source)),
            }
        }
        Ok(found)
    }

    /// Current state, or `None` for a service the store has never seen
    pub fn state(&self, service: &str) -> Result<Option<ServiceState>, StateError> {
        let mut states = self.states_of(service)?;
        match states.len() {
            0 => Ok(None),
            1 => Ok(states.pop()),
            _ => Err(StateError::Ambiguous {
                service: service.to_string(),
                states,
            }),
        }
    }

    /// Record `service` as inactive unless it already has a state
    pub fn register(&self, service: &str) -> Result<ServiceState, StateError> {
        if let Some(state) = self.state(service)? {
            return Ok(state);
        }

        let path = self.marker(ServiceState::Inactive, service);
        match std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
        {
            Ok(_) => {
                log::debug!("Registered {} as inactive", service);
                Ok(ServiceState::Inactive)
            }
            // Lost a race with another registration
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(ServiceState::Inactive),
            Err(source) => Err(StateError::io("create", &path, source)),
        }
    }

    /// Move `service` from `from` to `to`.
    ///
    /// The pair is checked against the transition table first; a rejected
    /// pair or a service not currently in `from` leaves the store unchanged.
    pub fn transition(
        &self,
        service: &str,
        from: ServiceState,
        to: ServiceState,
    ) -> Result<(), StateError> {
        validate_name(service)?;
        if !from.can_transition_to(to) {
            return Err(StateError::InvalidTransition {
                service: service.to_string(),
                from,
                to,
            });
        }

        // Failing an already broken service changes nothing
        if from == to {
            if self.states_of(service)?.contains(&from) {
                return Ok(());
            }
            return Err(StateError::NotInState {
                service: service.to_string(),
                expected: from,
                actual: self.state(service).ok().flatten(),
            });
        }

        let src = self.marker(from, service);
        let dst = self.marker(to, service);
        if let Err(source) = std::fs::rename(&src, &dst) {
            if source.kind() == std::io::ErrorKind::NotFound && !src.exists() {
                return Err(StateError::NotInState {
                    service: service.to_string(),
                    expected: from,
                    actual: self.state(service).ok().flatten(),
                });
            }
            return Err(StateError::io("rename", &src, source));
        }

        for state in [to, from] {
            let dir = self.container(state);
            if let Err(e) = sync_dir(&dir) {
                log::warn!("Failed to sync {}: {}", dir.display(), e);
            }
        }

        log::debug!("{}: {} -> {}", service, from, to);
        Ok(())
    }

    /// All markers, sorted by service name; a service in several states
    /// appears once per state
    pub fn list(&self) -> Result<Vec<(String, ServiceState)>, StateError> {
        Ok(self
            .scan()?
            .into_iter()
            .flat_map(|(name, states)| states.into_iter().map(move |s| (name.clone(), s)))
            .collect())
    }

    /// Services with a marker in `state`, sorted by name
    pub fn in_state(&self, state: ServiceState) -> Result<Vec<String>, StateError> {
        let dir = self.container(state);
        let entries = std::fs::read_dir(&dir).map_err(|e| StateError::io("read", &dir, e))?;

        let mut names = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| StateError::io("read", &dir, e))?;
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                log::warn!("Ignoring marker with non UTF-8 name {:?}", entry.path());
                continue;
            };
            if !name.starts_with('.') {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }

    fn scan(&self) -> Result<BTreeMap<String, Vec<ServiceState>>, StateError> {
        let mut markers: BTreeMap<String, Vec<ServiceState>> = BTreeMap::new();
        for state in ServiceState::ALL {
            for name in self.in_state(state)? {
                markers.entry(name).or_default().push(state);
            }
        }
        Ok(markers)
    }

    /// Resolve markers left behind by an unclean shutdown.
    ///
    /// Anything in `starting` or `stopping` is moved to `broken`. A service
    /// found in more than one directory is collapsed into `broken` as well.
    pub fn recover_on_startup(&self) -> Result<Vec<Recovered>, StateError> {
        let mut recovered = Vec::new();

        for (service, states) in self.scan()? {
            let needs_recovery = states.len() > 1 || states.iter().any(ServiceState::is_transient);
            if !needs_recovery {
                continue;
            }

            let broken = self.marker(ServiceState::Broken, &service);
            for &state in &states {
                if state == ServiceState::Broken {
                    continue;
                }
                let src = self.marker(state, &service);
                if broken.exists() {
                    std::fs::remove_file(&src).map_err(|e| StateError::io("remove", &src, e))?;
                } else {
                    std::fs::rename(&src, &broken)
                        .map_err(|e| StateError::io("rename", &src, e))?;
                }
            }

            log::warn!(
                "{} was left in {}; marked broken",
                service,
                states
                    .iter()
                    .map(ServiceState::as_str)
                    .collect::<Vec<_>>()
                    .join(", ")
            );
            recovered.push(Recovered {
                service,
                found_in: states,
            });
        }

        if !recovered.is_empty() {
            for state in ServiceState::ALL {
                let dir = self.container(state);
                if let Err(e) = sync_dir(&dir) {
                    log::warn!("Failed to sync {}: {}", dir.display(), e);
                }
            }
        }

        Ok(recovered)
    }
}

/// Service names become file names; reject anything that is not a single
/// path component
fn validate_name(service: &str) -> Result<(), StateError> {
    if service.is_empty()
        || service == "."
        || service == ".."
        || service.contains(&['/', '\0'][..])
    {
        return Err(StateError::InvalidName(service.to_string()));
    }
    Ok(())
}

fn sync_dir(dir: &Path) -> std::io::Result<()> {
    std::fs::File::open(dir)?.sync_all()
}

#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("Invalid transition for {service}: {from} -> {to}")]
    InvalidTransition {
        service: String,
        from: ServiceState,
        to: ServiceState,
    },

    #[error("{service} is not {expected} (current state: {})", .actual.map_or("unknown", |s| s.as_str()))]
    NotInState {
        service: String,
        expected: ServiceState,
        actual: Option<ServiceState>,
    },

    #[error("{service} has markers in several states: {states:?}")]
    Ambiguous {
        service: String,
        states: Vec<ServiceState>,
    },

    #[error("Unknown service state: {0}")]
    UnknownState(String),

    #[error("Invalid service name '{0}'")]
    InvalidName(String),

    #[error("State directory missing: {0}")]
    MissingContainer(String),

    #[error("Failed to {op} {path}: {source}")]
    Io {
        op: &'static str,
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl StateError {
    fn io(op: &'static str, path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            op,
            path: path.display().to_string(),
            source,
        }
    }
}
