//! Dependency resolution for service ordering
//!
//! Builds a graph from service descriptors and orders a target set with a
//! depth-first topological sort.
//!
//! - `need` pulls the target into the set and fails when nothing provides it
//! - `use` orders against the target only when it is in the set anyway
//! - `before`/`after` are hints; they are dropped when they would close a cycle
//!
//! Only `need` and `use` edges take part in cycle detection.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use super::runlevels::RunlevelRegistry;
use crate::units::{DependencyKind, ServiceDescriptor};

/// Which way an order is walked
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Dependencies first
    Start,
    /// Exact reverse of the start order
    Stop,
}

/// Dependency graph for ordering service startup
#[derive(Debug, Default, Clone)]
pub struct DependencyGraph {
    /// All known services by name
    services: BTreeMap<String, ServiceDescriptor>,
    /// Virtual name -> services that provide it, sorted by name
    providers: BTreeMap<String, Vec<String>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mark {
    InProgress,
    Done,
}

/// Predecessor lists: node -> nodes that must start before it
type Edges<'a> = HashMap<&'a str, Vec<&'a str>>;

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_descriptors(descriptors: impl IntoIterator<Item = ServiceDescriptor>) -> Self {
        let mut graph = Self::new();
        for svc in descriptors {
            graph.services.insert(svc.name.clone(), svc);
        }
        graph.rebuild_providers();
        graph
    }

    /// Add or replace a service, returning the previous descriptor
    pub fn insert(&mut self, service: ServiceDescriptor) -> Option<ServiceDescriptor> {
        let previous = self.services.insert(service.name.clone(), service);
        self.rebuild_providers();
        previous
    }

    fn rebuild_providers(&mut self) {
        self.providers.clear();
        // BTreeMap iteration keeps each provider list sorted by name
        for svc in self.services.values() {
            for alias in svc.provides() {
                let list = self.providers.entry(alias.to_string()).or_default();
                if !list.iter().any(|p| p == &svc.name) {
                    list.push(svc.name.clone());
                }
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<&ServiceDescriptor> {
        self.services.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.services.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    /// Service names in sorted order
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.services.keys().map(String::as_str)
    }

    pub fn descriptors(&self) -> impl Iterator<Item = &ServiceDescriptor> {
        self.services.values()
    }

    /// Services that declare `provide <alias>`
    pub fn providers(&self, alias: &str) -> &[String] {
        self.providers.get(alias).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Resolve a service or virtual name to a concrete service
    pub fn lookup(&self, name: &str) -> Option<&str> {
        self.lookup_preferring(name, &[])
    }

    /// Like [`lookup`](Self::lookup), but a provider listed in `preferred`
    /// wins over the alphabetical default. A real service shadows an alias.
    fn lookup_preferring(&self, name: &str, preferred: &[&str]) -> Option<&str> {
        if let Some((key, _)) = self.services.get_key_value(name) {
            return Some(key.as_str());
        }
        let providers = self.providers.get(name)?;
        preferred
            .iter()
            .find_map(|p| providers.iter().find(|q| q.as_str() == *p))
            .or_else(|| providers.first())
            .map(String::as_str)
    }

    /// Every concrete service `name` denotes, restricted to `set`
    fn members_in<'a>(&'a self, name: &str, set: &HashSet<&'a str>) -> Vec<&'a str> {
        if let Some((key, _)) = self.services.get_key_value(name) {
            return if set.contains(key.as_str()) {
                vec![key.as_str()]
            } else {
                Vec::new()
            };
        }
        self.providers
            .get(name)
            .into_iter()
            .flatten()
            .map(String::as_str)
            .filter(|p| set.contains(p))
            .collect()
    }

    /// Direct dependencies of `name` of one kind, resolved to known services.
    /// Unknown targets are left out.
    pub fn dependencies(&self, name: &str, kind: DependencyKind) -> Vec<&str> {
        let Some(svc) = self.services.get(name) else {
            return Vec::new();
        };
        svc.targets(kind)
            .filter_map(|t| self.lookup(t))
            .collect()
    }

    /// Order `targets` and everything they need.
    ///
    /// Independent services keep the order in which `targets` lists them,
    /// so identical input always gives identical output.
    pub fn resolve<S: AsRef<str>>(
        &self,
        targets: &[S],
        direction: Direction,
    ) -> Result<Vec<String>, ResolveError> {
        // Real services named in the request decide between alias providers
        let preferred: Vec<&str> = targets
            .iter()
            .map(|t| t.as_ref())
            .filter(|t| self.services.contains_key(*t))
            .collect();

        let mut closure: Vec<&str> = Vec::new();
        let mut in_closure: HashSet<&str> = HashSet::new();
        for target in targets {
            let target = target.as_ref();
            let name = self
                .lookup_preferring(target, &preferred)
                .ok_or_else(|| ResolveError::UnknownService(target.to_string()))?;
            if in_closure.insert(name) {
                closure.push(name);
            }
        }
        let roots = closure.clone();

        // Transitive need closure, breadth first so discovery order is stable
        let mut i = 0;
        while i < closure.len() {
            let name = closure[i];
            i += 1;
            let Some(svc) = self.services.get(name) else {
                continue;
            };
            for target in svc.targets(DependencyKind::Need) {
                let dep = self.lookup_preferring(target, &preferred).ok_or_else(|| {
                    ResolveError::MissingDependency {
                        service: name.to_string(),
                        target: target.to_string(),
                    }
                })?;
                if in_closure.insert(dep) {
                    closure.push(dep);
                }
            }
        }

        let mut edges = self.hard_edges(&closure, &in_closure, &preferred);

        let mut marks = HashMap::new();
        for &root in &roots {
            find_cycle(root, &edges, &mut marks)?;
        }

        self.add_advisory_edges(&closure, &in_closure, &mut edges);

        let mut order = Vec::with_capacity(closure.len());
        let mut marks = HashMap::new();
        for &root in &roots {
            emit_post_order(root, &edges, &mut marks, &mut order);
        }

        if direction == Direction::Stop {
            order.reverse();
        }
        Ok(order)
    }

    /// Order every member of a runlevel
    pub fn resolve_runlevel(
        &self,
        registry: &RunlevelRegistry,
        runlevel: &str,
        direction: Direction,
    ) -> Result<Vec<String>, ResolveError> {
        let definition = registry
            .get(runlevel)
            .ok_or_else(|| ResolveError::UnknownRunlevel(runlevel.to_string()))?;
        self.resolve(definition.members(), direction)
    }

    /// Need edges plus use edges whose target is already in the closure
    fn hard_edges<'a>(
        &'a self,
        closure: &[&'a str],
        in_closure: &HashSet<&'a str>,
        preferred: &[&str],
    ) -> Edges<'a> {
        let mut edges: Edges<'a> = HashMap::new();
        for &name in closure {
            let preds = edges.entry(name).or_default();
            let Some(svc) = self.services.get(name) else {
                continue;
            };
            for dep in svc.dependencies.iter().filter(|d| d.kind.is_hard()) {
                let resolved: Vec<&'a str> = if dep.kind == DependencyKind::Need {
                    self.lookup_preferring(&dep.target, preferred).into_iter().collect()
                } else {
                    self.members_in(&dep.target, in_closure)
                };
                for target in resolved {
                    if !preds.contains(&target) {
                        preds.push(target);
                    }
                }
            }
        }
        edges
    }

    /// Fold in before/after hints that do not contradict existing edges
    fn add_advisory_edges<'a>(
        &'a self,
        closure: &[&'a str],
        in_closure: &HashSet<&'a str>,
        edges: &mut Edges<'a>,
    ) {
        for &name in closure {
            let Some(svc) = self.services.get(name) else {
                continue;
            };
            for dep in svc.dependencies.iter().filter(|d| d.kind.is_advisory()) {
                for other in self.members_in(&dep.target, in_closure) {
                    let (first, then) = if dep.kind == DependencyKind::After {
                        (other, name)
                    } else {
                        (name, other)
                    };
                    if first == then || edges.get(then).is_some_and(|p| p.contains(&first)) {
                        continue;
                    }
                    if reaches(first, then, edges) {
                        log::debug!(
                            "Ignoring '{} {}' on {}: it contradicts a stronger ordering",
                            dep.kind,
                            dep.target,
                            name
                        );
                        continue;
                    }
                    edges.entry(then).or_default().push(first);
                }
            }
        }
    }
}

/// Depth-first walk over hard edges that fails on the first back edge
///
/// Iterative so that long `need` chains cannot exhaust the thread stack.
/// `path` holds the current walk; each entry keeps a cursor into its edges.
fn find_cycle<'a>(
    root: &'a str,
    edges: &Edges<'a>,
    marks: &mut HashMap<&'a str, Mark>,
) -> Result<(), CyclicDependencyError> {
    if marks.contains_key(root) {
        return Ok(());
    }
    marks.insert(root, Mark::InProgress);
    let mut path: Vec<(&'a str, usize)> = vec![(root, 0)];

    while let Some(top) = path.last_mut() {
        let node = top.0;
        let Some(&dep) = edges.get(node).and_then(|preds| preds.get(top.1)) else {
            path.pop();
            marks.insert(node, Mark::Done);
            continue;
        };
        top.1 += 1;

        match marks.get(dep) {
            Some(Mark::Done) => {}
            Some(Mark::InProgress) => {
                let entry = path.iter().position(|(n, _)| *n == dep).unwrap_or(0);
                let mut cycle: Vec<String> =
                    path[entry..].iter().map(|(n, _)| n.to_string()).collect();
                cycle.push(dep.to_string());
                return Err(CyclicDependencyError { cycle });
            }
            None => {
                marks.insert(dep, Mark::InProgress);
                path.push((dep, 0));
            }
        }
    }
    Ok(())
}

/// Post-order walk: every predecessor lands before its dependent
fn emit_post_order<'a>(
    root: &'a str,
    edges: &Edges<'a>,
    marks: &mut HashMap<&'a str, Mark>,
    order: &mut Vec<String>,
) {
    if marks.contains_key(root) {
        return;
    }
    marks.insert(root, Mark::InProgress);
    let mut path: Vec<(&'a str, usize)> = vec![(root, 0)];

    while let Some(top) = path.last_mut() {
        let node = top.0;
        match edges.get(node).and_then(|preds| preds.get(top.1)) {
            Some(&dep) => {
                top.1 += 1;
                if !marks.contains_key(dep) {
                    marks.insert(dep, Mark::InProgress);
                    path.push((dep, 0));
                }
            }
            None => {
                path.pop();
                marks.insert(node, Mark::Done);
                order.push(node.to_string());
            }
        }
    }
}

/// True when `to` is among the transitive predecessors of `from`
fn reaches(from: &str, to: &str, edges: &Edges<'_>) -> bool {
    let mut seen: HashSet<&str> = HashSet::new();
    let mut pending = vec![from];
    while let Some(node) = pending.pop() {
        if node == to {
            return true;
        }
        if seen.insert(node) {
            pending.extend(edges.get(node).into_iter().flatten().copied());
        }
    }
    false
}

/// Error when hard dependencies form a loop
///
/// `cycle` lists the walk from the entry node back to itself, e.g. `[a, b, a]`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Dependency cycle detected: {}", .cycle.join(" -> "))]
pub struct CyclicDependencyError {
    pub cycle: Vec<String>,
}

impl CyclicDependencyError {
    /// Distinct services on the cycle
    pub fn members(&self) -> BTreeSet<&str> {
        self.cycle.iter().map(String::as_str).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResolveError {
    #[error("Unknown service: {0}")]
    UnknownService(String),

    #[error("Unknown runlevel: {0}")]
    UnknownRunlevel(String),

    #[error("Service {service} needs '{target}', which no service provides")]
    MissingDependency { service: String, target: String },

    #[error(transparent)]
    Cycle(#[from] CyclicDependencyError),
}
