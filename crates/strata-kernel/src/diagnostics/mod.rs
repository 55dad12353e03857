//! Dependency Diagnostics
//!
//! Builds the module dependency graph from descriptors and derives a
//! deterministic start order:
//! - explicit module requirements and capability providers become edges
//! - missing requirements, exclusive-provider clashes, start-level
//!   inversions and cycles are collected as findings, never raised
//! - ties are broken by (start level, module id) everywhere
//!
//! Pure: reading modules' descriptors is the only input, the report is the
//! only output.

use crate::module::{ModuleDescriptor, ModuleRegistry, Requirement};
use crate::services::Capability;
use crate::types::ModuleId;
use indexmap::{IndexMap, IndexSet};
use petgraph::graphmap::DiGraphMap;
use petgraph::Direction;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::fmt;
use tracing::debug;

/// Start level assumed for ids that have no descriptor.
const UNKNOWN_LEVEL: u32 = 1;

/// Snapshot of the dependency analysis of a module set.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DiagnosticsReport {
    dependency_graph: IndexMap<ModuleId, Vec<ModuleId>>,
    start_order: Vec<ModuleId>,
    missing_requirements: Vec<String>,
    conflicts: Vec<String>,
}

impl DiagnosticsReport {
    /// Module → the modules it depends on, in declaration order. Every
    /// analysed module is a key, even without dependencies.
    #[inline]
    #[must_use]
    pub fn dependency_graph(&self) -> &IndexMap<ModuleId, Vec<ModuleId>> {
        &self.dependency_graph
    }

    /// Computed activation order. Only trustworthy when [`Self::is_clean`].
    #[inline]
    #[must_use]
    pub fn start_order(&self) -> &[ModuleId] {
        &self.start_order
    }

    #[inline]
    #[must_use]
    pub fn missing_requirements(&self) -> &[String] {
        &self.missing_requirements
    }

    #[inline]
    #[must_use]
    pub fn conflicts(&self) -> &[String] {
        &self.conflicts
    }

    /// No missing requirements and no conflicts.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.missing_requirements.is_empty() && self.conflicts.is_empty()
    }
}

impl fmt::Display for DiagnosticsReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Dependency graph:")?;
        for (id, deps) in &self.dependency_graph {
            writeln!(f, " - {id} -> {}", id_list(deps))?;
        }

        writeln!(f)?;
        writeln!(f, "Start order:")?;
        for (i, id) in self.start_order.iter().enumerate() {
            writeln!(f, " {}) {id}", i + 1)?;
        }

        if !self.missing_requirements.is_empty() {
            writeln!(f)?;
            writeln!(f, "Missing requirements:")?;
            for line in &self.missing_requirements {
                writeln!(f, " - {line}")?;
            }
        }

        if !self.conflicts.is_empty() {
            writeln!(f)?;
            writeln!(f, "Conflicts:")?;
            for line in &self.conflicts {
                writeln!(f, " - {line}")?;
            }
        }
        Ok(())
    }
}

/// Analyse every module in `registry`.
#[must_use]
pub fn build_report(registry: &ModuleRegistry) -> DiagnosticsReport {
    let modules = registry.all();
    analyze(modules.iter().map(|m| m.descriptor()))
}

/// Analyse a set of descriptors, given in registration order.
#[must_use]
pub fn analyze<'a, I>(descriptors: I) -> DiagnosticsReport
where
    I: IntoIterator<Item = &'a ModuleDescriptor>,
{
    let descriptors: IndexMap<&ModuleId, &ModuleDescriptor> =
        descriptors.into_iter().map(|d| (d.id(), d)).collect();
    let rank = |id: &ModuleId| {
        let level = descriptors
            .get(id)
            .map_or(UNKNOWN_LEVEL, |d| d.start_level());
        (level, id.clone())
    };

    // capability → providers (registration order), exclusive flag
    let mut providers: IndexMap<Capability, (Vec<&ModuleId>, bool)> = IndexMap::new();
    for descriptor in descriptors.values() {
        for provision in descriptor.provisions() {
            let slot = providers.entry(provision.capability).or_default();
            slot.0.push(descriptor.id());
            slot.1 |= provision.exclusive;
        }
    }

    let mut missing = Vec::new();
    let mut conflicts = Vec::new();

    for (capability, (ids, exclusive)) in &providers {
        if *exclusive && ids.len() > 1 {
            let ids: Vec<ModuleId> = ids.iter().map(|id| (*id).clone()).collect();
            conflicts.push(format!(
                "Exclusive service conflict: {capability} has multiple providers {}",
                id_list(&ids)
            ));
        }
    }

    let mut graph: IndexMap<ModuleId, Vec<ModuleId>> = IndexMap::new();
    for descriptor in descriptors.values() {
        let mut deps: IndexSet<ModuleId> = IndexSet::new();

        for requirement in descriptor.requirements() {
            match requirement {
                Requirement::Module { module_id } => {
                    deps.insert(module_id.clone());
                    match descriptors.get(module_id) {
                        Some(dep) => check_level(descriptor, dep, &mut conflicts),
                        None => missing.push(format!(
                            "{} requires missing module {module_id}",
                            descriptor.id()
                        )),
                    }
                }
                Requirement::Service {
                    capability,
                    optional,
                } => {
                    let Some((ids, _)) = providers.get(capability).filter(|(ids, _)| !ids.is_empty())
                    else {
                        if !optional {
                            missing.push(format!(
                                "{} requires missing service {capability}",
                                descriptor.id()
                            ));
                        }
                        continue;
                    };

                    let mut sorted: Vec<&ModuleId> = ids.clone();
                    sorted.sort_by_cached_key(|id| rank(*id));
                    for provider in sorted {
                        if provider == descriptor.id() {
                            continue;
                        }
                        deps.insert(provider.clone());
                        if let Some(dep) = descriptors.get(provider) {
                            check_level(descriptor, dep, &mut conflicts);
                        }
                    }
                }
            }
        }

        graph.insert(descriptor.id().clone(), deps.into_iter().collect());
    }

    let start_order = sort_by_start_level(&graph, &rank, &mut conflicts);

    debug!(
        modules = graph.len(),
        missing = missing.len(),
        conflicts = conflicts.len(),
        "diagnostics report built"
    );

    DiagnosticsReport {
        dependency_graph: graph,
        start_order,
        missing_requirements: missing,
        conflicts,
    }
}

fn check_level(me: &ModuleDescriptor, dep: &ModuleDescriptor, conflicts: &mut Vec<String>) {
    if dep.start_level() > me.start_level() {
        conflicts.push(format!(
            "StartLevel conflict: {}(level {}) requires {}(level {})",
            me.id(),
            me.start_level(),
            dep.id(),
            dep.start_level()
        ));
    }
}

/// Kahn's algorithm with a (level, id) min-heap.
///
/// Ids that only appear as dependencies (missing modules) take part in the
/// sort but are left out of the order. On a cycle the remainder is reported
/// and every module is returned in comparator order instead.
fn sort_by_start_level<F>(
    graph: &IndexMap<ModuleId, Vec<ModuleId>>,
    rank: &F,
    conflicts: &mut Vec<String>,
) -> Vec<ModuleId>
where
    F: Fn(&ModuleId) -> (u32, ModuleId),
{
    let mut ids: Vec<&ModuleId> = Vec::new();
    let mut index: HashMap<&ModuleId, usize> = HashMap::new();
    let mut dag: DiGraphMap<usize, ()> = DiGraphMap::new();
    for (id, deps) in graph {
        let node = node_of(id, &mut ids, &mut index);
        dag.add_node(node);
        for dep in deps {
            let from = node_of(dep, &mut ids, &mut index);
            // dependency → dependent
            dag.add_edge(from, node, ());
        }
    }

    let mut indegree: Vec<usize> = (0..ids.len())
        .map(|n| dag.neighbors_directed(n, Direction::Incoming).count())
        .collect();
    let mut ready: BinaryHeap<Reverse<((u32, ModuleId), usize)>> = indegree
        .iter()
        .enumerate()
        .filter(|(_, d)| **d == 0)
        .map(|(n, _)| Reverse((rank(ids[n]), n)))
        .collect();

    let mut order = Vec::with_capacity(graph.len());
    while let Some(Reverse((_, n))) = ready.pop() {
        if graph.contains_key(ids[n]) {
            order.push(ids[n].clone());
        }
        for dependent in dag.neighbors_directed(n, Direction::Outgoing) {
            indegree[dependent] -= 1;
            if indegree[dependent] == 0 {
                ready.push(Reverse((rank(ids[dependent]), dependent)));
            }
        }
    }

    if order.len() == graph.len() {
        return order;
    }

    let mut remaining: Vec<&ModuleId> = graph.keys().filter(|id| !order.contains(*id)).collect();
    remaining.sort_by_cached_key(|id| rank(*id));
    let owned: Vec<ModuleId> = remaining.iter().map(|id| (*id).clone()).collect();
    conflicts.push(format!(
        "Dependency cycle detected (topoSort incomplete). Remaining={}",
        id_list(&owned)
    ));
    for id in &remaining {
        let mut inner: Vec<ModuleId> = graph
            .get(*id)
            .map(|deps| deps.iter().filter(|d| owned.contains(*d)).cloned().collect())
            .unwrap_or_default();
        if !inner.is_empty() {
            inner.sort_by_cached_key(|d| rank(d));
            conflicts.push(format!(" - {id} depends on {}", id_list(&inner)));
        }
    }

    let mut fallback: Vec<ModuleId> = graph.keys().cloned().collect();
    fallback.sort_by_cached_key(|id| rank(id));
    fallback
}

fn node_of<'a>(
    id: &'a ModuleId,
    ids: &mut Vec<&'a ModuleId>,
    index: &mut HashMap<&'a ModuleId, usize>,
) -> usize {
    *index.entry(id).or_insert_with(|| {
        ids.push(id);
        ids.len() - 1
    })
}

fn id_list(ids: &[ModuleId]) -> String {
    let joined = ids
        .iter()
        .map(ModuleId::as_str)
        .collect::<Vec<_>>()
        .join(", ");
    format!("[{joined}]")
}
