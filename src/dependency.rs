//! Dependency graph derived from the registry.
//!
//! The graph is rebuilt from scratch on every registry change, so it never
//! drifts from the records it describes.

use std::collections::{BTreeSet, HashMap};

use parking_lot::RwLock;

use crate::error::{Error, ErrorCode, Result};
use crate::registry::PluginRegistry;

/// One plugin in the dependency graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyNode {
    /// Plugin id.
    pub plugin_id: String,
    /// Declared dependencies, present or not.
    pub declared: BTreeSet<String>,
    /// Edges to dependencies that are present in the graph.
    pub dependencies: BTreeSet<String>,
    /// Plugins that depend on this one.
    pub dependents: BTreeSet<String>,
    /// Position in the current load order, `-1` when unordered.
    pub load_order: i32,
}

impl DependencyNode {
    fn new(plugin_id: &str, declared: impl IntoIterator<Item = String>) -> Self {
        Self {
            plugin_id: plugin_id.to_string(),
            declared: declared.into_iter().collect(),
            dependencies: BTreeSet::new(),
            dependents: BTreeSet::new(),
            load_order: -1,
        }
    }
}

/// A detected dependency cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircularDependency {
    /// Nodes in cycle order; each depends on the next, the last on the first.
    pub cycle: Vec<String>,
    /// Node whose outgoing cycle edge is cut when breaking the cycle.
    pub suggested_break_point: String,
}

/// How [`DependencyResolver::resolve_circular_dependencies`] treats cycles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleResolution {
    /// Report cycles without changing the graph.
    None,
    /// Remove the edge from the break point to its successor in the cycle.
    RemoveWeakest,
    /// Clear the break point's dependencies.
    DisablePlugin,
    /// Load a cycle as one unit. Not supported.
    LoadAsGroup,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unvisited,
    Temp,
    Done,
}

#[derive(Debug, Clone, Default)]
struct Graph {
    nodes: HashMap<String, DependencyNode>,
    order: Vec<String>,
}

impl Graph {
    fn build<I>(entries: I) -> Self
    where
        I: IntoIterator<Item = (String, Vec<String>)>,
    {
        let mut graph = Graph::default();
        for (id, deps) in entries {
            if graph.nodes.contains_key(&id) {
                continue;
            }
            graph.order.push(id.clone());
            graph.nodes.insert(id.clone(), DependencyNode::new(&id, deps));
        }
        graph.link();
        graph
    }

    fn link(&mut self) {
        let mut edges: Vec<(String, String)> = Vec::new();
        for id in &self.order {
            for dep in &self.nodes[id].declared {
                if dep != id && self.nodes.contains_key(dep) {
                    edges.push((id.clone(), dep.clone()));
                }
            }
        }

        for node in self.nodes.values_mut() {
            node.dependencies.clear();
            node.dependents.clear();
        }
        for (from, to) in edges {
            self.add_edge(&from, &to);
        }
    }

    fn add_edge(&mut self, from: &str, to: &str) {
        if let Some(node) = self.nodes.get_mut(from) {
            node.dependencies.insert(to.to_string());
        }
        if let Some(node) = self.nodes.get_mut(to) {
            node.dependents.insert(from.to_string());
        }
    }

    fn remove_edge(&mut self, from: &str, to: &str) {
        if let Some(node) = self.nodes.get_mut(from) {
            node.dependencies.remove(to);
        }
        if let Some(node) = self.nodes.get_mut(to) {
            node.dependents.remove(from);
        }
    }

    fn position(&self, id: &str) -> usize {
        self.order.iter().position(|o| o == id).unwrap_or(usize::MAX)
    }

    /// Dependencies of `id` restricted by `keep`, in insertion order.
    fn ordered_deps(&self, id: &str, keep: &dyn Fn(&str) -> bool) -> Vec<String> {
        let mut deps: Vec<String> = self
            .nodes
            .get(id)
            .map(|n| n.dependencies.iter().filter(|d| keep(d)).cloned().collect())
            .unwrap_or_default();
        deps.sort_by_key(|d| self.position(d));
        deps
    }

    /// Post-order DFS over `roots`. `None` when a cycle is reachable.
    fn topo_order(&self, roots: &[String], keep: &dyn Fn(&str) -> bool) -> Option<Vec<String>> {
        let mut marks: HashMap<&str, Mark> = HashMap::new();
        let mut out = Vec::with_capacity(roots.len());

        fn visit<'a>(
            graph: &'a Graph,
            id: &'a str,
            keep: &dyn Fn(&str) -> bool,
            marks: &mut HashMap<&'a str, Mark>,
            out: &mut Vec<String>,
        ) -> bool {
            match marks.get(id).copied().unwrap_or(Mark::Unvisited) {
                Mark::Done => return true,
                Mark::Temp => return false,
                Mark::Unvisited => {}
            }
            marks.insert(id, Mark::Temp);

            if let Some(node) = graph.nodes.get(id) {
                let mut deps: Vec<&'a String> =
                    node.dependencies.iter().filter(|d| keep(d)).collect();
                deps.sort_by_key(|d| graph.position(d));
                for dep in deps {
                    if !visit(graph, dep, keep, marks, out) {
                        return false;
                    }
                }
            }

            marks.insert(id, Mark::Done);
            out.push(id.to_string());
            true
        }

        for root in roots {
            if !self.nodes.contains_key(root) || !keep(root) {
                continue;
            }
            if !visit(self, root, keep, &mut marks, &mut out) {
                return None;
            }
        }
        Some(out)
    }

    fn has_cycle(&self) -> bool {
        let mut visited: BTreeSet<&str> = BTreeSet::new();
        let mut path: Vec<&str> = Vec::new();

        fn walk<'a>(
            graph: &'a Graph,
            id: &'a str,
            visited: &mut BTreeSet<&'a str>,
            path: &mut Vec<&'a str>,
        ) -> bool {
            if path.contains(&id) {
                return true;
            }
            if visited.contains(id) {
                return false;
            }
            path.push(id);
            if let Some(node) = graph.nodes.get(id) {
                for dep in &node.dependencies {
                    if walk(graph, dep, visited, path) {
                        return true;
                    }
                }
            }
            path.pop();
            visited.insert(id);
            false
        }

        self.order
            .iter()
            .any(|id| walk(self, id, &mut visited, &mut path))
    }

    fn cycles(&self) -> Vec<CircularDependency> {
        let mut marks: HashMap<String, Mark> = HashMap::new();
        let mut stack: Vec<String> = Vec::new();
        let mut found: Vec<CircularDependency> = Vec::new();
        let mut seen: BTreeSet<Vec<String>> = BTreeSet::new();

        fn walk(
            graph: &Graph,
            id: &str,
            marks: &mut HashMap<String, Mark>,
            stack: &mut Vec<String>,
            found: &mut Vec<CircularDependency>,
            seen: &mut BTreeSet<Vec<String>>,
        ) {
            marks.insert(id.to_string(), Mark::Temp);
            stack.push(id.to_string());

            for dep in graph.ordered_deps(id, &|_: &str| true) {
                match marks.get(&dep).copied().unwrap_or(Mark::Unvisited) {
                    Mark::Unvisited => walk(graph, &dep, marks, stack, found, seen),
                    Mark::Temp => {
                        if let Some(start) = stack.iter().position(|s| *s == dep) {
                            let cycle: Vec<String> = stack[start..].to_vec();
                            let mut key = cycle.clone();
                            key.sort();
                            if seen.insert(key) {
                                found.push(CircularDependency {
                                    suggested_break_point: cycle[0].clone(),
                                    cycle,
                                });
                            }
                        }
                    }
                    Mark::Done => {}
                }
            }

            stack.pop();
            marks.insert(id.to_string(), Mark::Done);
        }

        for id in &self.order {
            if marks.get(id).copied().unwrap_or(Mark::Unvisited) == Mark::Unvisited {
                walk(self, id, &mut marks, &mut stack, &mut found, &mut seen);
            }
        }
        found
    }

    fn renumber(&mut self) {
        let order = self.topo_order(&self.order.clone(), &|_: &str| true);
        for node in self.nodes.values_mut() {
            node.load_order = -1;
        }
        if let Some(order) = order {
            for (index, id) in order.iter().enumerate() {
                if let Some(node) = self.nodes.get_mut(id) {
                    node.load_order = index as i32;
                }
            }
        }
    }
}

/// Builds and queries the plugin dependency graph.
pub struct DependencyResolver {
    graph: RwLock<Graph>,
}

impl DependencyResolver {
    /// Create an empty resolver.
    pub fn new() -> Self {
        Self {
            graph: RwLock::new(Graph::default()),
        }
    }

    /// Rebuild the graph from the registry's records.
    pub fn update_dependency_graph(&self, registry: &PluginRegistry) {
        self.rebuild(
            registry
                .get_all_info()
                .into_iter()
                .map(|info| (info.id, info.metadata.dependencies)),
        );
    }

    /// Rebuild the graph from `(id, declared dependencies)` pairs.
    pub fn rebuild<I>(&self, entries: I)
    where
        I: IntoIterator<Item = (String, Vec<String>)>,
    {
        let mut graph = Graph::build(entries);
        graph.renumber();
        tracing::debug!(nodes = graph.nodes.len(), "dependency graph rebuilt");
        *self.graph.write() = graph;
    }

    /// Ids ordered so dependencies precede dependents. Empty on a cycle.
    pub fn get_load_order(&self) -> Vec<String> {
        let graph = self.graph.read();
        graph.topo_order(&graph.order, &|_: &str| true).unwrap_or_default()
    }

    /// Load order restricted to `subset`. Dependencies outside the subset
    /// are skipped. Empty when the subset contains a cycle.
    pub fn suggested_load_order(&self, subset: &[String]) -> Vec<String> {
        let graph = self.graph.read();
        let members: BTreeSet<&str> = subset.iter().map(String::as_str).collect();
        graph
            .topo_order(subset, &|id: &str| members.contains(id))
            .unwrap_or_default()
    }

    /// Check if the graph contains a cycle.
    pub fn has_circular_dependencies(&self) -> bool {
        self.graph.read().has_cycle()
    }

    /// Every distinct cycle in the graph.
    pub fn get_circular_dependencies(&self) -> Vec<CircularDependency> {
        self.graph.read().cycles()
    }

    /// Apply `strategy` to the cycles in the graph. Returns the cycles that
    /// were found.
    pub fn resolve_circular_dependencies(
        &self,
        strategy: CycleResolution,
    ) -> Result<Vec<CircularDependency>> {
        let mut graph = self.graph.write();
        let mut handled = Vec::new();

        if strategy == CycleResolution::LoadAsGroup {
            return Err(Error::not_implemented("loading cycles as a group"));
        }

        // Each pass breaks at least one edge, so this terminates.
        loop {
            let cycles = graph.cycles();
            if cycles.is_empty() {
                break;
            }
            if strategy == CycleResolution::None {
                for cycle in &cycles {
                    tracing::warn!(cycle = ?cycle.cycle, "circular dependency left in place");
                }
                return Ok(cycles);
            }

            for cycle in cycles {
                let breaker = cycle.suggested_break_point.clone();
                match strategy {
                    CycleResolution::RemoveWeakest => {
                        let successor = &cycle.cycle[1 % cycle.cycle.len()];
                        tracing::info!(from = %breaker, to = %successor, "removing dependency edge");
                        graph.remove_edge(&breaker, successor);
                    }
                    CycleResolution::DisablePlugin => {
                        tracing::info!(plugin_id = %breaker, "clearing dependencies to break cycle");
                        let deps: Vec<String> = graph
                            .nodes
                            .get(&breaker)
                            .map(|n| n.dependencies.iter().cloned().collect())
                            .unwrap_or_default();
                        for dep in deps {
                            graph.remove_edge(&breaker, &dep);
                        }
                        if let Some(node) = graph.nodes.get_mut(&breaker) {
                            node.declared.clear();
                        }
                    }
                    CycleResolution::None | CycleResolution::LoadAsGroup => {}
                }
                handled.push(cycle);
            }
        }

        graph.renumber();
        Ok(handled)
    }

    /// A plugin is safe to unload when nothing depends on it.
    pub fn can_unload_safely(&self, id: &str) -> bool {
        self.graph
            .read()
            .nodes
            .get(id)
            .map(|n| n.dependents.is_empty())
            .unwrap_or(true)
    }

    /// Direct dependents of a plugin, in insertion order.
    pub fn get_dependents(&self, id: &str) -> Vec<String> {
        let graph = self.graph.read();
        let mut dependents: Vec<String> = graph
            .nodes
            .get(id)
            .map(|n| n.dependents.iter().cloned().collect())
            .unwrap_or_default();
        dependents.sort_by_key(|d| graph.position(d));
        dependents
    }

    /// Direct dependencies present in the graph, in insertion order.
    pub fn get_dependencies(&self, id: &str) -> Vec<String> {
        self.graph.read().ordered_deps(id, &|_: &str| true)
    }

    /// Declared dependencies of `id` that are not in the graph.
    pub fn get_missing_dependencies(&self, id: &str) -> Vec<String> {
        let graph = self.graph.read();
        graph
            .nodes
            .get(id)
            .map(|n| {
                n.declared
                    .iter()
                    .filter(|d| !graph.nodes.contains_key(*d))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Fail with `CircularDependency` when the graph has a cycle.
    pub fn ensure_acyclic(&self) -> Result<()> {
        match self.get_circular_dependencies().into_iter().next() {
            Some(cycle) => Err(Error::new(
                ErrorCode::CircularDependency,
                format!("dependency cycle: {}", cycle.cycle.join(" -> ")),
            )),
            None => Ok(()),
        }
    }

    /// Snapshot of one node.
    pub fn node(&self, id: &str) -> Option<DependencyNode> {
        self.graph.read().nodes.get(id).cloned()
    }

    /// Snapshot of the whole graph.
    pub fn graph(&self) -> HashMap<String, DependencyNode> {
        self.graph.read().nodes.clone()
    }

    /// Number of nodes.
    pub fn len(&self) -> usize {
        self.graph.read().nodes.len()
    }

    /// Check if the graph is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for DependencyResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for DependencyResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DependencyResolver")
            .field("node_count", &self.len())
            .finish()
    }
}
