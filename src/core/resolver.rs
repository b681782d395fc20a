//! Dependency DAG construction.
//!
//! Edges come from two sources: every `${kind.name.attr}` reference inside a
//! resource's attributes, and explicit `depends_on` entries. An edge `A -> B`
//! means A must be fully applied before B. Duplicate edges collapse.
//!
//! Cycles are found with a depth-first walk that keeps the recursion stack,
//! so the error names the exact cycle in order. Topological order uses
//! Kahn's algorithm with alphabetical tie-breaking for determinism.

use super::error::ConfigError;
use super::types::{Address, ResourceSet};
use rustc_hash::FxHashSet;
use std::collections::{BTreeMap, BTreeSet, VecDeque};

static EMPTY: BTreeSet<Address> = BTreeSet::new();

/// Directed acyclic dependency graph over addresses.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DependencyGraph {
    nodes: BTreeSet<Address>,
    /// node -> addresses it waits for
    dependencies: BTreeMap<Address, BTreeSet<Address>>,
    /// node -> addresses waiting for it
    dependents: BTreeMap<Address, BTreeSet<Address>>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_node(&mut self, address: Address) {
        self.nodes.insert(address);
    }

    /// Record that `before` must complete before `after`.
    pub fn add_edge(&mut self, before: &Address, after: &Address) {
        self.nodes.insert(before.clone());
        self.nodes.insert(after.clone());
        self.dependencies
            .entry(after.clone())
            .or_default()
            .insert(before.clone());
        self.dependents
            .entry(before.clone())
            .or_default()
            .insert(after.clone());
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Address> {
        self.nodes.iter()
    }

    pub fn contains(&self, address: &Address) -> bool {
        self.nodes.contains(address)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Addresses that must complete before `address`.
    pub fn dependencies_of(&self, address: &Address) -> &BTreeSet<Address> {
        self.dependencies.get(address).unwrap_or(&EMPTY)
    }

    /// Addresses that wait for `address`.
    pub fn dependents_of(&self, address: &Address) -> &BTreeSet<Address> {
        self.dependents.get(address).unwrap_or(&EMPTY)
    }

    /// All edges as `(before, after)` pairs, sorted.
    pub fn edges(&self) -> Vec<(Address, Address)> {
        self.dependents
            .iter()
            .flat_map(|(before, afters)| afters.iter().map(move |a| (before.clone(), a.clone())))
            .collect()
    }

    pub fn edge_count(&self) -> usize {
        self.dependents.values().map(BTreeSet::len).sum()
    }

    /// True if `to` is reachable from `from` along edges.
    pub fn has_path(&self, from: &Address, to: &Address) -> bool {
        self.transitive_dependents(from).contains(to)
    }

    /// Every address reachable from `address` (excluding itself unless cyclic).
    pub fn transitive_dependents(&self, address: &Address) -> BTreeSet<Address> {
        let mut seen = BTreeSet::new();
        let mut queue: VecDeque<&Address> = self.dependents_of(address).iter().collect();
        while let Some(next) = queue.pop_front() {
            if seen.insert(next.clone()) {
                queue.extend(self.dependents_of(next).iter());
            }
        }
        seen
    }

    /// Find a cycle, returned in edge order (each element precedes the next,
    /// the last precedes the first).
    pub fn find_cycle(&self) -> Option<Vec<Address>> {
        let mut done: FxHashSet<&Address> = FxHashSet::default();
        let mut on_stack: FxHashSet<&Address> = FxHashSet::default();
        let mut stack: Vec<&Address> = Vec::new();

        for start in &self.nodes {
            if done.contains(start) {
                continue;
            }
            if let Some(cycle) = self.visit(start, &mut done, &mut on_stack, &mut stack) {
                return Some(cycle);
            }
        }
        None
    }

    fn visit<'a>(
        &'a self,
        node: &'a Address,
        done: &mut FxHashSet<&'a Address>,
        on_stack: &mut FxHashSet<&'a Address>,
        stack: &mut Vec<&'a Address>,
    ) -> Option<Vec<Address>> {
        stack.push(node);
        on_stack.insert(node);

        for next in self.dependents_of(node) {
            if on_stack.contains(next) {
                let start = stack.iter().position(|n| *n == next).unwrap_or(0);
                return Some(stack[start..].iter().map(|a| (*a).clone()).collect());
            }
            if !done.contains(next) {
                if let Some(cycle) = self.visit(next, done, on_stack, stack) {
                    return Some(cycle);
                }
            }
        }

        stack.pop();
        on_stack.remove(node);
        done.insert(node);
        None
    }

    /// Topological order with alphabetical tie-breaking.
    /// Nodes on a cycle are omitted; callers check [`Self::find_cycle`] first.
    pub fn topological_order(&self) -> Vec<Address> {
        let mut in_degree: BTreeMap<&Address, usize> = self
            .nodes
            .iter()
            .map(|n| (n, self.dependencies_of(n).len()))
            .collect();

        let mut ready: BTreeSet<&Address> = in_degree
            .iter()
            .filter(|(_, &d)| d == 0)
            .map(|(n, _)| *n)
            .collect();

        let mut order = Vec::with_capacity(self.nodes.len());
        while let Some(current) = ready.pop_first() {
            order.push(current.clone());
            for next in self.dependents_of(current) {
                if let Some(degree) = in_degree.get_mut(next) {
                    *degree -= 1;
                    if *degree == 0 {
                        ready.insert(next);
                    }
                }
            }
        }
        order
    }
}

/// Build the dependency DAG for a validated resource set.
///
/// Fails with every reference/dependency error found, or with the first
/// cycle. Self-references are reported on their own, never as cycles.
pub fn build_graph(resources: &ResourceSet) -> Result<DependencyGraph, Vec<ConfigError>> {
    let mut graph = DependencyGraph::new();
    let mut errors = Vec::new();

    for resource in resources.iter() {
        let address = &resource.address;
        graph.add_node(address.clone());
        let mut self_referenced = false;

        for target in resource.references() {
            if &target == address {
                self_referenced = true;
            } else if !resources.contains(&target) {
                errors.push(ConfigError::UnresolvedReference {
                    from: address.clone(),
                    target,
                });
            } else {
                graph.add_edge(&target, address);
            }
        }

        for dep in &resource.depends_on {
            if dep == address {
                self_referenced = true;
            } else if !resources.contains(dep) {
                errors.push(ConfigError::UnknownDependency {
                    from: address.clone(),
                    target: dep.to_string(),
                });
            } else {
                graph.add_edge(dep, address);
            }
        }

        if self_referenced {
            errors.push(ConfigError::SelfReference {
                address: address.clone(),
            });
        }
    }

    if !errors.is_empty() {
        return Err(errors);
    }

    if let Some(cycle) = graph.find_cycle() {
        return Err(vec![ConfigError::Cycle { cycle }]);
    }

    Ok(graph)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{Lifecycle, Resource};
    use crate::core::value::{Reference, Value};
    use indexmap::IndexMap;
    use proptest::prelude::*;

    fn addr(s: &str) -> Address {
        s.parse().unwrap()
    }

    fn reference(target: &str) -> Value {
        Value::Reference(Reference {
            target: addr(target),
            path: vec!["id".to_string()],
        })
    }

    fn resource(address: &str, refs: &[&str], deps: &[&str]) -> Resource {
        let mut attributes = IndexMap::new();
        attributes.insert("name".to_string(), Value::string(address));
        for (i, r) in refs.iter().enumerate() {
            attributes.insert(format!("ref{}", i), reference(r));
        }
        Resource {
            address: addr(address),
            attributes,
            depends_on: deps.iter().map(|d| addr(d)).collect(),
            lifecycle: Lifecycle::default(),
        }
    }

    fn set(resources: Vec<Resource>) -> ResourceSet {
        ResourceSet {
            name: "test".to_string(),
            resources: resources
                .into_iter()
                .map(|r| (r.address.clone(), r))
                .collect(),
        }
    }

    #[test]
    fn test_reference_edges() {
        let g = build_graph(&set(vec![
            resource("network.n", &[], &[]),
            resource("subnetwork.s", &["network.n"], &[]),
            resource("managed-database.d", &["network.n"], &[]),
        ]))
        .unwrap();
        assert_eq!(g.edge_count(), 2);
        assert!(g.dependents_of(&addr("network.n")).contains(&addr("subnetwork.s")));
        assert!(g.dependencies_of(&addr("managed-database.d")).contains(&addr("network.n")));
        assert!(!g.has_path(&addr("subnetwork.s"), &addr("managed-database.d")));
    }

    #[test]
    fn test_duplicate_edges_collapse() {
        let g = build_graph(&set(vec![
            resource("network.n", &[], &[]),
            resource("subnetwork.s", &["network.n", "network.n"], &["network.n"]),
        ]))
        .unwrap();
        assert_eq!(g.edge_count(), 1);
    }

    #[test]
    fn test_self_reference_rejected() {
        let errors = build_graph(&set(vec![resource("network.n", &["network.n"], &[])])).unwrap_err();
        assert_eq!(
            errors,
            vec![ConfigError::SelfReference {
                address: addr("network.n")
            }]
        );
    }

    #[test]
    fn test_self_dependency_rejected() {
        let errors = build_graph(&set(vec![resource("network.n", &[], &["network.n"])])).unwrap_err();
        assert!(matches!(errors[0], ConfigError::SelfReference { .. }));
    }

    #[test]
    fn test_unresolved_reference() {
        let errors = build_graph(&set(vec![resource(
            "compute-service.c",
            &["managed-database.d"],
            &[],
        )]))
        .unwrap_err();
        assert_eq!(
            errors,
            vec![ConfigError::UnresolvedReference {
                from: addr("compute-service.c"),
                target: addr("managed-database.d"),
            }]
        );
        assert!(errors[0].to_string().starts_with("unresolved reference"));
    }

    #[test]
    fn test_unknown_dependency() {
        let errors = build_graph(&set(vec![resource("network.n", &[], &["secret.ghost"])])).unwrap_err();
        assert!(matches!(errors[0], ConfigError::UnknownDependency { .. }));
    }

    #[test]
    fn test_two_node_cycle_in_order() {
        let errors = build_graph(&set(vec![
            resource("network.a", &["network.b"], &[]),
            resource("network.b", &[], &["network.a"]),
        ]))
        .unwrap_err();
        assert_eq!(
            errors,
            vec![ConfigError::Cycle {
                cycle: vec![addr("network.a"), addr("network.b")]
            }]
        );
    }

    #[test]
    fn test_cycle_excludes_upstream_nodes() {
        // root -> x -> y -> z -> x
        let errors = build_graph(&set(vec![
            resource("network.root", &[], &[]),
            resource("network.x", &["network.root", "network.z"], &[]),
            resource("network.y", &["network.x"], &[]),
            resource("network.z", &["network.y"], &[]),
        ]))
        .unwrap_err();
        match &errors[0] {
            ConfigError::Cycle { cycle } => {
                assert_eq!(cycle.len(), 3);
                assert!(!cycle.contains(&addr("network.root")));
            }
            other => panic!("expected cycle, got {:?}", other),
        }
    }

    #[test]
    fn test_topo_diamond() {
        let g = build_graph(&set(vec![
            resource("network.top", &[], &[]),
            resource("subnetwork.right", &["network.top"], &[]),
            resource("subnetwork.left", &["network.top"], &[]),
            resource("cluster.bottom", &["subnetwork.left", "subnetwork.right"], &[]),
        ]))
        .unwrap();
        let order: Vec<String> = g.topological_order().iter().map(|a| a.to_string()).collect();
        assert_eq!(
            order,
            vec!["network.top", "subnetwork.left", "subnetwork.right", "cluster.bottom"]
        );
    }

    #[test]
    fn test_transitive_dependents() {
        let g = build_graph(&set(vec![
            resource("network.n", &[], &[]),
            resource("subnetwork.s", &["network.n"], &[]),
            resource("cluster.c", &["subnetwork.s"], &[]),
            resource("secret.x", &[], &[]),
        ]))
        .unwrap();
        let down = g.transitive_dependents(&addr("network.n"));
        assert_eq!(down.len(), 2);
        assert!(g.has_path(&addr("network.n"), &addr("cluster.c")));
        assert!(!g.has_path(&addr("cluster.c"), &addr("network.n")));
    }

    /// Random DAG: node i may reference any node j < i.
    fn arb_dag() -> impl Strategy<Value = Vec<Vec<usize>>> {
        (1usize..12).prop_flat_map(|n| {
            (0..n)
                .map(|i| proptest::collection::vec(0..i.max(1), 0..=i.min(4)))
                .collect::<Vec<_>>()
        })
    }

    proptest! {
        #[test]
        fn prop_edges_match_references(dag in arb_dag()) {
            let names: Vec<String> = (0..dag.len()).map(|i| format!("network.n{}", i)).collect();
            let resources: Vec<Resource> = dag
                .iter()
                .enumerate()
                .map(|(i, refs)| {
                    let targets: Vec<&str> = refs
                        .iter()
                        .filter(|&&j| j < i)
                        .map(|&j| names[j].as_str())
                        .collect();
                    resource(&names[i], &targets, &[])
                })
                .collect();
            let expected: BTreeSet<(Address, Address)> = resources
                .iter()
                .flat_map(|r| r.references().into_iter().map(move |t| (t, r.address.clone())))
                .collect();

            let g = build_graph(&set(resources)).unwrap();
            let actual: BTreeSet<(Address, Address)> = g.edges().into_iter().collect();
            prop_assert_eq!(actual, expected);
            prop_assert_eq!(g.topological_order().len(), dag.len());
        }

        #[test]
        fn prop_ring_cycle_names_every_member(n in 2usize..8) {
            let names: Vec<String> = (0..n).map(|i| format!("network.r{}", i)).collect();
            let resources: Vec<Resource> = (0..n)
                .map(|i| resource(&names[i], &[names[(i + 1) % n].as_str()], &[]))
                .collect();
            let errors = build_graph(&set(resources)).unwrap_err();
            match &errors[0] {
                ConfigError::Cycle { cycle } => {
                    prop_assert_eq!(cycle.len(), n);
                    for name in &names {
                        prop_assert!(cycle.contains(&addr(name)));
                    }
                }
                other => prop_assert!(false, "expected cycle, got {:?}", other),
            }
        }
    }
}
