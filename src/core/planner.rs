//! Plan generation: order a change set into dependency-respecting batches.
//!
//! Every non-no-op change becomes one provider step; a replace becomes two
//! (delete + create) ordered by the resource's replace policy. Ordering
//! rules between steps:
//! - apply(A) before apply(B) when B depends on A
//! - delete(B) before delete(A) when B depends (or depended) on A
//! - apply(B) before delete(A) when B was updated away from A
//! - apply(B) before delete(A) when A is replaced create-before-destroy
//!
//! A deposed instance of A (left by an earlier create-before-destroy
//! replace whose delete failed) gets its own delete step. It runs before
//! any delete of A's current instance; otherwise after apply(A) and after
//! apply(B) for every B that now depends on A.
//!
//! Batches are longest-path layers of the resulting step DAG. Planning
//! fails closed: nothing is returned unless every step can be scheduled.

use super::error::{ConfigError, EngineError, PlanError};
use super::resolver::DependencyGraph;
use super::state::ResourceRecord;
use super::types::*;
use super::value::{redact, render_json, Resolution, REDACTED};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, VecDeque};

/// Build the plan for a change set.
pub fn build_plan(
    name: &str,
    environment: &str,
    changes: ChangeSet,
    graph: &DependencyGraph,
    resources: &ResourceSet,
    records: &BTreeMap<Address, ResourceRecord>,
) -> Result<Plan, EngineError> {
    check_prevent_destroy(&changes, resources)?;

    let mut steps: Vec<PlanStep> = Vec::new();
    let mut apply_step: BTreeMap<Address, usize> = BTreeMap::new();
    let mut delete_step: BTreeMap<Address, usize> = BTreeMap::new();
    let mut deposed_steps: Vec<(Address, usize)> = Vec::new();
    let mut edges: BTreeSet<(usize, usize)> = BTreeSet::new();

    for change in changes.changes() {
        let mut push = |operation, phase| {
            let id = steps.len();
            steps.push(PlanStep {
                id,
                address: change.address.clone(),
                operation,
                action: change.action,
                phase,
                requires: Vec::new(),
            });
            id
        };
        match change.action {
            ChangeAction::Create => {
                apply_step.insert(change.address.clone(), push(StepOperation::Create, None));
            }
            ChangeAction::Update => {
                apply_step.insert(change.address.clone(), push(StepOperation::Update, None));
            }
            ChangeAction::Delete => {
                delete_step.insert(change.address.clone(), push(StepOperation::Delete, None));
            }
            ChangeAction::Replace => {
                let (create, delete) = if change.create_before_destroy {
                    let c = push(StepOperation::Create, Some(ReplacePhase::Create));
                    let d = push(StepOperation::Delete, Some(ReplacePhase::Destroy));
                    edges.insert((c, d));
                    (c, d)
                } else {
                    let d = push(StepOperation::Delete, Some(ReplacePhase::Destroy));
                    let c = push(StepOperation::Create, Some(ReplacePhase::Create));
                    edges.insert((d, c));
                    (c, d)
                };
                apply_step.insert(change.address.clone(), create);
                delete_step.insert(change.address.clone(), delete);
            }
            ChangeAction::NoOp => {}
        }
        let deposed: Vec<usize> = (0..change.deposed.len())
            .map(|i| push(StepOperation::Delete, Some(ReplacePhase::Deposed(i))))
            .collect();
        for id in deposed {
            steps[id].action = ChangeAction::Delete;
            deposed_steps.push((change.address.clone(), id));
        }
    }

    // apply(A) before apply(B) when B depends on A
    for (a, b) in graph.edges() {
        if let (Some(&sa), Some(&sb)) = (apply_step.get(&a), apply_step.get(&b)) {
            edges.insert((sa, sb));
        }
    }

    for (b, &del_b) in &delete_step {
        // delete dependents first, using both current and recorded edges
        for a in prior_dependencies(b, graph, records) {
            if let Some(&del_a) = delete_step.get(&a) {
                edges.insert((del_b, del_a));
            }
        }
    }

    for (a, &del_a) in &delete_step {
        let replaced_cbd = changes
            .get(a)
            .is_some_and(|c| c.action == ChangeAction::Replace && c.create_before_destroy);
        for (b, &apply_b) in &apply_step {
            if b == a {
                continue;
            }
            let depends_now = graph.dependencies_of(b).contains(a);
            let depended_before = records.get(b).is_some_and(|r| r.dependencies.contains(a));
            if (depended_before && !depends_now) || (depends_now && replaced_cbd) {
                edges.insert((apply_b, del_a));
            }
        }
    }

    for (a, del_deposed) in &deposed_steps {
        let replaced_cbd = changes
            .get(a)
            .is_some_and(|c| c.action == ChangeAction::Replace && c.create_before_destroy);
        match delete_step.get(a) {
            Some(&del_a) if !replaced_cbd => {
                edges.insert((*del_deposed, del_a));
                for (b, &del_b) in &delete_step {
                    if b != a && prior_dependencies(b, graph, records).contains(a) {
                        edges.insert((del_b, *del_deposed));
                    }
                }
            }
            _ => {
                for (b, &apply_b) in &apply_step {
                    if b == a || graph.dependencies_of(b).contains(a) {
                        edges.insert((apply_b, *del_deposed));
                    }
                }
            }
        }
    }

    for (before, after) in &edges {
        steps[*after].requires.push(*before);
    }

    let batches = layer(&steps)?;
    tracing::debug!(steps = steps.len(), batches = batches.len(), "built plan");

    Ok(Plan {
        name: name.to_string(),
        environment: environment.to_string(),
        steps,
        batches,
        changes,
    })
}

fn check_prevent_destroy(changes: &ChangeSet, resources: &ResourceSet) -> Result<(), EngineError> {
    let violations: Vec<ConfigError> = changes
        .changes()
        .filter(|c| matches!(c.action, ChangeAction::Delete | ChangeAction::Replace))
        .filter(|c| {
            resources
                .get(&c.address)
                .is_some_and(|r| r.lifecycle.prevent_destroy)
        })
        .map(|c| ConfigError::PreventDestroy {
            address: c.address.clone(),
            action: c.action.to_string().to_lowercase(),
        })
        .collect();
    if violations.is_empty() {
        Ok(())
    } else {
        Err(EngineError::Configuration(violations))
    }
}

fn prior_dependencies(
    address: &Address,
    graph: &DependencyGraph,
    records: &BTreeMap<Address, ResourceRecord>,
) -> BTreeSet<Address> {
    let mut deps = graph.dependencies_of(address).clone();
    if let Some(record) = records.get(address) {
        deps.extend(record.dependencies.iter().cloned());
    }
    deps.remove(address);
    deps
}

/// Longest-path layering (Kahn). Steps left over sit on a cycle.
fn layer(steps: &[PlanStep]) -> Result<Vec<Vec<usize>>, PlanError> {
    let mut remaining: Vec<usize> = steps.iter().map(|s| s.requires.len()).collect();
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); steps.len()];
    for step in steps {
        for &r in &step.requires {
            dependents[r].push(step.id);
        }
    }

    let mut level = vec![0usize; steps.len()];
    let mut queue: VecDeque<usize> = (0..steps.len()).filter(|&i| remaining[i] == 0).collect();
    let mut placed = 0;

    while let Some(id) = queue.pop_front() {
        placed += 1;
        for &next in &dependents[id] {
            level[next] = level[next].max(level[id] + 1);
            remaining[next] -= 1;
            if remaining[next] == 0 {
                queue.push_back(next);
            }
        }
    }

    if placed != steps.len() {
        let stuck = steps
            .iter()
            .filter(|s| remaining[s.id] > 0)
            .map(PlanStep::label)
            .collect();
        return Err(PlanError::Unschedulable { steps: stuck });
    }

    let depth = level.iter().copied().max().map_or(0, |m| m + 1);
    let mut batches = vec![Vec::new(); depth];
    for step in steps {
        batches[level[step.id]].push(step.id);
    }
    Ok(batches)
}

// ============================================================================
// Plan report
// ============================================================================

/// One attribute line in a plan report.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttributeDiff {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub before: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub after: Option<String>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub forces_replacement: bool,
}

/// One step in a plan report.
#[derive(Debug, Clone, Serialize)]
pub struct StepView {
    pub step: usize,
    pub address: Address,
    pub action: ChangeAction,
    pub operation: StepOperation,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase: Option<ReplacePhase>,
    pub requires: Vec<usize>,
    pub attributes: Vec<AttributeDiff>,
}

/// Redacted, serializable view of a plan.
#[derive(Debug, Clone, Serialize)]
pub struct PlanReport {
    pub name: String,
    pub environment: String,
    pub batches: Vec<Vec<StepView>>,
    pub summary: ChangeSummary,
}

/// Build the redacted report for a plan. Secrets never appear in it.
pub fn plan_report(plan: &Plan) -> PlanReport {
    let batches = plan
        .batches
        .iter()
        .map(|batch| {
            batch
                .iter()
                .map(|&id| {
                    let step = plan.step(id);
                    StepView {
                        step: id,
                        address: step.address.clone(),
                        action: step.action,
                        operation: step.operation,
                        phase: step.phase,
                        requires: step.requires.clone(),
                        attributes: plan
                            .changes
                            .get(&step.address)
                            .map(|c| attribute_diffs(c, step))
                            .unwrap_or_default(),
                    }
                })
                .collect()
        })
        .collect();
    PlanReport {
        name: plan.name.clone(),
        environment: plan.environment.clone(),
        batches,
        summary: plan.summary(),
    }
}

fn attribute_diffs(change: &Change, step: &PlanStep) -> Vec<AttributeDiff> {
    let sensitive = |name: &str| change.sensitive.contains(name);
    let before = |name: &str| {
        change.before.as_ref().and_then(|b| b.get(name)).map(|v| {
            if sensitive(name) {
                REDACTED.to_string()
            } else {
                render_json(&redact(v))
            }
        })
    };
    let after = |name: &str| {
        change.after.as_ref().and_then(|a| a.get(name)).map(|r| match r {
            Resolution::Known(_) if sensitive(name) => REDACTED.to_string(),
            other => other.render(),
        })
    };
    let diff = |name: &str| AttributeDiff {
        name: name.to_string(),
        before: before(name),
        after: after(name),
        forces_replacement: change.replace_reasons.iter().any(|r| r == name),
    };

    match (step.operation, step.phase) {
        (StepOperation::Delete, None) => change
            .before
            .iter()
            .flat_map(|b| b.keys())
            .map(|k| AttributeDiff {
                after: None,
                ..diff(k.as_str())
            })
            .collect(),
        (StepOperation::Create, None) => change
            .after
            .iter()
            .flat_map(|a| a.keys())
            .map(|k| AttributeDiff {
                before: None,
                ..diff(k.as_str())
            })
            .collect(),
        // the delete half of a replace carries no attribute detail
        (StepOperation::Delete, Some(_)) => Vec::new(),
        _ => change.changed.iter().map(|k| diff(k.as_str())).collect(),
    }
}

/// Human-readable rendering of a plan report.
pub fn render_plan(report: &PlanReport) -> String {
    use std::fmt::Write;
    let mut out = String::new();
    let _ = writeln!(out, "Planning: {} ({})", report.name, report.environment);
    for (i, batch) in report.batches.iter().enumerate() {
        let _ = writeln!(out);
        let _ = writeln!(out, "Batch {}:", i + 1);
        for step in batch {
            let symbol = match (step.operation, step.phase) {
                (StepOperation::Delete, _) => "-",
                (StepOperation::Create, _) => "+",
                (StepOperation::Update, _) => "~",
            };
            let suffix = match step.phase {
                Some(ReplacePhase::Destroy) => " (replace: delete)",
                Some(ReplacePhase::Create) => " (replace: create)",
                Some(ReplacePhase::Deposed(_)) => " (deposed)",
                None => "",
            };
            let _ = writeln!(out, "  {} {}{}", symbol, step.address, suffix);
            for attr in &step.attributes {
                let marker = if attr.forces_replacement {
                    " # forces replacement"
                } else {
                    ""
                };
                match (&attr.before, &attr.after) {
                    (Some(b), Some(a)) => {
                        let _ = writeln!(out, "      {}: {} -> {}{}", attr.name, b, a, marker);
                    }
                    (None, Some(a)) => {
                        let _ = writeln!(out, "      {}: {}", attr.name, a);
                    }
                    (Some(b), None) => {
                        let _ = writeln!(out, "      {}: {} -> null", attr.name, b);
                    }
                    (None, None) => {
                        let _ = writeln!(out, "      {}: (removed)", attr.name);
                    }
                }
            }
        }
    }
    let _ = writeln!(out);
    let _ = writeln!(out, "Plan: {}", report.summary);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::diff::{compute_changes, DiffInput, DiffMode};
    use crate::core::parser::{build_resource_set, parse_config};
    use crate::core::resolver::build_graph;
    use crate::core::schema::SchemaRegistry;
    use proptest::prelude::*;
    use serde_json::json;

    fn addr(s: &str) -> Address {
        s.parse().unwrap()
    }

    fn plan_for(
        yaml: &str,
        records: &BTreeMap<Address, ResourceRecord>,
        mode: DiffMode,
    ) -> Result<Plan, EngineError> {
        let config = parse_config(yaml).unwrap();
        let schemas = SchemaRegistry::builtin();
        let resources = build_resource_set(&config, &schemas).unwrap();
        let graph = build_graph(&resources).unwrap();
        let context = config.context_for(None).unwrap();
        let changes = compute_changes(
            &DiffInput {
                resources: &resources,
                graph: &graph,
                records,
                schemas: &schemas,
                context: &context,
            },
            mode,
        )
        .unwrap();
        build_plan(&config.name, "default", changes, &graph, &resources, records)
    }

    fn rec(kind: &str, attrs: serde_json::Value, deps: &[&str]) -> ResourceRecord {
        let attributes: Attributes = attrs
            .as_object()
            .unwrap()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        let mut r = ResourceRecord::new(kind, 1, attributes.clone());
        r.declared = attributes.keys().filter(|k| *k != "id").cloned().collect();
        r.dependencies = deps.iter().map(|d| addr(d)).collect();
        r
    }

    fn batch_addresses(plan: &Plan) -> Vec<Vec<String>> {
        plan.batches
            .iter()
            .map(|b| b.iter().map(|&i| plan.step(i).label()).collect())
            .collect()
    }

    fn position(plan: &Plan, label: &str) -> usize {
        let id = plan
            .steps
            .iter()
            .find(|s| s.label() == label)
            .unwrap_or_else(|| panic!("no step {}", label))
            .id;
        plan.batch_of(id).unwrap()
    }

    const NSD: &str = r#"
version: "1.0"
name: nsd
resources:
  - kind: network
    name: n
    attributes: { name: main }
  - kind: subnetwork
    name: s
    attributes: { name: app, network: "${network.n.id}", ip_cidr_range: 10.0.0.0/24 }
  - kind: managed-database
    name: d
    attributes: { name: db, tier: small, private_network: "${network.n.id}" }
"#;

    #[test]
    fn test_network_then_subnet_and_database() {
        let plan = plan_for(NSD, &BTreeMap::new(), DiffMode::Apply).unwrap();
        assert_eq!(
            batch_addresses(&plan),
            vec![
                vec!["network.n (create)".to_string()],
                vec![
                    "managed-database.d (create)".to_string(),
                    "subnetwork.s (create)".to_string()
                ],
            ]
        );
    }

    #[test]
    fn test_noop_plan_is_empty() {
        let mut records = BTreeMap::new();
        records.insert(addr("network.n"), rec("network", json!({"name": "main", "id": "n1"}), &[]));
        records.insert(
            addr("subnetwork.s"),
            rec(
                "subnetwork",
                json!({"name": "app", "network": "n1", "ip_cidr_range": "10.0.0.0/24", "id": "s1"}),
                &["network.n"],
            ),
        );
        records.insert(
            addr("managed-database.d"),
            rec(
                "managed-database",
                json!({"name": "db", "tier": "small", "private_network": "n1", "id": "d1"}),
                &["network.n"],
            ),
        );
        let plan = plan_for(NSD, &records, DiffMode::Apply).unwrap();
        assert!(plan.is_empty());
        assert!(plan.batches.is_empty());
        assert_eq!(plan.summary().unchanged, 3);
    }

    fn nsd_records() -> BTreeMap<Address, ResourceRecord> {
        let mut records = BTreeMap::new();
        records.insert(addr("network.n"), rec("network", json!({"name": "main", "id": "n1"}), &[]));
        records.insert(
            addr("subnetwork.s"),
            rec(
                "subnetwork",
                json!({"name": "app", "network": "n1", "ip_cidr_range": "10.0.0.0/24", "id": "s1"}),
                &["network.n"],
            ),
        );
        records.insert(
            addr("managed-database.d"),
            rec(
                "managed-database",
                json!({"name": "db", "tier": "small", "private_network": "n1", "id": "d1"}),
                &["network.n"],
            ),
        );
        records
            .get_mut(&addr("network.n"))
            .unwrap()
            .deposed
            .push([("id".to_string(), json!("n0"))].into_iter().collect());
        records
    }

    #[test]
    fn test_deposed_delete_after_dependent_updates() {
        let plan = plan_for(
            &NSD.replace("tier: small", "tier: large"),
            &nsd_records(),
            DiffMode::Apply,
        )
        .unwrap();
        assert_eq!(
            batch_addresses(&plan),
            vec![
                vec!["managed-database.d (update)".to_string()],
                vec!["network.n (deposed #0)".to_string()],
            ]
        );
        let deposed = plan.step(plan.batches[1][0]);
        assert_eq!(deposed.operation, StepOperation::Delete);
        assert_eq!(deposed.action, ChangeAction::Delete);
        assert_eq!(plan.summary().deposed, 1);
        assert_eq!(plan.summary().unchanged, 2);
    }

    #[test]
    fn test_deposed_delete_before_current_delete() {
        let plan = plan_for(NSD, &nsd_records(), DiffMode::Destroy).unwrap();
        assert_eq!(
            batch_addresses(&plan),
            vec![
                vec![
                    "managed-database.d (delete)".to_string(),
                    "subnetwork.s (delete)".to_string()
                ],
                vec!["network.n (deposed #0)".to_string()],
                vec!["network.n (delete)".to_string()],
            ]
        );
    }

    #[test]
    fn test_destroy_reverses_order() {
        let mut records = BTreeMap::new();
        records.insert(addr("network.n"), rec("network", json!({"name": "main", "id": "n1"}), &[]));
        records.insert(
            addr("subnetwork.s"),
            rec("subnetwork", json!({"name": "app", "id": "s1"}), &["network.n"]),
        );
        records.insert(
            addr("cluster.c"),
            rec("cluster", json!({"name": "gke", "id": "c1"}), &["subnetwork.s"]),
        );
        let plan = plan_for(NSD, &records, DiffMode::Destroy).unwrap();
        assert_eq!(
            batch_addresses(&plan),
            vec![
                vec!["cluster.c (delete)".to_string()],
                vec!["subnetwork.s (delete)".to_string()],
                vec!["network.n (delete)".to_string()],
            ]
        );
    }

    #[test]
    fn test_replace_destroy_before_create() {
        let yaml = r#"
version: "1.0"
name: r
resources:
  - kind: cluster
    name: gke
    attributes: { name: gke, region: us-central1 }
"#;
        let mut records = BTreeMap::new();
        records.insert(
            addr("cluster.gke"),
            rec("cluster", json!({"name": "gke", "region": "europe-west1", "id": "c1"}), &[]),
        );
        let plan = plan_for(yaml, &records, DiffMode::Apply).unwrap();
        assert_eq!(plan.steps.len(), 2);
        assert_eq!(
            batch_addresses(&plan),
            vec![
                vec!["cluster.gke (replace: delete)".to_string()],
                vec!["cluster.gke (replace: create)".to_string()],
            ]
        );
    }

    #[test]
    fn test_replace_create_before_destroy() {
        let yaml = r#"
version: "1.0"
name: r
resources:
  - kind: compute-service
    name: api
    attributes: { name: api, region: us-central1 }
  - kind: iam-member
    name: invoker
    attributes: { role: run.invoker, member: allUsers, service: "${compute-service.api.id}" }
"#;
        let mut records = BTreeMap::new();
        records.insert(
            addr("compute-service.api"),
            rec(
                "compute-service",
                json!({"name": "api", "region": "europe-west1", "id": "svc-1"}),
                &[],
            ),
        );
        records.insert(
            addr("iam-member.invoker"),
            rec(
                "iam-member",
                json!({"role": "run.invoker", "member": "allUsers", "service": "svc-1", "id": "m1"}),
                &["compute-service.api"],
            ),
        );
        let plan = plan_for(yaml, &records, DiffMode::Apply).unwrap();
        let create = position(&plan, "compute-service.api (replace: create)");
        let member = position(&plan, "iam-member.invoker (update)");
        let delete = position(&plan, "compute-service.api (replace: delete)");
        assert!(create < member);
        assert!(member < delete);
    }

    #[test]
    fn test_dependent_updated_before_old_target_deleted() {
        // subnetwork moved from network.old to network.n; old is undeclared
        let mut records = BTreeMap::new();
        records.insert(addr("network.n"), rec("network", json!({"name": "main", "id": "n1"}), &[]));
        records.insert(addr("network.old"), rec("network", json!({"name": "legacy", "id": "o1"}), &[]));
        records.insert(
            addr("subnetwork.s"),
            rec(
                "subnetwork",
                json!({"name": "app", "network": "o1", "ip_cidr_range": "10.0.0.0/24", "id": "s1"}),
                &["network.old"],
            ),
        );
        records.insert(
            addr("managed-database.d"),
            rec(
                "managed-database",
                json!({"name": "db", "tier": "small", "private_network": "n1", "id": "d1"}),
                &["network.n"],
            ),
        );
        let plan = plan_for(NSD, &records, DiffMode::Apply).unwrap();
        // network is immutable on subnetworks: replace
        let create = position(&plan, "subnetwork.s (replace: create)");
        let delete_sub = position(&plan, "subnetwork.s (replace: delete)");
        let delete_old = position(&plan, "network.old (delete)");
        assert!(delete_sub < delete_old);
        assert!(create < delete_old);
    }

    #[test]
    fn test_prevent_destroy_rejects_plan() {
        let yaml = r#"
version: "1.0"
name: r
resources:
  - kind: managed-database
    name: main
    attributes: { name: db, tier: small }
    lifecycle: { prevent_destroy: true }
"#;
        let mut records = BTreeMap::new();
        records.insert(
            addr("managed-database.main"),
            rec("managed-database", json!({"name": "db", "tier": "small", "id": "d1"}), &[]),
        );
        let err = plan_for(yaml, &records, DiffMode::Destroy).unwrap_err();
        match err {
            EngineError::Configuration(errors) => {
                assert!(matches!(errors[0], ConfigError::PreventDestroy { .. }));
            }
            other => panic!("expected configuration error, got {:?}", other),
        }
        assert_eq!(
            plan_for(yaml, &records, DiffMode::Apply).unwrap().steps.len(),
            0
        );
    }

    #[test]
    fn test_mixed_replace_policies_unschedulable() {
        // cluster (destroy first) feeds a create-before-destroy node pool
        let yaml = r#"
version: "1.0"
name: r
resources:
  - kind: cluster
    name: c
    attributes: { name: gke, region: us-central1 }
  - kind: node-pool
    name: p
    attributes: { name: pool, cluster: "${cluster.c.name}", machine_type: e2-standard-4 }
"#;
        let mut records = BTreeMap::new();
        records.insert(
            addr("cluster.c"),
            rec("cluster", json!({"name": "gke", "region": "europe-west1"}), &[]),
        );
        records.insert(
            addr("node-pool.p"),
            rec(
                "node-pool",
                json!({"name": "pool", "cluster": "gke", "machine_type": "e2-standard-2"}),
                &["cluster.c"],
            ),
        );
        let err = plan_for(yaml, &records, DiffMode::Apply).unwrap_err();
        match err {
            EngineError::Plan(PlanError::Unschedulable { steps }) => assert!(!steps.is_empty()),
            other => panic!("expected unschedulable, got {:?}", other),
        }
    }

    #[test]
    fn test_report_redacts_secrets_and_unknowns() {
        let yaml = r#"
version: "1.0"
name: r
resources:
  - kind: managed-database
    name: main
    attributes: { name: db, tier: small }
  - kind: database-user
    name: app
    attributes:
      name: app
      instance: "${managed-database.main.name}"
      host: "${managed-database.main.host}"
      password: "${secret:db-password/3}"
"#;
        let plan = plan_for(yaml, &BTreeMap::new(), DiffMode::Apply).unwrap();
        let report = plan_report(&plan);
        let user = report
            .batches
            .iter()
            .flatten()
            .find(|s| s.address == addr("database-user.app"))
            .unwrap();
        let get = |n: &str| user.attributes.iter().find(|a| a.name == n).unwrap();
        assert_eq!(get("password").after.as_deref(), Some(REDACTED));
        assert_eq!(get("host").after.as_deref(), Some("(known after apply)"));

        let text = render_plan(&report);
        assert!(!text.contains("db-password"));
        let json = serde_json::to_string(&report).unwrap();
        assert!(!json.contains("db-password"));
        assert!(text.contains("2 to add"));
    }

    /// Random DAG of networks: node i may reference nodes j < i.
    fn arb_dag() -> impl Strategy<Value = Vec<Vec<usize>>> {
        (1usize..10).prop_flat_map(|n| {
            (0..n)
                .map(|i| proptest::collection::vec(0..i.max(1), 0..=i.min(3)))
                .collect::<Vec<_>>()
        })
    }

    fn dag_yaml(dag: &[Vec<usize>]) -> String {
        let mut yaml = String::from("version: \"1.0\"\nname: prop\nresources:\n");
        for (i, refs) in dag.iter().enumerate() {
            yaml.push_str(&format!(
                "  - kind: network\n    name: n{}\n    attributes:\n      name: n{}\n",
                i, i
            ));
            let targets: BTreeSet<usize> = refs.iter().copied().filter(|&j| j < i).collect();
            for j in targets {
                yaml.push_str(&format!("      ref{}: \"${{network.n{}.id}}\"\n", j, j));
            }
        }
        yaml
    }

    proptest! {
        #[test]
        fn prop_batches_respect_dependencies(dag in arb_dag()) {
            let plan = plan_for(&dag_yaml(&dag), &BTreeMap::new(), DiffMode::Apply).unwrap();
            prop_assert_eq!(plan.steps.len(), dag.len());
            for step in &plan.steps {
                let mine = plan.batch_of(step.id).unwrap();
                for &r in &step.requires {
                    prop_assert!(plan.batch_of(r).unwrap() < mine);
                }
            }
            // roots all share the first batch
            let roots = dag
                .iter()
                .enumerate()
                .filter(|(i, refs)| refs.iter().all(|j| j >= i))
                .count();
            prop_assert_eq!(plan.batches[0].len(), roots);
        }
    }
}
