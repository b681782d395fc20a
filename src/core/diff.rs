//! Desired-vs-recorded comparison producing a [`ChangeSet`].
//!
//! Resources are visited in topological order so a reference can see what
//! is about to happen to its target: a target being created or replaced
//! yields `(known after apply)`, otherwise the reference resolves to the
//! target's desired value (declared attribute) or its recorded output.

use super::error::ConfigError;
use super::resolver::DependencyGraph;
use super::schema::SchemaRegistry;
use super::state::ResourceRecord;
use super::types::*;
use super::value::{Reference, Resolution, ResolveError};
use indexmap::IndexMap;
use serde_json::Value as Json;
use std::collections::{BTreeMap, BTreeSet};

/// Everything the diff reads.
#[derive(Debug, Clone, Copy)]
pub struct DiffInput<'a> {
    pub resources: &'a ResourceSet,
    pub graph: &'a DependencyGraph,
    pub records: &'a BTreeMap<Address, ResourceRecord>,
    pub schemas: &'a SchemaRegistry,
    pub context: &'a Context,
}

/// Reconcile toward the declarations, or tear everything down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DiffMode {
    #[default]
    Apply,
    Destroy,
}

type Desired = IndexMap<String, Resolution>;

/// Compute the change set. Resolution failures (unset context variables,
/// references to attributes the target never produced) are configuration
/// errors and are all reported together.
pub fn compute_changes(input: &DiffInput<'_>, mode: DiffMode) -> Result<ChangeSet, Vec<ConfigError>> {
    let mut entries = Vec::new();

    if mode == DiffMode::Destroy {
        for (address, record) in input.records {
            entries.push(delete_change(address, record));
        }
        return Ok(ChangeSet { entries });
    }

    let mut errors = Vec::new();
    let mut actions: BTreeMap<Address, ChangeAction> = BTreeMap::new();
    let mut desired_by_address: BTreeMap<Address, Desired> = BTreeMap::new();

    for address in input.graph.topological_order() {
        let Some(resource) = input.resources.get(&address) else {
            continue;
        };

        let mut desired = Desired::new();
        {
            let lookup = |r: &Reference| lookup_reference(r, input, &actions, &desired_by_address);
            for (name, value) in &resource.attributes {
                match value.resolve(input.context, &lookup) {
                    Ok(res) => {
                        desired.insert(name.clone(), res);
                    }
                    Err(e) => errors.push(ConfigError::SchemaViolation {
                        address: address.to_string(),
                        message: format!("attribute '{}': {}", name, e),
                    }),
                }
            }
        }

        let change = classify(resource, input.records.get(&address), desired.clone(), input.schemas);
        tracing::trace!(%address, action = %change.action, changed = ?change.changed, "diffed");
        actions.insert(address.clone(), change.action);
        desired_by_address.insert(address, desired);
        entries.push(change);
    }

    if !errors.is_empty() {
        return Err(errors);
    }

    for (address, record) in input.records {
        if !input.resources.contains(address) {
            entries.push(delete_change(address, record));
        }
    }

    entries.sort_by(|a, b| a.address.cmp(&b.address));
    Ok(ChangeSet { entries })
}

fn lookup_reference(
    r: &Reference,
    input: &DiffInput<'_>,
    actions: &BTreeMap<Address, ChangeAction>,
    desired: &BTreeMap<Address, Desired>,
) -> Result<Resolution, ResolveError> {
    let missing = || ResolveError::MissingAttribute(r.to_string());

    if matches!(
        actions.get(&r.target),
        Some(ChangeAction::Create | ChangeAction::Replace)
    ) {
        return Ok(Resolution::Unknown);
    }

    let (first, rest) = r.path.split_first().ok_or_else(missing)?;

    if let Some(planned) = desired.get(&r.target).and_then(|d| d.get(first)) {
        return match planned {
            Resolution::Unknown => Ok(Resolution::Unknown),
            Resolution::Known(v) => walk(v, rest).cloned().map(Resolution::Known).ok_or_else(missing),
        };
    }

    let record = input.records.get(&r.target).ok_or_else(missing)?;
    record
        .attributes
        .get(first)
        .and_then(|v| walk(v, rest))
        .cloned()
        .map(Resolution::Known)
        .ok_or_else(missing)
}

fn walk<'a>(mut current: &'a Json, path: &[String]) -> Option<&'a Json> {
    for segment in path {
        current = match current {
            Json::Object(map) => map.get(segment)?,
            Json::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

fn classify(
    resource: &Resource,
    record: Option<&ResourceRecord>,
    desired: Desired,
    schemas: &SchemaRegistry,
) -> Change {
    let schema = schemas.get(resource.kind());
    let create_before_destroy = resource.create_before_destroy(schema);
    let sensitive = resource.sensitive_attributes();

    let Some(record) = record else {
        return Change {
            address: resource.address.clone(),
            action: ChangeAction::Create,
            before: None,
            changed: desired.keys().cloned().collect(),
            after: Some(desired),
            replace_reasons: Vec::new(),
            create_before_destroy,
            sensitive,
            deposed: Vec::new(),
        };
    };

    let ignored: BTreeSet<&str> = resource
        .lifecycle
        .ignore_changes
        .iter()
        .map(String::as_str)
        .collect();

    let mut changed = Vec::new();
    for (name, res) in &desired {
        if ignored.contains(name.as_str()) {
            continue;
        }
        let differs = match res {
            Resolution::Unknown => true,
            Resolution::Known(v) => record.attributes.get(name) != Some(v),
        };
        if differs {
            changed.push(name.clone());
        }
    }
    for name in &record.declared {
        if !desired.contains_key(name) && !ignored.contains(name.as_str()) {
            changed.push(name.clone());
        }
    }

    let replace_reasons: Vec<String> = changed
        .iter()
        .filter(|a| schema.is_some_and(|s| s.is_immutable(a)))
        .cloned()
        .collect();

    let action = if changed.is_empty() {
        ChangeAction::NoOp
    } else if !replace_reasons.is_empty() {
        ChangeAction::Replace
    } else {
        ChangeAction::Update
    };

    Change {
        address: resource.address.clone(),
        action,
        before: Some(record.attributes.clone()),
        after: Some(desired),
        changed,
        replace_reasons,
        create_before_destroy,
        sensitive,
        deposed: record.deposed.clone(),
    }
}

fn delete_change(address: &Address, record: &ResourceRecord) -> Change {
    Change {
        address: address.clone(),
        action: ChangeAction::Delete,
        before: Some(record.attributes.clone()),
        after: None,
        changed: Vec::new(),
        replace_reasons: Vec::new(),
        create_before_destroy: record.create_before_destroy,
        sensitive: record.sensitive.clone(),
        deposed: record.deposed.clone(),
    }
}
