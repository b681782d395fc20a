//! YAML parsing and validation.
//!
//! Parses terrane.yaml, expands variants, and validates structural
//! constraints:
//! - Version must be "1.0"
//! - Addresses must be well-formed and unique
//! - Attribute expressions must parse
//! - Kind schemas (known kind, required attributes)
//!
//! Reference targets, explicit dependencies and cycles are checked by the
//! graph builder in [`super::resolver`].

use super::error::ConfigError;
use super::schema::SchemaRegistry;
use super::types::*;
use super::value::Value;
use indexmap::IndexMap;
use std::collections::BTreeSet;
use std::path::Path;

/// Parse a terrane.yaml file from disk.
pub fn parse_config_file(path: &Path) -> Result<TerraneConfig, ConfigError> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Parse(format!("failed to read {}: {}", path.display(), e)))?;
    parse_config(&content)
}

/// Parse a terrane.yaml from a string.
pub fn parse_config(yaml: &str) -> Result<TerraneConfig, ConfigError> {
    serde_yaml_ng::from_str(yaml).map_err(|e| ConfigError::Parse(e.to_string()))
}

/// Validate a parsed config and lower it into a [`ResourceSet`].
///
/// Collects every error instead of stopping at the first one.
pub fn build_resource_set(
    config: &TerraneConfig,
    schemas: &SchemaRegistry,
) -> Result<ResourceSet, Vec<ConfigError>> {
    let mut errors = Vec::new();

    if config.version != "1.0" {
        errors.push(ConfigError::Parse(format!(
            "version must be \"1.0\", got \"{}\"",
            config.version
        )));
    }
    if config.name.is_empty() {
        errors.push(ConfigError::Parse("name must not be empty".to_string()));
    }

    let mut resources: IndexMap<Address, Resource> = IndexMap::new();
    for decl in &config.resources {
        for lowered in lower_declaration(decl) {
            match lowered {
                Ok(resource) => {
                    if resources.contains_key(&resource.address) {
                        errors.push(ConfigError::DuplicateAddress {
                            address: resource.address.clone(),
                        });
                        continue;
                    }
                    errors.extend(schemas.validate(&resource));
                    resources.insert(resource.address.clone(), resource);
                }
                Err(e) => errors.push(e),
            }
        }
    }

    if errors.is_empty() {
        Ok(ResourceSet {
            name: config.name.clone(),
            resources,
        })
    } else {
        Err(errors)
    }
}

/// Expand one declaration into resources (one per variant, or itself).
fn lower_declaration(decl: &ResourceDecl) -> Vec<Result<Resource, ConfigError>> {
    if decl.variants.is_empty() {
        return vec![lower_one(decl, &decl.name, &decl.attributes)];
    }
    decl.variants
        .iter()
        .map(|(variant, overrides)| {
            let mut attrs = decl.attributes.clone();
            for (k, v) in overrides {
                attrs.insert(k.clone(), v.clone());
            }
            lower_one(decl, &format!("{}-{}", decl.name, variant), &attrs)
        })
        .collect()
}

fn lower_one(
    decl: &ResourceDecl,
    name: &str,
    attrs: &IndexMap<String, serde_yaml_ng::Value>,
) -> Result<Resource, ConfigError> {
    let label = format!("{}.{}", decl.kind, name);
    if !is_ident(&decl.kind) || !is_ident(name) {
        return Err(ConfigError::SchemaViolation {
            address: label,
            message: "kind and name must match [A-Za-z0-9_-]+".to_string(),
        });
    }
    let address = Address::new(&decl.kind, name);

    let mut attributes = IndexMap::new();
    for (key, raw) in attrs {
        let value = Value::from_yaml(raw).map_err(|message| ConfigError::SchemaViolation {
            address: label.clone(),
            message: format!("attribute '{}': {}", key, message),
        })?;
        attributes.insert(key.clone(), value);
    }

    let mut depends_on = BTreeSet::new();
    for dep in &decl.depends_on {
        let target: Address = dep.parse().map_err(|_| ConfigError::UnknownDependency {
            from: address.clone(),
            target: dep.clone(),
        })?;
        depends_on.insert(target);
    }

    Ok(Resource {
        address,
        attributes,
        depends_on,
        lifecycle: decl.lifecycle.clone(),
    })
}
