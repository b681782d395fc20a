//! Kind schemas: required attributes, immutable attributes, replace policy.
//!
//! The builtin table covers the kinds a multi-tier cloud topology uses.
//! Declaration files may add kinds or override builtins under `kinds:`.

use super::error::ConfigError;
use super::types::{ReplacePolicy, Resource};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Schema for one resource kind.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KindSchema {
    /// Attributes every declaration must carry
    #[serde(default)]
    pub required: Vec<String>,

    /// Attributes that force a replace when changed
    #[serde(default)]
    pub immutable: Vec<String>,

    /// Default replace ordering for the kind
    #[serde(default)]
    pub replace: ReplacePolicy,
}

impl KindSchema {
    pub fn is_immutable(&self, attribute: &str) -> bool {
        self.immutable.iter().any(|a| a == attribute)
    }
}

/// (kind, required, immutable, replace policy)
const BUILTIN: &[(&str, &[&str], &[&str], ReplacePolicy)] = &[
    ("network", &["name"], &["name", "auto_create_subnetworks"], ReplacePolicy::DestroyBeforeCreate),
    ("subnetwork", &["name", "network", "ip_cidr_range"], &["name", "network", "region"], ReplacePolicy::DestroyBeforeCreate),
    ("global-address", &["name"], &["name", "network", "prefix_length", "purpose"], ReplacePolicy::DestroyBeforeCreate),
    ("service-networking-connection", &["network"], &["network"], ReplacePolicy::DestroyBeforeCreate),
    ("vpc-connector", &["name", "network", "ip_cidr_range"], &["name", "network", "region", "ip_cidr_range"], ReplacePolicy::DestroyBeforeCreate),
    ("managed-database", &["name", "tier"], &["name", "region", "engine", "private_network"], ReplacePolicy::DestroyBeforeCreate),
    ("database", &["name", "instance"], &["name", "instance"], ReplacePolicy::DestroyBeforeCreate),
    ("database-user", &["name", "instance"], &["name", "instance"], ReplacePolicy::DestroyBeforeCreate),
    ("compute-service", &["name"], &["name", "region"], ReplacePolicy::CreateBeforeDestroy),
    ("function", &["name", "runtime"], &["name", "region"], ReplacePolicy::CreateBeforeDestroy),
    ("cluster", &["name"], &["name", "region", "network", "subnetwork"], ReplacePolicy::DestroyBeforeCreate),
    ("node-pool", &["name", "cluster"], &["name", "cluster", "machine_type"], ReplacePolicy::CreateBeforeDestroy),
    ("secret", &["secret_id"], &["secret_id", "replication"], ReplacePolicy::DestroyBeforeCreate),
    ("secret-version", &["secret", "data"], &["secret", "data"], ReplacePolicy::CreateBeforeDestroy),
    ("service-account", &["account_id"], &["account_id"], ReplacePolicy::DestroyBeforeCreate),
    ("iam-binding", &["role", "members"], &["role"], ReplacePolicy::CreateBeforeDestroy),
    ("iam-member", &["role", "member"], &["role", "member"], ReplacePolicy::CreateBeforeDestroy),
];

/// Lookup table of kind schemas.
#[derive(Debug, Clone)]
pub struct SchemaRegistry {
    kinds: BTreeMap<String, KindSchema>,
}

impl Default for SchemaRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

impl SchemaRegistry {
    /// Registry with only the builtin kinds.
    pub fn builtin() -> Self {
        let kinds = BUILTIN
            .iter()
            .map(|(kind, required, immutable, replace)| {
                (
                    kind.to_string(),
                    KindSchema {
                        required: required.iter().map(|s| s.to_string()).collect(),
                        immutable: immutable.iter().map(|s| s.to_string()).collect(),
                        replace: *replace,
                    },
                )
            })
            .collect();
        Self { kinds }
    }

    /// Builtins plus file-declared kinds (file wins on conflict).
    pub fn with_overrides(overrides: &IndexMap<String, KindSchema>) -> Self {
        let mut registry = Self::builtin();
        for (kind, schema) in overrides {
            registry.kinds.insert(kind.clone(), schema.clone());
        }
        registry
    }

    pub fn get(&self, kind: &str) -> Option<&KindSchema> {
        self.kinds.get(kind)
    }

    pub fn kinds(&self) -> impl Iterator<Item = &str> {
        self.kinds.keys().map(String::as_str)
    }

    /// Check a resource against its kind schema.
    pub fn validate(&self, resource: &Resource) -> Vec<ConfigError> {
        let mut errors = Vec::new();
        let address = resource.address.to_string();

        let Some(schema) = self.get(resource.kind()) else {
            errors.push(ConfigError::SchemaViolation {
                address,
                message: format!("unknown resource kind '{}'", resource.kind()),
            });
            return errors;
        };

        for required in &schema.required {
            if !resource.attributes.contains_key(required) {
                errors.push(ConfigError::SchemaViolation {
                    address: address.clone(),
                    message: format!("missing required attribute '{}'", required),
                });
            }
        }

        for ignored in &resource.lifecycle.ignore_changes {
            if schema.is_immutable(ignored) {
                errors.push(ConfigError::SchemaViolation {
                    address: address.clone(),
                    message: format!("cannot ignore changes to immutable attribute '{}'", ignored),
                });
            }
        }

        errors
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{Address, Lifecycle};
    use crate::core::value::Value;
    use std::collections::BTreeSet;

    fn resource(kind: &str, attrs: &[&str]) -> Resource {
        Resource {
            address: Address::new(kind, "r"),
            attributes: attrs
                .iter()
                .map(|a| (a.to_string(), Value::string("x")))
                .collect(),
            depends_on: BTreeSet::new(),
            lifecycle: Lifecycle::default(),
        }
    }

    #[test]
    fn test_builtin_kinds_present() {
        let reg = SchemaRegistry::builtin();
        for kind in [
            "network",
            "subnetwork",
            "managed-database",
            "compute-service",
            "cluster",
            "secret",
            "iam-binding",
        ] {
            assert!(reg.get(kind).is_some(), "missing builtin {}", kind);
        }
    }

    #[test]
    fn test_region_and_network_binding_immutable() {
        let reg = SchemaRegistry::builtin();
        let db = reg.get("managed-database").unwrap();
        assert!(db.is_immutable("region"));
        assert!(db.is_immutable("private_network"));
        assert!(!db.is_immutable("tier"));
    }

    #[test]
    fn test_cluster_destroys_first() {
        let reg = SchemaRegistry::builtin();
        assert_eq!(
            reg.get("cluster").unwrap().replace,
            ReplacePolicy::DestroyBeforeCreate
        );
        assert_eq!(
            reg.get("compute-service").unwrap().replace,
            ReplacePolicy::CreateBeforeDestroy
        );
    }

    #[test]
    fn test_missing_required_attribute() {
        let reg = SchemaRegistry::builtin();
        let errors = reg.validate(&resource("subnetwork", &["name"]));
        assert_eq!(errors.len(), 2);
        assert!(errors[0].to_string().contains("'network'"));
    }

    #[test]
    fn test_unknown_kind() {
        let reg = SchemaRegistry::builtin();
        let errors = reg.validate(&resource("mainframe", &[]));
        assert_eq!(errors.len(), 1);
        assert!(errors[0].to_string().contains("unknown resource kind"));
    }

    #[test]
    fn test_override_adds_kind() {
        let mut extra = IndexMap::new();
        extra.insert(
            "queue".to_string(),
            KindSchema {
                required: vec!["name".into()],
                immutable: vec!["region".into()],
                replace: ReplacePolicy::DestroyBeforeCreate,
            },
        );
        let reg = SchemaRegistry::with_overrides(&extra);
        assert!(reg.validate(&resource("queue", &["name"])).is_empty());
        assert!(reg.get("network").is_some());
    }

    #[test]
    fn test_ignore_changes_on_immutable_rejected() {
        let reg = SchemaRegistry::builtin();
        let mut r = resource("network", &["name"]);
        r.lifecycle.ignore_changes = vec!["name".into()];
        let errors = reg.validate(&r);
        assert!(errors[0].to_string().contains("cannot ignore"));
    }
}
