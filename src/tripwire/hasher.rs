//! BLAKE3 checksums for recorded attributes.

use crate::core::types::Attributes;
use std::collections::BTreeMap;

/// Hash a string. Returns `"blake3:{hex}"`.
pub fn hash_string(s: &str) -> String {
    format!("blake3:{}", blake3::hash(s.as_bytes()).to_hex())
}

/// Hash an attribute map in canonical form (keys sorted at every level).
///
/// Declaration order does not affect the checksum.
pub fn hash_attributes(attrs: &Attributes) -> String {
    let sorted: BTreeMap<&String, &serde_json::Value> = attrs.iter().collect();
    // Nested objects are serde_json::Map, which keeps keys sorted.
    let canonical = serde_json::to_string(&sorted).unwrap_or_default();
    hash_string(&canonical)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_hash_string() {
        let h = hash_string("hello");
        assert!(h.starts_with("blake3:"));
        assert_eq!(h.len(), 7 + 64);
        assert_eq!(h, hash_string("hello"));
        assert_ne!(h, hash_string("world"));
    }

    #[test]
    fn test_hash_attributes_order_independent() {
        let mut a = Attributes::new();
        a.insert("name".into(), json!("main"));
        a.insert("region".into(), json!("europe-west1"));
        let mut b = Attributes::new();
        b.insert("region".into(), json!("europe-west1"));
        b.insert("name".into(), json!("main"));
        assert_eq!(hash_attributes(&a), hash_attributes(&b));

        b.insert("tier".into(), json!("db-custom-2"));
        assert_ne!(hash_attributes(&a), hash_attributes(&b));
    }
}
