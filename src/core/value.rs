//! Value model for declared attributes.
//!
//! Strings in declarations may carry `${...}` expressions:
//! - `${kind.name.attr[.sub...]}`: reference to another resource's attribute
//! - `${secret:<handle>}`: opaque secret handle (never plaintext)
//! - `${context.<key>}`: explicit provider context (region, project, ...)
//!
//! A string that is exactly one reference is a typed [`Value::Reference`];
//! a string mixing text and expressions is a [`Value::Template`] and always
//! resolves to a string. `$${` escapes a literal `${`.

use super::types::{is_ident, Address, Attributes, Context};
use indexmap::IndexMap;
use serde_json::Value as Json;
use std::collections::BTreeSet;
use std::fmt;
use thiserror::Error;

/// Rendering used for secret-valued attributes in reports.
pub const REDACTED: &str = "(sensitive)";

/// Rendering used for values only known after apply.
pub const UNKNOWN: &str = "(known after apply)";

/// A declared attribute value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Literal(Literal),
    Reference(Reference),
    Secret(SecretHandle),
    Template(Vec<Fragment>),
}

/// Literal scalars and containers. Containers hold full values so references
/// can appear at any depth.
#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Null,
    Bool(bool),
    Number(serde_json::Number),
    String(String),
    List(Vec<Value>),
    Map(IndexMap<String, Value>),
}

/// `${kind.name.path...}`
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Reference {
    pub target: Address,
    pub path: Vec<String>,
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "${{{}.{}}}", self.target, self.path.join("."))
    }
}

/// Opaque secret version/identifier handle.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SecretHandle(pub String);

impl SecretHandle {
    /// Wire form handed to providers and stored in state.
    pub fn marker(&self) -> String {
        format!("${{secret:{}}}", self.0)
    }

    /// Parse the wire form back into a handle.
    pub fn from_marker(s: &str) -> Option<SecretHandle> {
        let inner = s.strip_prefix("${secret:")?.strip_suffix('}')?;
        (!inner.is_empty()).then(|| SecretHandle(inner.to_string()))
    }
}

impl fmt::Display for SecretHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.marker())
    }
}

/// Piece of an interpolated string.
#[derive(Debug, Clone, PartialEq)]
pub enum Fragment {
    Text(String),
    Reference(Reference),
    Context(String),
}

/// Resolved value, or a placeholder for values produced by a pending apply.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    Known(Json),
    Unknown,
}

impl Resolution {
    pub fn known(&self) -> Option<&Json> {
        match self {
            Self::Known(v) => Some(v),
            Self::Unknown => None,
        }
    }

    /// Report rendering with secrets redacted.
    pub fn render(&self) -> String {
        match self {
            Self::Known(v) => render_json(&redact(v)),
            Self::Unknown => UNKNOWN.to_string(),
        }
    }
}

/// Why a value could not be resolved.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResolveError {
    #[error("reference {reference} resolved before '{target}' completed")]
    NotReady { reference: String, target: Address },

    #[error("reference {0} does not match any attribute of its target")]
    MissingAttribute(String),

    #[error("context variable '{0}' is not set")]
    UnknownContext(String),

    #[error("cannot interpolate non-scalar value of {0} into a string")]
    NonScalar(String),
}

// ============================================================================
// Parsing
// ============================================================================

impl Value {
    /// Convert a parsed YAML value, recognising `${...}` expressions.
    pub fn from_yaml(yaml: &serde_yaml_ng::Value) -> Result<Value, String> {
        use serde_yaml_ng::Value as Y;
        Ok(match yaml {
            Y::Null => Value::Literal(Literal::Null),
            Y::Bool(b) => Value::Literal(Literal::Bool(*b)),
            Y::Number(n) => Value::Literal(Literal::Number(yaml_number(n)?)),
            Y::String(s) => parse_string(s)?,
            Y::Sequence(items) => Value::Literal(Literal::List(
                items.iter().map(Value::from_yaml).collect::<Result<_, _>>()?,
            )),
            Y::Mapping(map) => {
                let mut out = IndexMap::new();
                for (k, v) in map {
                    let key = match k {
                        Y::String(s) => s.clone(),
                        other => return Err(format!("map keys must be strings, got {:?}", other)),
                    };
                    out.insert(key, Value::from_yaml(v)?);
                }
                Value::Literal(Literal::Map(out))
            }
            Y::Tagged(t) => return Err(format!("YAML tag {} is not supported", t.tag)),
        })
    }

    pub fn string(s: impl Into<String>) -> Value {
        Value::Literal(Literal::String(s.into()))
    }

    /// Collect referenced addresses at any depth.
    pub fn collect_references(&self, out: &mut BTreeSet<Address>) {
        let mut exprs = Vec::new();
        self.collect_reference_exprs(&mut exprs);
        out.extend(exprs.into_iter().map(|r| r.target));
    }

    /// Collect every reference expression at any depth.
    pub fn collect_reference_exprs(&self, out: &mut Vec<Reference>) {
        match self {
            Value::Reference(r) => out.push(r.clone()),
            Value::Template(fragments) => {
                for f in fragments {
                    if let Fragment::Reference(r) = f {
                        out.push(r.clone());
                    }
                }
            }
            Value::Literal(Literal::List(items)) => {
                for v in items {
                    v.collect_reference_exprs(out);
                }
            }
            Value::Literal(Literal::Map(map)) => {
                for v in map.values() {
                    v.collect_reference_exprs(out);
                }
            }
            Value::Literal(_) | Value::Secret(_) => {}
        }
    }

    pub fn contains_secret(&self) -> bool {
        match self {
            Value::Secret(_) => true,
            Value::Literal(Literal::List(items)) => items.iter().any(Value::contains_secret),
            Value::Literal(Literal::Map(map)) => map.values().any(Value::contains_secret),
            _ => false,
        }
    }

    /// Resolve against the context and a reference lookup.
    pub fn resolve(
        &self,
        ctx: &Context,
        lookup: &dyn Fn(&Reference) -> Result<Resolution, ResolveError>,
    ) -> Result<Resolution, ResolveError> {
        match self {
            Value::Literal(lit) => match lit {
                Literal::Null => Ok(Resolution::Known(Json::Null)),
                Literal::Bool(b) => Ok(Resolution::Known(Json::Bool(*b))),
                Literal::Number(n) => Ok(Resolution::Known(Json::Number(n.clone()))),
                Literal::String(s) => Ok(Resolution::Known(Json::String(s.clone()))),
                Literal::List(items) => {
                    let mut out = Vec::with_capacity(items.len());
                    for item in items {
                        match item.resolve(ctx, lookup)? {
                            Resolution::Known(v) => out.push(v),
                            Resolution::Unknown => return Ok(Resolution::Unknown),
                        }
                    }
                    Ok(Resolution::Known(Json::Array(out)))
                }
                Literal::Map(map) => {
                    let mut out = serde_json::Map::new();
                    for (k, v) in map {
                        match v.resolve(ctx, lookup)? {
                            Resolution::Known(v) => {
                                out.insert(k.clone(), v);
                            }
                            Resolution::Unknown => return Ok(Resolution::Unknown),
                        }
                    }
                    Ok(Resolution::Known(Json::Object(out)))
                }
            },
            Value::Reference(r) => lookup(r),
            Value::Secret(handle) => Ok(Resolution::Known(Json::String(handle.marker()))),
            Value::Template(fragments) => {
                let mut out = String::new();
                for f in fragments {
                    match f {
                        Fragment::Text(t) => out.push_str(t),
                        Fragment::Context(key) => out.push_str(
                            ctx.get(key)
                                .ok_or_else(|| ResolveError::UnknownContext(key.clone()))?,
                        ),
                        Fragment::Reference(r) => match lookup(r)? {
                            Resolution::Known(v) => out.push_str(&scalar_to_string(&v, r)?),
                            Resolution::Unknown => return Ok(Resolution::Unknown),
                        },
                    }
                }
                Ok(Resolution::Known(Json::String(out)))
            }
        }
    }
}

fn yaml_number(n: &serde_yaml_ng::Number) -> Result<serde_json::Number, String> {
    if let Some(i) = n.as_i64() {
        Ok(i.into())
    } else if let Some(u) = n.as_u64() {
        Ok(u.into())
    } else {
        n.as_f64()
            .and_then(serde_json::Number::from_f64)
            .ok_or_else(|| format!("unsupported number {}", n))
    }
}

fn scalar_to_string(v: &Json, r: &Reference) -> Result<String, ResolveError> {
    match v {
        Json::String(s) => Ok(s.clone()),
        Json::Number(n) => Ok(n.to_string()),
        Json::Bool(b) => Ok(b.to_string()),
        Json::Null => Ok(String::new()),
        _ => Err(ResolveError::NonScalar(r.to_string())),
    }
}

enum Expr {
    Reference(Reference),
    Secret(SecretHandle),
    Context(String),
}

fn parse_expression(expr: &str) -> Result<Expr, String> {
    if let Some(handle) = expr.strip_prefix("secret:") {
        let handle = handle.trim();
        if handle.is_empty() {
            return Err("empty secret handle".to_string());
        }
        return Ok(Expr::Secret(SecretHandle(handle.to_string())));
    }
    if let Some(key) = expr.strip_prefix("context.") {
        if !is_ident(key) {
            return Err(format!("invalid context variable '{}'", key));
        }
        return Ok(Expr::Context(key.to_string()));
    }
    let parts: Vec<&str> = expr.split('.').collect();
    if parts.len() < 3 || parts.iter().any(|p| !is_ident(p)) {
        return Err(format!(
            "invalid reference '${{{}}}': expected kind.name.attribute",
            expr
        ));
    }
    Ok(Expr::Reference(Reference {
        target: Address::new(parts[0], parts[1]),
        path: parts[2..].iter().map(|p| p.to_string()).collect(),
    }))
}

fn parse_string(s: &str) -> Result<Value, String> {
    let mut fragments = Vec::new();
    let mut text = String::new();
    let mut rest = s;

    while let Some(open) = rest.find("${") {
        if rest[..open].ends_with('$') {
            text.push_str(&rest[..open - 1]);
            text.push_str("${");
            rest = &rest[open + 2..];
            continue;
        }
        text.push_str(&rest[..open]);
        let close = rest[open..]
            .find('}')
            .ok_or_else(|| format!("unclosed expression in '{}'", s))?;
        let expr = parse_expression(rest[open + 2..open + close].trim())?;
        if !text.is_empty() {
            fragments.push(Fragment::Text(std::mem::take(&mut text)));
        }
        match expr {
            Expr::Reference(r) => fragments.push(Fragment::Reference(r)),
            Expr::Context(k) => fragments.push(Fragment::Context(k)),
            Expr::Secret(h) => {
                if !fragments.is_empty() || open + close + 1 != rest.len() {
                    return Err(format!("secret handles cannot be interpolated: '{}'", s));
                }
                return Ok(Value::Secret(h));
            }
        }
        rest = &rest[open + close + 1..];
    }
    text.push_str(rest);

    if fragments.is_empty() {
        return Ok(Value::Literal(Literal::String(text)));
    }
    if !text.is_empty() {
        fragments.push(Fragment::Text(text));
    }
    if fragments.len() == 1 {
        if let Fragment::Reference(r) = &fragments[0] {
            return Ok(Value::Reference(r.clone()));
        }
    }
    Ok(Value::Template(fragments))
}

// ============================================================================
// Attribute paths and redaction
// ============================================================================

/// Walk an attribute path; numeric segments index arrays.
pub fn lookup_path<'a>(attrs: &'a Attributes, path: &[String]) -> Option<&'a Json> {
    let (first, rest) = path.split_first()?;
    let mut current = attrs.get(first)?;
    for segment in rest {
        current = match current {
            Json::Object(map) => map.get(segment)?,
            Json::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Replace every secret marker with [`REDACTED`].
pub fn redact(v: &Json) -> Json {
    match v {
        Json::String(s) if SecretHandle::from_marker(s).is_some() => {
            Json::String(REDACTED.to_string())
        }
        Json::Array(items) => Json::Array(items.iter().map(redact).collect()),
        Json::Object(map) => Json::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), redact(v)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Compact JSON rendering for reports.
pub fn render_json(v: &Json) -> String {
    match v {
        Json::String(s) => format!("{:?}", s),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parse(s: &str) -> Value {
        Value::from_yaml(&serde_yaml_ng::Value::String(s.to_string())).unwrap()
    }

    fn no_refs(_: &Reference) -> Result<Resolution, ResolveError> {
        panic!("no references expected")
    }

    #[test]
    fn test_plain_string_is_literal() {
        assert_eq!(parse("hello"), Value::string("hello"));
    }

    #[test]
    fn test_whole_reference_is_typed() {
        let v = parse("${network.vpc.id}");
        assert_eq!(
            v,
            Value::Reference(Reference {
                target: Address::new("network", "vpc"),
                path: vec!["id".into()],
            })
        );
    }

    #[test]
    fn test_nested_path_reference() {
        match parse("${cluster.main.endpoints.0.host}") {
            Value::Reference(r) => {
                assert_eq!(r.target.to_string(), "cluster.main");
                assert_eq!(r.path, vec!["endpoints", "0", "host"]);
            }
            other => panic!("expected reference, got {:?}", other),
        }
    }

    #[test]
    fn test_template_mixes_text_and_references() {
        let v = parse("postgres://${managed-database.main.host}:5432/app");
        match &v {
            Value::Template(f) => assert_eq!(f.len(), 3),
            other => panic!("expected template, got {:?}", other),
        }
        let mut refs = BTreeSet::new();
        v.collect_references(&mut refs);
        assert!(refs.contains(&Address::new("managed-database", "main")));
    }

    #[test]
    fn test_secret_handle() {
        let v = parse("${secret:db-password/versions/3}");
        assert_eq!(v, Value::Secret(SecretHandle("db-password/versions/3".into())));
        assert!(v.contains_secret());
    }

    #[test]
    fn test_secret_cannot_be_interpolated() {
        let err = Value::from_yaml(&serde_yaml_ng::Value::String(
            "pw=${secret:x}".to_string(),
        ))
        .unwrap_err();
        assert!(err.contains("cannot be interpolated"));
    }

    #[test]
    fn test_escape_dollar_brace() {
        assert_eq!(parse("echo $${HOME}"), Value::string("echo ${HOME}"));
    }

    #[test]
    fn test_invalid_expressions() {
        for bad in ["${network.vpc}", "${}", "${a b.c.d}", "${network.vpc.id"] {
            let r = Value::from_yaml(&serde_yaml_ng::Value::String(bad.to_string()));
            assert!(r.is_err(), "{} should be rejected", bad);
        }
    }

    #[test]
    fn test_references_inside_containers() {
        let yaml: serde_yaml_ng::Value = serde_yaml_ng::from_str(
            r#"
subnets: ["${subnetwork.a.id}", "${subnetwork.b.id}"]
labels: { owner: "${service-account.ci.email}" }
"#,
        )
        .unwrap();
        let v = Value::from_yaml(&yaml).unwrap();
        let mut refs = BTreeSet::new();
        v.collect_references(&mut refs);
        assert_eq!(refs.len(), 3);
    }

    #[test]
    fn test_resolve_context_template() {
        let ctx = Context::new("default").with_var("region", "europe-west1");
        let v = parse("${context.region}-a");
        assert_eq!(
            v.resolve(&ctx, &no_refs).unwrap(),
            Resolution::Known(json!("europe-west1-a"))
        );
        let missing = parse("${context.zone}").resolve(&ctx, &no_refs);
        assert_eq!(missing, Err(ResolveError::UnknownContext("zone".into())));
    }

    #[test]
    fn test_resolve_reference_and_unknown_propagation() {
        let ctx = Context::new("default");
        let lookup = |r: &Reference| -> Result<Resolution, ResolveError> {
            if r.target.name == "known" {
                Ok(Resolution::Known(json!(42)))
            } else {
                Ok(Resolution::Unknown)
            }
        };
        let v = parse("port-${network.known.port}");
        assert_eq!(
            v.resolve(&ctx, &lookup).unwrap(),
            Resolution::Known(json!("port-42"))
        );
        let yaml: serde_yaml_ng::Value =
            serde_yaml_ng::from_str(r#"["${network.known.id}", "${network.pending.id}"]"#).unwrap();
        let list = Value::from_yaml(&yaml).unwrap();
        assert_eq!(list.resolve(&ctx, &lookup).unwrap(), Resolution::Unknown);
    }

    #[test]
    fn test_resolve_secret_to_marker() {
        let v = parse("${secret:api-key/2}");
        let r = v.resolve(&Context::default(), &no_refs).unwrap();
        assert_eq!(r, Resolution::Known(json!("${secret:api-key/2}")));
        assert_eq!(r.render(), "\"(sensitive)\"");
    }

    #[test]
    fn test_lookup_path() {
        let mut attrs = Attributes::new();
        attrs.insert("endpoints".into(), json!([{"host": "10.0.0.2"}]));
        let path = vec!["endpoints".to_string(), "0".into(), "host".into()];
        assert_eq!(lookup_path(&attrs, &path), Some(&json!("10.0.0.2")));
        let bad = vec!["endpoints".to_string(), "x".into()];
        assert_eq!(lookup_path(&attrs, &bad), None);
    }

    #[test]
    fn test_redact_nested() {
        let v = json!({"env": {"DB_PASSWORD": "${secret:db/1}", "MODE": "prod"}});
        let r = redact(&v);
        assert_eq!(r["env"]["DB_PASSWORD"], json!(REDACTED));
        assert_eq!(r["env"]["MODE"], json!("prod"));
    }

    #[test]
    fn test_secret_marker_roundtrip() {
        let h = SecretHandle("tls-cert/latest".into());
        assert_eq!(SecretHandle::from_marker(&h.marker()), Some(h));
        assert_eq!(SecretHandle::from_marker("plain"), None);
    }
}
