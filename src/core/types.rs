//! Declaration schema, engine policy, provider context, and plan/report types.
//!
//! Everything that crosses a module boundary lives here. Declaration types
//! derive Serialize/Deserialize for YAML; report types serialize to JSON.

use super::error::ConfigError;
use super::schema::KindSchema;
use super::value::{Reference, Resolution, Value};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;
use std::time::Duration;

/// Observed or recorded attributes of one resource.
pub type Attributes = IndexMap<String, serde_json::Value>;

// ============================================================================
// Addresses
// ============================================================================

static IDENT: LazyLock<regex::Regex> =
    LazyLock::new(|| regex::Regex::new(r"^[A-Za-z0-9_-]+$").expect("static regex"));

/// Returns true if `s` is a valid kind or name segment.
pub fn is_ident(s: &str) -> bool {
    IDENT.is_match(s)
}

/// Unique resource identifier: `kind.name`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Address {
    pub kind: String,
    pub name: String,
}

impl Address {
    pub fn new(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.kind, self.name)
    }
}

impl FromStr for Address {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, name) = s
            .split_once('.')
            .ok_or_else(|| format!("invalid address '{}': expected kind.name", s))?;
        if !is_ident(kind) || !is_ident(name) {
            return Err(format!("invalid address '{}': expected kind.name", s));
        }
        Ok(Self::new(kind, name))
    }
}

impl TryFrom<String> for Address {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<Address> for String {
    fn from(a: Address) -> Self {
        a.to_string()
    }
}

// ============================================================================
// Top-level terrane.yaml
// ============================================================================

/// Root configuration: the declared topology plus engine policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TerraneConfig {
    /// Schema version (must be "1.0")
    pub version: String,

    /// Topology name
    pub name: String,

    /// Optional description
    #[serde(default)]
    pub description: Option<String>,

    /// Default provider context (region, project, free-form vars)
    #[serde(default)]
    pub context: IndexMap<String, String>,

    /// Per-environment context overrides
    #[serde(default)]
    pub environments: IndexMap<String, IndexMap<String, String>>,

    /// Additional or overriding kind schemas
    #[serde(default)]
    pub kinds: IndexMap<String, KindSchema>,

    /// Resource declarations (order-preserving)
    #[serde(default)]
    pub resources: Vec<ResourceDecl>,

    /// Execution policy
    #[serde(default)]
    pub policy: Policy,

    /// External provider program
    #[serde(default)]
    pub provider: ProviderConfig,
}

impl TerraneConfig {
    /// Build the explicit provider context for an environment.
    pub fn context_for(&self, environment: Option<&str>) -> Result<Context, ConfigError> {
        let mut vars = self.context.clone();
        let name = match environment {
            Some(env) => {
                let overrides = self
                    .environments
                    .get(env)
                    .ok_or_else(|| ConfigError::UnknownEnvironment(env.to_string()))?;
                for (k, v) in overrides {
                    vars.insert(k.clone(), v.clone());
                }
                env.to_string()
            }
            None => DEFAULT_ENVIRONMENT.to_string(),
        };
        Ok(Context {
            environment: name,
            vars,
        })
    }
}

/// Environment name used when `--env` is not given.
pub const DEFAULT_ENVIRONMENT: &str = "default";

/// A resource as written in the declaration file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceDecl {
    /// Provider-defined resource kind (network, managed-database, ...)
    pub kind: String,

    /// Symbolic name, unique within the kind
    pub name: String,

    /// Attribute mapping; strings may carry `${...}` expressions
    #[serde(default)]
    pub attributes: IndexMap<String, serde_yaml_ng::Value>,

    /// Variant overrides; each key expands to `kind.name-key`
    #[serde(default)]
    pub variants: IndexMap<String, IndexMap<String, serde_yaml_ng::Value>>,

    /// Explicit ordering (addresses that must be applied first)
    #[serde(default)]
    pub depends_on: Vec<String>,

    /// Lifecycle directives
    #[serde(default)]
    pub lifecycle: Lifecycle,
}

/// Lifecycle directives for one resource.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lifecycle {
    /// Replace ordering override; `None` defers to the kind schema
    #[serde(default)]
    pub create_before_destroy: Option<bool>,

    /// Reject any plan that would delete or replace this resource
    #[serde(default)]
    pub prevent_destroy: bool,

    /// Attributes excluded from the diff
    #[serde(default)]
    pub ignore_changes: Vec<String>,
}

/// A parsed, validated resource.
#[derive(Debug, Clone, PartialEq)]
pub struct Resource {
    pub address: Address,
    pub attributes: IndexMap<String, Value>,
    pub depends_on: BTreeSet<Address>,
    pub lifecycle: Lifecycle,
}

impl Resource {
    pub fn kind(&self) -> &str {
        &self.address.kind
    }

    /// Every address referenced from any attribute.
    pub fn references(&self) -> BTreeSet<Address> {
        let mut out = BTreeSet::new();
        for value in self.attributes.values() {
            value.collect_references(&mut out);
        }
        out
    }

    /// Every reference expression, with the attribute it appears under.
    pub fn reference_sites(&self) -> Vec<(&str, Reference)> {
        let mut out = Vec::new();
        for (name, value) in &self.attributes {
            let mut refs = Vec::new();
            value.collect_reference_exprs(&mut refs);
            out.extend(refs.into_iter().map(|r| (name.as_str(), r)));
        }
        out
    }

    /// Names of attributes whose value is or contains a secret handle.
    pub fn sensitive_attributes(&self) -> BTreeSet<String> {
        self.attributes
            .iter()
            .filter(|(_, v)| v.contains_secret())
            .map(|(k, _)| k.clone())
            .collect()
    }

    /// Whether a replace creates the new instance before destroying the old.
    ///
    /// Explicit lifecycle wins; a generated identity (`name_prefix`) implies
    /// create-before-destroy; otherwise the kind schema decides.
    pub fn create_before_destroy(&self, schema: Option<&KindSchema>) -> bool {
        if let Some(explicit) = self.lifecycle.create_before_destroy {
            return explicit;
        }
        if self.attributes.contains_key("name_prefix") {
            return true;
        }
        schema
            .map(|s| s.replace == ReplacePolicy::CreateBeforeDestroy)
            .unwrap_or(false)
    }
}

/// All declared resources, keyed by address in declaration order.
#[derive(Debug, Clone, Default)]
pub struct ResourceSet {
    pub name: String,
    pub resources: IndexMap<Address, Resource>,
}

impl ResourceSet {
    pub fn get(&self, address: &Address) -> Option<&Resource> {
        self.resources.get(address)
    }

    pub fn contains(&self, address: &Address) -> bool {
        self.resources.contains_key(address)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Resource> {
        self.resources.values()
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }
}

/// Replace ordering policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplacePolicy {
    #[default]
    DestroyBeforeCreate,
    CreateBeforeDestroy,
}

// ============================================================================
// Context
// ============================================================================

/// Explicit provider context (environment, region, project, vars).
///
/// Threaded through diff, plan and apply instead of living in globals, so
/// independent environments can reconcile concurrently in one process.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Context {
    pub environment: String,
    pub vars: IndexMap<String, String>,
}

impl Context {
    pub fn new(environment: impl Into<String>) -> Self {
        Self {
            environment: environment.into(),
            vars: IndexMap::new(),
        }
    }

    pub fn with_var(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.vars.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        if key == "environment" {
            return Some(&self.environment);
        }
        self.vars.get(key).map(String::as_str)
    }

    pub fn region(&self) -> Option<&str> {
        self.get("region")
    }

    pub fn project(&self) -> Option<&str> {
        self.get("project")
    }
}

// ============================================================================
// Policy
// ============================================================================

/// Execution policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Policy {
    /// Maximum concurrent provider operations within a batch
    #[serde(default = "default_parallelism")]
    pub parallelism: usize,

    /// Per-operation timeout in seconds
    #[serde(default = "default_timeout")]
    pub operation_timeout_secs: u64,

    /// Transient failure retry budget
    #[serde(default)]
    pub retry: RetryPolicy,

    /// Append run events to events.jsonl
    #[serde(default = "default_true")]
    pub tripwire: bool,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            parallelism: default_parallelism(),
            operation_timeout_secs: default_timeout(),
            retry: RetryPolicy::default(),
            tripwire: true,
        }
    }
}

impl Policy {
    pub fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.operation_timeout_secs)
    }
}

fn default_parallelism() -> usize {
    8
}

fn default_timeout() -> u64 {
    600
}

fn default_true() -> bool {
    true
}

/// Bounded exponential backoff for transient provider failures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first
    #[serde(default = "default_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,

    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,

    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_attempts(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_ms: default_max_backoff(),
            multiplier: default_multiplier(),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (1-based), capped at `max_backoff_ms`.
    pub fn backoff(&self, retry: u32) -> Duration {
        let exp = retry.saturating_sub(1).min(32) as i32;
        let ms = self.initial_backoff_ms as f64 * self.multiplier.max(1.0).powi(exp);
        Duration::from_millis(ms.min(self.max_backoff_ms as f64) as u64)
    }
}

fn default_attempts() -> u32 {
    4
}

fn default_initial_backoff() -> u64 {
    500
}

fn default_max_backoff() -> u64 {
    30_000
}

fn default_multiplier() -> f64 {
    2.0
}

/// External provider program settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(default)]
    pub command: Option<String>,

    #[serde(default)]
    pub args: Vec<String>,
}

// ============================================================================
// Change set
// ============================================================================

/// Action the diff assigns to one address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeAction {
    Create,
    Update,
    Replace,
    Delete,
    NoOp,
}

impl fmt::Display for ChangeAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Create => write!(f, "CREATE"),
            Self::Update => write!(f, "UPDATE"),
            Self::Replace => write!(f, "REPLACE"),
            Self::Delete => write!(f, "DELETE"),
            Self::NoOp => write!(f, "NO-OP"),
        }
    }
}

impl ChangeAction {
    pub fn symbol(&self) -> &'static str {
        match self {
            Self::Create => "+",
            Self::Update => "~",
            Self::Replace => "-/+",
            Self::Delete => "-",
            Self::NoOp => " ",
        }
    }
}

/// One ChangeSet entry.
#[derive(Debug, Clone)]
pub struct Change {
    pub address: Address,
    pub action: ChangeAction,

    /// Recorded attributes (None when the address has no record)
    pub before: Option<Attributes>,

    /// Desired attributes (None for deletes)
    pub after: Option<IndexMap<String, Resolution>>,

    /// Attribute names that differ
    pub changed: Vec<String>,

    /// Immutable attributes that forced a replace
    pub replace_reasons: Vec<String>,

    pub create_before_destroy: bool,

    /// Attributes rendered as `(sensitive)`
    pub sensitive: BTreeSet<String>,

    /// Instances left by an earlier create-before-destroy replace whose
    /// delete did not succeed; each gets its own delete step
    pub deposed: Vec<Attributes>,
}

impl Change {
    pub fn kind(&self) -> &str {
        &self.address.kind
    }
}

/// Unordered (address-sorted) diff output.
#[derive(Debug, Clone, Default)]
pub struct ChangeSet {
    pub entries: Vec<Change>,
}

impl ChangeSet {
    pub fn get(&self, address: &Address) -> Option<&Change> {
        self.entries.iter().find(|c| &c.address == address)
    }

    /// Entries that require a provider operation.
    pub fn changes(&self) -> impl Iterator<Item = &Change> {
        self.entries
            .iter()
            .filter(|c| c.action != ChangeAction::NoOp || !c.deposed.is_empty())
    }

    /// True when every entry is a no-op.
    pub fn is_empty(&self) -> bool {
        self.changes().next().is_none()
    }

    pub fn summary(&self) -> ChangeSummary {
        let mut s = ChangeSummary::default();
        for c in &self.entries {
            match c.action {
                ChangeAction::Create => s.create += 1,
                ChangeAction::Update => s.update += 1,
                ChangeAction::Replace => s.replace += 1,
                ChangeAction::Delete => s.delete += 1,
                ChangeAction::NoOp => s.unchanged += 1,
            }
            s.deposed += c.deposed.len() as u32;
        }
        s
    }
}

/// Per-action counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ChangeSummary {
    pub create: u32,
    pub update: u32,
    pub replace: u32,
    pub delete: u32,
    pub unchanged: u32,
    #[serde(skip_serializing_if = "is_zero")]
    pub deposed: u32,
}

fn is_zero(n: &u32) -> bool {
    *n == 0
}

impl fmt::Display for ChangeSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} to add, {} to change, {} to replace, {} to destroy",
            self.create, self.update, self.replace, self.delete
        )?;
        if self.deposed > 0 {
            write!(f, " (+{} deposed)", self.deposed)?;
        }
        write!(f, ", {} unchanged.", self.unchanged)
    }
}

// ============================================================================
// Plan
// ============================================================================

/// The provider call one plan step makes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepOperation {
    Create,
    Update,
    Delete,
}

impl fmt::Display for StepOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Create => write!(f, "create"),
            Self::Update => write!(f, "update"),
            Self::Delete => write!(f, "delete"),
        }
    }
}

/// Which half of a replace a step is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplacePhase {
    Destroy,
    Create,
    /// Delete of `Change::deposed[i]`, left over from an earlier replace
    Deposed(usize),
}

/// One provider operation in a plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlanStep {
    pub id: usize,
    pub address: Address,
    pub operation: StepOperation,
    pub action: ChangeAction,
    pub phase: Option<ReplacePhase>,

    /// Step ids that must complete successfully first
    pub requires: Vec<usize>,
}

impl PlanStep {
    pub fn kind(&self) -> &str {
        &self.address.kind
    }

    /// `address (operation)` label used in reports and errors.
    pub fn label(&self) -> String {
        match self.phase {
            Some(ReplacePhase::Destroy) => format!("{} (replace: delete)", self.address),
            Some(ReplacePhase::Create) => format!("{} (replace: create)", self.address),
            Some(ReplacePhase::Deposed(i)) => format!("{} (deposed #{})", self.address, i),
            None => format!("{} ({})", self.address, self.operation),
        }
    }
}

/// Ordered, batched execution plan.
#[derive(Debug, Clone)]
pub struct Plan {
    pub name: String,
    pub environment: String,
    pub steps: Vec<PlanStep>,

    /// Step ids per batch; batch i only requires steps from batches < i
    pub batches: Vec<Vec<usize>>,

    /// Diff the plan was built from
    pub changes: ChangeSet,
}

impl Plan {
    pub fn step(&self, id: usize) -> &PlanStep {
        &self.steps[id]
    }

    pub fn batch_of(&self, id: usize) -> Option<usize> {
        self.batches.iter().position(|b| b.contains(&id))
    }

    /// Addresses touched by any step.
    pub fn targets(&self) -> BTreeSet<Address> {
        self.steps.iter().map(|s| s.address.clone()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn summary(&self) -> ChangeSummary {
        self.changes.summary()
    }
}

// ============================================================================
// Apply report
// ============================================================================

/// Terminal outcome of one step.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum StepOutcome {
    Succeeded { attempts: u32, duration_seconds: f64 },
    Failed { attempts: u32, error: String },
    Skipped { blocked_by: String },
    Cancelled,
}

impl StepOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded { .. })
    }
}

impl fmt::Display for StepOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Succeeded { attempts, .. } if *attempts > 1 => {
                write!(f, "ok after {} attempts", attempts)
            }
            Self::Succeeded { .. } => write!(f, "ok"),
            Self::Failed { error, .. } => write!(f, "FAILED: {}", error),
            Self::Skipped { blocked_by } => write!(f, "skipped (upstream {} failed)", blocked_by),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// One row of the apply report.
#[derive(Debug, Clone, Serialize)]
pub struct StepReport {
    pub step: usize,
    pub batch: usize,
    pub address: Address,
    pub operation: StepOperation,
    pub action: ChangeAction,
    pub outcome: StepOutcome,
}

/// Result of executing a plan.
#[derive(Debug, Clone, Serialize)]
pub struct ApplyReport {
    pub run_id: String,
    pub environment: String,
    pub steps: Vec<StepReport>,

    /// Addresses with no step in the plan
    pub unchanged: Vec<Address>,

    /// Whether cancellation stopped dispatch early
    pub cancelled: bool,

    pub duration_seconds: f64,
}

impl ApplyReport {
    pub fn outcome_of(&self, address: &Address) -> Vec<&StepOutcome> {
        self.steps
            .iter()
            .filter(|s| &s.address == address)
            .map(|s| &s.outcome)
            .collect()
    }

    pub fn succeeded(&self) -> usize {
        self.steps.iter().filter(|s| s.outcome.is_success()).count()
    }

    pub fn failed(&self) -> usize {
        self.steps
            .iter()
            .filter(|s| matches!(s.outcome, StepOutcome::Failed { .. }))
            .count()
    }

    pub fn skipped(&self) -> usize {
        self.steps
            .iter()
            .filter(|s| matches!(s.outcome, StepOutcome::Skipped { .. }))
            .count()
    }

    pub fn not_started(&self) -> usize {
        self.steps
            .iter()
            .filter(|s| s.outcome == StepOutcome::Cancelled)
            .count()
    }

    /// Addresses whose recorded state changed during this run.
    pub fn changed_addresses(&self) -> BTreeSet<Address> {
        self.steps
            .iter()
            .filter(|s| s.outcome.is_success())
            .map(|s| s.address.clone())
            .collect()
    }

    /// Addresses targeted by the plan whose record did not change.
    pub fn unchanged_targets(&self) -> BTreeSet<Address> {
        let changed = self.changed_addresses();
        self.steps
            .iter()
            .map(|s| s.address.clone())
            .filter(|a| !changed.contains(a))
            .collect()
    }

    /// Every step succeeded.
    pub fn is_success(&self) -> bool {
        self.steps.iter().all(|s| s.outcome.is_success())
    }

    /// 0 on full success, 1 on partial success.
    pub fn exit_code(&self) -> i32 {
        if self.is_success() {
            0
        } else {
            1
        }
    }
}

// ============================================================================
// Run events
// ============================================================================

/// Event for the JSONL run log.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RunEvent {
    RunStarted {
        run_id: String,
        environment: String,
        steps: usize,
        batches: usize,
        terrane_version: String,
    },
    StepStarted {
        run_id: String,
        address: String,
        operation: String,
        batch: usize,
    },
    StepRetrying {
        run_id: String,
        address: String,
        attempt: u32,
        error: String,
    },
    StepSucceeded {
        run_id: String,
        address: String,
        operation: String,
        version: Option<u64>,
        duration_seconds: f64,
    },
    StepFailed {
        run_id: String,
        address: String,
        operation: String,
        error: String,
    },
    StepSkipped {
        run_id: String,
        address: String,
        blocked_by: String,
    },
    RunCompleted {
        run_id: String,
        succeeded: usize,
        failed: usize,
        skipped: usize,
        cancelled: usize,
        total_seconds: f64,
    },
    DriftDetected {
        address: String,
        attributes: Vec<String>,
        expected_hash: String,
        actual_hash: String,
    },
}

/// Timestamped event wrapper.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimestampedEvent {
    pub ts: String,
    #[serde(flatten)]
    pub event: RunEvent,
}

// ============================================================================
// Tests
// ============================================================================
