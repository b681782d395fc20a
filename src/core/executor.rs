//! Executor: runs a plan against a provider and commits results to state.
//!
//! Batches run in order; each settles completely before the next starts.
//! Within a batch every runnable step is spawned onto a [`JoinSet`] and a
//! semaphore bounds the provider calls in flight. Attribute references are
//! resolved at dispatch against outputs of steps that already succeeded in
//! this run, or the stored record of an address with no pending step.
//!
//! apply: lock targets → for each batch: skip / resolve / spawn → settle →
//! commit records → release settled locks → report

use super::error::{EngineError, StateError};
use super::resolver::DependencyGraph;
use super::schema::SchemaRegistry;
use super::state::{ResourceRecord, StateStore};
use super::types::*;
use super::value::{lookup_path, Reference, Resolution, ResolveError};
use crate::provider::{ApplyRequest, DeleteRequest, Provider, ProviderError};
use crate::tripwire::drift::{self, DriftFinding};
use crate::tripwire::eventlog;
use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

/// Shared cancellation flag. Checked before each batch is dispatched;
/// steps already in flight always finish and commit.
#[derive(Debug, Clone, Default)]
pub struct CancelSignal(Arc<AtomicBool>);

impl CancelSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Everything an apply run reads besides the plan.
pub struct ExecuteOptions<'a> {
    pub resources: &'a ResourceSet,
    pub graph: &'a DependencyGraph,
    pub schemas: &'a SchemaRegistry,
    pub context: &'a Context,
    pub policy: &'a Policy,
    pub cancel: CancelSignal,
}

/// Appends run events when `policy.tripwire` is on.
#[derive(Clone)]
struct EventSink {
    root: PathBuf,
    environment: String,
    enabled: bool,
}

impl EventSink {
    fn new(store: &StateStore, enabled: bool) -> Self {
        Self {
            root: store.root().to_path_buf(),
            environment: store.environment().to_string(),
            enabled,
        }
    }

    fn emit(&self, event: RunEvent) {
        if !self.enabled {
            return;
        }
        if let Err(e) = eventlog::append_event(&self.root, &self.environment, event) {
            tracing::warn!(error = %e, "failed to append run event");
        }
    }
}

enum Call {
    Apply(ApplyRequest),
    Delete(DeleteRequest),
}

struct StepTask {
    id: usize,
    batch: usize,
    address: Address,
    operation: StepOperation,
    call: Call,
}

/// What a spawned step hands back to the run loop.
struct Finished {
    id: usize,
    attempts: u32,
    duration: f64,
    result: Result<Option<Attributes>, ProviderError>,
}

#[derive(Clone)]
struct Shared {
    provider: Arc<dyn Provider>,
    semaphore: Arc<Semaphore>,
    policy: Policy,
    events: EventSink,
    run_id: String,
}

/// Call `op` under the per-operation timeout, retrying transient failures
/// with backoff. Returns the number of attempts made.
///
/// A transient failure that exhausts the budget is returned as permanent.
async fn call_with_retry<T, F, Fut>(
    policy: &Policy,
    mut on_retry: impl FnMut(u32, &ProviderError),
    mut op: F,
) -> (u32, Result<T, ProviderError>)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ProviderError>>,
{
    let max_attempts = policy.retry.max_attempts.max(1);
    let limit = policy.operation_timeout();
    let mut attempt = 1;
    loop {
        let result = match tokio::time::timeout(limit, op()).await {
            Ok(r) => r,
            Err(_) => Err(ProviderError::Transient(format!(
                "operation timed out after {:?}",
                limit
            ))),
        };
        match result {
            Err(e) if e.is_transient() && attempt < max_attempts => {
                on_retry(attempt, &e);
                tokio::time::sleep(policy.retry.backoff(attempt)).await;
                attempt += 1;
            }
            Err(e) if e.is_transient() && max_attempts > 1 => {
                return (
                    attempt,
                    Err(ProviderError::Permanent(format!(
                        "{} (gave up after {} attempts)",
                        e.message(),
                        attempt
                    ))),
                );
            }
            other => return (attempt, other),
        }
    }
}

async fn run_step(task: StepTask, shared: Shared) -> Finished {
    let _permit = match shared.semaphore.clone().acquire_owned().await {
        Ok(p) => p,
        Err(_) => {
            return Finished {
                id: task.id,
                attempts: 0,
                duration: 0.0,
                result: Err(ProviderError::Permanent("executor shut down".to_string())),
            }
        }
    };

    tracing::info!(address = %task.address, operation = %task.operation, batch = task.batch, "step started");
    shared.events.emit(RunEvent::StepStarted {
        run_id: shared.run_id.clone(),
        address: task.address.to_string(),
        operation: task.operation.to_string(),
        batch: task.batch,
    });

    let start = Instant::now();
    let provider = shared.provider.as_ref();
    let on_retry = |attempt: u32, e: &ProviderError| {
        tracing::warn!(address = %task.address, attempt, error = %e, "transient failure, retrying");
        shared.events.emit(RunEvent::StepRetrying {
            run_id: shared.run_id.clone(),
            address: task.address.to_string(),
            attempt,
            error: e.message().to_string(),
        });
    };

    let (attempts, result) = match &task.call {
        Call::Apply(request) => {
            let (n, r) = call_with_retry(&shared.policy, on_retry, move || provider.apply(request)).await;
            (n, r.map(Some))
        }
        Call::Delete(request) => {
            let (n, r) = call_with_retry(&shared.policy, on_retry, move || provider.delete(request)).await;
            (n, r.map(|()| None))
        }
    };

    Finished {
        id: task.id,
        attempts,
        duration: start.elapsed().as_secs_f64(),
        result,
    }
}

/// Mutable bookkeeping for one apply run.
struct Run<'a> {
    plan: &'a Plan,
    store: &'a StateStore,
    opts: &'a ExecuteOptions<'a>,
    run_id: &'a str,
    events: EventSink,
    outcomes: BTreeMap<usize, StepOutcome>,
    /// Observed attributes of addresses applied in this run
    outputs: BTreeMap<Address, Attributes>,
    /// Attributes sent with each step: secret handles for applies, the
    /// deleted instance for deletes
    sent: BTreeMap<usize, Attributes>,
    apply_steps: BTreeMap<Address, usize>,
    /// Record versions when the run started; deleted records keep their floor
    initial_versions: BTreeMap<Address, u64>,
    released: BTreeSet<Address>,
}

impl<'a> Run<'a> {
    /// The failed address blocking `step`, if any prerequisite did not succeed.
    fn blocked_by(&self, step: &PlanStep) -> Option<String> {
        for req in &step.requires {
            match self.outcomes.get(req) {
                Some(StepOutcome::Succeeded { .. }) => {}
                Some(StepOutcome::Skipped { blocked_by }) => return Some(blocked_by.clone()),
                _ => return Some(self.plan.step(*req).address.to_string()),
            }
        }
        None
    }

    fn lookup(&self, r: &Reference) -> Result<Resolution, ResolveError> {
        let missing = || ResolveError::MissingAttribute(r.to_string());
        if let Some(observed) = self.outputs.get(&r.target) {
            return lookup_path(observed, &r.path)
                .cloned()
                .map(Resolution::Known)
                .ok_or_else(missing);
        }
        if self.apply_steps.contains_key(&r.target) {
            return Err(ResolveError::NotReady {
                reference: r.to_string(),
                target: r.target.clone(),
            });
        }
        let record = self.store.get(&r.target).ok_or_else(missing)?;
        lookup_path(&record.attributes, &r.path)
            .cloned()
            .map(Resolution::Known)
            .ok_or_else(missing)
    }

    fn resolve(&self, resource: &Resource) -> Result<Attributes, String> {
        let lookup = |r: &Reference| self.lookup(r);
        let mut out = Attributes::new();
        for (name, value) in &resource.attributes {
            match value.resolve(self.opts.context, &lookup) {
                Ok(Resolution::Known(v)) => {
                    out.insert(name.clone(), v);
                }
                Ok(Resolution::Unknown) => {
                    return Err(format!("attribute '{}' is still unknown at apply time", name))
                }
                Err(e) => return Err(format!("attribute '{}': {}", name, e)),
            }
        }
        Ok(out)
    }

    /// Build the provider call for a step. Errors fail the step without
    /// contacting the provider.
    fn prepare(&mut self, step: &PlanStep) -> Result<Call, String> {
        let change = self
            .plan
            .changes
            .get(&step.address)
            .ok_or_else(|| format!("no change recorded for {}", step.address))?;

        if step.operation == StepOperation::Delete {
            let attributes = match step.phase {
                Some(ReplacePhase::Deposed(i)) => change
                    .deposed
                    .get(i)
                    .cloned()
                    .ok_or_else(|| format!("no deposed instance #{} for {}", i, step.address))?,
                _ => change.before.clone().unwrap_or_default(),
            };
            self.sent.insert(step.id, attributes.clone());
            return Ok(Call::Delete(DeleteRequest {
                context: self.opts.context.clone(),
                kind: step.kind().to_string(),
                address: step.address.clone(),
                attributes,
            }));
        }

        let resource = self
            .opts
            .resources
            .get(&step.address)
            .ok_or_else(|| format!("{} is not declared", step.address))?;
        let attributes = self.resolve(resource)?;
        self.sent.insert(step.id, attributes.clone());
        Ok(Call::Apply(ApplyRequest {
            context: self.opts.context.clone(),
            kind: step.kind().to_string(),
            address: step.address.clone(),
            operation: step.operation,
            attributes,
            prior: match step.operation {
                StepOperation::Update => change.before.clone(),
                _ => None,
            },
        }))
    }

    fn commit_apply(&mut self, step: &PlanStep, mut observed: Attributes) -> Result<u64, StateError> {
        let resource = self.opts.resources.get(&step.address);
        let sensitive = resource.map(Resource::sensitive_attributes).unwrap_or_default();

        // Store the handle, never whatever the provider echoed back.
        if let Some(sent) = self.sent.get(&step.id) {
            for key in &sensitive {
                if let Some(marker) = sent.get(key) {
                    observed.insert(key.clone(), marker.clone());
                }
            }
        }

        let prior = self.store.get(&step.address);
        let current = prior.as_ref().map(|r| r.version);
        let floor = current
            .or_else(|| self.initial_versions.get(&step.address).copied())
            .unwrap_or(0);

        let mut record = ResourceRecord::new(step.kind(), floor + 1, observed.clone());
        if let Some(resource) = resource {
            record.declared = resource.attributes.keys().cloned().collect();
            record.create_before_destroy =
                resource.create_before_destroy(self.opts.schemas.get(step.kind()));
        }
        record.sensitive = sensitive;
        record.dependencies = self.opts.graph.dependencies_of(&step.address).clone();
        if let Some(prior) = prior {
            record.deposed = prior.deposed;
            // The old instance stays tracked until the destroy half succeeds.
            if step.phase == Some(ReplacePhase::Create) && self.replaced_create_first(step) {
                record.deposed.push(prior.attributes);
            }
        }

        let version = self.store.commit(self.run_id, &step.address, current, record)?;
        self.outputs.insert(step.address.clone(), observed);
        Ok(version)
    }

    fn replaced_create_first(&self, step: &PlanStep) -> bool {
        self.plan
            .changes
            .get(&step.address)
            .is_some_and(|c| c.action == ChangeAction::Replace && c.create_before_destroy)
    }

    fn commit_delete(&mut self, step: &PlanStep) -> Result<Option<u64>, StateError> {
        // The destroy half of a create-before-destroy replace, or a deposed
        // delete, removes an old instance; the record describes the current
        // one and only drops the deposed entry.
        let deposed_delete = match step.phase {
            Some(ReplacePhase::Deposed(_)) => true,
            Some(ReplacePhase::Destroy) => self.replaced_create_first(step),
            _ => false,
        };
        if !deposed_delete {
            let current = self.store.get(&step.address).map(|r| r.version);
            self.store.remove(self.run_id, &step.address, current)?;
            return Ok(None);
        }

        let Some(mut record) = self.store.get(&step.address) else {
            return Ok(None);
        };
        let position = self
            .sent
            .get(&step.id)
            .and_then(|deleted| record.deposed.iter().position(|d| d == deleted));
        let Some(position) = position else {
            return Ok(None);
        };
        record.deposed.remove(position);
        let current = record.version;
        record.version += 1;
        self.store
            .commit(self.run_id, &step.address, Some(current), record)
            .map(Some)
    }

    fn finish(&mut self, finished: Finished) {
        let plan = self.plan;
        let step = plan.step(finished.id);
        let committed = match finished.result {
            Ok(Some(observed)) => self.commit_apply(step, observed).map(Some),
            Ok(None) => self.commit_delete(step),
            Err(e) => {
                self.fail(step, finished.attempts, e.to_string());
                return;
            }
        };
        match committed {
            Ok(version) => {
                tracing::info!(
                    address = %step.address,
                    operation = %step.operation,
                    attempts = finished.attempts,
                    version,
                    "step succeeded"
                );
                self.events.emit(RunEvent::StepSucceeded {
                    run_id: self.run_id.to_string(),
                    address: step.address.to_string(),
                    operation: step.operation.to_string(),
                    version,
                    duration_seconds: finished.duration,
                });
                self.outcomes.insert(
                    step.id,
                    StepOutcome::Succeeded {
                        attempts: finished.attempts,
                        duration_seconds: finished.duration,
                    },
                );
            }
            Err(e) => self.fail(step, finished.attempts, format!("state commit failed: {}", e)),
        }
    }

    fn fail(&mut self, step: &PlanStep, attempts: u32, error: String) {
        tracing::error!(address = %step.address, operation = %step.operation, attempts, %error, "step failed");
        self.events.emit(RunEvent::StepFailed {
            run_id: self.run_id.to_string(),
            address: step.address.to_string(),
            operation: step.operation.to_string(),
            error: error.clone(),
        });
        self.outcomes.insert(step.id, StepOutcome::Failed { attempts, error });
    }

    fn skip(&mut self, step: &PlanStep, blocked_by: String) {
        tracing::warn!(address = %step.address, %blocked_by, "step skipped");
        self.events.emit(RunEvent::StepSkipped {
            run_id: self.run_id.to_string(),
            address: step.address.to_string(),
            blocked_by: blocked_by.clone(),
        });
        self.outcomes.insert(step.id, StepOutcome::Skipped { blocked_by });
    }

    /// Release the lock of every address whose steps are all terminal.
    fn release_settled(&mut self) {
        let mut pending: BTreeSet<&Address> = BTreeSet::new();
        for step in &self.plan.steps {
            if !self.outcomes.contains_key(&step.id) {
                pending.insert(&step.address);
            }
        }
        for step in &self.plan.steps {
            if pending.contains(&step.address) || self.released.contains(&step.address) {
                continue;
            }
            match self.store.release_lock(self.run_id, &step.address) {
                Ok(()) => {
                    self.released.insert(step.address.clone());
                }
                Err(e) => tracing::warn!(address = %step.address, error = %e, "failed to release lock"),
            }
        }
    }
}

/// Execute `plan`.
///
/// Returns `Err` only when the run is refused before any provider call
/// (lock conflict, unreadable lock table). Provider failures become step
/// outcomes in the report.
pub async fn execute(
    plan: &Plan,
    store: Arc<StateStore>,
    provider: Arc<dyn Provider>,
    opts: &ExecuteOptions<'_>,
) -> Result<ApplyReport, EngineError> {
    let start = Instant::now();
    let run_id = eventlog::generate_run_id();
    let unchanged: Vec<Address> = plan
        .changes
        .entries
        .iter()
        .filter(|c| c.action == ChangeAction::NoOp)
        .map(|c| c.address.clone())
        .collect();

    if plan.is_empty() {
        return Ok(ApplyReport {
            run_id,
            environment: plan.environment.clone(),
            steps: Vec::new(),
            unchanged,
            cancelled: false,
            duration_seconds: start.elapsed().as_secs_f64(),
        });
    }

    store.acquire_locks(&run_id, &plan.targets())?;

    let events = EventSink::new(&store, opts.policy.tripwire);
    events.emit(RunEvent::RunStarted {
        run_id: run_id.clone(),
        environment: plan.environment.clone(),
        steps: plan.steps.len(),
        batches: plan.batches.len(),
        terrane_version: env!("CARGO_PKG_VERSION").to_string(),
    });
    tracing::info!(
        %run_id,
        environment = %plan.environment,
        steps = plan.steps.len(),
        batches = plan.batches.len(),
        provider = provider.name(),
        "apply started"
    );

    let shared = Shared {
        provider,
        semaphore: Arc::new(Semaphore::new(opts.policy.parallelism.max(1))),
        policy: opts.policy.clone(),
        events: events.clone(),
        run_id: run_id.clone(),
    };

    let mut run = Run {
        plan,
        store: &store,
        opts,
        run_id: &run_id,
        events: events.clone(),
        outcomes: BTreeMap::new(),
        outputs: BTreeMap::new(),
        sent: BTreeMap::new(),
        apply_steps: plan
            .steps
            .iter()
            .filter(|s| s.operation != StepOperation::Delete)
            .map(|s| (s.address.clone(), s.id))
            .collect(),
        initial_versions: store
            .records()
            .into_iter()
            .map(|(a, r)| (a, r.version))
            .collect(),
        released: BTreeSet::new(),
    };

    let mut cancelled = false;
    for (batch_no, batch) in plan.batches.iter().enumerate() {
        if opts.cancel.is_cancelled() {
            tracing::warn!(%run_id, batch = batch_no, "cancelled; not dispatching remaining batches");
            cancelled = true;
            break;
        }

        let mut tasks = JoinSet::new();
        let mut dispatched: BTreeSet<usize> = BTreeSet::new();
        for &id in batch {
            let step = plan.step(id);
            if let Some(root) = run.blocked_by(step) {
                run.skip(step, root);
                continue;
            }
            match run.prepare(step) {
                Ok(call) => {
                    dispatched.insert(id);
                    let task = StepTask {
                        id,
                        batch: batch_no,
                        address: step.address.clone(),
                        operation: step.operation,
                        call,
                    };
                    tasks.spawn(run_step(task, shared.clone()));
                }
                Err(message) => run.fail(step, 0, message),
            }
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(finished) => {
                    dispatched.remove(&finished.id);
                    run.finish(finished);
                }
                Err(e) => tracing::error!(error = %e, "step task did not complete"),
            }
        }
        for id in dispatched {
            run.fail(plan.step(id), 0, "step task panicked".to_string());
        }
        run.release_settled();
    }

    let mut outcomes = std::mem::take(&mut run.outcomes);
    let steps: Vec<StepReport> = plan
        .steps
        .iter()
        .map(|s| StepReport {
            step: s.id,
            batch: plan.batch_of(s.id).unwrap_or(0),
            address: s.address.clone(),
            operation: s.operation,
            action: s.action,
            outcome: outcomes.remove(&s.id).unwrap_or(StepOutcome::Cancelled),
        })
        .collect();

    if let Err(e) = store.force_unlock(&run_id) {
        tracing::error!(%run_id, error = %e, "failed to release locks; run `terrane unlock`");
    }

    let report = ApplyReport {
        run_id: run_id.clone(),
        environment: plan.environment.clone(),
        steps,
        unchanged,
        cancelled,
        duration_seconds: start.elapsed().as_secs_f64(),
    };

    events.emit(RunEvent::RunCompleted {
        run_id,
        succeeded: report.succeeded(),
        failed: report.failed(),
        skipped: report.skipped(),
        cancelled: report.not_started(),
        total_seconds: report.duration_seconds,
    });
    tracing::info!(
        succeeded = report.succeeded(),
        failed = report.failed(),
        skipped = report.skipped(),
        cancelled = report.not_started(),
        "apply finished"
    );

    Ok(report)
}

// ============================================================================
// Refresh
// ============================================================================

/// Outcome of a refresh run.
#[derive(Debug, Clone, Default)]
pub struct RefreshReport {
    /// Records read from the provider
    pub checked: usize,
    pub findings: Vec<DriftFinding>,
    /// Addresses whose read or record update failed
    pub errors: Vec<(Address, String)>,
}

impl RefreshReport {
    pub fn exit_code(&self) -> i32 {
        if self.errors.is_empty() {
            0
        } else {
            1
        }
    }
}

/// Read every recorded resource back from the provider and fold drift into
/// state: changed attributes are recorded at a new version, vanished
/// resources lose their record. Nothing is created or deleted.
pub async fn refresh(
    store: &StateStore,
    provider: &dyn Provider,
    context: &Context,
    policy: &Policy,
) -> Result<RefreshReport, EngineError> {
    let records = store.records();
    let mut report = RefreshReport::default();
    if records.is_empty() {
        return Ok(report);
    }

    let run_id = eventlog::generate_run_id();
    let addresses: BTreeSet<Address> = records.keys().cloned().collect();
    store.acquire_locks(&run_id, &addresses)?;
    let events = EventSink::new(store, policy.tripwire);
    tracing::info!(%run_id, records = records.len(), "refresh started");

    for (address, record) in &records {
        report.checked += 1;
        let kind = record.kind.as_str();
        let (_, live) = call_with_retry(
            policy,
            |attempt, e| tracing::warn!(%address, attempt, error = %e, "read failed, retrying"),
            move || provider.read(context, kind, address),
        )
        .await;
        let live = match live {
            Ok(live) => live,
            Err(e) => {
                report.errors.push((address.clone(), e.to_string()));
                continue;
            }
        };

        let Some(finding) = drift::check_drift(address, record, live.as_ref()) else {
            continue;
        };
        tracing::warn!(%address, detail = %finding.detail, "drift detected");
        events.emit(RunEvent::DriftDetected {
            address: address.to_string(),
            attributes: finding.attributes.clone(),
            expected_hash: finding.expected_hash.clone(),
            actual_hash: finding.actual_hash.clone(),
        });

        let updated = match &live {
            None => store.remove(&run_id, address, Some(record.version)),
            Some(live) => {
                let mut next = record.clone();
                next.attributes = drift::refreshed_attributes(record, live);
                next.version += 1;
                next.applied_at = eventlog::now_iso8601();
                next.rehash();
                store
                    .commit(&run_id, address, Some(record.version), next)
                    .map(|_| ())
            }
        };
        if let Err(e) = updated {
            report.errors.push((address.clone(), e.to_string()));
        }
        report.findings.push(finding);
    }

    store.force_unlock(&run_id)?;
    Ok(report)
}
