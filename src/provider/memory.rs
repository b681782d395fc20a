//! In-process provider with deterministic ids.
//!
//! Supports scripted failures and per-address latency, and records every
//! call, for tests and dry runs.

use super::{ApplyRequest, DeleteRequest, Provider, ProviderError};
use crate::core::types::{Address, Attributes, Context, StepOperation};
use async_trait::async_trait;
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

/// One recorded provider call.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderCall {
    pub operation: String,
    pub address: Address,
    pub attributes: Option<Attributes>,
}

#[derive(Default)]
struct Inner {
    objects: BTreeMap<Address, Attributes>,
    calls: Vec<ProviderCall>,
    failures: BTreeMap<Address, VecDeque<ProviderError>>,
    always_fail: BTreeMap<Address, ProviderError>,
    delete_fail: BTreeMap<Address, ProviderError>,
    latency: BTreeMap<Address, Duration>,
    outputs: BTreeMap<String, Attributes>,
    next_id: u64,
    in_flight: usize,
    peak: usize,
}

/// Deterministic in-memory provider.
#[derive(Default)]
pub struct MemoryProvider {
    inner: Mutex<Inner>,
    default_latency: Duration,
}

impl MemoryProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep this long inside every call.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.default_latency = latency;
        self
    }

    /// Extra computed outputs returned for every apply of `kind`.
    pub fn with_outputs(self, kind: &str, outputs: Attributes) -> Self {
        self.guard().outputs.insert(kind.to_string(), outputs);
        self
    }

    fn guard(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Fail the next `times` calls for `address` with `error`.
    pub fn fail_next(&self, address: &Address, error: ProviderError, times: usize) {
        let mut inner = self.guard();
        let queue = inner.failures.entry(address.clone()).or_default();
        for _ in 0..times {
            queue.push_back(error.clone());
        }
    }

    /// Fail every call for `address`.
    pub fn fail_always(&self, address: &Address, error: ProviderError) {
        self.guard().always_fail.insert(address.clone(), error);
    }

    /// Fail every delete for `address`; applies still succeed.
    pub fn fail_deletes(&self, address: &Address, error: ProviderError) {
        self.guard().delete_fail.insert(address.clone(), error);
    }

    /// Drop every scripted failure for `address`.
    pub fn clear_failures(&self, address: &Address) {
        let mut inner = self.guard();
        inner.failures.remove(address);
        inner.always_fail.remove(address);
        inner.delete_fail.remove(address);
    }

    /// Per-address latency override.
    pub fn delay(&self, address: &Address, latency: Duration) {
        self.guard().latency.insert(address.clone(), latency);
    }

    /// Change or remove an object behind the engine's back.
    pub fn tamper(&self, address: &Address, attributes: Option<Attributes>) {
        let mut inner = self.guard();
        match attributes {
            Some(a) => inner.objects.insert(address.clone(), a),
            None => inner.objects.remove(address),
        };
    }

    pub fn objects(&self) -> BTreeMap<Address, Attributes> {
        self.guard().objects.clone()
    }

    pub fn calls(&self) -> Vec<ProviderCall> {
        self.guard().calls.clone()
    }

    /// Calls made for one address.
    pub fn calls_for(&self, address: &Address) -> Vec<ProviderCall> {
        self.guard()
            .calls
            .iter()
            .filter(|c| &c.address == address)
            .cloned()
            .collect()
    }

    /// Highest number of calls observed in flight at once.
    pub fn peak_concurrency(&self) -> usize {
        self.guard().peak
    }

    /// Record the call, then sleep and pop any scripted failure.
    async fn enter(
        &self,
        operation: &str,
        address: &Address,
        attributes: Option<&Attributes>,
    ) -> Result<(), ProviderError> {
        let latency = {
            let mut inner = self.guard();
            inner.calls.push(ProviderCall {
                operation: operation.to_string(),
                address: address.clone(),
                attributes: attributes.cloned(),
            });
            inner.in_flight += 1;
            inner.peak = inner.peak.max(inner.in_flight);
            inner
                .latency
                .get(address)
                .copied()
                .unwrap_or(self.default_latency)
        };

        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let mut inner = self.guard();
        inner.in_flight = inner.in_flight.saturating_sub(1);
        if let Some(err) = inner.always_fail.get(address) {
            return Err(err.clone());
        }
        if operation == "delete" {
            if let Some(err) = inner.delete_fail.get(address) {
                return Err(err.clone());
            }
        }
        if let Some(err) = inner.failures.get_mut(address).and_then(VecDeque::pop_front) {
            return Err(err);
        }
        Ok(())
    }
}

#[async_trait]
impl Provider for MemoryProvider {
    async fn apply(&self, request: &ApplyRequest) -> Result<Attributes, ProviderError> {
        let op = request.operation.to_string();
        self.enter(&op, &request.address, Some(&request.attributes))
            .await?;

        let mut inner = self.guard();
        let existing_id = match request.operation {
            StepOperation::Update => inner
                .objects
                .get(&request.address)
                .and_then(|o| o.get("id"))
                .cloned(),
            _ => None,
        };
        let id = match existing_id {
            Some(id) => id,
            None => {
                inner.next_id += 1;
                serde_json::Value::String(format!("{}-{}", request.kind, inner.next_id))
            }
        };

        let mut observed = request.attributes.clone();
        if let Some(extra) = inner.outputs.get(&request.kind) {
            for (k, v) in extra {
                observed.entry(k.clone()).or_insert_with(|| v.clone());
            }
        }
        observed.insert("id".to_string(), id);
        inner.objects.insert(request.address.clone(), observed.clone());
        Ok(observed)
    }

    async fn delete(&self, request: &DeleteRequest) -> Result<(), ProviderError> {
        let address = &request.address;
        self.enter("delete", address, Some(&request.attributes)).await?;
        let mut inner = self.guard();
        // A deposed instance (create-before-destroy) has a different id than
        // the live object at this address; leave the live one alone.
        let live_id = inner.objects.get(address).and_then(|o| o.get("id"));
        let same = match (live_id, request.attributes.get("id")) {
            (Some(live), Some(target)) => live == target,
            _ => true,
        };
        if same {
            inner.objects.remove(address);
        }
        Ok(())
    }

    async fn read(
        &self,
        _ctx: &Context,
        _kind: &str,
        address: &Address,
    ) -> Result<Option<Attributes>, ProviderError> {
        self.enter("read", address, None).await?;
        Ok(self.guard().objects.get(address).cloned())
    }

    fn name(&self) -> &str {
        "memory"
    }
}
