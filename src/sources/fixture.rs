//! Fixture-backed source client
//!
//! Serves canned records keyed by the query's `lead`. Used by the CLI's
//! offline mode and throughout the tests: failures, latency and concurrency
//! observations can all be scripted.

use std::collections::{BTreeMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{QueryParams, RawRecord, SourceClient, SourceRegistry};
use crate::evidence::{normalize_entity_id, SourceCategory};
use crate::types::{AppError, AppResult, CallFailure};

#[derive(Default)]
pub struct FixtureSource {
    records: BTreeMap<String, Vec<RawRecord>>,
    scripted: Mutex<VecDeque<CallFailure>>,
    always_fail: Option<CallFailure>,
    latency: Duration,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl FixtureSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records returned when the query's lead matches `lead`.
    pub fn with_records(mut self, lead: &str, records: Vec<RawRecord>) -> Self {
        self.records.entry(normalize_entity_id(lead)).or_default().extend(records);
        self
    }

    /// Every call fails with `failure`.
    pub fn failing(mut self, failure: CallFailure) -> Self {
        self.always_fail = Some(failure);
        self
    }

    /// The next calls fail in order, then the source recovers.
    pub fn with_scripted_failures(self, failures: Vec<CallFailure>) -> Self {
        if let Ok(mut scripted) = self.scripted.lock() {
            scripted.extend(failures);
        }
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Highest number of concurrent calls observed.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn next_scripted_failure(&self) -> Option<CallFailure> {
        self.scripted
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .pop_front()
    }
}

#[async_trait]
impl SourceClient for FixtureSource {
    async fn query(
        &self,
        params: &QueryParams,
        cancel: &CancellationToken,
    ) -> Result<Vec<RawRecord>, CallFailure> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let _guard = InFlight(&self.in_flight);

        if !self.latency.is_zero() {
            tokio::select! {
                _ = cancel.cancelled() => return Err(CallFailure::cancelled()),
                _ = tokio::time::sleep(self.latency) => {}
            }
        } else if cancel.is_cancelled() {
            return Err(CallFailure::cancelled());
        }

        if let Some(failure) = self.always_fail.clone().or_else(|| self.next_scripted_failure()) {
            debug!(error = %failure, "Fixture source failing call");
            return Err(failure);
        }

        let lead = params.get("lead").map(|l| normalize_entity_id(l)).unwrap_or_default();
        Ok(self.records.get(&lead).cloned().unwrap_or_default())
    }
}

/// On-disk fixture format used by the CLI.
///
/// ```json
/// { "sources": [ { "id": "ctgov", "category": "clinical",
///                  "records": { "inflammatory bowel disease": [ { "subject": "...", "fields": {} } ] } } ] }
/// ```
#[derive(Debug, Deserialize)]
pub struct FixtureFile {
    pub sources: Vec<FixtureSourceSpec>,
}

#[derive(Debug, Deserialize)]
pub struct FixtureSourceSpec {
    pub id: String,
    pub category: SourceCategory,
    #[serde(default)]
    pub ttl_secs: Option<u64>,
    #[serde(default)]
    pub latency_ms: u64,
    /// Make every call fail: `unavailable`, `invalid` or `rate_limited`.
    #[serde(default)]
    pub fail: Option<String>,
    #[serde(default)]
    pub records: BTreeMap<String, Vec<RawRecord>>,
}

impl FixtureFile {
    pub async fn load(path: impl AsRef<Path>) -> AppResult<Self> {
        let path = path.as_ref();
        let bytes = tokio::fs::read(path).await?;
        let file: FixtureFile = serde_json::from_slice(&bytes)
            .map_err(|e| AppError::Internal(format!("invalid fixture file {}: {}", path.display(), e)))?;
        info!(path = %path.display(), sources = file.sources.len(), "Loaded source fixtures");
        Ok(file)
    }

    pub fn into_registry(self, default_ttl: Duration) -> AppResult<SourceRegistry> {
        let mut registry = SourceRegistry::new();
        for spec in self.sources {
            let mut source = FixtureSource::new().with_latency(Duration::from_millis(spec.latency_ms));
            for (lead, records) in spec.records {
                source = source.with_records(&lead, records);
            }
            if let Some(mode) = spec.fail.as_deref() {
                let failure = match mode {
                    "unavailable" => CallFailure::unavailable("fixture marked unavailable"),
                    "invalid" => CallFailure::invalid("fixture marked invalid"),
                    "rate_limited" => CallFailure::rate_limited(None),
                    other => {
                        return Err(AppError::Internal(format!(
                            "unknown failure mode '{}' for fixture source {}",
                            other, spec.id
                        )))
                    }
                };
                source = source.failing(failure);
            }
            let ttl = spec.ttl_secs.map(Duration::from_secs).unwrap_or(default_ttl);
            registry = registry.with_source(spec.id.as_str(), spec.category, Arc::new(source), ttl);
        }
        Ok(registry)
    }
}
