//! Cache Layer
//!
//! A TTL cache with single-flight semantics, shared by every run in the
//! process:
//!
//! - concurrent callers with the same [`Fingerprint`] share one in-flight fetch
//! - entries expire after their TTL and are refetched on the next miss
//! - errors are never cached
//! - a fetch every caller has abandoned (timeout, cancellation) is forgotten
//! - entries older than the soft-freshness threshold are still served, but
//!   flagged `stale`
//!
//! The same structure backs both source queries ([`EvidenceCache`]) and
//! generation calls ([`SynthesisCache`]).

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use sha2::{Digest, Sha256};
use tokio::time::Instant;
use tracing::debug;

use crate::evidence::SourceId;
use crate::sources::RawRecord;
use crate::types::CallFailure;

/// Times a caller restarts a shared fetch that failed only because another
/// caller's cancellation stopped it.
pub const MAX_SHARED_FETCH_RETRIES: usize = 2;

/// Stable hash identifying one external call.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Fingerprint of a source query. Params are already sorted by key.
    pub fn for_query(source: &SourceId, params: &BTreeMap<String, String>) -> Self {
        let normalized: BTreeMap<String, String> = params
            .iter()
            .map(|(k, v)| (k.trim().to_ascii_lowercase(), v.split_whitespace().collect::<Vec<_>>().join(" ")))
            .collect();
        let body = serde_json::to_vec(&normalized).unwrap_or_default();
        Self::for_bytes(source.as_str(), &body)
    }

    pub fn for_bytes(namespace: &str, bytes: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(namespace.as_bytes());
        hasher.update([0u8]);
        hasher.update(bytes);
        Self(hex::encode(hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0[..12.min(self.0.len())])
    }
}

/// A value served by the cache.
#[derive(Debug, Clone, PartialEq)]
pub struct Cached<V> {
    pub value: V,
    /// When the producer finished.
    pub stored_at: DateTime<Utc>,
    /// Older than the soft-freshness threshold.
    pub stale: bool,
    /// Served from a stored entry or a fetch started by another caller.
    pub shared: bool,
}

type SharedFetch<V, E> = Shared<BoxFuture<'static, Result<(V, DateTime<Utc>), E>>>;

enum Slot<V, E>
where
    V: Clone,
    E: Clone,
{
    Ready {
        value: V,
        stored_at: DateTime<Utc>,
        inserted: Instant,
        ttl: Duration,
    },
    Pending {
        generation: u64,
        fetch: SharedFetch<V, E>,
        /// Callers currently awaiting `fetch`.
        waiters: Arc<AtomicUsize>,
    },
}

/// Held by each caller awaiting a pending fetch. The last one to go away
/// before the fetch settles removes the slot.
struct Waiter<'a, V, E>
where
    V: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    cache: &'a TtlCache<V, E>,
    fingerprint: &'a Fingerprint,
    generation: u64,
    waiters: Arc<AtomicUsize>,
    settled: bool,
}

impl<V, E> Drop for Waiter<'_, V, E>
where
    V: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    fn drop(&mut self) {
        let mut slots = self.cache.lock();
        let last = self.waiters.fetch_sub(1, Ordering::SeqCst) == 1;
        if self.settled || !last {
            return;
        }
        let abandoned = matches!(
            slots.get(self.fingerprint),
            Some(Slot::Pending { generation, .. }) if *generation == self.generation
        );
        if abandoned {
            debug!(fingerprint = %self.fingerprint, "Dropping abandoned fetch");
            slots.remove(self.fingerprint);
        }
    }
}

pub struct TtlCache<V, E>
where
    V: Clone,
    E: Clone,
{
    slots: Mutex<HashMap<Fingerprint, Slot<V, E>>>,
    soft_freshness: Duration,
    generation: AtomicU64,
    fetches: AtomicU64,
}

pub type EvidenceCache = TtlCache<Vec<RawRecord>, CallFailure>;
pub type SynthesisCache = TtlCache<String, CallFailure>;

impl<V, E> TtlCache<V, E>
where
    V: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    pub fn new(soft_freshness: Duration) -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            soft_freshness,
            generation: AtomicU64::new(0),
            fetches: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Fingerprint, Slot<V, E>>> {
        // A panic while holding the lock cannot leave a slot half-written.
        self.slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Return the cached value for `fingerprint`, or run `producer` once for
    /// all concurrent callers and cache its success for `ttl`.
    pub async fn get_or_fetch<F, Fut>(
        &self,
        fingerprint: &Fingerprint,
        ttl: Duration,
        producer: F,
    ) -> Result<Cached<V>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
    {
        let (fetch, generation, waiters, leader) = {
            let mut slots = self.lock();
            match slots.get(fingerprint) {
                Some(Slot::Ready { value, stored_at, inserted, ttl: entry_ttl })
                    if inserted.elapsed() < *entry_ttl =>
                {
                    let stale = inserted.elapsed() >= self.soft_freshness;
                    debug!(fingerprint = %fingerprint, stale, "Cache hit");
                    return Ok(Cached { value: value.clone(), stored_at: *stored_at, stale, shared: true });
                }
                Some(Slot::Pending { generation, fetch, waiters }) => {
                    debug!(fingerprint = %fingerprint, "Joining in-flight fetch");
                    waiters.fetch_add(1, Ordering::SeqCst);
                    (fetch.clone(), *generation, waiters.clone(), false)
                }
                _ => {
                    let generation = self.generation.fetch_add(1, Ordering::SeqCst);
                    self.fetches.fetch_add(1, Ordering::SeqCst);
                    let fetch = producer()
                        .map(|result| result.map(|value| (value, Utc::now())))
                        .boxed()
                        .shared();
                    let waiters = Arc::new(AtomicUsize::new(1));
                    slots.insert(
                        fingerprint.clone(),
                        Slot::Pending { generation, fetch: fetch.clone(), waiters: waiters.clone() },
                    );
                    (fetch, generation, waiters, true)
                }
            }
        };

        let mut waiter = Waiter { cache: self, fingerprint, generation, waiters, settled: false };
        let result = fetch.await;
        self.settle(fingerprint, generation, &result, ttl);
        waiter.settled = true;
        drop(waiter);
        result.map(|(value, stored_at)| Cached { value, stored_at, stale: false, shared: !leader })
    }

    /// Replace the pending slot of `generation` with its outcome. Later
    /// callers of the same generation find the slot already settled.
    fn settle(
        &self,
        fingerprint: &Fingerprint,
        generation: u64,
        result: &Result<(V, DateTime<Utc>), E>,
        ttl: Duration,
    ) {
        let mut slots = self.lock();
        let is_current = matches!(
            slots.get(fingerprint),
            Some(Slot::Pending { generation: g, .. }) if *g == generation
        );
        if !is_current {
            return;
        }
        match result {
            Ok((value, stored_at)) => {
                slots.insert(
                    fingerprint.clone(),
                    Slot::Ready { value: value.clone(), stored_at: *stored_at, inserted: Instant::now(), ttl },
                );
            }
            Err(_) => {
                slots.remove(fingerprint);
            }
        }
    }

    /// Number of producer invocations since creation.
    pub fn fetch_count(&self) -> u64 {
        self.fetches.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop expired entries. Pending fetches are left alone; abandoned ones
    /// are already gone.
    pub fn purge_expired(&self) -> usize {
        let mut slots = self.lock();
        let before = slots.len();
        slots.retain(|_, slot| match slot {
            Slot::Ready { inserted, ttl, .. } => inserted.elapsed() < *ttl,
            Slot::Pending { .. } => true,
        });
        before - slots.len()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }
}
