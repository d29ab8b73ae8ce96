//! Entity store.
//!
//! One slot per `QueryKey`. A slot keeps the last value confirmed by the
//! remote store (`base`) and the optimistic layers of mutations that touch
//! the key, in dispatch order. Readers only ever see `fold(base, layers)`.

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use metrics::{counter, histogram};
use serde::Serialize;
use time::OffsetDateTime;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::application::gateway::RemoteError;

use super::config::CacheConfig;
use super::events::{Epoch, NotificationBus, Subscription};
use super::keys::{KeyPattern, QueryKey};
use super::lock::mutex_lock;
use super::value::{CacheValue, Patch};

const SOURCE: &str = "cache::store";

const METRIC_CACHE_HIT: &str = "daybook_cache_hit_total";
const METRIC_CACHE_MISS: &str = "daybook_cache_miss_total";
const METRIC_CACHE_FETCH_DEDUP: &str = "daybook_cache_fetch_dedup_total";
const METRIC_CACHE_EVICT: &str = "daybook_cache_evict_total";
const METRIC_CACHE_INVALIDATE: &str = "daybook_cache_invalidate_total";
const METRIC_CACHE_FETCH_MS: &str = "daybook_cache_fetch_ms";

/// Freshness of a cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchStatus {
    Fresh,
    Stale,
    Fetching,
    Error,
}

/// Point-in-time view of one key, as handed to readers and subscribers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheEntry {
    #[serde(serialize_with = "serialize_key")]
    pub key: QueryKey,
    pub data: Option<CacheValue>,
    pub status: FetchStatus,
    #[serde(with = "daybook_api_types::serde_time::rfc3339_option")]
    pub last_updated: Option<OffsetDateTime>,
    #[serde(serialize_with = "serialize_error")]
    pub error: Option<RemoteError>,
    pub subscribers: usize,
    /// Optimistic layers not yet settled.
    pub pending_mutations: usize,
    /// Publication counter of the key; strictly increases per key.
    pub epoch: Epoch,
}

fn serialize_key<S: serde::Serializer>(key: &QueryKey, serializer: S) -> Result<S::Ok, S::Error> {
    key.canonical_value().serialize(serializer)
}

fn serialize_error<S: serde::Serializer>(
    error: &Option<RemoteError>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    error.as_ref().map(ToString::to_string).serialize(serializer)
}

type FetchResult = Result<CacheValue, RemoteError>;
type SharedFetch = Shared<BoxFuture<'static, FetchResult>>;

struct InFlight {
    id: u64,
    future: SharedFetch,
}

struct Layer {
    mutation: Uuid,
    patch: Patch,
    committed: bool,
}

struct Slot {
    base: Option<CacheValue>,
    /// Bumped by writes and folds. A fetch started under an older epoch is
    /// superseded when it lands.
    base_epoch: u64,
    /// Committed layers stay in this list until a base is known and no fetch
    /// is running, so a fetch result gets them replayed on top.
    layers: Vec<Layer>,
    visible: Option<CacheValue>,
    status: FetchStatus,
    error: Option<RemoteError>,
    last_updated: Option<OffsetDateTime>,
    fetched_at: Option<Instant>,
    in_flight: Option<InFlight>,
    /// Last fetch cut loose by an invalidation.
    detached: Option<u64>,
    settled_during_fetch: bool,
    touched_at: Instant,
    epoch: Epoch,
}

impl Slot {
    fn new(now: Instant) -> Self {
        Self {
            base: None,
            base_epoch: 0,
            layers: Vec::new(),
            visible: None,
            status: FetchStatus::Stale,
            error: None,
            last_updated: None,
            fetched_at: None,
            in_flight: None,
            detached: None,
            settled_during_fetch: false,
            touched_at: now,
            epoch: 0,
        }
    }

    fn is_fresh(&self, now: Instant, config: &CacheConfig) -> bool {
        self.status == FetchStatus::Fresh
            && self
                .fetched_at
                .is_some_and(|at| now.saturating_duration_since(at) < config.stale_time)
    }

    fn refresh_visible(&mut self) {
        self.visible = self
            .layers
            .iter()
            .fold(self.base.clone(), |value, layer| layer.patch.apply(value.as_ref()));
    }

    /// `value` with every current layer on top.
    fn overlay(&self, value: &CacheValue) -> CacheValue {
        self.layers
            .iter()
            .fold(Some(value.clone()), |value, layer| layer.patch.apply(value.as_ref()))
            .unwrap_or_else(|| value.clone())
    }

    /// Move committed layers at the head of the list into `base`.
    fn fold_committed(&mut self) {
        if self.base.is_none() || self.in_flight.is_some() {
            return;
        }
        let settled = self.layers.iter().take_while(|layer| layer.committed).count();
        if settled == 0 {
            return;
        }
        let previous = self.base.clone();
        for layer in self.layers.drain(..settled) {
            self.base = layer.patch.apply(self.base.as_ref());
        }
        self.base_epoch += 1;
        if self.base != previous {
            self.last_updated = Some(OffsetDateTime::now_utc());
        }
    }

    fn pending(&self) -> usize {
        self.layers.iter().filter(|layer| !layer.committed).count()
    }

    fn is_collectable(&self) -> bool {
        self.pending() == 0 && self.in_flight.is_none()
    }

    fn snapshot(&self, key: &QueryKey, subscribers: usize, now: Instant, config: &CacheConfig) -> CacheEntry {
        let status = match self.status {
            FetchStatus::Fresh if !self.is_fresh(now, config) => FetchStatus::Stale,
            status => status,
        };
        CacheEntry {
            key: key.clone(),
            data: self.visible.clone(),
            status,
            last_updated: self.last_updated,
            error: self.error.clone(),
            subscribers,
            pending_mutations: self.pending(),
            epoch: self.epoch,
        }
    }
}

struct StoreInner {
    slots: Mutex<HashMap<QueryKey, Slot>>,
    bus: NotificationBus,
    config: CacheConfig,
    next_fetch: AtomicU64,
}

impl StoreInner {
    fn publish(&self, key: &QueryKey, slot: &mut Slot, now: Instant) {
        slot.epoch += 1;
        let subscribers = self.bus.subscriber_count(key);
        if subscribers == 0 {
            return;
        }
        self.bus
            .publish(&slot.snapshot(key, subscribers, now, &self.config));
    }

    fn complete_fetch(
        &self,
        key: &QueryKey,
        fetch_id: u64,
        started_epoch: u64,
        result: FetchResult,
    ) -> FetchResult {
        let now = Instant::now();
        let mut slots = mutex_lock(&self.slots, SOURCE, "complete_fetch");
        let Some(slot) = slots.get_mut(key) else {
            debug!(key = %key, "Fetch finished for evicted key");
            return result;
        };
        if slot.in_flight.as_ref().map(|fetch| fetch.id) != Some(fetch_id) {
            return self.complete_detached(key, slot, fetch_id, started_epoch, result, now);
        }
        slot.in_flight = None;
        slot.detached = None;
        let settled = std::mem::take(&mut slot.settled_during_fetch);

        match result {
            Ok(value) if slot.base_epoch != started_epoch => {
                info!(
                    key = %key,
                    started_epoch,
                    base_epoch = slot.base_epoch,
                    "Discarded superseded fetch result"
                );
                slot.status = FetchStatus::Stale;
                slot.fetched_at = None;
                self.publish(key, slot, now);
                Ok(slot.visible.clone().unwrap_or_else(|| slot.overlay(&value)))
            }
            Ok(value) => {
                slot.base = Some(value.clone());
                slot.fold_committed();
                slot.refresh_visible();
                slot.status = if settled {
                    FetchStatus::Stale
                } else {
                    FetchStatus::Fresh
                };
                slot.error = None;
                slot.fetched_at = Some(now);
                slot.last_updated = Some(OffsetDateTime::now_utc());
                debug!(key = %key, status = ?slot.status, "Fetch stored");
                self.publish(key, slot, now);
                Ok(slot.visible.clone().unwrap_or(value))
            }
            Err(err) => {
                warn!(key = %key, error = %err, "Fetch failed");
                slot.status = FetchStatus::Error;
                slot.error = Some(err.clone());
                self.publish(key, slot, now);
                Err(err)
            }
        }
    }

    /// Result of a fetch that no longer owns the slot. It becomes stale data
    /// only if it was the last one detached and nothing replaced the base
    /// since it started.
    fn complete_detached(
        &self,
        key: &QueryKey,
        slot: &mut Slot,
        fetch_id: u64,
        started_epoch: u64,
        result: FetchResult,
        now: Instant,
    ) -> FetchResult {
        let value = match result {
            Ok(value) => value,
            Err(err) => {
                debug!(key = %key, fetch_id, error = %err, "Detached fetch failed");
                return Err(err);
            }
        };
        let adoptable = slot.detached == Some(fetch_id)
            && slot.in_flight.is_none()
            && slot.base_epoch == started_epoch;
        if !adoptable {
            debug!(key = %key, fetch_id, "Dropped result of detached fetch");
            return Ok(slot.visible.clone().unwrap_or_else(|| slot.overlay(&value)));
        }

        slot.detached = None;
        slot.base = Some(value.clone());
        slot.fold_committed();
        slot.refresh_visible();
        slot.error = None;
        slot.last_updated = Some(OffsetDateTime::now_utc());
        debug!(key = %key, fetch_id, "Detached fetch stored as stale");
        self.publish(key, slot, now);
        Ok(slot.visible.clone().unwrap_or(value))
    }
}

/// In-memory cache of query results shared by queries and mutations.
///
/// Cloning yields another handle to the same store.
#[derive(Clone)]
pub struct EntityStore {
    inner: Arc<StoreInner>,
}

impl EntityStore {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                slots: Mutex::new(HashMap::new()),
                bus: NotificationBus::new(),
                config,
                next_fetch: AtomicU64::new(1),
            }),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    /// Current snapshot of `key`, if the store knows it. Never fetches.
    pub fn read(&self, key: &QueryKey) -> Option<CacheEntry> {
        let now = Instant::now();
        let slots = mutex_lock(&self.inner.slots, SOURCE, "read");
        slots.get(key).map(|slot| {
            slot.snapshot(key, self.inner.bus.subscriber_count(key), now, &self.inner.config)
        })
    }

    /// Visible value of `key`, optimistic layers included.
    pub fn data(&self, key: &QueryKey) -> Option<CacheValue> {
        let slots = mutex_lock(&self.inner.slots, SOURCE, "data");
        slots.get(key).and_then(|slot| slot.visible.clone())
    }

    /// Return the cached value when fresh; otherwise fetch it once.
    ///
    /// Concurrent calls for the same key share one fetch. The fetch runs on
    /// its own task and populates the store even if every caller goes away.
    pub async fn ensure<F, Fut>(&self, key: &QueryKey, fetcher: F) -> FetchResult
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = FetchResult> + Send + 'static,
    {
        let shared = {
            let now = Instant::now();
            let mut slots = mutex_lock(&self.inner.slots, SOURCE, "ensure");
            let slot = slots
                .entry(key.clone())
                .or_insert_with(|| Slot::new(now));
            slot.touched_at = now;

            if slot.is_fresh(now, &self.inner.config)
                && let Some(value) = slot.visible.clone()
            {
                counter!(METRIC_CACHE_HIT, "kind" => key.kind()).increment(1);
                return Ok(value);
            }

            if let Some(in_flight) = &slot.in_flight {
                counter!(METRIC_CACHE_FETCH_DEDUP, "kind" => key.kind()).increment(1);
                debug!(key = %key, fetch_id = in_flight.id, "Joined in-flight fetch");
                in_flight.future.clone()
            } else {
                counter!(METRIC_CACHE_MISS, "kind" => key.kind()).increment(1);
                let fetch_id = self.inner.next_fetch.fetch_add(1, Ordering::Relaxed);
                let started_epoch = slot.base_epoch;
                let future = self.spawn_fetch(key, fetch_id, started_epoch, fetcher());

                slot.in_flight = Some(InFlight {
                    id: fetch_id,
                    future: future.clone(),
                });
                slot.status = FetchStatus::Fetching;
                debug!(key = %key, fetch_id, "Fetch started");
                self.inner.publish(key, slot, now);
                future
            }
        };

        shared.await
    }

    fn spawn_fetch<Fut>(&self, key: &QueryKey, fetch_id: u64, started_epoch: u64, fetch: Fut) -> SharedFetch
    where
        Fut: Future<Output = FetchResult> + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        let task_key = key.clone();
        let handle = tokio::spawn(async move {
            let started_at = Instant::now();
            let result = AssertUnwindSafe(fetch)
                .catch_unwind()
                .await
                .unwrap_or_else(|_| Err(RemoteError::unavailable("fetch task panicked")));
            histogram!(METRIC_CACHE_FETCH_MS, "kind" => task_key.kind())
                .record(started_at.elapsed().as_secs_f64() * 1000.0);
            inner.complete_fetch(&task_key, fetch_id, started_epoch, result)
        });

        async move {
            match handle.await {
                Ok(result) => result,
                Err(err) => Err(RemoteError::unavailable(format!("fetch task aborted: {err}"))),
            }
        }
        .boxed()
        .shared()
    }

    /// Replace the confirmed value of `key` with `updater(confirmed)`.
    ///
    /// Pending optimistic layers stay on top of the new value. An in-flight
    /// fetch that started before this write is discarded when it lands.
    pub fn write(
        &self,
        key: &QueryKey,
        updater: impl FnOnce(Option<&CacheValue>) -> Option<CacheValue>,
    ) -> CacheEntry {
        let now = Instant::now();
        let mut slots = mutex_lock(&self.inner.slots, SOURCE, "write");
        let slot = slots
            .entry(key.clone())
            .or_insert_with(|| Slot::new(now));
        slot.touched_at = now;
        slot.base = updater(slot.base.as_ref());
        slot.base_epoch += 1;
        slot.fold_committed();
        slot.refresh_visible();
        slot.last_updated = Some(OffsetDateTime::now_utc());
        if slot.status != FetchStatus::Fetching {
            if slot.base.is_some() {
                slot.status = FetchStatus::Fresh;
                slot.fetched_at = Some(now);
                slot.error = None;
            } else {
                slot.status = FetchStatus::Stale;
                slot.fetched_at = None;
            }
        }
        debug!(key = %key, "Cache entry written");
        self.inner.publish(key, slot, now);
        slot.snapshot(key, self.inner.bus.subscriber_count(key), now, &self.inner.config)
    }

    /// Mark every key matched by `pattern` stale. Returns the matched keys.
    ///
    /// A fetch still running for a matched key is detached: the next
    /// `ensure` starts a new one instead of joining it.
    pub fn invalidate(&self, pattern: &KeyPattern) -> Vec<QueryKey> {
        self.invalidate_where(|key| pattern.matches(key))
    }

    pub fn invalidate_where(&self, predicate: impl Fn(&QueryKey) -> bool) -> Vec<QueryKey> {
        let now = Instant::now();
        let mut slots = mutex_lock(&self.inner.slots, SOURCE, "invalidate");
        let mut matched = Vec::new();

        for (key, slot) in slots.iter_mut().filter(|(key, _)| predicate(key)) {
            matched.push(key.clone());
            if let Some(fetch) = slot.in_flight.take() {
                debug!(key = %key, fetch_id = fetch.id, "In-flight fetch detached");
                slot.detached = Some(fetch.id);
                slot.settled_during_fetch = false;
            } else if slot.status == FetchStatus::Stale && slot.fetched_at.is_none() {
                continue;
            }
            slot.status = FetchStatus::Stale;
            slot.fetched_at = None;
            self.inner.publish(key, slot, now);
        }

        if !matched.is_empty() {
            counter!(METRIC_CACHE_INVALIDATE).increment(matched.len() as u64);
            debug!(count = matched.len(), "Cache entries invalidated");
        }
        matched
    }

    /// Drop `key`. Refused while it is observed or carries optimistic layers.
    pub fn evict(&self, key: &QueryKey) -> bool {
        let mut slots = mutex_lock(&self.inner.slots, SOURCE, "evict");
        let Some(slot) = slots.get(key) else {
            return false;
        };
        if self.inner.bus.subscriber_count(key) > 0 || slot.pending() > 0 {
            debug!(key = %key, "Eviction refused for observed key");
            return false;
        }
        slots.remove(key);
        self.inner.bus.forget_idle(key);
        counter!(METRIC_CACHE_EVICT, "reason" => "explicit").increment(1);
        debug!(key = %key, "Cache entry evicted");
        true
    }

    /// Observe `key`. The current snapshot is delivered immediately.
    pub fn subscribe(&self, key: &QueryKey) -> Subscription {
        let now = Instant::now();
        let mut slots = mutex_lock(&self.inner.slots, SOURCE, "subscribe");
        let slot = slots
            .entry(key.clone())
            .or_insert_with(|| Slot::new(now));
        slot.touched_at = now;
        let subscribers = self.inner.bus.subscriber_count(key) + 1;
        let initial = slot.snapshot(key, subscribers, now, &self.inner.config);
        self.inner.bus.register(initial)
    }

    pub fn subscriber_count(&self, key: &QueryKey) -> usize {
        self.inner.bus.subscriber_count(key)
    }

    pub fn keys(&self) -> Vec<QueryKey> {
        mutex_lock(&self.inner.slots, SOURCE, "keys")
            .keys()
            .cloned()
            .collect()
    }

    pub fn keys_matching(&self, pattern: &KeyPattern) -> Vec<QueryKey> {
        mutex_lock(&self.inner.slots, SOURCE, "keys_matching")
            .keys()
            .filter(|key| pattern.matches(key))
            .cloned()
            .collect()
    }

    /// Evict unobserved, settled entries idle for at least `gc_delay`.
    pub fn collect_garbage(&self, now: Instant) -> usize {
        let gc_delay = self.inner.config.gc_delay;
        let mut slots = mutex_lock(&self.inner.slots, SOURCE, "collect_garbage");
        let expired: Vec<QueryKey> = slots
            .iter()
            .filter(|(key, slot)| {
                if !slot.is_collectable() || self.inner.bus.subscriber_count(key) > 0 {
                    return false;
                }
                let idle_from = self
                    .inner
                    .bus
                    .idle_since(key)
                    .map_or(slot.touched_at, |since| since.max(slot.touched_at));
                now.saturating_duration_since(idle_from) >= gc_delay
            })
            .map(|(key, _)| key.clone())
            .collect();

        for key in &expired {
            slots.remove(key);
            self.inner.bus.forget_idle(key);
            debug!(key = %key, "Idle cache entry collected");
        }
        if !expired.is_empty() {
            counter!(METRIC_CACHE_EVICT, "reason" => "gc").increment(expired.len() as u64);
            info!(evicted = expired.len(), remaining = slots.len(), "Cache garbage collected");
        }
        expired.len()
    }

    /// Forget every cached value. Observed keys are reset to an empty stale
    /// entry and their subscribers are told.
    pub fn clear(&self) {
        let now = Instant::now();
        let mut slots = mutex_lock(&self.inner.slots, SOURCE, "clear");
        let before = slots.len();
        slots.retain(|key, _| self.inner.bus.subscriber_count(key) > 0);
        for (key, slot) in slots.iter_mut() {
            let epoch = slot.epoch;
            *slot = Slot::new(now);
            slot.epoch = epoch;
            self.inner.publish(key, slot, now);
        }
        info!(cleared = before, observed = slots.len(), "Cache cleared");
    }

    /// Push an optimistic layer for `mutation` onto `key`.
    pub(crate) fn apply_layer(&self, key: &QueryKey, mutation: Uuid, patch: Patch) {
        let now = Instant::now();
        let mut slots = mutex_lock(&self.inner.slots, SOURCE, "apply_layer");
        let slot = slots
            .entry(key.clone())
            .or_insert_with(|| Slot::new(now));
        slot.touched_at = now;
        slot.layers.push(Layer {
            mutation,
            patch,
            committed: false,
        });
        slot.refresh_visible();
        debug!(key = %key, mutation = %mutation, layers = slot.layers.len(), "Optimistic layer applied");
        self.inner.publish(key, slot, now);
    }

    /// Confirm the layer of `mutation`, optionally swapping its patch for one
    /// built from the authoritative response.
    pub(crate) fn commit_layer(&self, key: &QueryKey, mutation: Uuid, authoritative: Option<Patch>) {
        let now = Instant::now();
        let mut slots = mutex_lock(&self.inner.slots, SOURCE, "commit_layer");
        let Some(slot) = slots.get_mut(key) else {
            return;
        };
        let Some(layer) = slot.layers.iter_mut().find(|layer| layer.mutation == mutation) else {
            return;
        };
        layer.committed = true;
        if let Some(patch) = authoritative {
            layer.patch = patch;
        }
        if slot.in_flight.is_some() {
            slot.settled_during_fetch = true;
        }
        slot.fold_committed();
        slot.refresh_visible();
        slot.touched_at = now;
        self.inner.publish(key, slot, now);
    }

    /// Remove the layer of `mutation`, keeping every other layer in place.
    pub(crate) fn discard_layer(&self, key: &QueryKey, mutation: Uuid) {
        let now = Instant::now();
        let mut slots = mutex_lock(&self.inner.slots, SOURCE, "discard_layer");
        let Some(slot) = slots.get_mut(key) else {
            return;
        };
        let before = slot.layers.len();
        slot.layers.retain(|layer| layer.mutation != mutation);
        if slot.layers.len() == before {
            return;
        }
        if slot.in_flight.is_some() {
            slot.settled_during_fetch = true;
        }
        slot.fold_committed();
        slot.refresh_visible();
        slot.touched_at = now;
        debug!(key = %key, mutation = %mutation, "Optimistic layer discarded");
        self.inner.publish(key, slot, now);
    }
}
