//! Read cache with stale-while-revalidate reads.
//!
//! The cache is an explicit object: it is created at application start,
//! handed by reference (it is cheap to clone) to every reader and writer, and
//! cleared or disposed on sign-out. Entries are indexed by their leading tag
//! so that prefix invalidation touches only the matching fingerprints.
//!
//! Reads never wait on a value that is present. A stale entry is served as
//! is while one background refetch runs; readers of a missing entry wait for
//! that same fetch. Fetches are stamped with a watermark when issued and
//! their results are discarded if a newer write landed in the meantime.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use folio_core::{CacheConfig, DataService, EntityTag, Fingerprint, FolioError, FolioResult};
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use crate::entry::{CacheEntry, CacheRead, ReadSource};
use crate::stats::{CacheCounters, CacheStats};
use crate::watermark::{Watermark, WatermarkClock};

/// What a settled fetch hands to waiting readers.
type FetchResult = Result<(Arc<Value>, Watermark), FolioError>;

struct InFlight {
    id: u64,
    issued: Watermark,
    result: watch::Receiver<Option<FetchResult>>,
}

impl InFlight {
    /// A fetch can still deliver something worth joining: its task is alive
    /// and no write landed after it was issued.
    fn joinable(&self, current: Option<&CacheEntry>) -> bool {
        let superseded =
            current.is_some_and(|entry| entry.watermark().is_newer_than(&self.issued));
        !superseded && self.result.has_changed().is_ok()
    }
}

/// Drops the fetch registration if the fetch task ends without settling.
struct FetchGuard {
    cache: ReadCache,
    fingerprint: Fingerprint,
    id: u64,
}

impl Drop for FetchGuard {
    fn drop(&mut self) {
        let mut state = self.cache.lock();
        if matches!(state.in_flight.get(&self.fingerprint), Some(f) if f.id == self.id) {
            state.in_flight.remove(&self.fingerprint);
            warn!(fingerprint = %self.fingerprint, "Fetch abandoned before settling");
        }
    }
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<Fingerprint, CacheEntry>,
    by_tag: HashMap<EntityTag, HashSet<Fingerprint>>,
    in_flight: HashMap<Fingerprint, InFlight>,
    next_fetch_id: u64,
}

impl CacheState {
    fn insert(&mut self, entry: CacheEntry) {
        let fingerprint = entry.fingerprint().clone();
        self.by_tag
            .entry(fingerprint.tag())
            .or_default()
            .insert(fingerprint.clone());
        self.entries.insert(fingerprint, entry);
    }

    fn remove(&mut self, fingerprint: &Fingerprint) -> Option<CacheEntry> {
        let removed = self.entries.remove(fingerprint)?;
        if let Some(tagged) = self.by_tag.get_mut(&fingerprint.tag()) {
            tagged.remove(fingerprint);
            if tagged.is_empty() {
                self.by_tag.remove(&fingerprint.tag());
            }
        }
        Some(removed)
    }

    fn clear(&mut self) {
        self.entries.clear();
        self.by_tag.clear();
        self.in_flight.clear();
    }
}

struct Inner {
    config: CacheConfig,
    clock: WatermarkClock,
    state: Mutex<CacheState>,
    counters: CacheCounters,
    shutdown: watch::Sender<bool>,
}

enum ReadPlan {
    Ready(CacheRead<Arc<Value>>),
    Wait(watch::Receiver<Option<FetchResult>>),
}

/// In-memory query cache keyed by [`Fingerprint`].
#[derive(Clone)]
pub struct ReadCache {
    inner: Arc<Inner>,
}

impl ReadCache {
    /// Create an empty cache.
    pub fn create(config: CacheConfig) -> Self {
        let (shutdown, _) = watch::channel(false);
        info!(
            gc_time_secs = config.gc_time.as_secs(),
            sweep_interval_secs = config.sweep_interval.as_secs(),
            "Read cache created"
        );
        Self {
            inner: Arc::new(Inner {
                config,
                clock: WatermarkClock::new(),
                state: Mutex::new(CacheState::default()),
                counters: CacheCounters::default(),
                shutdown,
            }),
        }
    }

    /// Create an empty cache after validating `config`.
    pub fn try_create(config: CacheConfig) -> FolioResult<Self> {
        config.validate()?;
        Ok(Self::create(config))
    }

    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    fn lock(&self) -> MutexGuard<'_, CacheState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    // ========================================================================
    // DIRECT ACCESS
    // ========================================================================

    /// Current entry for a fingerprint. Counts as a use for idle eviction.
    pub fn get(&self, fingerprint: &Fingerprint) -> Option<CacheEntry> {
        let mut state = self.lock();
        let entry = state.entries.get_mut(fingerprint)?;
        entry.touch();
        Some(entry.clone())
    }

    pub fn contains(&self, fingerprint: &Fingerprint) -> bool {
        self.lock().entries.contains_key(fingerprint)
    }

    /// Overwrite an entry with known-fresh data.
    ///
    /// Clears staleness and stamps a new watermark, so any refetch already in
    /// flight for this fingerprint is discarded when it resolves.
    pub fn set(&self, fingerprint: Fingerprint, value: Value) -> Watermark {
        let mut state = self.lock();
        let watermark = self.inner.clock.tick();
        let entry = match state.entries.get(&fingerprint) {
            Some(current) => current.replaced(value, watermark, false),
            None => CacheEntry::new(fingerprint.clone(), Arc::new(value), watermark),
        };
        state.insert(entry);
        debug!(
            fingerprint = %fingerprint,
            sequence = watermark.sequence,
            "Cache entry overwritten"
        );
        watermark
    }

    /// Replace an existing entry with a value derived from the current one.
    ///
    /// `patch` returns `None` to leave the entry alone. Staleness is kept as
    /// it was. Returns true if the entry was replaced.
    pub fn patch<F>(&self, fingerprint: &Fingerprint, patch: F) -> bool
    where
        F: FnOnce(&Value) -> Option<Value>,
    {
        let mut state = self.lock();
        let next = {
            let Some(current) = state.entries.get(fingerprint) else {
                return false;
            };
            let Some(value) = patch(current.value()) else {
                return false;
            };
            let watermark = self.inner.clock.tick();
            current.replaced(value, watermark, current.is_stale())
        };
        trace!(fingerprint = %fingerprint, "Cache entry patched");
        state.insert(next);
        true
    }

    /// Mark every entry under `tag` stale, whatever its parameters.
    pub fn mark_stale(&self, tag: EntityTag) -> Vec<Fingerprint> {
        self.mark_stale_except(tag, &HashSet::new())
    }

    /// Mark every entry under `tag` stale except the fingerprints in `keep`.
    ///
    /// Returns the fingerprints that were marked, sorted.
    pub fn mark_stale_except(
        &self,
        tag: EntityTag,
        keep: &HashSet<Fingerprint>,
    ) -> Vec<Fingerprint> {
        let mut state = self.lock();
        let mut targets: Vec<Fingerprint> = state
            .by_tag
            .get(&tag)
            .map(|tagged| {
                tagged
                    .iter()
                    .filter(|fp| !keep.contains(*fp))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        targets.sort();
        for fingerprint in &targets {
            if let Some(entry) = state.entries.get_mut(fingerprint) {
                *entry = entry.marked_stale();
            }
        }
        debug!(tag = %tag, count = targets.len(), "Marked entries stale");
        targets
    }

    /// Mark a single entry stale. Returns false if it is not cached.
    pub fn mark_stale_exact(&self, fingerprint: &Fingerprint) -> bool {
        let mut state = self.lock();
        match state.entries.get_mut(fingerprint) {
            Some(entry) => {
                *entry = entry.marked_stale();
                true
            }
            None => false,
        }
    }

    /// Drop an entry and forget any fetch in flight for it.
    pub fn remove(&self, fingerprint: &Fingerprint) -> Option<CacheEntry> {
        let mut state = self.lock();
        state.in_flight.remove(fingerprint);
        let removed = state.remove(fingerprint);
        if removed.is_some() {
            debug!(fingerprint = %fingerprint, "Cache entry removed");
        }
        removed
    }

    /// Fingerprints currently cached under `tag`, sorted.
    pub fn fingerprints(&self, tag: EntityTag) -> Vec<Fingerprint> {
        let state = self.lock();
        let mut fingerprints: Vec<Fingerprint> = state
            .by_tag
            .get(&tag)
            .map(|tagged| tagged.iter().cloned().collect())
            .unwrap_or_default();
        fingerprints.sort();
        fingerprints
    }

    /// Every entry, sorted by fingerprint.
    pub fn entries(&self) -> Vec<CacheEntry> {
        let state = self.lock();
        let mut entries: Vec<CacheEntry> = state.entries.values().cloned().collect();
        entries.sort_by(|a, b| a.fingerprint().cmp(b.fingerprint()));
        entries
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of fetches issued and not yet settled.
    pub fn in_flight_count(&self) -> usize {
        self.lock().in_flight.len()
    }

    pub fn stats(&self) -> CacheStats {
        let entry_count = self.len();
        self.inner.counters.snapshot(entry_count)
    }

    // ========================================================================
    // READS
    // ========================================================================

    /// Read through the cache.
    ///
    /// - fresh entry: returned immediately, `fetcher` is not called;
    /// - stale entry: returned immediately, one background refetch starts;
    /// - no entry: waits for the fetch.
    ///
    /// Concurrent readers share the fetch already in flight for the
    /// fingerprint; their `fetcher` is dropped unused. A fetch issued before
    /// the entry's last write is not shared, since its result will be
    /// discarded.
    pub async fn read<F, Fut>(
        &self,
        fingerprint: &Fingerprint,
        fetcher: F,
    ) -> FolioResult<CacheRead<Arc<Value>>>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = FolioResult<Value>> + Send + 'static,
    {
        let plan = {
            let mut state = self.lock();
            let cached = state.entries.get_mut(fingerprint).map(|entry| {
                entry.touch();
                (Arc::clone(entry.value()), entry.watermark(), entry.is_stale())
            });
            match cached {
                Some((value, watermark, false)) => {
                    CacheCounters::bump(&self.inner.counters.hits);
                    trace!(fingerprint = %fingerprint, "Cache hit");
                    ReadPlan::Ready(CacheRead::new(value, watermark, ReadSource::Fresh))
                }
                Some((value, watermark, true)) => {
                    CacheCounters::bump(&self.inner.counters.stale_hits);
                    trace!(fingerprint = %fingerprint, "Stale hit, revalidating");
                    self.start_fetch(&mut state, fingerprint, fetcher);
                    ReadPlan::Ready(CacheRead::new(value, watermark, ReadSource::Stale))
                }
                None => {
                    CacheCounters::bump(&self.inner.counters.misses);
                    trace!(fingerprint = %fingerprint, "Cache miss");
                    ReadPlan::Wait(self.start_fetch(&mut state, fingerprint, fetcher))
                }
            }
        };

        match plan {
            ReadPlan::Ready(read) => Ok(read),
            ReadPlan::Wait(mut result) => {
                let settled = result.wait_for(Option::is_some).await.map_err(|_| {
                    FolioError::network(format!("fetch for {} was abandoned", fingerprint))
                })?;
                match &*settled {
                    Some(Ok((value, watermark))) => Ok(CacheRead::new(
                        Arc::clone(value),
                        *watermark,
                        ReadSource::Fetched,
                    )),
                    Some(Err(err)) => Err(err.clone()),
                    None => Err(FolioError::network(format!(
                        "fetch for {} settled without a result",
                        fingerprint
                    ))),
                }
            }
        }
    }

    /// [`read`](Self::read) with the data service as the fetcher.
    pub async fn read_through<S>(
        &self,
        service: &Arc<S>,
        fingerprint: &Fingerprint,
    ) -> FolioResult<CacheRead<Arc<Value>>>
    where
        S: DataService + ?Sized + 'static,
    {
        let service = Arc::clone(service);
        let key = fingerprint.clone();
        self.read(fingerprint, move || async move { service.fetch(&key).await })
            .await
    }

    /// Register a fetch for `fingerprint`, or join the one in flight.
    fn start_fetch<F, Fut>(
        &self,
        state: &mut CacheState,
        fingerprint: &Fingerprint,
        fetcher: F,
    ) -> watch::Receiver<Option<FetchResult>>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = FolioResult<Value>> + Send + 'static,
    {
        if let Some(in_flight) = state.in_flight.get(fingerprint) {
            if in_flight.joinable(state.entries.get(fingerprint)) {
                CacheCounters::bump(&self.inner.counters.deduplicated);
                trace!(fingerprint = %fingerprint, "Joining fetch in flight");
                return in_flight.result.clone();
            }
            debug!(
                fingerprint = %fingerprint,
                fetch_sequence = in_flight.issued.sequence,
                "Fetch in flight is superseded, issuing a new one"
            );
        }

        state.next_fetch_id += 1;
        let id = state.next_fetch_id;
        let issued = self.inner.clock.tick();
        let (tx, rx) = watch::channel(None);
        state.in_flight.insert(
            fingerprint.clone(),
            InFlight {
                id,
                issued,
                result: rx.clone(),
            },
        );
        CacheCounters::bump(&self.inner.counters.fetches);
        debug!(
            fingerprint = %fingerprint,
            sequence = issued.sequence,
            "Fetch started"
        );

        let guard = FetchGuard {
            cache: self.clone(),
            fingerprint: fingerprint.clone(),
            id,
        };
        tokio::spawn(async move {
            let guard = guard;
            let result = fetcher().await;
            let settled = guard
                .cache
                .complete_fetch(&guard.fingerprint, id, issued, result);
            tx.send_replace(Some(settled));
        });
        rx
    }

    /// Apply a settled fetch unless a newer write or a removal superseded it.
    fn complete_fetch(
        &self,
        fingerprint: &Fingerprint,
        id: u64,
        issued: Watermark,
        result: FolioResult<Value>,
    ) -> FetchResult {
        let mut state = self.lock();
        let registered = matches!(state.in_flight.get(fingerprint), Some(f) if f.id == id);
        if registered {
            state.in_flight.remove(fingerprint);
        }

        let value = match result {
            Ok(value) => value,
            Err(err) => {
                warn!(
                    fingerprint = %fingerprint,
                    error = %err,
                    "Fetch failed, keeping last known value"
                );
                return Err(err);
            }
        };

        if !registered {
            CacheCounters::bump(&self.inner.counters.dropped_writes);
            debug!(fingerprint = %fingerprint, "Fetch result for a removed entry discarded");
            return Ok((Arc::new(value), issued));
        }

        let next = match state.entries.get(fingerprint) {
            Some(current) if current.watermark().is_newer_than(&issued) => {
                CacheCounters::bump(&self.inner.counters.dropped_writes);
                debug!(
                    fingerprint = %fingerprint,
                    fetch_sequence = issued.sequence,
                    entry_sequence = current.watermark().sequence,
                    "Out-of-order fetch result discarded"
                );
                return Ok((Arc::clone(current.value()), current.watermark()));
            }
            Some(current) => current.replaced(value, issued, false),
            None => CacheEntry::new(fingerprint.clone(), Arc::new(value), issued),
        };
        let delivered = (Arc::clone(next.value()), issued);
        state.insert(next);
        debug!(fingerprint = %fingerprint, sequence = issued.sequence, "Fetch applied");
        Ok(delivered)
    }

    // ========================================================================
    // LIFECYCLE
    // ========================================================================

    /// Evict entries unused for `gc_time`. Entries with a fetch in flight stay.
    pub fn evict_idle(&self) -> usize {
        let now = Instant::now();
        let gc_time = self.inner.config.gc_time;
        let mut state = self.lock();
        let idle: Vec<Fingerprint> = state
            .entries
            .values()
            .filter(|entry| {
                entry.is_idle(now, gc_time) && !state.in_flight.contains_key(entry.fingerprint())
            })
            .map(|entry| entry.fingerprint().clone())
            .collect();
        for fingerprint in &idle {
            state.remove(fingerprint);
        }
        CacheCounters::add(&self.inner.counters.evictions, idle.len() as u64);
        idle.len()
    }

    /// Spawn the idle-eviction task. It stops when the cache is disposed or
    /// dropped.
    pub fn spawn_janitor(&self) -> JoinHandle<()> {
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let mut shutdown = self.inner.shutdown.subscribe();
        let period = self.inner.config.sweep_interval.max(Duration::from_millis(1));

        tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            info!(period_ms = period.as_millis() as u64, "Cache janitor started");

            loop {
                if *shutdown.borrow() {
                    break;
                }
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        let Some(inner) = weak.upgrade() else {
                            break;
                        };
                        let evicted = ReadCache { inner }.evict_idle();
                        if evicted > 0 {
                            debug!(evicted, "Evicted idle cache entries");
                        }
                    }
                }
            }

            info!("Cache janitor stopped");
        })
    }

    /// Drop every entry and every fetch registration.
    ///
    /// Fetches still running deliver to their waiting readers but no longer
    /// write into the cache.
    pub fn clear(&self) {
        let mut state = self.lock();
        let dropped = state.entries.len();
        state.clear();
        info!(dropped, "Read cache cleared");
    }

    /// Clear the cache and stop the janitor.
    pub fn dispose(&self) {
        self.clear();
        self.inner.shutdown.send_replace(true);
    }

    pub fn is_disposed(&self) -> bool {
        *self.inner.shutdown.borrow()
    }
}

impl Default for ReadCache {
    fn default() -> Self {
        Self::create(CacheConfig::default())
    }
}

impl fmt::Debug for ReadCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadCache")
            .field("entries", &self.len())
            .field("in_flight", &self.in_flight_count())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Notify;

    fn books(term: &str) -> Fingerprint {
        Fingerprint::new(EntityTag::Books, [term])
    }

    async fn settle(cache: &ReadCache) {
        while cache.in_flight_count() > 0 {
            tokio::task::yield_now().await;
        }
        // let the fetch task deliver to its receivers
        tokio::task::yield_now().await;
    }

    #[test]
    fn test_set_get_and_equal_value_keeps_arc() {
        let cache = ReadCache::default();
        let fp = Fingerprint::detail(EntityTag::Book, "b1");
        let first = cache.set(fp.clone(), json!({"id": "b1", "title": "Dune"}));
        let before = cache.get(&fp).unwrap();

        let second = cache.set(fp.clone(), json!({"id": "b1", "title": "Dune"}));
        let after = cache.get(&fp).unwrap();

        assert!(second.is_newer_than(&first));
        assert!(!after.is_stale());
        assert!(Arc::ptr_eq(before.value(), after.value()));
    }

    #[test]
    fn test_mark_stale_is_prefix_scoped() {
        let cache = ReadCache::default();
        cache.set(books("dune"), json!([]));
        cache.set(books("emma"), json!([]));
        cache.set(Fingerprint::detail(EntityTag::Book, "b1"), json!({"id": "b1"}));

        let marked = cache.mark_stale(EntityTag::Books);
        assert_eq!(marked, vec![books("dune"), books("emma")]);
        assert!(cache.get(&books("dune")).unwrap().is_stale());
        assert!(!cache
            .get(&Fingerprint::detail(EntityTag::Book, "b1"))
            .unwrap()
            .is_stale());
    }

    #[test]
    fn test_mark_stale_except_skips_kept() {
        let cache = ReadCache::default();
        cache.set(books("dune"), json!([]));
        cache.set(books("emma"), json!([]));
        let keep: HashSet<Fingerprint> = [books("dune")].into_iter().collect();

        let marked = cache.mark_stale_except(EntityTag::Books, &keep);
        assert_eq!(marked, vec![books("emma")]);
        assert!(!cache.get(&books("dune")).unwrap().is_stale());
    }

    #[test]
    fn test_mark_stale_does_not_move_watermark() {
        let cache = ReadCache::default();
        let w = cache.set(books("dune"), json!([]));
        assert!(cache.mark_stale_exact(&books("dune")));
        assert_eq!(cache.get(&books("dune")).unwrap().watermark(), w);
        assert!(!cache.mark_stale_exact(&books("missing")));
    }

    #[test]
    fn test_remove_updates_index() {
        let cache = ReadCache::default();
        cache.set(books("dune"), json!([]));
        assert!(cache.remove(&books("dune")).is_some());
        assert!(cache.fingerprints(EntityTag::Books).is_empty());
        assert!(cache.mark_stale(EntityTag::Books).is_empty());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_patch_preserves_staleness() {
        let cache = ReadCache::default();
        cache.set(books("dune"), json!([1]));
        cache.mark_stale(EntityTag::Books);

        assert!(cache.patch(&books("dune"), |_| Some(json!([2]))));
        let entry = cache.get(&books("dune")).unwrap();
        assert!(entry.is_stale());
        assert_eq!(**entry.value(), json!([2]));

        assert!(!cache.patch(&books("dune"), |_| None));
        assert!(!cache.patch(&books("missing"), |_| Some(json!([]))));
    }

    #[tokio::test]
    async fn test_fresh_hit_does_not_fetch() {
        let cache = ReadCache::default();
        cache.set(books("dune"), json!(["cached"]));
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);

        let read = cache
            .read(&books("dune"), move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(json!(["fetched"]))
            })
            .await
            .unwrap();

        assert_eq!(read.source(), ReadSource::Fresh);
        assert_eq!(**read.value(), json!(["cached"]));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(cache.stats().hits, 1);
    }

    #[tokio::test]
    async fn test_miss_waits_for_fetch() {
        let cache = ReadCache::default();
        let read = cache
            .read(&books("dune"), || async { Ok(json!(["fetched"])) })
            .await
            .unwrap();

        assert_eq!(read.source(), ReadSource::Fetched);
        assert_eq!(**read.value(), json!(["fetched"]));
        let entry = cache.get(&books("dune")).unwrap();
        assert!(!entry.is_stale());
        assert_eq!(entry.watermark(), read.watermark());
    }

    #[tokio::test]
    async fn test_stale_read_returns_last_value_then_refreshes() {
        let cache = ReadCache::default();
        cache.set(books("dune"), json!(["old"]));
        cache.mark_stale(EntityTag::Books);
        let gate = Arc::new(Notify::new());
        let release = Arc::clone(&gate);

        let read = cache
            .read(&books("dune"), move || async move {
                release.notified().await;
                Ok(json!(["new"]))
            })
            .await
            .unwrap();

        assert_eq!(read.source(), ReadSource::Stale);
        assert_eq!(**read.value(), json!(["old"]));
        assert_eq!(cache.in_flight_count(), 1);

        gate.notify_one();
        settle(&cache).await;

        let entry = cache.get(&books("dune")).unwrap();
        assert!(!entry.is_stale());
        assert_eq!(**entry.value(), json!(["new"]));
    }

    #[tokio::test]
    async fn test_concurrent_stale_reads_share_one_fetch() {
        let cache = ReadCache::default();
        cache.set(books("dune"), json!(["old"]));
        cache.mark_stale(EntityTag::Books);
        let calls = Arc::new(AtomicUsize::new(0));
        let gate = Arc::new(Notify::new());

        for _ in 0..5 {
            let counter = Arc::clone(&calls);
            let release = Arc::clone(&gate);
            let read = cache
                .read(&books("dune"), move || async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    release.notified().await;
                    Ok(json!(["new"]))
                })
                .await
                .unwrap();
            assert!(read.is_stale());
        }

        gate.notify_one();
        settle(&cache).await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let stats = cache.stats();
        assert_eq!(stats.fetches, 1);
        assert_eq!(stats.deduplicated, 4);
        assert_eq!(stats.stale_hits, 5);
    }

    #[tokio::test]
    async fn test_out_of_order_fetch_is_dropped() {
        let cache = ReadCache::default();
        cache.set(books("dune"), json!(["v1"]));
        cache.mark_stale(EntityTag::Books);
        let gate = Arc::new(Notify::new());
        let release = Arc::clone(&gate);

        cache
            .read(&books("dune"), move || async move {
                release.notified().await;
                Ok(json!(["refetched-before-write"]))
            })
            .await
            .unwrap();

        let written = cache.set(books("dune"), json!(["v2"]));
        gate.notify_one();
        settle(&cache).await;

        let entry = cache.get(&books("dune")).unwrap();
        assert_eq!(**entry.value(), json!(["v2"]));
        assert_eq!(entry.watermark(), written);
        assert_eq!(cache.stats().dropped_writes, 1);
    }

    #[tokio::test]
    async fn test_failed_refetch_keeps_stale_value() {
        let cache = ReadCache::default();
        cache.set(books("dune"), json!(["old"]));
        cache.mark_stale(EntityTag::Books);

        cache
            .read(&books("dune"), || async { Err(FolioError::network("offline")) })
            .await
            .unwrap();
        settle(&cache).await;

        let entry = cache.get(&books("dune")).unwrap();
        assert!(entry.is_stale());
        assert_eq!(**entry.value(), json!(["old"]));
    }

    #[tokio::test]
    async fn test_failed_fetch_on_miss_is_returned() {
        let cache = ReadCache::default();
        let err = cache
            .read(&books("dune"), || async { Err(FolioError::service("not found")) })
            .await
            .unwrap_err();
        assert_eq!(err, FolioError::service("not found"));
        assert!(!cache.contains(&books("dune")));
        assert_eq!(cache.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn test_removed_entry_is_not_resurrected() {
        let cache = ReadCache::default();
        let fp = Fingerprint::detail(EntityTag::Book, "b1");
        cache.set(fp.clone(), json!({"id": "b1"}));
        cache.mark_stale_exact(&fp);
        let gate = Arc::new(Notify::new());
        let release = Arc::clone(&gate);

        cache
            .read(&fp, move || async move {
                release.notified().await;
                Ok(json!({"id": "b1"}))
            })
            .await
            .unwrap();
        cache.remove(&fp);
        gate.notify_one();
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }

        assert!(!cache.contains(&fp));
        assert_eq!(cache.stats().dropped_writes, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_evict_idle_respects_last_use() {
        let cache = ReadCache::create(CacheConfig::new().with_gc_time(Duration::from_secs(10)));
        cache.set(books("dune"), json!([]));

        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(cache.get(&books("dune")).is_some());
        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(cache.evict_idle(), 0);

        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(cache.evict_idle(), 1);
        assert!(cache.is_empty());
        assert_eq!(cache.stats().evictions, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_janitor_evicts_and_stops_on_dispose() {
        let cache = ReadCache::create(
            CacheConfig::new()
                .with_gc_time(Duration::from_secs(2))
                .with_sweep_interval(Duration::from_secs(1)),
        );
        let janitor = cache.spawn_janitor();
        cache.set(books("dune"), json!([]));

        tokio::time::sleep(Duration::from_secs(4)).await;
        assert!(cache.is_empty());

        cache.dispose();
        assert!(cache.is_disposed());
        janitor.await.unwrap();
    }

    #[tokio::test]
    async fn test_stale_read_after_write_does_not_join_old_fetch() {
        let cache = ReadCache::default();
        let fp = Fingerprint::detail(EntityTag::BorrowRecord, "r1");
        cache.set(fp.clone(), json!({"n": 1}));
        cache.mark_stale_exact(&fp);
        let gate = Arc::new(Notify::new());
        let release = Arc::clone(&gate);
        cache
            .read(&fp, move || async move {
                release.notified().await;
                Ok(json!({"n": 2}))
            })
            .await
            .unwrap();

        cache.set(fp.clone(), json!({"n": 3}));
        cache.mark_stale_exact(&fp);
        let read = cache
            .read(&fp, || async { Ok(json!({"n": 4})) })
            .await
            .unwrap();
        assert!(read.is_stale());
        assert_eq!(**read.value(), json!({"n": 3}));

        settle(&cache).await;
        let entry = cache.get(&fp).unwrap();
        assert!(!entry.is_stale());
        assert_eq!(**entry.value(), json!({"n": 4}));

        // the first fetch resolves last and is discarded
        gate.notify_one();
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(**cache.get(&fp).unwrap().value(), json!({"n": 4}));
        let stats = cache.stats();
        assert_eq!(stats.fetches, 2);
        assert_eq!(stats.deduplicated, 0);
        assert_eq!(stats.dropped_writes, 1);
    }

    async fn exploding_fetch() -> FolioResult<Value> {
        panic!("fetcher blew up")
    }

    #[tokio::test]
    async fn test_panicking_fetch_releases_fingerprint() {
        let cache = ReadCache::default();
        let err = cache
            .read(&books("dune"), exploding_fetch)
            .await
            .unwrap_err();
        assert!(matches!(err, FolioError::Network { .. }));
        assert_eq!(cache.in_flight_count(), 0);

        let read = cache
            .read(&books("dune"), || async { Ok(json!(["fetched"])) })
            .await
            .unwrap();
        assert_eq!(read.source(), ReadSource::Fetched);
        assert_eq!(**read.value(), json!(["fetched"]));
    }

    #[tokio::test]
    async fn test_panicking_refetch_lets_next_stale_read_retry() {
        let cache = ReadCache::default();
        cache.set(books("dune"), json!(["old"]));
        cache.mark_stale(EntityTag::Books);

        let read = cache.read(&books("dune"), exploding_fetch).await.unwrap();
        assert!(read.is_stale());
        settle(&cache).await;

        cache
            .read(&books("dune"), || async { Ok(json!(["new"])) })
            .await
            .unwrap();
        settle(&cache).await;

        let entry = cache.get(&books("dune")).unwrap();
        assert!(!entry.is_stale());
        assert_eq!(**entry.value(), json!(["new"]));
        assert_eq!(cache.stats().fetches, 2);
    }

    #[test]
    fn test_try_create_rejects_zero_sweep_interval() {
        let config = CacheConfig::default().with_sweep_interval(Duration::ZERO);
        assert!(matches!(
            ReadCache::try_create(config),
            Err(FolioError::Config(_))
        ));
        assert!(ReadCache::try_create(CacheConfig::default()).is_ok());
    }
}
