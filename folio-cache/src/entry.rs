//! Cache entries and read results.

use chrono::{DateTime, Utc};
use folio_core::Fingerprint;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use crate::watermark::Watermark;

/// One cached query result.
///
/// Entries are never edited in place: every write builds a new entry and
/// swaps it in, so readers always see a whole value.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    fingerprint: Fingerprint,
    value: Arc<Value>,
    stale: bool,
    fetched_at: Watermark,
    last_used: Instant,
}

impl CacheEntry {
    pub(crate) fn new(fingerprint: Fingerprint, value: Arc<Value>, fetched_at: Watermark) -> Self {
        Self {
            fingerprint,
            value,
            stale: false,
            fetched_at,
            last_used: Instant::now(),
        }
    }

    /// Copy of this entry with a new value and watermark.
    ///
    /// Keeps the current `Arc` when the new value is equal, so views built
    /// from the old value stay valid.
    pub(crate) fn replaced(&self, value: Value, fetched_at: Watermark, stale: bool) -> Self {
        let value = if *self.value == value {
            Arc::clone(&self.value)
        } else {
            Arc::new(value)
        };
        Self {
            fingerprint: self.fingerprint.clone(),
            value,
            stale,
            fetched_at,
            last_used: Instant::now(),
        }
    }

    pub(crate) fn marked_stale(&self) -> Self {
        Self {
            stale: true,
            ..self.clone()
        }
    }

    pub(crate) fn touch(&mut self) {
        self.last_used = Instant::now();
    }

    pub fn fingerprint(&self) -> &Fingerprint {
        &self.fingerprint
    }

    pub fn value(&self) -> &Arc<Value> {
        &self.value
    }

    pub fn is_stale(&self) -> bool {
        self.stale
    }

    /// Watermark of the write that produced this value.
    pub fn watermark(&self) -> Watermark {
        self.fetched_at
    }

    /// Wall-clock time the value was fetched or written.
    pub fn last_fetched_at(&self) -> DateTime<Utc> {
        self.fetched_at.observed_at
    }

    pub fn last_used(&self) -> Instant {
        self.last_used
    }

    /// True when the entry has been unused for at least `gc_time`.
    pub fn is_idle(&self, now: Instant, gc_time: Duration) -> bool {
        now.saturating_duration_since(self.last_used) >= gc_time
    }
}

/// Equality ignores the last-use instant.
impl PartialEq for CacheEntry {
    fn eq(&self, other: &Self) -> bool {
        self.fingerprint == other.fingerprint
            && self.value == other.value
            && self.stale == other.stale
            && self.fetched_at == other.fetched_at
    }
}

/// Where a read was served from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadSource {
    /// Cached and not stale.
    Fresh,
    /// Cached but stale; a background refetch is running.
    Stale,
    /// Not cached; the caller waited for the fetch.
    Fetched,
}

/// Result of a cache read, carrying freshness metadata.
#[derive(Debug, Clone)]
pub struct CacheRead<T> {
    value: T,
    fetched_at: Watermark,
    source: ReadSource,
}

impl<T> CacheRead<T> {
    pub fn new(value: T, fetched_at: Watermark, source: ReadSource) -> Self {
        Self {
            value,
            fetched_at,
            source,
        }
    }

    /// Consume the wrapper and return the underlying value.
    pub fn into_value(self) -> T {
        self.value
    }

    /// Get a reference to the underlying value.
    pub fn value(&self) -> &T {
        &self.value
    }

    pub fn source(&self) -> ReadSource {
        self.source
    }

    /// Check if this was served from the cache without waiting.
    pub fn was_cache_hit(&self) -> bool {
        !matches!(self.source, ReadSource::Fetched)
    }

    /// Check if the served value is known to be out of date.
    pub fn is_stale(&self) -> bool {
        matches!(self.source, ReadSource::Stale)
    }

    pub fn watermark(&self) -> Watermark {
        self.fetched_at
    }

    /// Calculate how long ago the value was fetched.
    pub fn staleness(&self) -> Duration {
        let now = Utc::now();
        if now > self.fetched_at.observed_at {
            (now - self.fetched_at.observed_at)
                .to_std()
                .unwrap_or(Duration::ZERO)
        } else {
            Duration::ZERO
        }
    }

    /// Map the inner value to a new type.
    pub fn map<U, F>(self, f: F) -> CacheRead<U>
    where
        F: FnOnce(T) -> U,
    {
        CacheRead {
            value: f(self.value),
            fetched_at: self.fetched_at,
            source: self.source,
        }
    }
}

impl<T> AsRef<T> for CacheRead<T> {
    fn as_ref(&self) -> &T {
        &self.value
    }
}
