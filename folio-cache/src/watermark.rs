//! Watermarks for ordering cache writes.
//!
//! Every write into the read cache is stamped with a watermark taken from the
//! cache's [`WatermarkClock`]. A background refetch is stamped when it is
//! issued, so a fetch that started before a direct overwrite carries an older
//! watermark than the overwrite and is dropped when it resolves.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// A point in the cache's write history.
///
/// Ordering is by sequence number first; `observed_at` is informational.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Watermark {
    /// Monotonically increasing sequence number.
    pub sequence: u64,
    /// Wall-clock time the watermark was taken.
    pub observed_at: DateTime<Utc>,
}

impl Watermark {
    /// Create a watermark with an explicit timestamp.
    pub fn with_timestamp(sequence: u64, observed_at: DateTime<Utc>) -> Self {
        Self {
            sequence,
            observed_at,
        }
    }

    /// Create a zero watermark (beginning of time).
    pub fn zero() -> Self {
        Self {
            sequence: 0,
            observed_at: DateTime::UNIX_EPOCH,
        }
    }

    /// Check if this watermark is newer than another.
    pub fn is_newer_than(&self, other: &Watermark) -> bool {
        self.sequence > other.sequence
    }

    /// Check if this watermark is at least as fresh as another.
    pub fn is_at_least(&self, other: &Watermark) -> bool {
        self.sequence >= other.sequence
    }
}

impl Default for Watermark {
    fn default() -> Self {
        Self::zero()
    }
}

/// Issues strictly increasing watermarks.
#[derive(Debug, Default)]
pub struct WatermarkClock {
    last: AtomicU64,
}

impl WatermarkClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the next watermark.
    pub fn tick(&self) -> Watermark {
        let sequence = self.last.fetch_add(1, Ordering::SeqCst) + 1;
        Watermark::with_timestamp(sequence, Utc::now())
    }

    /// Sequence of the most recently issued watermark.
    pub fn last_sequence(&self) -> u64 {
        self.last.load(Ordering::SeqCst)
    }
}
