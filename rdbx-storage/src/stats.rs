//! Query cache counters.

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters for the cache side of the query path.
#[derive(Debug, Default)]
pub struct CacheCounters {
    /// Reads that found a previous blob
    pub hits: AtomicU64,
    /// Reads that found nothing
    pub misses: AtomicU64,
    /// Reads that failed and were ignored
    pub read_errors: AtomicU64,
    /// Blobs written on cursor close
    pub writes: AtomicU64,
    /// Blob writes that failed
    pub write_errors: AtomicU64,
    /// Cursors closed before exhaustion, so nothing was written
    pub skipped_writes: AtomicU64,
}

impl CacheCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Get current snapshot of all counters.
    pub fn snapshot(&self) -> QueryCacheStats {
        QueryCacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            read_errors: self.read_errors.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            write_errors: self.write_errors.load(Ordering::Relaxed),
            skipped_writes: self.skipped_writes.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of [`CacheCounters`] at a point in time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryCacheStats {
    pub hits: u64,
    pub misses: u64,
    pub read_errors: u64,
    pub writes: u64,
    pub write_errors: u64,
    pub skipped_writes: u64,
}

impl QueryCacheStats {
    /// Calculate the hit rate (0.0 to 1.0). Failed reads count as misses.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses + self.read_errors;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}
