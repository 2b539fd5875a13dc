//! Lock manager counters.

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters for one lock namespace (server side) or lock table (client side).
///
/// Thread-safe counters using atomic operations for lock-free updates.
#[derive(Debug, Default)]
pub struct LockMetrics {
    /// Requests granted without waiting
    pub immediate_grants: AtomicU64,

    /// Requests granted after waiting in the queue
    pub queued_grants: AtomicU64,

    /// Non-blocking requests refused
    pub would_block: AtomicU64,

    /// Blocking callbacks sent (server) or received (client)
    pub blocking_asts: AtomicU64,

    /// Locks served from the local table without an enqueue
    pub matches: AtomicU64,

    /// Local lookups that found nothing usable
    pub match_misses: AtomicU64,

    /// Locks cancelled
    pub cancels: AtomicU64,

    /// Unused locks cancelled because the LRU overflowed
    pub lru_cancels: AtomicU64,

    /// Clients evicted for not answering a blocking callback
    pub evictions: AtomicU64,
}

impl LockMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn record_immediate_grant(&self) {
        self.immediate_grants.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_queued_grant(&self) {
        self.queued_grants.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_would_block(&self) {
        self.would_block.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_blocking_ast(&self) {
        self.blocking_asts.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_match(&self, hit: bool) {
        if hit {
            self.matches.fetch_add(1, Ordering::Relaxed);
        } else {
            self.match_misses.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[inline]
    pub fn record_cancel(&self) {
        self.cancels.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_lru_cancel(&self) {
        self.lru_cancels.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_eviction(&self) {
        self.evictions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> LockMetricsSnapshot {
        LockMetricsSnapshot {
            immediate_grants: self.immediate_grants.load(Ordering::Relaxed),
            queued_grants: self.queued_grants.load(Ordering::Relaxed),
            would_block: self.would_block.load(Ordering::Relaxed),
            blocking_asts: self.blocking_asts.load(Ordering::Relaxed),
            matches: self.matches.load(Ordering::Relaxed),
            match_misses: self.match_misses.load(Ordering::Relaxed),
            cancels: self.cancels.load(Ordering::Relaxed),
            lru_cancels: self.lru_cancels.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`LockMetrics`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LockMetricsSnapshot {
    pub immediate_grants: u64,
    pub queued_grants: u64,
    pub would_block: u64,
    pub blocking_asts: u64,
    pub matches: u64,
    pub match_misses: u64,
    pub cancels: u64,
    pub lru_cancels: u64,
    pub evictions: u64,
}

impl LockMetricsSnapshot {
    /// Fraction of lookups served from the local table.
    pub fn match_rate(&self) -> f64 {
        let total = self.matches + self.match_misses;
        if total == 0 {
            0.0
        } else {
            self.matches as f64 / total as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_match_rate() {
        let m = LockMetrics::new();
        assert_eq!(m.snapshot().match_rate(), 0.0);
        m.record_match(true);
        m.record_match(true);
        m.record_match(false);
        m.record_match(true);
        let snap = m.snapshot();
        assert_eq!(snap.matches, 3);
        assert!((snap.match_rate() - 0.75).abs() < f64::EPSILON);
    }
}
