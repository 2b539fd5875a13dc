//! Per-session statistics.
//!
//! Lock-free counters updated on the hot paths. Tests use them to assert how
//! many RPCs an operation really issued.

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters for one mounted session.
#[derive(Debug, Default)]
pub struct ClientStats {
    /// Revalidations answered from the cache under a held lock.
    pub revalidate_hits: AtomicU64,
    /// Revalidations that went to the metadata service.
    pub revalidate_misses: AtomicU64,
    /// Size probes sent to storage targets.
    pub glimpses: AtomicU64,
    /// Metadata getattr RPCs issued.
    pub getattr_rpcs: AtomicU64,
    /// Symlink target fetches issued.
    pub readlink_rpcs: AtomicU64,
    pub reads: AtomicU64,
    pub bytes_read: AtomicU64,
    pub writes: AtomicU64,
    pub bytes_written: AtomicU64,
    /// Storage objects left behind after a failed destroy.
    pub orphaned: AtomicU64,
}

impl ClientStats {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn record_revalidate(&self, hit: bool) {
        if hit {
            self.revalidate_hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.revalidate_misses.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[inline]
    pub fn record_glimpse(&self) {
        self.glimpses.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_getattr_rpc(&self) {
        self.getattr_rpcs.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_readlink_rpc(&self) {
        self.readlink_rpcs.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_read(&self, bytes: u64) {
        self.reads.fetch_add(1, Ordering::Relaxed);
        self.bytes_read.fetch_add(bytes, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_write(&self, bytes: u64) {
        self.writes.fetch_add(1, Ordering::Relaxed);
        self.bytes_written.fetch_add(bytes, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_orphaned(&self) {
        self.orphaned.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ClientStatsSnapshot {
        ClientStatsSnapshot {
            revalidate_hits: self.revalidate_hits.load(Ordering::Relaxed),
            revalidate_misses: self.revalidate_misses.load(Ordering::Relaxed),
            glimpses: self.glimpses.load(Ordering::Relaxed),
            getattr_rpcs: self.getattr_rpcs.load(Ordering::Relaxed),
            readlink_rpcs: self.readlink_rpcs.load(Ordering::Relaxed),
            reads: self.reads.load(Ordering::Relaxed),
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            orphaned: self.orphaned.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`ClientStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ClientStatsSnapshot {
    pub revalidate_hits: u64,
    pub revalidate_misses: u64,
    pub glimpses: u64,
    pub getattr_rpcs: u64,
    pub readlink_rpcs: u64,
    pub reads: u64,
    pub bytes_read: u64,
    pub writes: u64,
    pub bytes_written: u64,
    pub orphaned: u64,
}

impl ClientStatsSnapshot {
    /// Fraction of revalidations served from the cache.
    ///
    /// Returns 0.0 if nothing was revalidated yet.
    pub fn hit_rate(&self) -> f64 {
        let total = self.revalidate_hits + self.revalidate_misses;
        if total == 0 {
            0.0
        } else {
            self.revalidate_hits as f64 / total as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_counters() {
        let stats = ClientStats::new();
        stats.record_read(4096);
        stats.record_read(100);
        stats.record_write(10);
        let snap = stats.snapshot();
        assert_eq!(snap.reads, 2);
        assert_eq!(snap.bytes_read, 4196);
        assert_eq!(snap.writes, 1);
        assert_eq!(snap.bytes_written, 10);
    }

    #[test]
    fn test_hit_rate() {
        let stats = ClientStats::new();
        assert_eq!(stats.snapshot().hit_rate(), 0.0);
        stats.record_revalidate(true);
        stats.record_revalidate(false);
        assert!((stats.snapshot().hit_rate() - 0.5).abs() < f64::EPSILON);
    }
}
