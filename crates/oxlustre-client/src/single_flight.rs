//! Single-flight deduplication of concurrent fetches.
//!
//! When several callers need the same remote state at once, only the first
//! ("leader") issues the RPC and the others ("waiters") wait for it. The
//! fetched data lands in the inode cache, so waiters only need to learn
//! whether the leader succeeded.

use crate::error::{ClientError, ClientResult};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast;

type Outcome = Result<(), ClientError>;

/// Result of trying to attach to an in-flight fetch.
pub enum AttachResult {
    /// This caller should perform the fetch.
    Leader,
    /// Another caller is fetching; wait for its outcome.
    Waiter(broadcast::Receiver<Outcome>),
}

#[derive(Debug, Default)]
pub struct SingleFlightStats {
    pub leaders: AtomicU64,
    pub waiters: AtomicU64,
    pub completed: AtomicU64,
}

impl SingleFlightStats {
    /// Fraction of callers that piggybacked on another's fetch.
    pub fn dedup_ratio(&self) -> f64 {
        let leaders = self.leaders.load(Ordering::Relaxed);
        let waiters = self.waiters.load(Ordering::Relaxed);
        let total = leaders + waiters;
        if total == 0 {
            0.0
        } else {
            waiters as f64 / total as f64
        }
    }
}

/// Removes the in-flight entry if the leader's future is dropped, so the
/// waiters see a closed channel and retry.
struct LeaderGuard<'a, K: Eq + Hash> {
    flights: &'a SingleFlight<K>,
    key: Option<K>,
}

impl<K: Eq + Hash> Drop for LeaderGuard<'_, K> {
    fn drop(&mut self) {
        if let Some(key) = self.key.take() {
            self.flights.cancel(&key);
        }
    }
}

/// Single-flight manager keyed by `K`.
pub struct SingleFlight<K: Eq + Hash> {
    in_flight: DashMap<K, broadcast::Sender<Outcome>>,
    stats: SingleFlightStats,
}

impl<K: Eq + Hash> SingleFlight<K> {
    /// Drop an in-flight entry without an outcome.
    pub fn cancel(&self, key: &K) {
        self.in_flight.remove(key);
    }
}

impl<K: Eq + Hash + Clone> SingleFlight<K> {
    pub fn new() -> Self {
        Self {
            in_flight: DashMap::new(),
            stats: SingleFlightStats::default(),
        }
    }

    /// Attach to an in-flight fetch, or become its leader.
    pub fn try_attach(&self, key: K) -> AttachResult {
        match self.in_flight.entry(key) {
            Entry::Occupied(occupied) => {
                self.stats.waiters.fetch_add(1, Ordering::Relaxed);
                AttachResult::Waiter(occupied.get().subscribe())
            }
            Entry::Vacant(vacant) => {
                let (sender, _) = broadcast::channel(1);
                vacant.insert(sender);
                self.stats.leaders.fetch_add(1, Ordering::Relaxed);
                AttachResult::Leader
            }
        }
    }

    /// Publish the leader's outcome. Returns how many waiters received it.
    pub fn complete(&self, key: &K, outcome: Outcome) -> usize {
        match self.in_flight.remove(key) {
            Some((_, sender)) => {
                self.stats.completed.fetch_add(1, Ordering::Relaxed);
                // No waiters is fine
                sender.send(outcome).unwrap_or(0)
            }
            None => 0,
        }
    }

    /// Run `fetch` once for `key` no matter how many callers arrive.
    ///
    /// Waiters get the leader's outcome. If the leader is dropped before
    /// finishing, a waiter takes over.
    pub async fn run<F, Fut>(&self, key: K, fetch: F) -> ClientResult<()>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = ClientResult<()>>,
    {
        loop {
            match self.try_attach(key.clone()) {
                AttachResult::Leader => {
                    let mut guard = LeaderGuard {
                        flights: self,
                        key: Some(key.clone()),
                    };
                    let outcome = fetch().await;
                    guard.key = None;
                    self.complete(&key, outcome.clone());
                    return outcome;
                }
                AttachResult::Waiter(mut rx) => match rx.recv().await {
                    Ok(outcome) => return outcome,
                    Err(_) => continue,
                },
            }
        }
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    pub fn stats(&self) -> &SingleFlightStats {
        &self.stats
    }
}

impl<K: Eq + Hash + Clone> Default for SingleFlight<K> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    #[test]
    fn test_leader_then_waiter() {
        let sf: SingleFlight<u64> = SingleFlight::new();
        assert!(matches!(sf.try_attach(1), AttachResult::Leader));
        assert!(matches!(sf.try_attach(1), AttachResult::Waiter(_)));
        assert!(matches!(sf.try_attach(2), AttachResult::Leader));
        assert_eq!(sf.in_flight_count(), 2);
    }

    #[tokio::test]
    async fn test_complete_notifies_waiters() {
        let sf: SingleFlight<u64> = SingleFlight::new();
        let _leader = sf.try_attach(7);
        let AttachResult::Waiter(mut rx) = sf.try_attach(7) else {
            panic!("second attach should wait");
        };
        assert_eq!(sf.complete(&7, Ok(())), 1);
        assert_eq!(rx.recv().await.unwrap(), Ok(()));
        assert_eq!(sf.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn test_run_fetches_once() {
        let sf = Arc::new(SingleFlight::<u64>::new());
        let calls = Arc::new(AtomicU32::new(0));
        let mut tasks = Vec::new();
        for _ in 0..8 {
            let sf = Arc::clone(&sf);
            let calls = Arc::clone(&calls);
            tasks.push(tokio::spawn(async move {
                sf.run(1, || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    Ok(())
                })
                .await
            }));
        }
        for t in tasks {
            t.await.unwrap().unwrap();
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(sf.stats().waiters.load(Ordering::Relaxed), 7);
    }

    #[tokio::test]
    async fn test_waiters_share_leader_error() {
        let sf = Arc::new(SingleFlight::<u64>::new());
        let waiter = {
            let sf = Arc::clone(&sf);
            let _leader = sf.try_attach(3);
            tokio::spawn(async move { sf.run(3, || async { Ok(()) }).await })
        };
        while sf.stats().waiters.load(Ordering::Relaxed) == 0 {
            tokio::task::yield_now().await;
        }
        sf.complete(&3, Err(ClientError::errno("getattr", libc::EACCES)));
        let err = waiter.await.unwrap().unwrap_err();
        assert_eq!(err.to_errno(), libc::EACCES);
    }

    #[tokio::test]
    async fn test_cancelled_leader_hands_over() {
        let sf = Arc::new(SingleFlight::<u64>::new());
        let _ = sf.try_attach(5);
        let waiter = {
            let sf = Arc::clone(&sf);
            tokio::spawn(async move { sf.run(5, || async { Ok(()) }).await })
        };
        while sf.stats().waiters.load(Ordering::Relaxed) == 0 {
            tokio::task::yield_now().await;
        }
        sf.cancel(&5);
        waiter.await.unwrap().unwrap();
        assert_eq!(sf.stats().leaders.load(Ordering::Relaxed), 2);
    }

    #[tokio::test]
    async fn test_dropped_leader_clears_its_flight() {
        let sf = Arc::new(SingleFlight::<u64>::new());
        let abandoned = tokio::time::timeout(
            Duration::from_millis(10),
            sf.run(9, || std::future::pending::<ClientResult<()>>()),
        )
        .await;
        assert!(abandoned.is_err());
        assert_eq!(sf.in_flight_count(), 0);

        // The next caller leads a fresh fetch
        sf.run(9, || async { Ok(()) }).await.unwrap();
        assert_eq!(sf.stats().leaders.load(Ordering::Relaxed), 2);
    }
}
