//! Client-side lock table.
//!
//! Locks granted to this client are cached after their last user releases
//! them, so a later request for the same (or a weaker) lock is served locally
//! by [`LockClient::match_lock`]. Unused locks are cancelled lazily: when the
//! server sends a blocking callback, or when the unused LRU overflows.
//!
//! Server callbacks are handled by a background task. A blocking callback
//! marks the lock callback-pending (so it is never matched again), notifies
//! the lock's sink, and cancels the lock right away if nobody holds a
//! reference; otherwise the last [`LockClient::release`] cancels it.

use crate::error::{DlmError, DlmResult};
use crate::metrics::LockMetrics;
use crate::mode::LockMode;
use crate::policy::Policy;
use crate::resource::{ClientId, LockCookie, ResourceId};
use crate::service::{EnqueueRequest, LockFlags, LockService, ServerEvent};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, instrument, warn};

/// Lifecycle of a client lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
    Unrequested,
    Pending,
    Granted,
    Converting,
    Cancelling,
    Released,
}

/// Why a sink is being told about a lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeReason {
    /// A conflicting request is waiting; the lock is going away.
    Blocking,
    /// The lock was cancelled by this client.
    Cancelled,
    /// The server dropped the lock.
    Revoked,
}

/// Message delivered to a lock's sink when its coverage is lost.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockNotice {
    pub cookie: LockCookie,
    pub resource: ResourceId,
    pub mode: LockMode,
    pub policy: Policy,
    pub flags: LockFlags,
    pub reason: NoticeReason,
}

/// Where revocation notices for a lock go.
///
/// `owner` identifies the receiving object so its sinks can be detached in
/// bulk with [`LockClient::clear_ast_data`].
#[derive(Debug, Clone)]
pub struct AstSink {
    pub owner: u64,
    pub tx: mpsc::UnboundedSender<LockNotice>,
}

struct LockInner {
    state: LockState,
    mode: LockMode,
    refs: u32,
    cb_pending: bool,
    sink: Option<AstSink>,
}

/// A lock in the client table.
pub struct ClientLock {
    cookie: LockCookie,
    resource: ResourceId,
    policy: Policy,
    flags: LockFlags,
    inner: Mutex<LockInner>,
}

impl ClientLock {
    pub fn cookie(&self) -> LockCookie {
        self.cookie
    }

    pub fn resource(&self) -> ResourceId {
        self.resource
    }

    pub fn policy(&self) -> Policy {
        self.policy
    }

    pub fn mode(&self) -> LockMode {
        self.inner.lock().mode
    }

    pub fn state(&self) -> LockState {
        self.inner.lock().state
    }

    pub fn refs(&self) -> u32 {
        self.inner.lock().refs
    }

    pub fn is_cb_pending(&self) -> bool {
        self.inner.lock().cb_pending
    }

    fn notice(&self, mode: LockMode, reason: NoticeReason) -> LockNotice {
        LockNotice {
            cookie: self.cookie,
            resource: self.resource,
            mode,
            policy: self.policy,
            flags: self.flags,
            reason,
        }
    }
}

impl fmt::Debug for ClientLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("ClientLock")
            .field("cookie", &self.cookie)
            .field("resource", &self.resource)
            .field("mode", &inner.mode)
            .field("state", &inner.state)
            .field("refs", &inner.refs)
            .field("cb_pending", &inner.cb_pending)
            .finish_non_exhaustive()
    }
}

fn notify(sink: Option<AstSink>, notice: LockNotice) {
    if let Some(sink) = sink {
        // The owner may already be gone
        let _ = sink.tx.send(notice);
    }
}

/// A referenced lock. Hand it back with [`LockClient::release`].
#[must_use = "locks must be released"]
#[derive(Debug)]
pub struct LockHandle {
    lock: Arc<ClientLock>,
}

impl LockHandle {
    pub fn cookie(&self) -> LockCookie {
        self.lock.cookie
    }

    pub fn resource(&self) -> ResourceId {
        self.lock.resource
    }

    pub fn mode(&self) -> LockMode {
        self.lock.mode()
    }

    pub fn policy(&self) -> Policy {
        self.lock.policy
    }

    /// True once the lock has been revoked or cancelled underneath the holder.
    pub fn is_released(&self) -> bool {
        self.lock.state() == LockState::Released
    }
}

struct ClientInner {
    id: ClientId,
    service: Arc<dyn LockService>,
    next_seq: AtomicU64,
    /// Locks per resource.
    locks: DashMap<ResourceId, Vec<Arc<ClientLock>>>,
    /// Cookie index into `locks`.
    by_cookie: DashMap<LockCookie, Arc<ClientLock>>,
    /// Unused granted locks, least recently released first.
    lru: Mutex<VecDeque<LockCookie>>,
    lru_size: usize,
    metrics: LockMetrics,
    events_task: Mutex<Option<JoinHandle<()>>>,
}

/// Lock table of one client in one namespace.
///
/// Cloning is cheap; clones share the table.
#[derive(Clone)]
pub struct LockClient {
    inner: Arc<ClientInner>,
}

impl fmt::Debug for LockClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockClient")
            .field("id", &self.inner.id)
            .field("namespace", &self.inner.service.name())
            .field("locks", &self.inner.by_cookie.len())
            .finish_non_exhaustive()
    }
}

/// Removes a still-pending lock if the enqueue future is dropped.
struct PendingGuard<'a> {
    client: &'a LockClient,
    lock: Option<Arc<ClientLock>>,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if let Some(lock) = self.lock.take() {
            self.client.forget(&lock);
            // The request may still be queued on the server
            let _ = self.client.inner.service.cancel(lock.cookie);
        }
    }
}

impl LockClient {
    /// Connect to a namespace and start handling its callbacks.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn connect(id: ClientId, service: Arc<dyn LockService>, lru_size: usize) -> Self {
        let rx = service.connect(id);
        let client = Self {
            inner: Arc::new(ClientInner {
                id,
                service,
                next_seq: AtomicU64::new(1),
                locks: DashMap::new(),
                by_cookie: DashMap::new(),
                lru: Mutex::new(VecDeque::new()),
                lru_size,
                metrics: LockMetrics::new(),
                events_task: Mutex::new(None),
            }),
        };
        let task = tokio::spawn(Self::event_loop(Arc::downgrade(&client.inner), rx));
        *client.inner.events_task.lock() = Some(task);
        client
    }

    async fn event_loop(inner: Weak<ClientInner>, mut rx: mpsc::UnboundedReceiver<ServerEvent>) {
        while let Some(event) = rx.recv().await {
            let Some(inner) = inner.upgrade() else {
                break;
            };
            LockClient { inner }.handle_event(event);
        }
    }

    pub fn id(&self) -> ClientId {
        self.inner.id
    }

    pub fn namespace(&self) -> &str {
        self.inner.service.name()
    }

    pub fn metrics(&self) -> &LockMetrics {
        &self.inner.metrics
    }

    /// Number of locks in the table.
    pub fn lock_count(&self) -> usize {
        self.inner.by_cookie.len()
    }

    /// Total references held on locks of a resource.
    pub fn held_refs(&self, resource: ResourceId) -> u32 {
        self.inner
            .locks
            .get(&resource)
            .map_or(0, |locks| locks.iter().map(|l| l.refs()).sum())
    }

    /// Locks cached for a resource.
    pub fn locks_on(&self, resource: ResourceId) -> Vec<Arc<ClientLock>> {
        self.inner
            .locks
            .get(&resource)
            .map(|l| l.clone())
            .unwrap_or_default()
    }

    fn insert(&self, lock: &Arc<ClientLock>) {
        self.inner
            .locks
            .entry(lock.resource)
            .or_default()
            .push(Arc::clone(lock));
        self.inner.by_cookie.insert(lock.cookie, Arc::clone(lock));
    }

    fn forget(&self, lock: &ClientLock) {
        self.inner.by_cookie.remove(&lock.cookie);
        if let Some(mut locks) = self.inner.locks.get_mut(&lock.resource) {
            locks.retain(|l| l.cookie != lock.cookie);
        }
        self.inner
            .locks
            .remove_if(&lock.resource, |_, locks| locks.is_empty());
        self.inner.lru.lock().retain(|c| *c != lock.cookie);
    }

    /// Find a usable cached lock and take a reference on it.
    ///
    /// A lock is usable when it is granted, not callback-pending, its mode
    /// covers `mode` and its policy covers `policy`.
    pub fn match_lock(&self, resource: ResourceId, mode: LockMode, policy: &Policy) -> Option<LockHandle> {
        let found = self.find_usable(resource, mode, policy, true);
        self.inner.metrics.record_match(found.is_some());
        found.map(|lock| LockHandle { lock })
    }

    /// Like [`match_lock`](Self::match_lock) without taking a reference.
    pub fn test_lock(&self, resource: ResourceId, mode: LockMode, policy: &Policy) -> bool {
        self.find_usable(resource, mode, policy, false).is_some()
    }

    fn find_usable(
        &self,
        resource: ResourceId,
        mode: LockMode,
        policy: &Policy,
        take_ref: bool,
    ) -> Option<Arc<ClientLock>> {
        let candidates = self.locks_on(resource);
        for lock in candidates {
            let mut inner = lock.inner.lock();
            if inner.state != LockState::Granted
                || inner.cb_pending
                || !inner.mode.covers(mode)
                || !lock.policy.covers(policy)
            {
                continue;
            }
            let reused = take_ref && inner.refs == 0;
            if take_ref {
                inner.refs += 1;
            }
            drop(inner);
            if reused {
                self.inner.lru.lock().retain(|c| *c != lock.cookie);
            }
            return Some(lock);
        }
        None
    }

    /// Match a cached lock, or enqueue a new one.
    pub async fn acquire(
        &self,
        resource: ResourceId,
        mode: LockMode,
        policy: Policy,
        flags: LockFlags,
        sink: Option<AstSink>,
    ) -> DlmResult<LockHandle> {
        if let Some(handle) = self.match_lock(resource, mode, &policy) {
            if let Some(sink) = sink {
                let mut inner = handle.lock.inner.lock();
                if inner.sink.is_none() {
                    inner.sink = Some(sink);
                }
            }
            return Ok(handle);
        }
        self.enqueue(resource, mode, policy, flags, sink).await
    }

    /// Enqueue a new lock with the namespace, bypassing the local table.
    #[instrument(level = "debug", skip(self, policy, sink), fields(namespace = %self.namespace(), %resource, %mode))]
    pub async fn enqueue(
        &self,
        resource: ResourceId,
        mode: LockMode,
        policy: Policy,
        flags: LockFlags,
        sink: Option<AstSink>,
    ) -> DlmResult<LockHandle> {
        let cookie = LockCookie {
            client: self.inner.id,
            seq: self.inner.next_seq.fetch_add(1, Ordering::Relaxed),
        };
        let lock = Arc::new(ClientLock {
            cookie,
            resource,
            policy,
            flags,
            inner: Mutex::new(LockInner {
                state: LockState::Unrequested,
                mode,
                refs: 1,
                cb_pending: false,
                sink,
            }),
        });
        // Registered before the request goes out so early callbacks find it
        lock.inner.lock().state = LockState::Pending;
        self.insert(&lock);
        let mut guard = PendingGuard {
            client: self,
            lock: Some(Arc::clone(&lock)),
        };

        let result = self
            .inner
            .service
            .enqueue(EnqueueRequest {
                cookie,
                resource,
                mode,
                policy,
                flags,
            })
            .await;
        guard.lock = None;

        match result {
            Ok(grant) => {
                let mut inner = lock.inner.lock();
                if inner.state == LockState::Released {
                    drop(inner);
                    self.forget(&lock);
                    return Err(DlmError::Evicted {
                        client: self.inner.id,
                        namespace: self.namespace().to_string(),
                    });
                }
                inner.state = LockState::Granted;
                inner.mode = grant.mode;
                debug!(%cookie, cb_pending = inner.cb_pending, "Lock granted");
                drop(inner);
                Ok(LockHandle { lock })
            }
            Err(err) => {
                lock.inner.lock().state = LockState::Released;
                self.forget(&lock);
                Err(err)
            }
        }
    }

    /// Drop a reference.
    ///
    /// At zero references a callback-pending lock is cancelled at once; any
    /// other lock stays cached as unused. Returns an error when the lock was
    /// revoked while held.
    pub fn release(&self, handle: LockHandle) -> DlmResult<()> {
        let lock = handle.lock;
        let mut inner = lock.inner.lock();
        inner.refs = inner.refs.saturating_sub(1);
        if inner.state == LockState::Released {
            return Err(DlmError::Evicted {
                client: self.inner.id,
                namespace: self.namespace().to_string(),
            });
        }
        if inner.refs > 0 {
            return Ok(());
        }
        if inner.cb_pending {
            inner.state = LockState::Cancelling;
            drop(inner);
            self.cancel_now(&lock);
            return Ok(());
        }
        drop(inner);
        self.inner.lru.lock().push_back(lock.cookie);
        self.trim_lru();
        Ok(())
    }

    fn trim_lru(&self) {
        loop {
            let victim = {
                let mut lru = self.inner.lru.lock();
                if lru.len() <= self.inner.lru_size {
                    return;
                }
                lru.pop_front()
            };
            let Some(cookie) = victim else {
                return;
            };
            let Some(lock) = self.inner.by_cookie.get(&cookie).map(|l| Arc::clone(&l)) else {
                continue;
            };
            {
                let mut inner = lock.inner.lock();
                if inner.refs > 0 || inner.state != LockState::Granted {
                    continue;
                }
                inner.state = LockState::Cancelling;
            }
            self.inner.metrics.record_lru_cancel();
            self.cancel_now(&lock);
        }
    }

    fn cancel_now(&self, lock: &Arc<ClientLock>) {
        self.forget(lock);
        if let Err(err) = self.inner.service.cancel(lock.cookie) {
            warn!(cookie = %lock.cookie, error = %err, "Lock cancel failed");
        }
        self.inner.metrics.record_cancel();
        let (mode, sink) = {
            let mut inner = lock.inner.lock();
            inner.state = LockState::Released;
            (inner.mode, inner.sink.take())
        };
        debug!(cookie = %lock.cookie, resource = %lock.resource, "Lock cancelled");
        notify(sink, lock.notice(mode, NoticeReason::Cancelled));
    }

    /// Downgrade a held lock.
    pub fn convert(&self, handle: &LockHandle, mode: LockMode) -> DlmResult<()> {
        let from = {
            let mut inner = handle.lock.inner.lock();
            if inner.state != LockState::Granted {
                return Err(DlmError::UnknownLock(handle.lock.cookie));
            }
            if !inner.mode.covers(mode) {
                return Err(DlmError::InvalidConversion {
                    from: inner.mode,
                    to: mode,
                });
            }
            inner.state = LockState::Converting;
            inner.mode
        };
        let result = self.inner.service.convert(handle.lock.cookie, mode);
        let mut inner = handle.lock.inner.lock();
        if inner.state == LockState::Converting {
            inner.state = LockState::Granted;
            inner.mode = if result.is_ok() { mode } else { from };
        }
        result
    }

    /// Cancel every unused lock, optionally only on one resource.
    pub fn cancel_unused(&self, resource: Option<ResourceId>) -> usize {
        let candidates: Vec<Arc<ClientLock>> = match resource {
            Some(r) => self.locks_on(r),
            None => self.inner.by_cookie.iter().map(|e| Arc::clone(e.value())).collect(),
        };
        let mut cancelled = 0;
        for lock in candidates {
            {
                let mut inner = lock.inner.lock();
                if inner.refs > 0 || inner.state != LockState::Granted {
                    continue;
                }
                inner.state = LockState::Cancelling;
            }
            self.cancel_now(&lock);
            cancelled += 1;
        }
        cancelled
    }

    /// Detach every sink owned by `owner` from the locks of a resource.
    pub fn clear_ast_data(&self, resource: ResourceId, owner: u64) {
        for lock in self.locks_on(resource) {
            let mut inner = lock.inner.lock();
            if inner.sink.as_ref().is_some_and(|s| s.owner == owner) {
                inner.sink = None;
            }
        }
    }

    /// Attach a sink to a held lock if it has none.
    pub fn set_sink(&self, handle: &LockHandle, sink: AstSink) {
        let mut inner = handle.lock.inner.lock();
        if inner.sink.is_none() {
            inner.sink = Some(sink);
        }
    }

    fn handle_event(&self, event: ServerEvent) {
        match event {
            ServerEvent::Blocking { cookie, resource } => {
                self.inner.metrics.record_blocking_ast();
                let Some(lock) = self.inner.by_cookie.get(&cookie).map(|l| Arc::clone(&l)) else {
                    debug!(%cookie, %resource, "Blocking callback for unknown lock");
                    return;
                };
                let (cancel, mode, sink) = {
                    let mut inner = lock.inner.lock();
                    if inner.cb_pending || inner.state == LockState::Released {
                        return;
                    }
                    inner.cb_pending = true;
                    let cancel = inner.refs == 0 && inner.state == LockState::Granted;
                    if cancel {
                        inner.state = LockState::Cancelling;
                    }
                    (cancel, inner.mode, inner.sink.clone())
                };
                debug!(%cookie, %resource, cancel, "Blocking callback");
                notify(sink, lock.notice(mode, NoticeReason::Blocking));
                if cancel {
                    self.cancel_now(&lock);
                }
            }
            ServerEvent::Revoked { cookie, resource } => {
                let Some(lock) = self.inner.by_cookie.get(&cookie).map(|l| Arc::clone(&l)) else {
                    return;
                };
                warn!(%cookie, %resource, "Lock revoked by server");
                let (mode, sink) = {
                    let mut inner = lock.inner.lock();
                    inner.state = LockState::Released;
                    (inner.mode, inner.sink.take())
                };
                self.forget(&lock);
                notify(sink, lock.notice(mode, NoticeReason::Revoked));
            }
        }
    }

    /// Cancel unused locks, leave the namespace and stop handling callbacks.
    pub fn disconnect(&self) {
        self.cancel_unused(None);
        self.inner.service.disconnect(self.inner.id);
        if let Some(task) = self.inner.events_task.lock().take() {
            task.abort();
        }
    }
}

/// A lock released when the guard is dropped.
pub struct ScopedLock {
    client: LockClient,
    handle: Option<LockHandle>,
}

impl ScopedLock {
    pub fn new(client: LockClient, handle: LockHandle) -> Self {
        Self {
            client,
            handle: Some(handle),
        }
    }

    pub fn handle(&self) -> Option<&LockHandle> {
        self.handle.as_ref()
    }

    /// Release now and report the outcome.
    pub fn release(mut self) -> DlmResult<()> {
        match self.handle.take() {
            Some(handle) => self.client.release(handle),
            None => Ok(()),
        }
    }
}

impl Drop for ScopedLock {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            let cookie = handle.cookie();
            if let Err(err) = self.client.release(handle) {
                warn!(%cookie, error = %err, "Scoped lock release failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::{Extent, InodeBits};
    use crate::server::{DEFAULT_ACK_TIMEOUT, LockServer};
    use std::time::Duration;

    fn res() -> ResourceId {
        ResourceId([9, 0, 0])
    }

    fn update() -> Policy {
        Policy::InodeBits(InodeBits::UPDATE)
    }

    fn setup(n: usize) -> (LockServer, Vec<LockClient>) {
        let server = LockServer::new("mds", DEFAULT_ACK_TIMEOUT);
        let service: Arc<dyn LockService> = Arc::new(server.clone());
        let clients = (0..n)
            .map(|_| LockClient::connect(ClientId::random(), Arc::clone(&service), 8))
            .collect();
        (server, clients)
    }

    async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_released_lock_is_cached_and_matched() {
        let (_server, clients) = setup(1);
        let c = &clients[0];
        let h = c
            .acquire(res(), LockMode::Pw, update(), LockFlags::empty(), None)
            .await
            .unwrap();
        c.release(h).unwrap();
        assert_eq!(c.lock_count(), 1);
        // PW serves a PR request
        let h = c.match_lock(res(), LockMode::Pr, &update()).unwrap();
        assert_eq!(h.mode(), LockMode::Pw);
        assert_eq!(c.held_refs(res()), 1);
        c.release(h).unwrap();
        assert!(c.test_lock(res(), LockMode::Pr, &update()));
        assert!(!c.test_lock(res(), LockMode::Pr, &Policy::InodeBits(InodeBits::LOOKUP)));
    }

    #[tokio::test]
    async fn test_blocking_callback_cancels_unused_lock() {
        let (server, clients) = setup(2);
        let (a, b) = (&clients[0], &clients[1]);
        let (tx, mut notices) = mpsc::unbounded_channel();
        let h = a
            .acquire(res(), LockMode::Pr, update(), LockFlags::empty(), Some(AstSink { owner: 1, tx }))
            .await
            .unwrap();
        a.release(h).unwrap();

        let h = b
            .acquire(res(), LockMode::Pw, update(), LockFlags::empty(), None)
            .await
            .unwrap();
        let notice = notices.recv().await.unwrap();
        assert_eq!(notice.reason, NoticeReason::Blocking);
        assert_eq!(a.lock_count(), 0);
        assert_eq!(server.granted_count(res()), 1);
        b.release(h).unwrap();
    }

    #[tokio::test]
    async fn test_callback_pending_lock_not_matched_and_cancelled_on_release() {
        let (server, clients) = setup(2);
        let (a, b) = (clients[0].clone(), clients[1].clone());
        let held = a
            .acquire(res(), LockMode::Pr, update(), LockFlags::empty(), None)
            .await
            .unwrap();

        let writer = tokio::spawn(async move {
            b.acquire(res(), LockMode::Pw, update(), LockFlags::empty(), None)
                .await
        });
        while server.waiting_count(res()) < 1 {
            tokio::task::yield_now().await;
        }
        settle().await;
        assert!(a.locks_on(res())[0].is_cb_pending());
        assert!(a.match_lock(res(), LockMode::Pr, &update()).is_none());
        assert!(!writer.is_finished());

        a.release(held).unwrap();
        let h = writer.await.unwrap().unwrap();
        assert_eq!(h.mode(), LockMode::Pw);
        assert_eq!(a.lock_count(), 0);
    }

    #[tokio::test]
    async fn test_fifo_grant_order_three_waiters() {
        let (server, clients) = setup(4);
        let holder = clients[0].clone();
        let ext = Policy::Extent(Extent::to_eof(0));
        let held = holder
            .acquire(res(), LockMode::Pw, ext, LockFlags::empty(), None)
            .await
            .unwrap();

        let order = Arc::new(Mutex::new(Vec::new()));
        let mut tasks = Vec::new();
        for (i, c) in clients.iter().enumerate().skip(1) {
            let c = c.clone();
            let order = Arc::clone(&order);
            tasks.push(tokio::spawn(async move {
                let h = c
                    .acquire(res(), LockMode::Pw, ext, LockFlags::empty(), None)
                    .await
                    .unwrap();
                order.lock().push(i);
                tokio::task::yield_now().await;
                c.release(h).unwrap();
            }));
            while server.waiting_count(res()) < i {
                tokio::task::yield_now().await;
            }
        }

        holder.release(held).unwrap();
        for t in tasks {
            t.await.unwrap();
        }
        assert_eq!(*order.lock(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_nowait_returns_would_block() {
        let (_server, clients) = setup(2);
        let h = clients[0]
            .acquire(res(), LockMode::Ex, update(), LockFlags::empty(), None)
            .await
            .unwrap();
        let err = clients[1]
            .acquire(res(), LockMode::Pr, update(), LockFlags::BLOCK_NOWAIT, None)
            .await
            .unwrap_err();
        assert!(matches!(err, DlmError::WouldBlock { .. }));
        assert_eq!(clients[1].lock_count(), 0);
        clients[0].release(h).unwrap();
    }

    #[tokio::test]
    async fn test_lru_overflow_cancels_oldest() {
        let server = LockServer::new("ost", DEFAULT_ACK_TIMEOUT);
        let c = LockClient::connect(ClientId::random(), Arc::new(server.clone()), 2);
        for i in 0..3u64 {
            let r = ResourceId([i, 0, 0]);
            let h = c
                .acquire(r, LockMode::Pr, update(), LockFlags::empty(), None)
                .await
                .unwrap();
            c.release(h).unwrap();
        }
        assert_eq!(c.lock_count(), 2);
        assert_eq!(server.granted_count(ResourceId([0, 0, 0])), 0);
        assert_eq!(c.metrics().snapshot().lru_cancels, 1);
    }

    #[tokio::test]
    async fn test_clear_ast_data_detaches_owner() {
        let (_server, clients) = setup(1);
        let c = &clients[0];
        let (tx, mut rx) = mpsc::unbounded_channel();
        let h = c
            .acquire(res(), LockMode::Pr, update(), LockFlags::empty(), Some(AstSink { owner: 42, tx }))
            .await
            .unwrap();
        c.release(h).unwrap();
        c.clear_ast_data(res(), 42);
        assert_eq!(c.cancel_unused(Some(res())), 1);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_revoked_lock_reports_error_on_release() {
        let server = LockServer::new("mds", Duration::from_millis(20));
        let service: Arc<dyn LockService> = Arc::new(server.clone());
        let a = LockClient::connect(ClientId::random(), Arc::clone(&service), 8);
        let b = LockClient::connect(ClientId::random(), service, 8);
        let (tx, mut notices) = mpsc::unbounded_channel();
        let held = a
            .acquire(res(), LockMode::Pw, update(), LockFlags::empty(), Some(AstSink { owner: 1, tx }))
            .await
            .unwrap();
        // `a` keeps its reference past the ack deadline and gets evicted
        let h = b
            .acquire(res(), LockMode::Pw, update(), LockFlags::empty(), None)
            .await
            .unwrap();
        assert_eq!(notices.recv().await.unwrap().reason, NoticeReason::Blocking);
        assert_eq!(notices.recv().await.unwrap().reason, NoticeReason::Revoked);
        assert!(held.is_released());
        assert!(matches!(a.release(held), Err(DlmError::Evicted { .. })));
        b.release(h).unwrap();
    }

    #[tokio::test]
    async fn test_scoped_lock_releases_on_drop() {
        let (_server, clients) = setup(1);
        let c = clients[0].clone();
        let h = c
            .acquire(res(), LockMode::Pw, update(), LockFlags::empty(), None)
            .await
            .unwrap();
        {
            let _guard = ScopedLock::new(c.clone(), h);
            assert_eq!(c.held_refs(res()), 1);
        }
        assert_eq!(c.held_refs(res()), 0);
    }
}
