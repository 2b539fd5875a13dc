//! Server-side lock namespace.
//!
//! Each resource keeps a list of granted locks and a FIFO queue of waiting
//! requests. A request is granted immediately only when it is compatible with
//! every granted lock *and* nobody is queued ahead of it; otherwise it waits.
//! Holders of conflicting locks receive a blocking callback and must cancel
//! within the ack timeout, or their client is evicted from the namespace.
//! Group locks are exempt from the timeout: they are held until the
//! application drops them, and conflicting requests wait behind them.
//!
//! When a lock goes away the queue is reprocessed strictly in order: waiters
//! are granted from the head until the first one that still conflicts.

use crate::error::{DlmError, DlmResult};
use crate::metrics::LockMetrics;
use crate::mode::LockMode;
use crate::policy::Policy;
use crate::resource::{ClientId, LockCookie, ResourceId};
use crate::service::{EnqueueRequest, Grant, LockFlags, LockService, ServerEvent};
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

/// Default time a holder has to cancel after a blocking callback.
pub const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_secs(5);

struct GrantedLock {
    cookie: LockCookie,
    mode: LockMode,
    policy: Policy,
    ast_sent: bool,
}

/// A blocking callback to deliver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct BlockingAst {
    cookie: LockCookie,
    /// Evict the holder if it has not cancelled within the ack timeout.
    timed: bool,
}

struct Waiter {
    cookie: LockCookie,
    mode: LockMode,
    policy: Policy,
    reply: oneshot::Sender<DlmResult<Grant>>,
}

#[derive(Default)]
struct Resource {
    granted: Vec<GrantedLock>,
    waiting: VecDeque<Waiter>,
}

impl Resource {
    fn is_empty(&self) -> bool {
        self.granted.is_empty() && self.waiting.is_empty()
    }
}

/// True when the two locks cannot be held at once.
fn conflicts(mode_a: LockMode, policy_a: &Policy, mode_b: LockMode, policy_b: &Policy) -> bool {
    if !policy_a.overlaps(policy_b) {
        return false;
    }
    if mode_a == LockMode::Group && mode_b == LockMode::Group {
        return policy_a.gid() != policy_b.gid();
    }
    !mode_a.compatible(mode_b)
}

struct ServerInner {
    name: String,
    ack_timeout: Duration,
    resources: DashMap<ResourceId, Resource>,
    /// Which resource each granted or waiting lock lives on.
    index: DashMap<LockCookie, ResourceId>,
    clients: DashMap<ClientId, mpsc::UnboundedSender<ServerEvent>>,
    evicted: DashMap<ClientId, ()>,
    shutdown: AtomicBool,
    metrics: LockMetrics,
}

/// A lock namespace.
///
/// Cloning is cheap; clones share the namespace.
#[derive(Clone)]
pub struct LockServer {
    inner: Arc<ServerInner>,
}

impl std::fmt::Debug for LockServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockServer")
            .field("name", &self.inner.name)
            .field("resources", &self.inner.resources.len())
            .finish_non_exhaustive()
    }
}

impl LockServer {
    pub fn new(name: impl Into<String>, ack_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(ServerInner {
                name: name.into(),
                ack_timeout,
                resources: DashMap::new(),
                index: DashMap::new(),
                clients: DashMap::new(),
                evicted: DashMap::new(),
                shutdown: AtomicBool::new(false),
                metrics: LockMetrics::new(),
            }),
        }
    }

    pub fn metrics(&self) -> &LockMetrics {
        &self.inner.metrics
    }

    /// Number of granted locks on a resource.
    pub fn granted_count(&self, resource: ResourceId) -> usize {
        self.inner
            .resources
            .get(&resource)
            .map_or(0, |r| r.granted.len())
    }

    /// Number of queued requests on a resource.
    pub fn waiting_count(&self, resource: ResourceId) -> usize {
        self.inner
            .resources
            .get(&resource)
            .map_or(0, |r| r.waiting.len())
    }

    pub fn is_evicted(&self, client: ClientId) -> bool {
        self.inner.evicted.contains_key(&client)
    }

    fn is_granted_with_ast(&self, cookie: LockCookie) -> bool {
        let Some(resource) = self.inner.index.get(&cookie).map(|r| *r) else {
            return false;
        };
        self.inner.resources.get(&resource).is_some_and(|r| {
            r.granted
                .iter()
                .any(|g| g.cookie == cookie && g.ast_sent)
        })
    }

    /// Grant queued requests in order, then pick holders needing a blocking callback.
    fn reprocess(&self, resource: ResourceId, r: &mut Resource) -> Vec<BlockingAst> {
        while let Some(head) = r.waiting.front() {
            if r
                .granted
                .iter()
                .any(|g| conflicts(g.mode, &g.policy, head.mode, &head.policy))
            {
                break;
            }
            let Some(waiter) = r.waiting.pop_front() else {
                break;
            };
            let grant = Grant {
                cookie: waiter.cookie,
                mode: waiter.mode,
                policy: waiter.policy,
            };
            if waiter.reply.send(Ok(grant)).is_ok() {
                debug!(namespace = %self.inner.name, %resource, cookie = %waiter.cookie, mode = %waiter.mode, "Granted queued lock");
                self.inner.metrics.record_queued_grant();
                r.granted.push(GrantedLock {
                    cookie: waiter.cookie,
                    mode: waiter.mode,
                    policy: waiter.policy,
                    ast_sent: false,
                });
            } else {
                // Requester went away while queued
                self.inner.index.remove(&waiter.cookie);
            }
        }
        Self::collect_blocking(r)
    }

    fn collect_blocking(r: &mut Resource) -> Vec<BlockingAst> {
        let mut out = Vec::new();
        for g in &mut r.granted {
            if g.ast_sent {
                continue;
            }
            let blocks = r
                .waiting
                .iter()
                .any(|w| conflicts(g.mode, &g.policy, w.mode, &w.policy));
            if blocks {
                g.ast_sent = true;
                out.push(BlockingAst {
                    cookie: g.cookie,
                    timed: g.mode != LockMode::Group,
                });
            }
        }
        out
    }

    fn send_asts(&self, resource: ResourceId, asts: Vec<BlockingAst>) {
        for BlockingAst { cookie, timed } in asts {
            self.inner.metrics.record_blocking_ast();
            let delivered = self
                .inner
                .clients
                .get(&cookie.client)
                .is_some_and(|tx| tx.send(ServerEvent::Blocking { cookie, resource }).is_ok());
            debug!(namespace = %self.inner.name, %resource, %cookie, delivered, timed, "Sent blocking callback");
            if timed {
                self.arm_ack_timer(cookie);
            }
        }
    }

    fn arm_ack_timer(&self, cookie: LockCookie) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(namespace = %self.inner.name, %cookie, "No runtime for callback timer");
            return;
        };
        let weak: Weak<ServerInner> = Arc::downgrade(&self.inner);
        let timeout = self.inner.ack_timeout;
        handle.spawn(async move {
            tokio::time::sleep(timeout).await;
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let server = LockServer { inner };
            if server.is_granted_with_ast(cookie) {
                error!(
                    namespace = %server.inner.name,
                    %cookie,
                    timeout_ms = timeout.as_millis() as u64,
                    "Lock callback timer expired, evicting client"
                );
                server.evict(cookie.client);
            }
        });
    }

    fn cleanup(&self, resource: ResourceId) {
        self.inner.resources.remove_if(&resource, |_, r| r.is_empty());
    }

    /// Drop every lock and request of a client.
    fn purge(&self, client: ClientId, evicted: bool) {
        let tx = self.inner.clients.remove(&client).map(|(_, tx)| tx);
        let mut pending_asts = Vec::new();
        let mut touched = Vec::new();
        for mut entry in self.inner.resources.iter_mut() {
            let resource = *entry.key();
            let r = entry.value_mut();
            let mut revoked = Vec::new();
            r.granted.retain(|g| {
                if g.cookie.client == client {
                    revoked.push(g.cookie);
                    false
                } else {
                    true
                }
            });
            let before = r.waiting.len();
            let mut kept = VecDeque::with_capacity(before);
            for w in r.waiting.drain(..) {
                if w.cookie.client == client {
                    self.inner.index.remove(&w.cookie);
                    let err = if evicted {
                        DlmError::Evicted {
                            client,
                            namespace: self.inner.name.clone(),
                        }
                    } else {
                        DlmError::Cancelled { resource }
                    };
                    // Requester may have given up already
                    let _ = w.reply.send(Err(err));
                } else {
                    kept.push_back(w);
                }
            }
            r.waiting = kept;
            if revoked.is_empty() && r.waiting.len() == before {
                continue;
            }
            for cookie in revoked {
                self.inner.index.remove(&cookie);
                if let Some(tx) = &tx {
                    let _ = tx.send(ServerEvent::Revoked { cookie, resource });
                }
            }
            pending_asts.push((resource, self.reprocess(resource, r)));
            touched.push(resource);
        }
        for (resource, asts) in pending_asts {
            self.send_asts(resource, asts);
        }
        for resource in touched {
            self.cleanup(resource);
        }
    }

    /// Evict a client: revoke its locks and fail its queued requests.
    pub fn evict(&self, client: ClientId) {
        self.inner.evicted.insert(client, ());
        self.inner.metrics.record_eviction();
        error!(namespace = %self.inner.name, %client, "Evicting client");
        self.purge(client, true);
    }

    /// Server-initiated cancellation of everything on a resource.
    ///
    /// Granted locks are revoked and queued requests fail with
    /// [`DlmError::Cancelled`].
    pub fn cancel_resource(&self, resource: ResourceId) {
        let Some((_, r)) = self.inner.resources.remove(&resource) else {
            return;
        };
        for g in r.granted {
            self.inner.index.remove(&g.cookie);
            if let Some(tx) = self.inner.clients.get(&g.cookie.client) {
                let _ = tx.send(ServerEvent::Revoked {
                    cookie: g.cookie,
                    resource,
                });
            }
        }
        for w in r.waiting {
            self.inner.index.remove(&w.cookie);
            let _ = w.reply.send(Err(DlmError::Cancelled { resource }));
        }
        info!(namespace = %self.inner.name, %resource, "Cancelled all locks on resource");
    }

    /// Shut the namespace down, failing every queued request.
    pub fn shutdown(&self) {
        self.inner.shutdown.store(true, Ordering::SeqCst);
        let resources: Vec<ResourceId> = self.inner.resources.iter().map(|e| *e.key()).collect();
        for resource in resources {
            if let Some((_, r)) = self.inner.resources.remove(&resource) {
                for w in r.waiting {
                    let _ = w.reply.send(Err(DlmError::Shutdown(self.inner.name.clone())));
                }
            }
        }
        self.inner.index.clear();
        self.inner.clients.clear();
    }

    fn check_open(&self) -> DlmResult<()> {
        if self.inner.shutdown.load(Ordering::SeqCst) {
            return Err(DlmError::Shutdown(self.inner.name.clone()));
        }
        Ok(())
    }
}

#[async_trait]
impl LockService for LockServer {
    fn name(&self) -> &str {
        &self.inner.name
    }

    fn connect(&self, client: ClientId) -> mpsc::UnboundedReceiver<ServerEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.evicted.remove(&client);
        self.inner.clients.insert(client, tx);
        debug!(namespace = %self.inner.name, %client, "Client connected");
        rx
    }

    fn disconnect(&self, client: ClientId) {
        self.purge(client, false);
        debug!(namespace = %self.inner.name, %client, "Client disconnected");
    }

    async fn enqueue(&self, request: EnqueueRequest) -> DlmResult<Grant> {
        self.check_open()?;
        let client = request.cookie.client;
        if self.is_evicted(client) {
            return Err(DlmError::Evicted {
                client,
                namespace: self.inner.name.clone(),
            });
        }
        let resource = request.resource;
        let grant = Grant {
            cookie: request.cookie,
            mode: request.mode,
            policy: request.policy,
        };

        let (rx, asts) = {
            let mut entry = self.inner.resources.entry(resource).or_default();
            let r = entry.value_mut();
            let blocked = !r.waiting.is_empty()
                || r
                    .granted
                    .iter()
                    .any(|g| conflicts(g.mode, &g.policy, request.mode, &request.policy));
            if !blocked {
                r.granted.push(GrantedLock {
                    cookie: request.cookie,
                    mode: request.mode,
                    policy: request.policy,
                    ast_sent: false,
                });
                self.inner.index.insert(request.cookie, resource);
                self.inner.metrics.record_immediate_grant();
                debug!(namespace = %self.inner.name, %resource, cookie = %request.cookie, mode = %request.mode, "Granted lock");
                return Ok(grant);
            }
            if request.flags.contains(LockFlags::BLOCK_NOWAIT) {
                self.inner.metrics.record_would_block();
                return Err(DlmError::WouldBlock { resource });
            }
            let (tx, rx) = oneshot::channel();
            r.waiting.push_back(Waiter {
                cookie: request.cookie,
                mode: request.mode,
                policy: request.policy,
                reply: tx,
            });
            self.inner.index.insert(request.cookie, resource);
            (rx, Self::collect_blocking(r))
        };
        debug!(namespace = %self.inner.name, %resource, cookie = %request.cookie, mode = %request.mode, "Lock request queued");
        self.send_asts(resource, asts);

        match rx.await {
            Ok(result) => result,
            Err(_) => Err(DlmError::Cancelled { resource }),
        }
    }

    fn cancel(&self, cookie: LockCookie) -> DlmResult<()> {
        let Some((_, resource)) = self.inner.index.remove(&cookie) else {
            return Err(DlmError::UnknownLock(cookie));
        };
        let asts = {
            let Some(mut r) = self.inner.resources.get_mut(&resource) else {
                return Err(DlmError::UnknownLock(cookie));
            };
            if let Some(pos) = r.granted.iter().position(|g| g.cookie == cookie) {
                r.granted.remove(pos);
            } else if let Some(pos) = r.waiting.iter().position(|w| w.cookie == cookie) {
                if let Some(w) = r.waiting.remove(pos) {
                    let _ = w.reply.send(Err(DlmError::Cancelled { resource }));
                }
            }
            self.inner.metrics.record_cancel();
            self.reprocess(resource, &mut r)
        };
        self.send_asts(resource, asts);
        self.cleanup(resource);
        Ok(())
    }

    fn convert(&self, cookie: LockCookie, mode: LockMode) -> DlmResult<()> {
        let Some(resource) = self.inner.index.get(&cookie).map(|r| *r) else {
            return Err(DlmError::UnknownLock(cookie));
        };
        let asts = {
            let Some(mut r) = self.inner.resources.get_mut(&resource) else {
                return Err(DlmError::UnknownLock(cookie));
            };
            let Some(lock) = r.granted.iter_mut().find(|g| g.cookie == cookie) else {
                return Err(DlmError::UnknownLock(cookie));
            };
            if !lock.mode.covers(mode) {
                return Err(DlmError::InvalidConversion {
                    from: lock.mode,
                    to: mode,
                });
            }
            lock.mode = mode;
            lock.ast_sent = false;
            self.reprocess(resource, &mut r)
        };
        self.send_asts(resource, asts);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::{Extent, InodeBits};

    fn res() -> ResourceId {
        ResourceId([1, 0, 0])
    }

    fn request(client: ClientId, seq: u64, mode: LockMode, policy: Policy) -> EnqueueRequest {
        EnqueueRequest {
            cookie: LockCookie { client, seq },
            resource: res(),
            mode,
            policy,
            flags: LockFlags::empty(),
        }
    }

    #[tokio::test]
    async fn test_compatible_requests_granted_immediately() {
        let server = LockServer::new("mds", DEFAULT_ACK_TIMEOUT);
        let (a, b) = (ClientId::random(), ClientId::random());
        let _ra = server.connect(a);
        let _rb = server.connect(b);
        let bits = Policy::InodeBits(InodeBits::UPDATE);
        server.enqueue(request(a, 1, LockMode::Pr, bits)).await.unwrap();
        server.enqueue(request(b, 1, LockMode::Pr, bits)).await.unwrap();
        assert_eq!(server.granted_count(res()), 2);
    }

    #[tokio::test]
    async fn test_nowait_conflict_would_block() {
        let server = LockServer::new("ost", DEFAULT_ACK_TIMEOUT);
        let (a, b) = (ClientId::random(), ClientId::random());
        let mut events = server.connect(a);
        let _rb = server.connect(b);
        let ext = Policy::Extent(Extent::to_eof(0));
        server.enqueue(request(a, 1, LockMode::Pw, ext)).await.unwrap();
        let mut req = request(b, 1, LockMode::Pr, ext);
        req.flags = LockFlags::BLOCK_NOWAIT;
        assert!(matches!(
            server.enqueue(req).await,
            Err(DlmError::WouldBlock { .. })
        ));
        // A refused non-blocking request does not disturb the holder
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_disjoint_extents_do_not_conflict() {
        let server = LockServer::new("ost", DEFAULT_ACK_TIMEOUT);
        let a = ClientId::random();
        let _ra = server.connect(a);
        server
            .enqueue(request(a, 1, LockMode::Pw, Policy::Extent(Extent::new(0, 99))))
            .await
            .unwrap();
        server
            .enqueue(request(a, 2, LockMode::Pw, Policy::Extent(Extent::new(100, 199))))
            .await
            .unwrap();
        assert_eq!(server.granted_count(res()), 2);
    }

    #[tokio::test]
    async fn test_blocking_callback_then_grant_on_cancel() {
        let server = LockServer::new("mds", DEFAULT_ACK_TIMEOUT);
        let (a, b) = (ClientId::random(), ClientId::random());
        let mut events = server.connect(a);
        let _rb = server.connect(b);
        let bits = Policy::InodeBits(InodeBits::UPDATE);
        let held = server.enqueue(request(a, 1, LockMode::Pr, bits)).await.unwrap();

        let s2 = server.clone();
        let waiter = tokio::spawn(async move { s2.enqueue(request(b, 1, LockMode::Pw, bits)).await });

        let event = events.recv().await.unwrap();
        assert_eq!(
            event,
            ServerEvent::Blocking {
                cookie: held.cookie,
                resource: res()
            }
        );
        server.cancel(held.cookie).unwrap();
        let grant = waiter.await.unwrap().unwrap();
        assert_eq!(grant.mode, LockMode::Pw);
        assert_eq!(server.metrics().snapshot().queued_grants, 1);
    }

    #[tokio::test]
    async fn test_group_locks_share_only_same_gid() {
        let server = LockServer::new("ost", DEFAULT_ACK_TIMEOUT);
        let (a, b) = (ClientId::random(), ClientId::random());
        let _ra = server.connect(a);
        let _rb = server.connect(b);
        server
            .enqueue(request(a, 1, LockMode::Group, Policy::Extent(Extent::group(5))))
            .await
            .unwrap();
        server
            .enqueue(request(b, 1, LockMode::Group, Policy::Extent(Extent::group(5))))
            .await
            .unwrap();
        let mut other = request(b, 2, LockMode::Group, Policy::Extent(Extent::group(6)));
        other.flags = LockFlags::BLOCK_NOWAIT;
        assert!(server.enqueue(other).await.is_err());
        let mut reader = request(b, 3, LockMode::Pr, Policy::Extent(Extent::new(0, 10)));
        reader.flags = LockFlags::BLOCK_NOWAIT;
        assert!(server.enqueue(reader).await.is_err());
    }

    #[tokio::test]
    async fn test_queue_is_fifo_even_for_compatible_latecomer() {
        let server = LockServer::new("ost", DEFAULT_ACK_TIMEOUT);
        let (a, b, c) = (ClientId::random(), ClientId::random(), ClientId::random());
        let _r = (server.connect(a), server.connect(b), server.connect(c));
        let ext = Policy::Extent(Extent::to_eof(0));
        let held = server.enqueue(request(a, 1, LockMode::Pr, ext)).await.unwrap();

        let s2 = server.clone();
        let writer = tokio::spawn(async move { s2.enqueue(request(b, 1, LockMode::Pw, ext)).await });
        while server.waiting_count(res()) < 1 {
            tokio::task::yield_now().await;
        }
        // Compatible with the holder, but must not jump the queued writer
        let mut reader = request(c, 1, LockMode::Pr, ext);
        reader.flags = LockFlags::BLOCK_NOWAIT;
        assert!(matches!(
            server.enqueue(reader).await,
            Err(DlmError::WouldBlock { .. })
        ));
        server.cancel(held.cookie).unwrap();
        writer.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_unacknowledged_callback_evicts_holder() {
        let server = LockServer::new("mds", Duration::from_millis(50));
        let (a, b) = (ClientId::random(), ClientId::random());
        let mut events = server.connect(a);
        let _rb = server.connect(b);
        let bits = Policy::InodeBits(InodeBits::UPDATE);
        let held = server.enqueue(request(a, 1, LockMode::Pw, bits)).await.unwrap();

        // Client `a` never cancels
        let grant = server.enqueue(request(b, 1, LockMode::Pw, bits)).await.unwrap();
        assert_eq!(grant.cookie.client, b);
        assert!(server.is_evicted(a));
        assert!(matches!(events.recv().await, Some(ServerEvent::Blocking { .. })));
        assert_eq!(
            events.recv().await,
            Some(ServerEvent::Revoked {
                cookie: held.cookie,
                resource: res()
            })
        );
        let again = server.enqueue(request(a, 2, LockMode::Pr, bits)).await;
        assert!(matches!(again, Err(DlmError::Evicted { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_group_lock_holder_is_never_timed_out() {
        let server = LockServer::new("ost", Duration::from_millis(50));
        let (a, b) = (ClientId::random(), ClientId::random());
        let mut events = server.connect(a);
        let _rb = server.connect(b);
        let held = server
            .enqueue(request(a, 1, LockMode::Group, Policy::Extent(Extent::group(7))))
            .await
            .unwrap();

        let s2 = server.clone();
        let reader = tokio::spawn(async move {
            s2.enqueue(request(b, 1, LockMode::Pr, Policy::Extent(Extent::new(0, 4095))))
                .await
        });
        assert!(matches!(events.recv().await, Some(ServerEvent::Blocking { .. })));

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(!server.is_evicted(a));
        assert_eq!(server.granted_count(res()), 1);
        assert_eq!(server.waiting_count(res()), 1);
        assert!(!reader.is_finished());

        server.cancel(held.cookie).unwrap();
        assert_eq!(reader.await.unwrap().unwrap().mode, LockMode::Pr);
        assert_eq!(server.metrics().snapshot().evictions, 0);
    }

    #[tokio::test]
    async fn test_server_cancel_wakes_waiter_with_error() {
        let server = LockServer::new("ost", DEFAULT_ACK_TIMEOUT);
        let (a, b) = (ClientId::random(), ClientId::random());
        let _r = (server.connect(a), server.connect(b));
        let ext = Policy::Extent(Extent::to_eof(0));
        server.enqueue(request(a, 1, LockMode::Pw, ext)).await.unwrap();
        let s2 = server.clone();
        let waiter = tokio::spawn(async move { s2.enqueue(request(b, 1, LockMode::Pw, ext)).await });
        while server.waiting_count(res()) < 1 {
            tokio::task::yield_now().await;
        }
        server.cancel_resource(res());
        assert!(matches!(
            waiter.await.unwrap(),
            Err(DlmError::Cancelled { .. })
        ));
        assert_eq!(server.granted_count(res()), 0);
    }

    #[tokio::test]
    async fn test_convert_downgrade_unblocks_reader() {
        let server = LockServer::new("ost", DEFAULT_ACK_TIMEOUT);
        let (a, b) = (ClientId::random(), ClientId::random());
        let _r = (server.connect(a), server.connect(b));
        let ext = Policy::Extent(Extent::to_eof(0));
        let held = server.enqueue(request(a, 1, LockMode::Pw, ext)).await.unwrap();
        assert!(matches!(
            server.convert(held.cookie, LockMode::Ex),
            Err(DlmError::InvalidConversion { .. })
        ));
        let s2 = server.clone();
        let reader = tokio::spawn(async move { s2.enqueue(request(b, 1, LockMode::Pr, ext)).await });
        while server.waiting_count(res()) < 1 {
            tokio::task::yield_now().await;
        }
        server.convert(held.cookie, LockMode::Pr).unwrap();
        reader.await.unwrap().unwrap();
        assert_eq!(server.granted_count(res()), 2);
    }
}
