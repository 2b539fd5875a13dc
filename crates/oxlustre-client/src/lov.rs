//! Striping layer: one logical object spread over several storage targets.
//!
//! Every operation fans out to the stripes it touches with
//! [`join_all`](futures::future::join_all). Peers are never cancelled when one
//! stripe fails; the outcome lists which stripes completed and which failed
//! (see [`PartialFailure`]).

use crate::error::{ClientError, ClientResult, PartialFailure, StripeFailure};
use crate::obd::{CreateSpec, ExportHandle, IoOp, ObdOps, Prepared};
use crate::osc::OscClient;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use dashmap::DashMap;
use futures::future::join_all;
use oxlustre_core::stripe::StripeMd;
use oxlustre_core::transport::ImportEvent;
use oxlustre_core::{AttrValid, ObdStatfs, ObjectId, SetAttr, SetAttrValid, StripeObject, WireAttrs};
use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

/// Outcome of one fan-out, stripe by stripe.
struct Fanout<T> {
    done: Vec<(usize, T)>,
    failed: Vec<StripeFailure>,
}

impl<T> Fanout<T> {
    async fn join<F>(futures: impl IntoIterator<Item = F>) -> Self
    where
        F: Future<Output = (usize, u32, ClientResult<T>)>,
    {
        let mut done = Vec::new();
        let mut failed = Vec::new();
        for (stripe, target, result) in join_all(futures).await {
            match result {
                Ok(value) => done.push((stripe, value)),
                Err(error) => failed.push(StripeFailure {
                    stripe,
                    target,
                    error: Box::new(error),
                }),
            }
        }
        done.sort_by_key(|(stripe, _)| *stripe);
        failed.sort_by_key(|f| f.stripe);
        Self { done, failed }
    }

    fn completed(&self) -> Vec<usize> {
        self.done.iter().map(|(stripe, _)| *stripe).collect()
    }

    fn into_result(self) -> ClientResult<Vec<(usize, T)>> {
        if self.failed.is_empty() {
            return Ok(self.done);
        }
        Err(partial(self.completed(), self.failed))
    }
}

/// A lone failure on a single-stripe operation surfaces as itself.
fn partial(completed: Vec<usize>, mut failed: Vec<StripeFailure>) -> ClientError {
    if completed.is_empty() && failed.len() == 1 {
        if let Some(only) = failed.pop() {
            return *only.error;
        }
    }
    ClientError::PartialFailure(PartialFailure { completed, failed })
}

/// A staged stripe of a logical transfer.
struct StagedStripe {
    stripe: usize,
    target: u32,
    object: ObjectId,
    token: u64,
}

struct PendingIo {
    staged: Vec<StagedStripe>,
    /// Stripes whose prepare already failed.
    failed: Vec<StripeFailure>,
}

/// Stripe fan-out over the storage target clients.
pub struct LovClient {
    name: String,
    targets: Vec<Arc<OscClient>>,
    next_start: AtomicU32,
    next_token: AtomicU64,
    pending: DashMap<u64, PendingIo>,
    events: broadcast::Sender<ImportEvent>,
    forwarders: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for LovClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LovClient")
            .field("name", &self.name)
            .field("targets", &self.targets.len())
            .field("pending", &self.pending.len())
            .finish_non_exhaustive()
    }
}

impl LovClient {
    /// `targets[i]` must be the client of target index `i`.
    pub fn new(name: impl Into<String>, targets: Vec<Arc<OscClient>>) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            name: name.into(),
            targets,
            next_start: AtomicU32::new(0),
            next_token: AtomicU64::new(1),
            pending: DashMap::new(),
            events,
            forwarders: Mutex::new(Vec::new()),
        }
    }

    pub fn target_count(&self) -> usize {
        self.targets.len()
    }

    fn target(&self, index: u32) -> ClientResult<&Arc<OscClient>> {
        self.targets
            .get(index as usize)
            .filter(|t| t.index() == index)
            .ok_or_else(|| ClientError::Protocol(format!("stripe references unknown target {index}")))
    }

    /// Run `op` on every stripe object of `md`.
    async fn each_stripe<'a, T, F, Fut>(&'a self, md: &'a StripeMd, op: F) -> Fanout<T>
    where
        F: Fn(usize, &'a Arc<OscClient>, StripeObject) -> Fut,
        Fut: Future<Output = ClientResult<T>> + 'a,
    {
        let futures = md.objects.iter().enumerate().map(|(stripe, obj)| {
            let target = self.target(obj.target);
            let fut = target.map(|osc| op(stripe, osc, *obj));
            async move {
                let result = match fut {
                    Ok(fut) => fut.await,
                    Err(e) => Err(e),
                };
                (stripe, obj.target, result)
            }
        });
        Fanout::join(futures).await
    }

    /// Combine per-stripe object attributes into file attributes.
    fn aggregate(md: &StripeMd, per_stripe: &[(usize, WireAttrs)]) -> ClientResult<WireAttrs> {
        let mut out = WireAttrs {
            valid: AttrValid::STORAGE | AttrValid::ATIME,
            ..WireAttrs::default()
        };
        for (stripe, attrs) in per_stripe {
            out.valid &= attrs.valid | !(AttrValid::STORAGE | AttrValid::ATIME);
            if attrs.valid.contains(AttrValid::SIZE) {
                out.size = out.size.max(md.object_to_file_size(*stripe, attrs.size)?);
            }
            out.blocks = out.blocks.saturating_add(attrs.blocks);
            out.blksize = out.blksize.max(attrs.blksize);
            out.atime = out.atime.max(attrs.atime);
            out.mtime = out.mtime.max(attrs.mtime);
            out.ctime = out.ctime.max(attrs.ctime);
        }
        Ok(out)
    }

    /// Read `len` bytes at `offset`. Holes and data past the end of an
    /// object read as zeros; the caller clips to the file size.
    #[instrument(level = "debug", skip(self, md), fields(object = %md.object))]
    pub async fn read(&self, md: &Arc<StripeMd>, offset: u64, len: u64) -> ClientResult<Bytes> {
        let prepared = self.prep_rw(md, IoOp::Read { offset, len }).await?;
        self.commit_rw(md, prepared.token).await?;
        Ok(prepared.data)
    }

    /// Write `data` at `offset`. Returns the bytes committed.
    #[instrument(level = "debug", skip(self, md, data), fields(object = %md.object, len = data.len()))]
    pub async fn write(&self, md: &Arc<StripeMd>, offset: u64, data: Bytes) -> ClientResult<u64> {
        let prepared = self.prep_rw(md, IoOp::Write { offset, data }).await?;
        self.commit_rw(md, prepared.token).await
    }

    async fn prep_read(&self, md: &StripeMd, offset: u64, len: u64) -> ClientResult<Prepared> {
        let ios = md.group_by_stripe(offset, len)?;
        let futures = ios.iter().map(|io| async move {
            let result = match self.target(io.target) {
                Ok(osc) => {
                    let first = io.segments.first().map_or(0, |s| s.object_offset);
                    osc.prep_rw(
                        &io.object,
                        IoOp::Read {
                            offset: first,
                            len: io.bytes(),
                        },
                    )
                    .await
                }
                Err(e) => Err(e),
            };
            (io.stripe, io.target, result)
        });
        let fanout = Fanout::join(futures).await;

        let mut buf = BytesMut::zeroed(usize::try_from(len).unwrap_or(usize::MAX));
        let mut staged = Vec::with_capacity(fanout.done.len());
        for (stripe, prepared) in &fanout.done {
            let Some(io) = ios.iter().find(|io| io.stripe == *stripe) else {
                continue;
            };
            let mut cursor = 0usize;
            for seg in &io.segments {
                let seg_len = seg.len as usize;
                let available = prepared.data.len().saturating_sub(cursor).min(seg_len);
                let at = (seg.file_offset - offset) as usize;
                buf[at..at + available].copy_from_slice(&prepared.data[cursor..cursor + available]);
                cursor += seg_len;
            }
            staged.push(StagedStripe {
                stripe: io.stripe,
                target: io.target,
                object: io.object,
                token: prepared.token,
            });
        }

        if !fanout.failed.is_empty() {
            let completed = fanout.completed();
            self.commit_staged(staged).await;
            return Err(partial(completed, fanout.failed));
        }
        let token = self.stage(PendingIo {
            staged,
            failed: Vec::new(),
        });
        Ok(Prepared {
            token,
            data: buf.freeze(),
        })
    }

    async fn prep_write(&self, md: &StripeMd, offset: u64, data: Bytes) -> ClientResult<Prepared> {
        let ios = md.group_by_stripe(offset, data.len() as u64)?;
        let futures = ios.iter().map(|io| {
            // Segments of one stripe are contiguous in object space
            let mut chunk = BytesMut::with_capacity(io.bytes() as usize);
            for seg in &io.segments {
                let at = (seg.file_offset - offset) as usize;
                chunk.extend_from_slice(&data[at..at + seg.len as usize]);
            }
            let chunk = chunk.freeze();
            async move {
                let result = match self.target(io.target) {
                    Ok(osc) => {
                        let first = io.segments.first().map_or(0, |s| s.object_offset);
                        osc.prep_rw(
                            &io.object,
                            IoOp::Write {
                                offset: first,
                                data: chunk,
                            },
                        )
                        .await
                    }
                    Err(e) => Err(e),
                };
                (io.stripe, io.target, result)
            }
        });
        let fanout = Fanout::join(futures).await;
        if fanout.done.is_empty() && !fanout.failed.is_empty() {
            return Err(partial(Vec::new(), fanout.failed));
        }
        let staged = fanout
            .done
            .iter()
            .filter_map(|(stripe, prepared)| {
                ios.iter().find(|io| io.stripe == *stripe).map(|io| StagedStripe {
                    stripe: io.stripe,
                    target: io.target,
                    object: io.object,
                    token: prepared.token,
                })
            })
            .collect();
        let token = self.stage(PendingIo {
            staged,
            failed: fanout.failed,
        });
        Ok(Prepared {
            token,
            data: Bytes::new(),
        })
    }

    fn stage(&self, io: PendingIo) -> u64 {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        self.pending.insert(token, io);
        token
    }

    /// Commit staged stripes; used to release read buffers after a failure.
    async fn commit_staged(&self, staged: Vec<StagedStripe>) {
        let fanout = self.commit_all(&staged).await;
        for failure in fanout.failed {
            debug!(stripe = failure.stripe, error = %failure.error, "Releasing staged read failed");
        }
    }

    async fn commit_all(&self, staged: &[StagedStripe]) -> Fanout<u64> {
        let futures = staged.iter().map(|s| async move {
            let result = match self.target(s.target) {
                Ok(osc) => osc.commit_rw(&s.object, s.token).await,
                Err(e) => Err(e),
            };
            (s.stripe, s.target, result)
        });
        Fanout::join(futures).await
    }

    /// Spawn tasks that re-publish each target's import events.
    fn forward_events(&self) {
        let mut forwarders = self.forwarders.lock();
        for osc in &self.targets {
            let mut rx = osc.subscribe();
            let tx = self.events.clone();
            forwarders.push(tokio::spawn(async move {
                loop {
                    match rx.recv().await {
                        Ok(event) => {
                            // No subscribers is fine
                            let _ = tx.send(event);
                        }
                        Err(broadcast::error::RecvError::Lagged(_)) => {}
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }));
        }
    }
}

#[async_trait]
impl ObdOps for LovClient {
    type Key = Arc<StripeMd>;

    fn name(&self) -> &str {
        &self.name
    }

    /// Connect every target. Any failure fails the whole connect.
    async fn connect(&self, client: Uuid) -> ClientResult<ExportHandle> {
        let futures = self.targets.iter().map(|osc| async move {
            (osc.index() as usize, osc.index(), osc.connect(client).await)
        });
        let handles = Fanout::join(futures).await.into_result()?;
        self.forward_events();
        Ok(ExportHandle {
            cookie: handles.first().map_or(0, |(_, h)| h.cookie),
            target: self.name.clone(),
        })
    }

    async fn disconnect(&self) -> ClientResult<()> {
        for task in self.forwarders.lock().drain(..) {
            task.abort();
        }
        let futures = self.targets.iter().map(|osc| async move {
            (osc.index() as usize, osc.index(), osc.disconnect().await)
        });
        Fanout::join(futures).await.into_result().map(|_| ())
    }

    /// Glimpse: size, blocks and times of the file from its objects.
    async fn getattr(&self, md: &Arc<StripeMd>, valid: AttrValid) -> ClientResult<WireAttrs> {
        let request = valid & (AttrValid::STORAGE | AttrValid::ATIME);
        let per_stripe = self
            .each_stripe(md, |_, osc, obj| async move { osc.getattr(&obj.object, request).await })
            .await
            .into_result()?;
        Ok(Self::aggregate(md, &per_stripe)?.project(request))
    }

    async fn setattr(&self, md: &Arc<StripeMd>, attr: &SetAttr) -> ClientResult<WireAttrs> {
        let per_stripe = self
            .each_stripe(md, |stripe, osc, obj| {
                let mut attr = *attr;
                let converted = if attr.valid.contains(SetAttrValid::SIZE) {
                    md.file_to_object_size(stripe, attr.size).map(|size| {
                        attr.size = size;
                        attr
                    })
                } else {
                    Ok(attr)
                };
                async move { osc.setattr(&obj.object, &converted?).await }
            })
            .await
            .into_result()?;
        Self::aggregate(md, &per_stripe)
    }

    /// Allocate one object per stripe, round-robin over the targets.
    ///
    /// Objects already created are destroyed again when any target fails.
    #[instrument(level = "debug", skip(self))]
    async fn create(&self, spec: &CreateSpec) -> ClientResult<Arc<StripeMd>> {
        let total = u32::try_from(self.targets.len()).unwrap_or(u32::MAX);
        if total == 0 {
            return Err(ClientError::errno("create", libc::ENOSPC));
        }
        let count = spec.stripe_count.clamp(1, total);
        let start = self.next_start.fetch_add(1, Ordering::Relaxed) % total;
        let futures = (0..count).map(|i| {
            let index = (start + i) % total;
            async move {
                let result = match self.target(index) {
                    Ok(osc) => osc.create(spec).await,
                    Err(e) => Err(e),
                };
                (i as usize, index, result)
            }
        });
        let fanout = Fanout::join(futures).await;
        let objects: Vec<StripeObject> = fanout
            .done
            .iter()
            .map(|(stripe, object)| StripeObject {
                object: *object,
                target: (start + *stripe as u32) % total,
            })
            .collect();

        if !fanout.failed.is_empty() {
            warn!(created = objects.len(), failed = fanout.failed.len(), "Object allocation failed, cleaning up");
            for obj in &objects {
                if let Ok(osc) = self.target(obj.target) {
                    if let Err(e) = osc.destroy(&obj.object).await {
                        warn!(object = %obj.object, error = %e, "Cleanup destroy failed");
                    }
                }
            }
            return Err(partial(Vec::new(), fanout.failed));
        }

        let whole = objects
            .first()
            .map(|o| o.object)
            .ok_or_else(|| ClientError::Protocol("no objects allocated".to_string()))?;
        let md = StripeMd::new(whole, spec.stripe_size, start, objects)?;
        debug!(object = %md.object, stripes = md.stripe_count(), "Allocated objects");
        Ok(Arc::new(md))
    }

    async fn destroy(&self, md: &Arc<StripeMd>) -> ClientResult<()> {
        self.each_stripe(md, |_, osc, obj| async move { osc.destroy(&obj.object).await })
            .await
            .into_result()
            .map(|_| ())
    }

    /// Truncate every stripe object to its share of `start`.
    async fn punch(&self, md: &Arc<StripeMd>, start: u64) -> ClientResult<()> {
        self.each_stripe(md, |stripe, osc, obj| {
            let at = md.file_to_object_size(stripe, start);
            async move { osc.punch(&obj.object, at?).await }
        })
        .await
        .into_result()
        .map(|_| ())
    }

    async fn prep_rw(&self, md: &Arc<StripeMd>, op: IoOp) -> ClientResult<Prepared> {
        match op {
            IoOp::Read { offset, len } => self.prep_read(md, offset, len).await,
            IoOp::Write { offset, data } => self.prep_write(md, offset, data).await,
        }
    }

    /// Commit every staged stripe of a transfer, reporting the stripes that
    /// failed in either phase.
    async fn commit_rw(&self, _md: &Arc<StripeMd>, token: u64) -> ClientResult<u64> {
        let (_, pending) = self
            .pending
            .remove(&token)
            .ok_or_else(|| ClientError::Protocol(format!("unknown transfer token {token}")))?;
        let mut fanout = self.commit_all(&pending.staged).await;
        fanout.failed.extend(pending.failed);
        fanout.failed.sort_by_key(|f| f.stripe);
        let committed = fanout.done.iter().map(|(_, bytes)| *bytes).sum();
        if fanout.failed.is_empty() {
            Ok(committed)
        } else {
            Err(partial(fanout.completed(), fanout.failed))
        }
    }

    /// Sum the targets that answer. Fails only when none do.
    async fn statfs(&self) -> ClientResult<ObdStatfs> {
        let futures = self
            .targets
            .iter()
            .map(|osc| async move { (osc.index() as usize, osc.index(), osc.statfs().await) });
        let fanout = Fanout::join(futures).await;
        for failure in &fanout.failed {
            warn!(target_index = failure.target, error = %failure.error, "Storage target statfs failed");
        }
        let reports: Vec<ObdStatfs> = fanout.done.iter().map(|(_, r)| *r).collect();
        match ObdStatfs::sum(&reports) {
            Some(total) => Ok(total),
            None if fanout.failed.is_empty() => Err(ClientError::errno("statfs", libc::ENODEV)),
            None => Err(partial(Vec::new(), fanout.failed)),
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<ImportEvent> {
        self.events.subscribe()
    }
}
