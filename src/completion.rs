//! Frame completion: the success (`frame_done`) and failure (`frame_ndone`)
//! paths, and the deferred channel completions are delivered on.
//!
//! Completions are never delivered from the context that finished the frame.
//! They are posted to an unbounded tokio channel and consumed by the caller,
//! either by polling a [`CompletionReceiver`] or through
//! [`spawn_completion_worker`].
//!
//! A frame is posted exactly once: only the call that empties its owner mask
//! releases it to FREE, and only a successful release posts. Internal frames are
//! counted but not delivered.

use crate::core::IspCore;
use crate::error::{IspError, IspResult};
use crate::frame::{FrameId, FrameKind, FrameRecord, FrameState, Outcome, StateTrace};
use crate::hardware::{BufferHandle, FrameMeta};
use crate::mask::{InstanceId, SlotId};
use crate::queue::QueueGuard;
use crate::registry::{InstanceStats, PipelineInstance};
use crate::slot::HardwareIpSlot;
use crate::sync::LockContext;
use crate::topology::{Chain, ChainRef};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

// =============================================================================
// Events
// =============================================================================

/// A finished frame as seen by the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameCompletion {
    /// Owning stream.
    pub instance: InstanceId,
    /// Capture sequence number.
    pub fcount: u64,
    /// Origin.
    pub kind: FrameKind,
    /// Definitive outcome.
    pub outcome: Outcome,
    /// Queue record the frame used.
    pub frame: FrameId,
    /// States visited on the way.
    pub trace: StateTrace,
    /// Metadata collected from each slot.
    pub meta: Vec<(SlotId, FrameMeta)>,
    /// Output buffers handed in with the request.
    pub buffers: Vec<BufferHandle>,
}

impl From<FrameRecord> for FrameCompletion {
    fn from(record: FrameRecord) -> Self {
        Self {
            instance: record.instance,
            fcount: record.fcount,
            kind: record.kind,
            outcome: record.result,
            frame: record.id,
            trace: record.trace,
            meta: record.meta,
            buffers: record.buffers,
        }
    }
}

/// Event delivered on the completion channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineEvent {
    /// A user-visible frame finished.
    Completed(FrameCompletion),
    /// The chain of `instance` kept getting stuck; a supervisor should restart it.
    ForceRestart {
        /// Affected stream.
        instance: InstanceId,
        /// Human-readable cause.
        reason: String,
    },
}

// =============================================================================
// Channel
// =============================================================================

pub(crate) struct CompletionQueue {
    tx: mpsc::UnboundedSender<PipelineEvent>,
    posted: AtomicU64,
    delivered: AtomicU64,
}

impl CompletionQueue {
    pub(crate) fn new() -> (Self, CompletionReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                tx,
                posted: AtomicU64::new(0),
                delivered: AtomicU64::new(0),
            },
            CompletionReceiver { rx },
        )
    }

    pub(crate) fn posted(&self) -> u64 {
        self.posted.load(Ordering::Relaxed)
    }

    pub(crate) fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    fn post_frame(&self, record: FrameRecord) {
        self.posted.fetch_add(1, Ordering::Relaxed);
        if !record.is_user_visible() {
            debug!(instance = %record.instance, fcount = record.fcount, outcome = %record.result, "internal frame retired");
            return;
        }
        self.send(PipelineEvent::Completed(record.into()));
    }

    pub(crate) fn send(&self, event: PipelineEvent) {
        if self.tx.send(event).is_err() {
            debug!("completion receiver dropped, event discarded");
            return;
        }
        self.delivered.fetch_add(1, Ordering::Relaxed);
    }
}

/// Receiving end of the completion channel.
#[derive(Debug)]
pub struct CompletionReceiver {
    rx: mpsc::UnboundedReceiver<PipelineEvent>,
}

impl CompletionReceiver {
    /// Next event if one is ready.
    pub fn try_next(&mut self) -> Option<PipelineEvent> {
        self.rx.try_recv().ok()
    }

    /// Wait for the next event. `None` once the core is dropped.
    pub async fn recv(&mut self) -> Option<PipelineEvent> {
        self.rx.recv().await
    }

    /// Every event ready now.
    pub fn drain(&mut self) -> Vec<PipelineEvent> {
        std::iter::from_fn(|| self.try_next()).collect()
    }

    /// Frame completions ready now; other events are discarded.
    pub fn drain_completions(&mut self) -> Vec<FrameCompletion> {
        self.drain()
            .into_iter()
            .filter_map(|event| match event {
                PipelineEvent::Completed(c) => Some(c),
                PipelineEvent::ForceRestart { .. } => None,
            })
            .collect()
    }
}

/// Run `handler` on every event on the current tokio runtime until the core is
/// dropped.
pub fn spawn_completion_worker<F>(mut receiver: CompletionReceiver, mut handler: F) -> JoinHandle<()>
where
    F: FnMut(PipelineEvent) + Send + 'static,
{
    tokio::spawn(async move {
        while let Some(event) = receiver.recv().await {
            handler(event);
        }
        debug!("completion worker stopped");
    })
}

// =============================================================================
// Done / NDONE
// =============================================================================

pub(crate) fn find_in_flight<P>(guard: &QueueGuard<'_>, predicate: P) -> Option<FrameId>
where
    P: Fn(&FrameRecord) -> bool,
{
    [FrameState::Request, FrameState::Configure, FrameState::WaitDone]
        .into_iter()
        .find_map(|state| guard.find(state, &predicate))
}

impl IspCore {
    /// Instance, chain and head slot that `slot`'s interrupt work belongs to.
    pub(crate) fn resolve_chain(
        &self,
        slot: SlotId,
    ) -> IspResult<(Arc<PipelineInstance>, ChainRef, Arc<HardwareIpSlot>)> {
        let registry = self.registry();
        let ip = registry.slot(slot)?;
        let instance_id = ip.route_instance().ok_or(IspError::NoActiveInstance(slot))?;
        let instance = registry.instance(instance_id)?;
        let which = instance
            .topology()
            .locate(slot)
            .ok_or(IspError::NoActiveInstance(slot))?;
        let head = self.chain_head_of(&instance, which)?;
        Ok((instance, which, head))
    }

    pub(crate) fn chain_of<'a>(&self, instance: &'a PipelineInstance, which: ChainRef) -> IspResult<&'a Chain> {
        instance
            .topology()
            .chain(which)
            .ok_or_else(|| IspError::InvalidChain(format!("instance {} has no chain {:?}", instance.id(), which)))
    }

    pub(crate) fn chain_head_of(&self, instance: &PipelineInstance, which: ChainRef) -> IspResult<Arc<HardwareIpSlot>> {
        let chain = self.chain_of(instance, which)?;
        self.registry().chain_head(chain)
    }

    /// Success completion of `fcount` on `slot`.
    ///
    /// Clears `slot` from the frame's owners, collecting the slot's metadata on
    /// the way. The frame is released and its completion posted only when the
    /// last owner lets go.
    pub fn frame_done(&self, slot: SlotId, fcount: u64, outcome: Outcome) -> IspResult<()> {
        let ip = self.registry().slot(slot)?;
        let (instance, _, head) = self.resolve_chain(slot)?;
        let queue = head.queue();

        let (id, info) = {
            let guard = queue.lock_irq()?;
            let id = guard
                .find(FrameState::WaitDone, |f| {
                    f.instance == instance.id() && f.fcount == fcount && f.owner.is_owned(slot)
                })
                .ok_or(IspError::FrameNotFound {
                    slot: head.id(),
                    fcount,
                    state: FrameState::WaitDone,
                })?;
            let info = guard.frame(id).map(FrameRecord::info).ok_or(IspError::FrameNotFound {
                slot: head.id(),
                fcount,
                state: FrameState::WaitDone,
            })?;
            (id, info)
        };

        // The IP is queried without the queue lock held.
        let meta = if outcome.is_success() {
            ip.ops().get_meta(&info)
        } else {
            None
        };

        let finished = {
            let mut guard = queue.lock_irq()?;
            let Some(record) = guard.frame_mut(id) else {
                return Ok(());
            };
            if record.generation != info.generation || record.state != FrameState::WaitDone {
                warn!(slot = %slot, fcount, "frame recycled while collecting metadata");
                return Ok(());
            }
            record.record_result(outcome);
            if let Some(meta) = meta {
                record.meta.push((slot, meta));
            }
            record.owner.clear_owned(slot);
            if record.owner.is_empty() {
                Some(guard.release(id)?)
            } else {
                None
            }
        };

        if let Some(record) = finished {
            head.time_log().record_end(record.fcount, self.now_ns());
            if record.result.is_success() {
                head.clear_stuck_streak();
                head.clear_stalled();
            }
            debug!(slot = %slot, instance = %record.instance, fcount = record.fcount, outcome = %record.result, "frame done");
            self.post_completion(record);
        }
        Ok(())
    }

    /// Failure completion of the in-flight frame `fcount` on the chain led by
    /// `leader`. A `TIMEOUT` always dumps the chain before the slots are told.
    pub fn frame_ndone(&self, leader: SlotId, fcount: u64, outcome: Outcome) -> IspResult<()> {
        let (instance, which, head) = self.resolve_chain(leader)?;
        let id = {
            let guard = head.queue().lock();
            find_in_flight(&guard, |f| f.fcount == fcount && f.instance == instance.id()).ok_or(
                IspError::FrameNotFound {
                    slot: head.id(),
                    fcount,
                    state: FrameState::WaitDone,
                },
            )?
        };
        if outcome == Outcome::Timeout {
            head.mark_stalled();
            self.dump_chain(&instance, self.chain_of(&instance, which)?);
        }
        self.ndone_frame(&instance, which, id, outcome, LockContext::Request)
    }

    /// NDONE one frame: record `outcome`, move it to WAIT_DONE, run every chain
    /// slot's `frame_ndone` hook, then drop all owners and release it.
    pub(crate) fn ndone_frame(
        &self,
        instance: &PipelineInstance,
        which: ChainRef,
        id: FrameId,
        outcome: Outcome,
        ctx: LockContext,
    ) -> IspResult<()> {
        let chain = self.chain_of(instance, which)?;
        let head = self.registry().chain_head(chain)?;
        let queue = head.queue();

        let info = {
            let mut guard = queue.lock_in(ctx)?;
            let Some(record) = guard.frame_mut(id) else {
                return Ok(());
            };
            let state = record.state;
            if state == FrameState::Free {
                return Ok(());
            }
            record.record_result(outcome);
            let info = record.info();
            if state != FrameState::WaitDone {
                guard.transition(id, state, FrameState::WaitDone)?;
            }
            info
        };

        for slot_id in chain.slots() {
            let slot = self.registry().slot(*slot_id)?;
            if let Err(e) = slot.ops().frame_ndone(&info, outcome) {
                warn!(slot = %slot_id, fcount = info.fcount, error = %e, "frame_ndone hook failed");
            }
        }

        let finished = {
            let mut guard = queue.lock_in(ctx)?;
            let current = matches!(
                guard.frame(id),
                Some(r) if r.generation == info.generation && r.state == FrameState::WaitDone
            );
            if current {
                if let Some(record) = guard.frame_mut(id) {
                    record.owner.clear_all();
                }
                Some(guard.release(id)?)
            } else {
                None
            }
        };

        if let Some(record) = finished {
            head.time_log().record_end(record.fcount, self.now_ns());
            warn!(
                instance = %record.instance,
                fcount = record.fcount,
                outcome = %record.result,
                "frame ndone"
            );
            self.post_completion(record);
        }
        Ok(())
    }

    /// Release and post frames no slot was ever told about (late, delayed or
    /// duplicate). Each must already sit in WAIT_DONE with no owners.
    pub(crate) fn retire_unshot(&self, head: &HardwareIpSlot, ids: &[FrameId], ctx: LockContext) -> IspResult<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let retired = {
            let mut guard = head.queue().lock_in(ctx)?;
            let mut retired = Vec::with_capacity(ids.len());
            for id in ids {
                retired.push(guard.release(*id)?);
            }
            retired
        };
        for record in retired {
            debug!(instance = %record.instance, fcount = record.fcount, outcome = %record.result, "frame retired without shot");
            self.post_completion(record);
        }
        Ok(())
    }

    /// Single diagnostic dump of a chain.
    pub(crate) fn dump_chain(&self, instance: &PipelineInstance, chain: &Chain) {
        let n = self.registry().note_dump();
        error!(instance = %instance.id(), head = %chain.head(), dump = n, "chain diagnostic dump");
        for slot_id in chain.slots() {
            match self.registry().slot(*slot_id) {
                Ok(slot) => {
                    let counters = slot.counters().snapshot();
                    info!(
                        slot = %slot_id,
                        name = slot.name(),
                        flags = ?slot.flags(),
                        frame_start = counters.frame_start,
                        config_lock = counters.config_lock,
                        frame_end = counters.frame_end,
                        dma_done = counters.dma_done,
                        "slot state"
                    );
                    slot.ops().dump_regs(instance.id());
                }
                Err(e) => warn!(slot = %slot_id, error = %e, "slot vanished during dump"),
            }
        }
    }

    pub(crate) fn post_completion(&self, record: FrameRecord) {
        if let Ok(instance) = self.registry().instance(record.instance) {
            let stats = instance.stats();
            match record.result {
                Outcome::Success => InstanceStats::bump(&stats.completed),
                Outcome::LateFrame => {
                    InstanceStats::bump(&stats.late_frames);
                    InstanceStats::bump(&stats.failed);
                }
                _ => InstanceStats::bump(&stats.failed),
            }
        }
        self.inner.completions.post_frame(record);
    }

    pub(crate) fn post_event(&self, event: PipelineEvent) {
        self.inner.completions.send(event);
    }
}
