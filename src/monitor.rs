//! Completion and timeout monitor: frame-start/frame-end handling, the stuck
//! frame watchdog, forced flushes and diagnostics.
//!
//! The interrupt handlers take queue locks with the bounded acquire and return
//! [`IspError::LockContended`] rather than wait.

use crate::completion::PipelineEvent;
use crate::core::IspCore;
use crate::error::{IpError, IspError, IspResult};
use crate::frame::{FrameId, FrameRecord, FrameState, Outcome};
use crate::mask::{InstanceId, SlotId};
use crate::registry::{InstanceStats, PipelineInstance};
use crate::slot::{CounterSnapshot, SlotFlags};
use crate::sync::LockContext;
use crate::topology::ChainRef;
use tracing::{debug, error, info, trace, warn};

/// Queue occupancy of one chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueOccupancy {
    /// Head slot owning the queue.
    pub head: SlotId,
    /// Records per state, indexed FREE, REQUEST, CONFIGURE, WAIT_DONE.
    pub by_state: [usize; 4],
}

impl QueueOccupancy {
    /// Records in `state`.
    pub fn count(&self, state: FrameState) -> usize {
        self.by_state[state.index()]
    }
}

/// Result of [`IspCore::dump_state`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceDump {
    /// Instance dumped.
    pub instance: InstanceId,
    /// One entry per chain, primary first.
    pub queues: Vec<QueueOccupancy>,
    /// Counters of every active slot.
    pub counters: Vec<(SlotId, CounterSnapshot)>,
}

/// Whether a frame (possibly spanning several buffers) covers `fcount`.
fn covers(record: &FrameRecord, fcount: u64) -> bool {
    let span = u64::from(record.geometry.num_buffers.max(1));
    record.fcount <= fcount && fcount < record.fcount.saturating_add(span)
}

fn is_stale(record: &FrameRecord, fcount: u64) -> bool {
    let span = u64::from(record.geometry.num_buffers.max(1));
    record.fcount.saturating_add(span) <= fcount
}

impl IspCore {
    // =========================================================================
    // Interrupts
    // =========================================================================

    /// Frame-start interrupt of `slot` for hardware frame `hw_fcount`.
    ///
    /// On a chain head: CONFIGURE frames older than `hw_fcount` complete with
    /// `INVALID_FRAME_NUMBER`, the frame covering `hw_fcount` moves to
    /// WAIT_DONE, and if WAIT_DONE then holds more than `queue.max_wait_done`
    /// frames the oldest complete with `DROP`.
    pub fn on_frame_start(&self, slot: SlotId, hw_fcount: u64) -> IspResult<()> {
        let ip = self.registry().slot(slot)?;
        ip.counters().frame_start();
        ip.note_frame_start(hw_fcount);
        ip.clear_flags(SlotFlags::CONFIG_LOCKED);

        let Some(instance_id) = ip.route_instance() else {
            debug!(slot = %slot, hw_fcount, "frame start with no bound instance");
            return Ok(());
        };
        let instance = self.registry().instance(instance_id)?;
        let Some(which) = instance.topology().chain_headed_by(slot).map(|(r, _)| r) else {
            return Ok(());
        };

        let (stale, started) = {
            let mut guard = ip.queue().lock_irq()?;
            let mut stale = Vec::new();
            let mut started = None;
            for id in guard.ids(FrameState::Configure) {
                let Some(record) = guard.frame(id) else {
                    continue;
                };
                if record.instance != instance_id {
                    continue;
                }
                if is_stale(record, hw_fcount) {
                    if let Some(record) = guard.frame_mut(id) {
                        record.record_result(Outcome::InvalidFrameNumber);
                    }
                    guard.transition(id, FrameState::Configure, FrameState::WaitDone)?;
                    stale.push(id);
                } else if started.is_none() && covers(record, hw_fcount) {
                    let fcount = record.fcount;
                    guard.transition(id, FrameState::Configure, FrameState::WaitDone)?;
                    started = Some((id, fcount));
                }
            }
            (stale, started)
        };

        match started {
            Some((id, fcount)) => {
                ip.time_log().record_start(fcount, self.now_ns());
                trace!(slot = %slot, frame = %id, fcount, hw_fcount, "frame started");
            }
            None => debug!(slot = %slot, hw_fcount, "frame start without configured frame"),
        }

        if !stale.is_empty() {
            warn!(slot = %slot, hw_fcount, stale = stale.len(), "stale configured frames flushed");
        }
        for id in stale {
            self.ndone_frame(&instance, which, id, Outcome::InvalidFrameNumber, LockContext::Irq)?;
        }

        let limit = self.config().queue.max_wait_done;
        let dropped = {
            let mut guard = ip.queue().lock_irq()?;
            let excess = guard.count(FrameState::WaitDone).saturating_sub(limit);
            let dropped: Vec<FrameId> = guard
                .ids(FrameState::WaitDone)
                .into_iter()
                .filter(|id| guard.frame(*id).is_some_and(|f| f.instance == instance_id))
                .take(excess)
                .collect();
            for id in &dropped {
                if let Some(record) = guard.frame_mut(*id) {
                    record.record_result(Outcome::Drop);
                }
            }
            dropped
        };
        if !dropped.is_empty() {
            warn!(slot = %slot, limit, dropped = dropped.len(), "WAIT_DONE overflow, dropping oldest frames");
        }
        for id in dropped {
            self.ndone_frame(&instance, which, id, Outcome::Drop, LockContext::Irq)?;
        }
        Ok(())
    }

    /// Frame-end interrupt of `slot` for `fcount`.
    ///
    /// A frame-end for a frame that was already flushed is logged and ignored.
    pub fn on_frame_end(&self, slot: SlotId, fcount: u64, outcome: Outcome) -> IspResult<()> {
        self.registry().slot(slot)?.counters().frame_end();
        match self.frame_done(slot, fcount, outcome) {
            Err(IspError::FrameNotFound { .. }) => {
                warn!(slot = %slot, fcount, outcome = %outcome, "frame end for unknown frame");
                Ok(())
            }
            other => other,
        }
    }

    /// DMA-done interrupt of `slot`.
    pub fn on_dma_done(&self, slot: SlotId) -> IspResult<()> {
        self.registry().slot(slot)?.counters().dma_done();
        Ok(())
    }

    /// Firmware response for a dispatched frame. A failure makes the frame's
    /// result `UNPROCESSED`; a response matching no in-flight frame is counted.
    pub fn on_firmware_response(
        &self,
        instance: InstanceId,
        fcount: u64,
        result: Result<(), IpError>,
    ) -> IspResult<()> {
        let pipeline = self.registry().instance(instance)?;
        for (_, chain) in pipeline.topology().chains() {
            let head = self.registry().chain_head(chain)?;
            let mut guard = head.queue().lock_irq()?;
            let Some(id) = crate::completion::find_in_flight(&guard, |f| {
                f.instance == instance && f.fcount == fcount
            }) else {
                continue;
            };
            match &result {
                Ok(()) => trace!(instance = %instance, fcount, "firmware acknowledged frame"),
                Err(e) => {
                    warn!(instance = %instance, fcount, error = %e, "firmware rejected frame");
                    if let Some(record) = guard.frame_mut(id) {
                        record.record_result(Outcome::Unprocessed);
                    }
                }
            }
            return Ok(());
        }
        InstanceStats::bump(&pipeline.stats().firmware_orphans);
        warn!(instance = %instance, fcount, "firmware response for unknown frame");
        Ok(())
    }

    // =========================================================================
    // Watchdog
    // =========================================================================

    /// Watchdog expiry of the chain headed by `slot`.
    ///
    /// The chain is STUCK if a frame logged since the previous expiry started
    /// after it ended or was shot after it started, or if the chain is still
    /// stalled and nothing was shot since. A stuck chain gets one diagnostic
    /// dump per stall, every in-flight frame completes with `TIMEOUT`, and every
    /// slot is notified. After `watchdog.max_consecutive_timeouts` stuck
    /// expiries in a row a [`PipelineEvent::ForceRestart`] is posted.
    pub fn on_watchdog_expired(&self, slot: SlotId) -> IspResult<()> {
        let ip = self.registry().slot(slot)?;
        let (report, progressed) = {
            let mut log = ip.time_log();
            let progressed = log.unchecked() > 0;
            (log.inspect(), progressed)
        };

        let reason = match report {
            Some(report) => {
                error!(
                    slot = %slot,
                    fcount = report.fcount,
                    reason = ?report.reason,
                    shot_ns = report.times.shot_ns,
                    start_ns = report.times.start_ns,
                    end_ns = report.times.end_ns,
                    "chain stuck"
                );
                format!("fcount {} {:?}", report.fcount, report.reason)
            }
            None if ip.is_stalled() && !progressed => {
                error!(slot = %slot, streak = ip.stuck_streak(), "chain still stuck, no progress");
                "no progress since last expiry".to_string()
            }
            None => {
                ip.clear_stuck_streak();
                debug!(slot = %slot, "watchdog expired, chain healthy");
                return Ok(());
            }
        };

        let chains = self.registry().chains_headed_by(slot);
        if ip.mark_stalled() {
            if let Some((instance, which)) = chains.first() {
                let chain = self.chain_of(instance, *which)?;
                self.dump_chain(instance, chain);
            }
        }

        for (instance, which) in &chains {
            // The stall stays latched, so the next expiry retries the flush.
            if let Err(e) = self.timeout_chain(instance, *which) {
                warn!(instance = %instance.id(), head = %slot, error = %e, "stuck chain flush failed, re-arming");
                self.arm_watchdog(&ip);
                return Err(e);
            }
        }

        let streak = ip.bump_stuck_streak();
        let limit = self.config().watchdog.max_consecutive_timeouts;
        if streak >= limit {
            for (instance, _) in &chains {
                error!(instance = %instance.id(), slot = %slot, streak, "requesting force restart");
                self.post_event(PipelineEvent::ForceRestart {
                    instance: instance.id(),
                    reason: format!("slot {} stuck {} times: {}", slot, streak, reason),
                });
            }
            ip.clear_stuck_streak();
        } else {
            self.arm_watchdog(&ip);
        }
        Ok(())
    }

    fn timeout_chain(&self, instance: &PipelineInstance, which: ChainRef) -> IspResult<()> {
        let head = self.chain_head_of(instance, which)?;
        let flushed = self.flush_chain(instance, which, Outcome::Timeout, LockContext::Irq)?;
        let chain = self.chain_of(instance, which)?;
        for slot_id in chain.slots() {
            self.registry().slot(*slot_id)?.ops().notify_timeout(instance.id());
        }
        warn!(instance = %instance.id(), head = %head.id(), flushed, "stuck chain flushed");
        Ok(())
    }

    // =========================================================================
    // Flush / diagnostics
    // =========================================================================

    /// Complete every in-flight frame of `instance` with `outcome`, oldest
    /// first. Returns the number of frames flushed.
    ///
    /// A `TIMEOUT` flush dumps every chain that has frames in flight first.
    pub fn force_flush(&self, instance: InstanceId, outcome: Outcome) -> IspResult<usize> {
        let pipeline = self.registry().instance(instance)?;
        if outcome == Outcome::Timeout {
            for (_, chain) in pipeline.topology().chains() {
                let head = self.registry().chain_head(chain)?;
                let busy = {
                    let guard = head.queue().lock();
                    crate::completion::find_in_flight(&guard, |f| f.instance == instance).is_some()
                };
                if busy {
                    head.mark_stalled();
                    self.dump_chain(&pipeline, chain);
                }
            }
        }
        self.flush_instance(&pipeline, outcome)
    }

    pub(crate) fn flush_instance(&self, instance: &PipelineInstance, outcome: Outcome) -> IspResult<usize> {
        let mut flushed = 0;
        let chains: Vec<ChainRef> = instance.topology().chains().map(|(which, _)| which).collect();
        for which in chains {
            flushed += self.flush_chain(instance, which, outcome, LockContext::Request)?;
        }
        if flushed > 0 {
            info!(instance = %instance.id(), flushed, outcome = %outcome, "instance flushed");
        }
        Ok(flushed)
    }

    pub(crate) fn flush_chain(
        &self,
        instance: &PipelineInstance,
        which: ChainRef,
        outcome: Outcome,
        ctx: LockContext,
    ) -> IspResult<usize> {
        let head = self.chain_head_of(instance, which)?;
        let ids: Vec<FrameId> = {
            let guard = head.queue().lock_in(ctx)?;
            [FrameState::WaitDone, FrameState::Configure, FrameState::Request]
                .into_iter()
                .flat_map(|state| guard.ids(state))
                .filter(|id| guard.frame(*id).is_some_and(|f| f.instance == instance.id()))
                .collect()
        };
        for id in &ids {
            self.ndone_frame(instance, which, *id, outcome, ctx)?;
        }
        Ok(ids.len())
    }

    /// Log queue occupancy and slot counters of `instance` and ask every slot
    /// for a register dump.
    pub fn dump_state(&self, instance: InstanceId) -> IspResult<InstanceDump> {
        let pipeline = self.registry().instance(instance)?;
        let n = self.registry().note_dump();

        let mut queues = Vec::new();
        for (which, chain) in pipeline.topology().chains() {
            let head = self.registry().chain_head(chain)?;
            let guard = head.queue().lock();
            let by_state = FrameState::ALL.map(|state| guard.count(state));
            info!(
                instance = %instance,
                chain = ?which,
                head = %head.id(),
                free = by_state[0],
                request = by_state[1],
                configure = by_state[2],
                wait_done = by_state[3],
                "queue occupancy"
            );
            queues.push(QueueOccupancy {
                head: head.id(),
                by_state,
            });
        }

        let mut counters = Vec::new();
        for slot_id in pipeline.hw_mask().iter() {
            let slot = self.registry().slot(slot_id)?;
            let snapshot = slot.counters().snapshot();
            info!(
                instance = %instance,
                slot = %slot_id,
                name = slot.name(),
                flags = ?slot.flags(),
                ref_count = slot.ref_count(),
                frame_start = snapshot.frame_start,
                config_lock = snapshot.config_lock,
                frame_end = snapshot.frame_end,
                dma_done = snapshot.dma_done,
                "slot state"
            );
            slot.ops().dump_regs(instance);
            counters.push((slot_id, snapshot));
        }
        info!(instance = %instance, dump = n, aeb = %pipeline.aeb_state(), "state dump complete");

        Ok(InstanceDump {
            instance,
            queues,
            counters,
        })
    }
}
