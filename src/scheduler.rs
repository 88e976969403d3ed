//! Shot scheduler: accepting frame requests and dispatching them through a
//! chain.
//!
//! # Dispatch
//!
//! A dispatch happens in three phases so that no IP is called with a queue lock
//! held:
//!
//! 1. under the head queue's lock the frame is claimed (still in REQUEST, not
//!    already claimed, not late, no other active frame for the same fcount) and
//!    a [`ShotRequest`] is built. A claimed frame is skipped by every other
//!    dispatch, so a config-lock arriving during phase 2 never shoots it again;
//! 2. without the lock, pending setfile data is applied and every slot is shot,
//!    tail first, so downstream blocks are armed before the block feeding them;
//! 3. under the lock again the chain's slots are marked as owners and the frame
//!    moves REQUEST → CONFIGURE.
//!
//! A failure in phase 2 restores every slot already programmed and completes the
//! frame with `UNPROCESSED` through the NDONE path. It is not retried.
//!
//! # Config-lock
//!
//! [`IspCore::on_config_lock`] is the interrupt-time trigger. It retires the
//! REQUEST frames whose window has passed, then dispatches the frame queued for
//! the locked fcount, synthesising an internal frame if the caller queued
//! nothing.

use crate::aeb::AebAction;
use crate::completion::find_in_flight;
use crate::core::IspCore;
use crate::error::{IspError, IspResult};
use crate::frame::{FrameId, FrameInfo, FrameKind, FrameRequest, FrameState, Outcome};
use crate::hardware::ShotRequest;
use crate::mask::{InstanceId, SlotId};
use crate::registry::{InstanceStats, PipelineInstance};
use crate::slot::{HardwareIpSlot, SlotFlags};
use crate::sync::LockContext;
use crate::topology::{Chain, ChainRef};
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

/// What a config-lock found queued for its fcount.
enum Target {
    Queued(FrameId),
    InDispatch(FrameId),
    Nothing,
}

impl IspCore {
    // =========================================================================
    // Requests
    // =========================================================================

    /// Queue an external frame for `instance`.
    ///
    /// The frame waits in REQUEST until the config-lock for its fcount (or an
    /// explicit [`dispatch_shot`](Self::dispatch_shot)). A frame whose fcount
    /// the hardware has already passed is accepted but goes straight to
    /// WAIT_DONE and completes with `LATE_FRAME`.
    ///
    /// # Errors
    /// - [`IspError::InvalidFrameNumber`] if another single-buffer frame of the
    ///   same instance is already in flight for `fcount`
    /// - [`IspError::QueueExhausted`] if the head queue has no FREE record
    pub fn request_shot(&self, instance: InstanceId, request: FrameRequest) -> IspResult<FrameId> {
        let pipeline = self.registry().instance(instance)?;
        let head = self.chain_head_of(&pipeline, ChainRef::Primary)?;
        let hw_fcount = hardware_fcount(&head);
        let multi = request.geometry.num_buffers > 1;
        let fcount = request.fcount;

        let (id, late) = {
            let mut guard = head.queue().lock();
            if !multi
                && find_in_flight(&guard, |f| {
                    f.instance == instance && f.fcount == fcount && !f.is_multi_buffer()
                })
                .is_some()
            {
                warn!(instance = %instance, fcount, "duplicate frame request rejected");
                return Err(IspError::InvalidFrameNumber {
                    slot: head.id(),
                    fcount,
                });
            }

            let id = guard.acquire_free()?;
            let late = hw_fcount.is_some_and(|hw| fcount <= hw);
            if let Some(record) = guard.frame_mut(id) {
                record.instance = instance;
                record.fcount = fcount;
                record.geometry = request.geometry;
                record.buffers = request.buffers;
                record.kind = if late {
                    FrameKind::Late
                } else if multi {
                    FrameKind::Multi
                } else {
                    FrameKind::External
                };
                if late {
                    record.record_result(Outcome::LateFrame);
                }
            }
            if late {
                guard.transition(id, FrameState::Request, FrameState::WaitDone)?;
            }
            (id, late)
        };

        *pipeline.last_geometry.lock() = Some(request.geometry);
        InstanceStats::bump(&pipeline.stats().requested);

        if late {
            warn!(instance = %instance, fcount, hw_fcount = ?hw_fcount, "late frame request");
            self.retire_unshot(&head, &[id], LockContext::Request)?;
        } else {
            debug!(instance = %instance, fcount, frame = %id, "frame requested");
        }
        Ok(id)
    }

    /// Dispatch a REQUEST frame of `instance` through its primary chain now,
    /// from request context.
    ///
    /// # Errors
    /// - [`IspError::LateFrame`] if the frame's window already passed; the frame
    ///   completes with `LATE_FRAME`
    /// - [`IspError::InvalidFrameNumber`] if another frame is active for the same
    ///   fcount; the frame completes with `INVALID_FRAME_NUMBER`
    /// - [`IspError::ShotFailed`] if an IP rejected the shot; the frame
    ///   completes with `UNPROCESSED`
    pub fn dispatch_shot(&self, instance: InstanceId, frame: FrameId) -> IspResult<()> {
        let pipeline = self.registry().instance(instance)?;
        self.dispatch_on(&pipeline, ChainRef::Primary, frame, LockContext::Request)
    }

    // =========================================================================
    // Config-lock
    // =========================================================================

    /// Config-lock interrupt of `slot` for `fcount`.
    ///
    /// Re-arms the chain watchdog, then (for a primary chain head) retires late
    /// or delayed REQUEST frames and dispatches the frame for `fcount`, as
    /// modified by the instance's AEB state.
    pub fn on_config_lock(&self, slot: SlotId, fcount: u64) -> IspResult<()> {
        let ip = self.registry().slot(slot)?;
        ip.counters().config_lock();
        ip.set_flags(SlotFlags::CONFIG_LOCKED);
        let cursor = ip.note_config_lock(fcount);

        let Some(instance_id) = ip.route_instance() else {
            debug!(slot = %slot, fcount, "config-lock with no bound instance");
            return Ok(());
        };
        let instance = self.registry().instance(instance_id)?;
        let Some(which) = instance.topology().chain_headed_by(slot).map(|(r, _)| r) else {
            trace!(slot = %slot, fcount, "config-lock on chain member");
            return Ok(());
        };
        self.arm_watchdog(&ip);
        if which != ChainRef::Primary {
            return Ok(());
        }

        let action = instance.aeb.lock().action();
        let frame_started = cursor.frame_start.is_some_and(|start| start >= fcount);

        let (retired, target) = {
            let mut guard = ip.queue().lock_irq()?;
            let mut retired = Vec::new();
            for id in guard.ids(FrameState::Request) {
                let Some(record) = guard.frame(id) else {
                    continue;
                };
                if record.instance != instance_id || record.is_dispatching() {
                    continue;
                }
                let outcome = if record.fcount < fcount {
                    Outcome::LateFrame
                } else if record.fcount == fcount && frame_started {
                    Outcome::ConfigLockDelay
                } else {
                    continue;
                };
                if let Some(record) = guard.frame_mut(id) {
                    record.record_result(outcome);
                    if outcome == Outcome::LateFrame && record.kind != FrameKind::Internal {
                        record.kind = FrameKind::Late;
                    }
                }
                guard.transition(id, FrameState::Request, FrameState::WaitDone)?;
                retired.push(id);
            }

            let target = if frame_started || action == AebAction::SkipSensorShot {
                Target::Nothing
            } else {
                match guard.find(FrameState::Request, |f| {
                    f.instance == instance_id && f.fcount == fcount
                }) {
                    Some(id) if guard.frame(id).is_some_and(|f| f.is_dispatching()) => Target::InDispatch(id),
                    Some(id) => Target::Queued(id),
                    None => Target::Nothing,
                }
            };
            (retired, target)
        };

        if !retired.is_empty() {
            warn!(
                slot = %slot,
                instance = %instance_id,
                fcount,
                retired = retired.len(),
                delayed = frame_started,
                "config-lock retired frames without shot"
            );
            self.retire_unshot(&ip, &retired, LockContext::Irq)?;
        }

        if frame_started {
            return Ok(());
        }
        if action == AebAction::SkipSensorShot {
            InstanceStats::bump(&instance.stats().skipped_shots);
            debug!(instance = %instance_id, fcount, "sensor shot skipped while AEB switches");
            return Ok(());
        }

        match target {
            Target::InDispatch(frame) => {
                debug!(instance = %instance_id, fcount, frame = %frame, "frame already being dispatched");
            }
            Target::Queued(frame) => self.dispatch_on(&instance, ChainRef::Primary, frame, LockContext::Irq)?,
            Target::Nothing => {
                let frame = self.synthesize_internal(&instance, &ip, fcount, LockContext::Irq)?;
                self.dispatch_on(&instance, ChainRef::Primary, frame, LockContext::Irq)?;
            }
        }

        if action == AebAction::DispatchWithShort {
            self.dispatch_short(&instance, fcount)?;
        }
        Ok(())
    }

    // =========================================================================
    // Internals
    // =========================================================================

    /// Queue an internal frame for `fcount` on `head`, reusing the instance's
    /// most recent geometry.
    fn synthesize_internal(
        &self,
        instance: &PipelineInstance,
        head: &HardwareIpSlot,
        fcount: u64,
        ctx: LockContext,
    ) -> IspResult<FrameId> {
        let geometry = instance.last_geometry().unwrap_or_default();
        let id = {
            let mut guard = head.queue().lock_in(ctx)?;
            let id = guard.acquire_free()?;
            if let Some(record) = guard.frame_mut(id) {
                record.instance = instance.id();
                record.fcount = fcount;
                record.kind = FrameKind::Internal;
                record.geometry = geometry;
            }
            id
        };
        InstanceStats::bump(&instance.stats().internal_frames);
        debug!(instance = %instance.id(), slot = %head.id(), fcount, "internal frame synthesised");
        Ok(id)
    }

    /// Extra short-exposure dispatch on the bracket branch.
    fn dispatch_short(&self, instance: &PipelineInstance, fcount: u64) -> IspResult<()> {
        let Some((which, chain)) = instance.topology().short_exposure() else {
            warn!(instance = %instance.id(), "bracketed exposure without a short-exposure branch");
            instance.aeb.lock().on_error();
            return Ok(());
        };
        let head = self.registry().chain_head(chain)?;
        let frame = self.synthesize_internal(instance, &head, fcount, LockContext::Irq)?;
        self.dispatch_on(instance, which, frame, LockContext::Irq)
    }

    /// Run the three dispatch phases for `id` on chain `which`.
    pub(crate) fn dispatch_on(
        &self,
        instance: &PipelineInstance,
        which: ChainRef,
        id: FrameId,
        ctx: LockContext,
    ) -> IspResult<()> {
        let chain = self.chain_of(instance, which)?;
        let head = self.registry().chain_head(chain)?;
        let slots = chain
            .dispatch_order()
            .map(|slot| self.registry().slot(slot))
            .collect::<IspResult<Vec<_>>>()?;
        let hw_fcount = head.cursor().config_lock;

        // Phase 1
        let (info, request) = {
            let mut guard = head.queue().lock_in(ctx)?;
            let info = guard.claim(id)?;

            let rejection = if hw_fcount.is_some_and(|hw| info.fcount < hw) {
                Some(Outcome::LateFrame)
            } else if info.num_buffers <= 1
                && [FrameState::Configure, FrameState::WaitDone].into_iter().any(|state| {
                    guard
                        .find(state, |f| {
                            f.id != id
                                && f.instance == info.instance
                                && f.fcount == info.fcount
                                && !f.is_multi_buffer()
                        })
                        .is_some()
                })
            {
                Some(Outcome::InvalidFrameNumber)
            } else {
                None
            };

            if let Some(outcome) = rejection {
                if let Some(record) = guard.frame_mut(id) {
                    record.record_result(outcome);
                }
                guard.transition(id, FrameState::Request, FrameState::WaitDone)?;
                drop(guard);
                self.retire_unshot(&head, &[id], ctx)?;
                warn!(instance = %info.instance, fcount = info.fcount, outcome = %outcome, "frame rejected at dispatch");
                return Err(match outcome {
                    Outcome::LateFrame => IspError::LateFrame {
                        fcount: info.fcount,
                        hw_fcount: hw_fcount.unwrap_or_default(),
                    },
                    _ => IspError::InvalidFrameNumber {
                        slot: head.id(),
                        fcount: info.fcount,
                    },
                });
            }

            let buffers = guard.frame(id).map(|f| f.buffers.clone()).unwrap_or_default();
            let request = ShotRequest {
                instance: info.instance,
                fcount: info.fcount,
                frame: id,
                kind: info.kind,
                hw_mask: chain.mask(),
                num_buffers: info.num_buffers,
                buffers,
                region: None,
            };
            (info, request)
        };

        // Phase 2
        if let Err(e) = self.program_chain(instance, chain, &slots, request) {
            warn!(
                instance = %info.instance,
                fcount = info.fcount,
                error = %e,
                "shot dispatch aborted"
            );
            instance.aeb.lock().on_error();
            self.ndone_frame(instance, which, id, Outcome::Unprocessed, ctx)?;
            return Err(e);
        }

        // Phase 3
        let committed = {
            let mut guard = head.queue().lock_in(ctx)?;
            let current = matches!(
                guard.frame(id),
                Some(f) if f.generation == info.generation && f.state == FrameState::Request
            );
            if current {
                if let Some(record) = guard.frame_mut(id) {
                    for slot in chain.slots() {
                        record.owner.mark_owned(*slot);
                    }
                }
                guard.transition(id, FrameState::Request, FrameState::Configure)?;
            }
            current
        };
        if !committed {
            warn!(instance = %info.instance, fcount = info.fcount, "frame flushed during dispatch, restoring chain");
            restore_all(info.instance, &slots);
            return Ok(());
        }

        head.time_log().record_shot(info.fcount, self.now_ns());
        debug!(
            instance = %info.instance,
            head = %head.id(),
            fcount = info.fcount,
            kind = ?info.kind,
            "frame configured"
        );
        self.notify_firmware(&head, &info, ctx)
    }

    /// Apply pending setfile data, then shot every slot tail first. On failure
    /// every slot programmed so far is restored.
    fn program_chain(
        &self,
        instance: &PipelineInstance,
        chain: &Chain,
        slots: &[Arc<HardwareIpSlot>],
        mut request: ShotRequest,
    ) -> IspResult<()> {
        self.apply_pending_setfile(instance)?;

        let mut programmed: Vec<Arc<HardwareIpSlot>> = Vec::with_capacity(slots.len());
        for slot in slots {
            if slot.bind_current(request.instance, request.fcount) {
                trace!(slot = %slot.id(), instance = %request.instance, fcount = request.fcount, "slot bound");
            }
            request.region = slot.region(request.instance);
            if let Err(source) = slot.ops().shot(&request, chain.mask()) {
                restore_all(request.instance, &programmed);
                return Err(IspError::ShotFailed {
                    slot: slot.id(),
                    source,
                });
            }
            programmed.push(Arc::clone(slot));
        }
        Ok(())
    }

    fn apply_pending_setfile(&self, instance: &PipelineInstance) -> IspResult<()> {
        let pending = {
            let binding = instance.setfile.lock();
            binding
                .needs_apply()
                .then(|| (binding.loaded(), binding.scenario()))
        };
        let Some((loaded, scenario)) = pending else {
            return Ok(());
        };
        for slot_id in loaded.iter() {
            let slot = self.registry().slot(slot_id)?;
            slot.ops()
                .apply_setfile(instance.id(), scenario)
                .map_err(|source| IspError::ShotFailed { slot: slot_id, source })?;
        }
        instance.setfile.lock().mark_applied();
        info!(instance = %instance.id(), scenario, slots = loaded.len(), "setfile applied");
        Ok(())
    }

    /// Announce a configured frame to the firmware. A send failure does not undo
    /// the dispatch; it makes the frame's result `UNPROCESSED`.
    fn notify_firmware(&self, head: &HardwareIpSlot, info: &FrameInfo, ctx: LockContext) -> IspResult<()> {
        let Err(e) = self
            .inner
            .firmware
            .send_shot_message(info.instance, info, info.fcount)
        else {
            return Ok(());
        };
        warn!(instance = %info.instance, fcount = info.fcount, error = %e, "firmware shot message failed");
        let mut guard = head.queue().lock_in(ctx)?;
        if let Some(record) = guard.frame_mut(info.id) {
            if record.generation == info.generation {
                record.record_result(Outcome::Unprocessed);
            }
        }
        Ok(())
    }
}

/// Highest frame count the hardware has committed to on `head`.
fn hardware_fcount(head: &HardwareIpSlot) -> Option<u64> {
    let cursor = head.cursor();
    match (cursor.config_lock, cursor.frame_start) {
        (Some(lock), Some(start)) => Some(lock.max(start)),
        (lock, start) => lock.or(start),
    }
}

fn restore_all(instance: InstanceId, programmed: &[Arc<HardwareIpSlot>]) {
    for slot in programmed.iter().rev() {
        if let Err(e) = slot.ops().restore(instance) {
            warn!(slot = %slot.id(), instance = %instance, error = %e, "restore failed");
        }
    }
}
