//! Integration tests for request and dispatch of shots through a chain.
//!
//! Every test drives the core with mock IPs that record their calls into one
//! shared log, so ordering across slots can be asserted directly.

mod common;

use common::{Fixture, PRIMARY};
use isp_core::aeb::{AebState, SensorHdrMode};
use isp_core::config::CoreConfig;
use isp_core::hardware::{CallLog, IpOp, IpOps, IpResult, MockIp, ShotRequest};
use isp_core::lifecycle::InstanceDesc;
use isp_core::setfile::{SensorPosition, SetfileTable};
use isp_core::timer::ManualTimer;
use isp_core::topology::{BranchRole, ChainSpec};
use isp_core::{
    CompletionReceiver, FrameKind, FrameRequest, FrameState, InstanceId, IspCore, IspError, IspResult, Outcome,
    SlotDescriptor, SlotId, SlotMask,
};
use parking_lot::Mutex;
use std::sync::Arc;

const INSTANCE: InstanceId = InstanceId(0);

fn chain_mask() -> SlotMask {
    [SlotId(0), SlotId(1), SlotId(2)].into_iter().collect()
}

#[test]
fn test_dispatch_programs_chain_tail_first() {
    let mut f = Fixture::streaming();
    let id = f
        .core
        .request_shot(INSTANCE, FrameRequest::new(10))
        .expect("request failed");
    f.core.dispatch_shot(INSTANCE, id).expect("dispatch failed");

    assert_eq!(f.log.slots_for(IpOp::Shot), vec![SlotId(2), SlotId(1), SlotId(0)]);
    for slot in 0..3 {
        assert_eq!(f.log.fcounts_for(SlotId(slot), IpOp::Shot), vec![10]);
    }

    let record = f.record(0, id);
    assert_eq!(record.state, FrameState::Configure);
    assert_eq!(record.owner.owners(), chain_mask());
    assert!(record.trace.visited(FrameState::Request));
    assert!(f.completions().is_empty());
}

#[test]
fn test_dispatch_announces_frame_to_firmware() {
    let f = Fixture::streaming();
    let id = f
        .core
        .request_shot(INSTANCE, FrameRequest::new(4))
        .expect("request failed");
    assert!(f.firmware.messages().is_empty());

    f.core.dispatch_shot(INSTANCE, id).expect("dispatch failed");
    assert_eq!(f.firmware.messages(), vec![(INSTANCE, 4)]);
}

#[test]
fn test_shot_failure_restores_programmed_slots() {
    let mut f = Fixture::streaming();
    f.ip(1).fail_next_shots(1);
    let id = f
        .core
        .request_shot(INSTANCE, FrameRequest::new(10))
        .expect("request failed");

    let err = f.core.dispatch_shot(INSTANCE, id).unwrap_err();
    assert!(matches!(err, IspError::ShotFailed { slot: SlotId(1), .. }));

    // slot 2 was programmed before slot 1 failed; slot 0 was never reached
    assert_eq!(f.log.slots_for(IpOp::Shot), vec![SlotId(2), SlotId(1)]);
    assert_eq!(f.log.slots_for(IpOp::Restore), vec![SlotId(2)]);
    assert_eq!(
        f.log.count_where(|c| c.op == IpOp::FrameNdone(Outcome::Unprocessed)),
        3
    );

    let done = f.completions();
    assert_eq!(done.len(), 1);
    assert_eq!(done[0].fcount, 10);
    assert_eq!(done[0].outcome, Outcome::Unprocessed);
    assert!(!done[0].trace.visited(FrameState::Configure));
    assert!(f.firmware.messages().is_empty());

    // the chain stays usable
    let next = f
        .core
        .request_shot(INSTANCE, FrameRequest::new(11))
        .expect("request failed");
    f.core.dispatch_shot(INSTANCE, next).expect("dispatch failed");
    assert_eq!(f.record(0, next).state, FrameState::Configure);
}

#[test]
fn test_config_lock_dispatches_queued_frame() {
    let mut f = Fixture::streaming();
    let id = f
        .core
        .request_shot(INSTANCE, FrameRequest::new(3))
        .expect("request failed");

    f.core.on_config_lock(SlotId(0), 3).expect("config-lock failed");
    assert_eq!(f.record(0, id).state, FrameState::Configure);
    assert_eq!(f.log.fcounts_for(SlotId(0), IpOp::Shot), vec![3]);

    f.core.on_frame_start(SlotId(0), 3).expect("frame-start failed");
    f.end_frame(3, Outcome::Success);

    let done = f.completions();
    assert_eq!(done.len(), 1);
    assert_eq!(done[0].outcome, Outcome::Success);
    assert_eq!(done[0].kind, FrameKind::External);
    assert!(done[0].trace.visited(FrameState::Configure));
    assert!(done[0].trace.visited(FrameState::WaitDone));
    assert_eq!(done[0].meta.len(), 3);
    assert_eq!(f.core.instance_stats(INSTANCE).expect("stats").completed, 1);
}

#[test]
fn test_config_lock_synthesizes_internal_frame() {
    let mut f = Fixture::streaming();
    f.core.on_config_lock(SlotId(0), 11).expect("config-lock failed");

    assert_eq!(f.log.fcounts_for(SlotId(0), IpOp::Shot), vec![11]);
    let head = f.core.registry().slot(SlotId(0)).expect("slot");
    {
        let guard = head.queue().lock();
        let id = guard
            .find(FrameState::Configure, |r| r.fcount == 11)
            .expect("internal frame not configured");
        assert_eq!(guard.frame(id).map(|r| r.kind), Some(FrameKind::Internal));
    }

    f.core.on_frame_start(SlotId(0), 11).expect("frame-start failed");
    f.end_frame(11, Outcome::Success);

    assert!(f.completions().is_empty());
    assert_eq!(f.core.completions_posted(), 1);
    assert_eq!(f.core.completions_delivered(), 0);
    let stats = f.core.instance_stats(INSTANCE).expect("stats");
    assert_eq!(stats.internal_frames, 1);
    assert_eq!(stats.requested, 0);
}

#[test]
fn test_internal_frame_reuses_last_geometry() {
    let f = Fixture::streaming();
    let geometry = isp_core::FrameGeometry::new(4032, 3024);
    let id = f
        .core
        .request_shot(INSTANCE, FrameRequest::new(1).with_geometry(geometry))
        .expect("request failed");
    f.core.dispatch_shot(INSTANCE, id).expect("dispatch failed");

    f.core.on_config_lock(SlotId(0), 2).expect("config-lock failed");
    let head = f.core.registry().slot(SlotId(0)).expect("slot");
    let guard = head.queue().lock();
    let internal = guard
        .find(FrameState::Configure, |r| r.fcount == 2)
        .and_then(|id| guard.frame(id))
        .expect("internal frame not configured");
    assert_eq!(internal.kind, FrameKind::Internal);
    assert_eq!(internal.geometry, geometry);
}

#[test]
fn test_config_lock_retires_passed_requests_as_late() {
    let mut f = Fixture::streaming();
    f.core
        .request_shot(INSTANCE, FrameRequest::new(7))
        .expect("request failed");

    f.core.on_config_lock(SlotId(0), 9).expect("config-lock failed");

    let done = f.completions();
    assert_eq!(done.len(), 1);
    assert_eq!(done[0].fcount, 7);
    assert_eq!(done[0].outcome, Outcome::LateFrame);
    assert_eq!(done[0].kind, FrameKind::Late);
    assert!(!done[0].trace.visited(FrameState::Configure));

    // nothing was shot for 7; 9 was synthesised
    assert_eq!(f.log.fcounts_for(SlotId(0), IpOp::Shot), vec![9]);
    let stats = f.core.instance_stats(INSTANCE).expect("stats");
    assert_eq!(stats.late_frames, 1);
    assert_eq!(stats.internal_frames, 1);
}

#[test]
fn test_config_lock_after_frame_start_delays_request() {
    let mut f = Fixture::streaming();
    f.core
        .request_shot(INSTANCE, FrameRequest::new(12))
        .expect("request failed");

    f.core.on_frame_start(SlotId(0), 12).expect("frame-start failed");
    f.core.on_config_lock(SlotId(0), 12).expect("config-lock failed");

    let done = f.completions();
    assert_eq!(done.len(), 1);
    assert_eq!(done[0].outcome, Outcome::ConfigLockDelay);
    assert!(f.log.slots_for(IpOp::Shot).is_empty());
}

#[test]
fn test_duplicate_request_rejected() {
    let f = Fixture::streaming();
    f.core
        .request_shot(INSTANCE, FrameRequest::new(10))
        .expect("request failed");

    let err = f
        .core
        .request_shot(INSTANCE, FrameRequest::new(10))
        .unwrap_err();
    assert!(matches!(err, IspError::InvalidFrameNumber { fcount: 10, .. }));
    assert_eq!(f.core.instance_stats(INSTANCE).expect("stats").requested, 1);
}

#[test]
fn test_request_on_closed_instance_rejected() {
    let f = Fixture::three_slots();
    let err = f
        .core
        .request_shot(INSTANCE, FrameRequest::new(1))
        .unwrap_err();
    assert!(matches!(err, IspError::InstanceNotOpen(_)));
}

#[test]
fn test_queue_exhaustion_reported() {
    let f = Fixture::streaming();
    let capacity = f.core.config().queue.frames_per_queue as u64;
    for fcount in 1..=capacity {
        f.core
            .request_shot(INSTANCE, FrameRequest::new(fcount))
            .expect("request failed");
    }
    let err = f
        .core
        .request_shot(INSTANCE, FrameRequest::new(capacity + 1))
        .unwrap_err();
    assert!(matches!(err, IspError::QueueExhausted(SlotId(0))));
}

#[test]
fn test_setfile_applied_once_before_first_shot() {
    let f = Fixture::three_slots();
    let table = SetfileTable::new(SensorPosition(0))
        .with_blob(SlotId(1), 2, &b"byrp-tuning"[..])
        .with_blob(SlotId(2), 2, &b"rgbp-tuning"[..]);
    let chain = ChainSpec::linear([SlotId(0), SlotId(1), SlotId(2)]);
    f.core
        .open(InstanceDesc::new(INSTANCE, chain).with_setfile(Arc::new(table), 2))
        .expect("open failed");
    f.log.clear();

    for fcount in [1, 2] {
        let id = f
            .core
            .request_shot(INSTANCE, FrameRequest::new(fcount))
            .expect("request failed");
        f.core.dispatch_shot(INSTANCE, id).expect("dispatch failed");
    }

    assert_eq!(f.log.slots_for(IpOp::ApplySetfile(2)), vec![SlotId(1), SlotId(2)]);
    let calls = f.log.calls();
    let first_shot = calls
        .iter()
        .position(|c| c.op == IpOp::Shot)
        .expect("no shot");
    let last_apply = calls
        .iter()
        .rposition(|c| c.op == IpOp::ApplySetfile(2))
        .expect("no apply");
    assert!(last_apply < first_shot);
}

#[test]
fn test_aeb_switching_skips_then_adds_short_exposure() {
    let mut slots = PRIMARY.to_vec();
    slots.push((3, "mcsc"));
    let mut f = Fixture::new(CoreConfig::default(), &slots);
    let chain = ChainSpec::linear([SlotId(0), SlotId(1), SlotId(2)]).with_branch(
        SlotId(0),
        [SlotId(3)],
        BranchRole::ShortExposure,
    );
    f.core
        .open(InstanceDesc::new(INSTANCE, chain))
        .expect("open failed");
    f.log.clear();

    assert_eq!(
        f.core.update_aeb(INSTANCE, SensorHdrMode::Bracketed).expect("aeb"),
        AebState::Switching
    );
    f.core
        .request_shot(INSTANCE, FrameRequest::new(5))
        .expect("request failed");
    f.core.on_config_lock(SlotId(0), 5).expect("config-lock failed");
    assert!(f.log.slots_for(IpOp::Shot).is_empty());

    assert_eq!(
        f.core.update_aeb(INSTANCE, SensorHdrMode::Bracketed).expect("aeb"),
        AebState::TwoExposure
    );
    f.core
        .request_shot(INSTANCE, FrameRequest::new(6))
        .expect("request failed");
    f.core.on_config_lock(SlotId(0), 6).expect("config-lock failed");

    assert_eq!(f.log.fcounts_for(SlotId(0), IpOp::Shot), vec![6]);
    assert_eq!(f.log.fcounts_for(SlotId(3), IpOp::Shot), vec![6]);

    // the request skipped at 5 is retired once its window passes
    let done = f.completions();
    assert_eq!(done.len(), 1);
    assert_eq!(done[0].fcount, 5);
    assert_eq!(done[0].outcome, Outcome::LateFrame);

    let stats = f.core.instance_stats(INSTANCE).expect("stats");
    assert_eq!(stats.skipped_shots, 1);
    assert_eq!(stats.internal_frames, 1);

    assert_eq!(
        f.core.update_aeb(INSTANCE, SensorHdrMode::Single).expect("aeb"),
        AebState::Single
    );
}

#[test]
fn test_aeb_without_short_branch_falls_back_to_single() {
    let f = Fixture::streaming();
    f.core
        .update_aeb(INSTANCE, SensorHdrMode::Bracketed)
        .expect("aeb");
    f.core
        .update_aeb(INSTANCE, SensorHdrMode::Bracketed)
        .expect("aeb");

    f.core.on_config_lock(SlotId(0), 1).expect("config-lock failed");

    let instance = f.core.registry().instance(INSTANCE).expect("instance");
    assert_eq!(instance.aeb_state(), AebState::Single);
    assert_eq!(f.log.fcounts_for(SlotId(0), IpOp::Shot), vec![1]);
}

#[test]
fn test_aeb_disabled_ignores_bracketed_mode() {
    let mut config = CoreConfig::default();
    config.aeb.enabled = false;
    let f = Fixture::new(config, &PRIMARY);
    f.open_linear(INSTANCE, &[0, 1, 2]);

    for _ in 0..2 {
        assert_eq!(
            f.core.update_aeb(INSTANCE, SensorHdrMode::Bracketed).expect("aeb"),
            AebState::Single
        );
    }
}

// =============================================================================
// Interrupts preempting a dispatch
// =============================================================================

type Interrupt = Box<dyn FnOnce() -> IspResult<()> + Send>;

/// Tail block that runs an interrupt handler from inside its next shot, the way
/// a config-lock preempts a request-context dispatch mid-chain.
struct PreemptedIp {
    inner: MockIp,
    interrupt: Mutex<Option<Interrupt>>,
    result: Mutex<Option<IspResult<()>>>,
}

impl PreemptedIp {
    fn raise_during_next_shot(&self, interrupt: Interrupt) {
        *self.interrupt.lock() = Some(interrupt);
    }

    fn interrupt_result(&self) -> IspResult<()> {
        self.result.lock().take().expect("interrupt never ran")
    }
}

impl IpOps for PreemptedIp {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn open(&self, instance: InstanceId) -> IpResult<()> {
        self.inner.open(instance)
    }

    fn close(&self, instance: InstanceId) -> IpResult<()> {
        self.inner.close(instance)
    }

    fn shot(&self, request: &ShotRequest, hw_mask: SlotMask) -> IpResult<()> {
        let interrupt = self.interrupt.lock().take();
        if let Some(interrupt) = interrupt {
            let result = interrupt();
            *self.result.lock() = Some(result);
        }
        self.inner.shot(request, hw_mask)
    }

    fn restore(&self, instance: InstanceId) -> IpResult<()> {
        self.inner.restore(instance)
    }
}

/// Chain 0 -> 1 -> 2 open for `INSTANCE`, with slot 2 preemptible.
fn preemptible_chain() -> (IspCore, CompletionReceiver, CallLog, Arc<PreemptedIp>) {
    let log = CallLog::new();
    let tail = Arc::new(PreemptedIp {
        inner: MockIp::new(SlotId(2), "rgbp", log.clone()),
        interrupt: Mutex::new(None),
        result: Mutex::new(None),
    });
    let mut builder = IspCore::builder(CoreConfig::default());
    for (id, name) in &PRIMARY[..2] {
        let ip = Arc::new(MockIp::new(SlotId(*id), *name, log.clone()));
        builder = builder.slot(SlotDescriptor::new(SlotId(*id), ip, Arc::new(ManualTimer::new())));
    }
    builder = builder.slot(SlotDescriptor::new(SlotId(2), tail.clone(), Arc::new(ManualTimer::new())));
    let (core, events) = builder.build().expect("Failed to build core");
    core.open(InstanceDesc::new(
        INSTANCE,
        ChainSpec::linear([SlotId(0), SlotId(1), SlotId(2)]),
    ))
    .expect("Failed to open instance");
    log.clear();
    (core, events, log, tail)
}

#[test]
fn test_config_lock_during_dispatch_leaves_frame_to_dispatcher() {
    let (core, mut events, log, tail) = preemptible_chain();
    let id = core
        .request_shot(INSTANCE, FrameRequest::new(10))
        .expect("request failed");

    let irq = core.clone();
    tail.raise_during_next_shot(Box::new(move || irq.on_config_lock(SlotId(0), 10)));
    core.dispatch_shot(INSTANCE, id).expect("dispatch failed");
    tail.interrupt_result().expect("config-lock failed");

    // one set of shots, nothing rolled back
    assert_eq!(log.slots_for(IpOp::Shot), vec![SlotId(2), SlotId(1), SlotId(0)]);
    for slot in 0..3 {
        assert_eq!(log.count(SlotId(slot), IpOp::Restore), 0);
    }

    let head = core.registry().slot(SlotId(0)).expect("slot");
    let guard = head.queue().lock();
    let record = guard.frame(id).expect("frame");
    assert_eq!(record.state, FrameState::Configure);
    assert_eq!(record.owner.owners(), chain_mask());
    assert!(!record.is_dispatching());
    // no internal frame was made up for the claimed fcount
    assert_eq!(guard.count(FrameState::Request), 0);
    assert_eq!(guard.count(FrameState::Configure), 1);
    drop(guard);

    assert!(events.drain_completions().is_empty());
    assert_eq!(core.instance_stats(INSTANCE).expect("stats").internal_frames, 0);
}

#[test]
fn test_second_dispatch_of_claimed_frame_rejected() {
    let (core, mut events, log, tail) = preemptible_chain();
    let id = core
        .request_shot(INSTANCE, FrameRequest::new(3))
        .expect("request failed");

    let other = core.clone();
    tail.raise_during_next_shot(Box::new(move || other.dispatch_shot(INSTANCE, id)));
    core.dispatch_shot(INSTANCE, id).expect("dispatch failed");

    let err = tail.interrupt_result().unwrap_err();
    assert!(matches!(err, IspError::DispatchInProgress { frame } if frame == id));
    assert_eq!(log.slots_for(IpOp::Shot).len(), 3);
    assert_eq!(log.slots_for(IpOp::Restore).len(), 0);
    assert!(events.drain_completions().is_empty());
}
