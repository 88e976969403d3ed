//! Integration tests for frame-start/frame-end handling, the stuck-frame
//! watchdog and the NDONE paths.

mod common;

use common::{Fixture, PRIMARY};
use isp_core::config::CoreConfig;
use isp_core::hardware::IpOp;
use isp_core::timer::OneShotTimer;
use isp_core::{
    FrameGeometry, FrameId, FrameKind, FrameRequest, FrameState, InstanceId, IpError, IpErrorKind, IspError, Outcome,
    PipelineEvent, SlotId, SlotMask,
};
use tracing_test::traced_test;

const INSTANCE: InstanceId = InstanceId(0);

fn dispatch(f: &Fixture, fcount: u64) -> FrameId {
    let id = f
        .core
        .request_shot(INSTANCE, FrameRequest::new(fcount))
        .expect("request failed");
    f.core.dispatch_shot(INSTANCE, id).expect("dispatch failed");
    id
}

fn start(f: &Fixture, fcount: u64) {
    f.core
        .on_frame_start(SlotId(0), fcount)
        .expect("frame-start failed");
}

/// Frame 12 started but never ended, frame 13 configured behind it.
fn stalled() -> Fixture {
    let f = Fixture::streaming();
    dispatch(&f, 12);
    start(&f, 12);
    dispatch(&f, 13);
    f.log.clear();
    f
}

// =============================================================================
// Watchdog
// =============================================================================

#[test]
fn test_watchdog_times_out_stuck_chain() {
    let mut f = stalled();
    assert!(f.timer(0).is_armed());
    assert!(f.timer(0).fire());

    let done = f.completions();
    assert_eq!(done.iter().map(|c| c.fcount).collect::<Vec<_>>(), vec![12, 13]);
    for completion in &done {
        assert_eq!(completion.outcome, Outcome::Timeout);
        assert!(completion.trace.visited(FrameState::WaitDone));
    }

    assert_eq!(f.core.registry().dumps(), 1);
    for slot in 0..3 {
        assert_eq!(f.log.count(SlotId(slot), IpOp::DumpRegs), 1);
        assert_eq!(f.log.count(SlotId(slot), IpOp::NotifyTimeout), 1);
        assert_eq!(f.log.count(SlotId(slot), IpOp::FrameNdone(Outcome::Timeout)), 2);
    }

    let head = f.core.registry().slot(SlotId(0)).expect("slot");
    assert!(head.is_stalled());
    assert_eq!(head.stuck_streak(), 1);
    // not escalated yet, so the watchdog is armed again
    assert!(f.timer(0).is_armed());
}

#[test]
fn test_contended_watchdog_expiry_rearms_and_retries() {
    let mut f = stalled();
    let head = f.core.registry().slot(SlotId(0)).expect("slot");
    {
        // request context holds the queue while the timer fires
        let _held = head.queue().lock();
        assert!(f.timer(0).fire());
    }
    assert!(f.completions().is_empty());
    assert!(head.is_stalled());
    assert_eq!(head.stuck_streak(), 0);
    assert!(f.timer(0).is_armed());

    assert!(f.timer(0).fire());
    let done = f.completions();
    assert_eq!(done.iter().map(|c| c.fcount).collect::<Vec<_>>(), vec![12, 13]);
    assert!(done.iter().all(|c| c.outcome == Outcome::Timeout));
    assert_eq!(f.core.registry().dumps(), 1);
    assert_eq!(f.log.count(SlotId(0), IpOp::NotifyTimeout), 1);
    assert_eq!(head.stuck_streak(), 1);
    assert!(f.timer(0).is_armed());
}

#[test]
fn test_watchdog_healthy_chain_is_left_alone() {
    let mut f = Fixture::streaming();
    f.core
        .request_shot(INSTANCE, FrameRequest::new(1))
        .expect("request failed");
    f.run_frame(1);
    assert_eq!(f.completions().len(), 1);

    assert!(f.timer(0).fire());
    assert_eq!(f.core.registry().dumps(), 0);
    assert_eq!(f.log.count(SlotId(0), IpOp::NotifyTimeout), 0);
    assert!(f.completions().is_empty());
}

#[test]
fn test_repeated_stall_requests_force_restart() {
    let mut f = stalled();
    let limit = f.core.config().watchdog.max_consecutive_timeouts;

    for _ in 0..limit {
        assert!(f.timer(0).fire());
    }

    let restarts: Vec<_> = f
        .events
        .drain()
        .into_iter()
        .filter_map(|event| match event {
            PipelineEvent::ForceRestart { instance, .. } => Some(instance),
            PipelineEvent::Completed(_) => None,
        })
        .collect();
    assert_eq!(restarts, vec![INSTANCE]);

    // one dump for the whole stall
    assert_eq!(f.core.registry().dumps(), 1);
    let head = f.core.registry().slot(SlotId(0)).expect("slot");
    assert_eq!(head.stuck_streak(), 0);
    assert!(!f.timer(0).is_armed());
}

#[test]
fn test_successful_frame_clears_stall() {
    let mut f = stalled();
    assert!(f.timer(0).fire());
    f.completions();

    f.core
        .request_shot(INSTANCE, FrameRequest::new(20))
        .expect("request failed");
    f.run_frame(20);
    let done = f.completions();
    assert_eq!(done.len(), 1);
    assert_eq!(done[0].outcome, Outcome::Success);

    let head = f.core.registry().slot(SlotId(0)).expect("slot");
    assert!(!head.is_stalled());
    assert_eq!(head.stuck_streak(), 0);

    assert!(f.timer(0).fire());
    assert_eq!(f.core.registry().dumps(), 1);
}

#[test]
#[traced_test]
fn test_stuck_chain_is_logged() {
    let f = stalled();
    f.timer(0).fire();
    assert!(logs_contain("chain stuck"));
    assert!(logs_contain("chain diagnostic dump"));
}

// =============================================================================
// Frame start
// =============================================================================

#[test]
fn test_late_request_completes_without_shot() {
    let mut f = Fixture::streaming();
    start(&f, 8);

    let id = f
        .core
        .request_shot(INSTANCE, FrameRequest::new(5))
        .expect("late request should still be accepted");

    let done = f.completions();
    assert_eq!(done.len(), 1);
    assert_eq!(done[0].frame, id);
    assert_eq!(done[0].fcount, 5);
    assert_eq!(done[0].kind, FrameKind::Late);
    assert_eq!(done[0].outcome, Outcome::LateFrame);
    assert!(!done[0].trace.visited(FrameState::Configure));
    assert!(f.log.slots_for(IpOp::Shot).is_empty());
}

#[test]
fn test_late_frame_dispatch_after_config_lock() {
    let mut f = Fixture::streaming();
    f.core.on_config_lock(SlotId(0), 8).expect("config-lock failed");
    f.completions();

    f.core
        .request_shot(INSTANCE, FrameRequest::new(5))
        .expect("late request should still be accepted");
    let done = f.completions();
    assert_eq!(done.len(), 1);
    assert_eq!(done[0].outcome, Outcome::LateFrame);
    assert_eq!(f.core.instance_stats(INSTANCE).expect("stats").late_frames, 1);
}

#[test]
fn test_stale_configured_frame_invalidated() {
    let mut f = Fixture::streaming();
    dispatch(&f, 10);

    start(&f, 11);

    let done = f.completions();
    assert_eq!(done.len(), 1);
    assert_eq!(done[0].fcount, 10);
    assert_eq!(done[0].outcome, Outcome::InvalidFrameNumber);
    assert_eq!(
        f.log.count_where(|c| c.op == IpOp::FrameNdone(Outcome::InvalidFrameNumber)),
        3
    );
}

#[test]
fn test_multi_buffer_frame_spans_its_buffers() {
    let mut f = Fixture::streaming();
    let geometry = FrameGeometry {
        width: 1920,
        height: 1080,
        num_buffers: 4,
    };
    let id = f
        .core
        .request_shot(INSTANCE, FrameRequest::new(20).with_geometry(geometry))
        .expect("request failed");
    f.core.dispatch_shot(INSTANCE, id).expect("dispatch failed");
    assert_eq!(f.record(0, id).kind, FrameKind::Multi);

    start(&f, 21);
    assert_eq!(f.record(0, id).state, FrameState::WaitDone);
    assert!(f.completions().is_empty());

    f.end_frame(20, Outcome::Success);
    let done = f.completions();
    assert_eq!(done.len(), 1);
    assert_eq!(done[0].outcome, Outcome::Success);
}

#[test]
fn test_wait_done_overflow_drops_oldest() {
    let mut f = Fixture::streaming();
    let limit = f.core.config().queue.max_wait_done as u64;
    for fcount in 1..=limit + 1 {
        dispatch(&f, fcount);
    }
    for fcount in 1..=limit + 1 {
        start(&f, fcount);
    }

    let done = f.completions();
    assert_eq!(done.len(), 1);
    assert_eq!(done[0].fcount, 1);
    assert_eq!(done[0].outcome, Outcome::Drop);

    let head = f.core.registry().slot(SlotId(0)).expect("slot");
    assert_eq!(head.queue().lock().count(FrameState::WaitDone), limit as usize);
}

// =============================================================================
// Frame end
// =============================================================================

#[test]
fn test_owners_drain_before_completion() {
    let mut f = Fixture::streaming();
    let id = dispatch(&f, 1);
    start(&f, 1);

    f.core
        .on_frame_end(SlotId(2), 1, Outcome::Success)
        .expect("frame-end failed");
    let record = f.record(0, id);
    assert!(record.owner.is_draining());
    assert_eq!(
        record.owner.owners(),
        [SlotId(0), SlotId(1)].into_iter().collect::<SlotMask>()
    );
    assert!(f.completions().is_empty());

    f.core
        .on_frame_end(SlotId(1), 1, Outcome::Success)
        .expect("frame-end failed");
    assert!(f.completions().is_empty());

    f.core
        .on_frame_end(SlotId(0), 1, Outcome::Success)
        .expect("frame-end failed");
    let done = f.completions();
    assert_eq!(done.len(), 1);
    assert_eq!(
        done[0].meta.iter().map(|(slot, _)| *slot).collect::<Vec<_>>(),
        vec![SlotId(2), SlotId(1), SlotId(0)]
    );
    assert_eq!(f.record(0, id).state, FrameState::Free);
}

#[test]
fn test_frame_end_after_completion_is_ignored() {
    let mut f = Fixture::streaming();
    dispatch(&f, 1);
    start(&f, 1);
    f.end_frame(1, Outcome::Success);
    f.end_frame(1, Outcome::Success);

    assert_eq!(f.completions().len(), 1);
    assert_eq!(f.core.completions_posted(), 1);

    let err = f
        .core
        .frame_ndone(SlotId(0), 1, Outcome::Timeout)
        .unwrap_err();
    assert!(matches!(err, IspError::FrameNotFound { fcount: 1, .. }));
}

#[test]
fn test_frame_ndone_timeout_dumps_after_earlier_stall() {
    let mut f = stalled();
    assert!(f.timer(0).fire());
    f.completions();
    assert_eq!(f.core.registry().dumps(), 1);

    dispatch(&f, 20);
    start(&f, 20);
    f.core
        .frame_ndone(SlotId(0), 20, Outcome::Timeout)
        .expect("ndone failed");

    let done = f.completions();
    assert_eq!(done.len(), 1);
    assert_eq!(done[0].outcome, Outcome::Timeout);
    assert_eq!(f.core.registry().dumps(), 2);
    assert_eq!(f.log.count(SlotId(0), IpOp::DumpRegs), 2);
}

#[test]
fn test_frame_end_completes_routed_instance_on_shared_head() {
    let mut f = Fixture::three_slots();
    f.open_linear(InstanceId(0), &[0, 1, 2]);
    f.open_linear(InstanceId(1), &[0, 1, 2]);

    let ids: Vec<FrameId> = [InstanceId(0), InstanceId(1)]
        .into_iter()
        .map(|instance| {
            f.core
                .request_shot(instance, FrameRequest::new(5))
                .expect("request failed")
        })
        .collect();
    // both reach WAIT_DONE for fcount 5, instance 0 first
    for (instance, id) in [InstanceId(0), InstanceId(1)].into_iter().zip(ids) {
        f.core.dispatch_shot(instance, id).expect("dispatch failed");
        start(&f, 5);
    }
    f.end_frame(5, Outcome::Success);

    let done = f.completions();
    assert_eq!(done.len(), 1);
    assert_eq!(done[0].instance, InstanceId(1));

    let head = f.core.registry().slot(SlotId(0)).expect("slot");
    let guard = head.queue().lock();
    let waiting = guard.ids(FrameState::WaitDone);
    assert_eq!(waiting.len(), 1);
    assert_eq!(guard.frame(waiting[0]).expect("frame").instance, InstanceId(0));
}

#[test]
fn test_first_failure_result_sticks() {
    let mut f = Fixture::streaming();
    dispatch(&f, 1);
    start(&f, 1);

    f.core
        .on_frame_end(SlotId(2), 1, Outcome::Overflow)
        .expect("frame-end failed");
    f.core
        .on_frame_end(SlotId(1), 1, Outcome::Unprocessed)
        .expect("frame-end failed");
    f.core
        .on_frame_end(SlotId(0), 1, Outcome::Success)
        .expect("frame-end failed");

    let done = f.completions();
    assert_eq!(done.len(), 1);
    assert_eq!(done[0].outcome, Outcome::Overflow);
    // metadata is only collected for successful ends
    assert_eq!(done[0].meta.len(), 1);

    let stats = f.core.instance_stats(INSTANCE).expect("stats");
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.completed, 0);
}

#[test]
fn test_frame_ndone_completes_whole_chain() {
    let mut f = Fixture::streaming();
    dispatch(&f, 3);
    start(&f, 3);

    f.core
        .frame_ndone(SlotId(0), 3, Outcome::Overflow)
        .expect("ndone failed");

    let done = f.completions();
    assert_eq!(done.len(), 1);
    assert_eq!(done[0].outcome, Outcome::Overflow);
    assert_eq!(f.log.slots_for(IpOp::FrameNdone(Outcome::Overflow)), vec![SlotId(0), SlotId(1), SlotId(2)]);
}

#[test]
fn test_dma_done_counted() {
    let f = Fixture::streaming();
    f.core.on_dma_done(SlotId(1)).expect("dma-done failed");
    f.core.on_dma_done(SlotId(1)).expect("dma-done failed");
    assert_eq!(f.core.slot_counters(SlotId(1)).expect("counters").dma_done, 2);
    assert_eq!(f.core.slot_counters(SlotId(0)).expect("counters").dma_done, 0);
}

// =============================================================================
// Firmware
// =============================================================================

#[test]
fn test_firmware_rejection_marks_frame_unprocessed() {
    let mut f = Fixture::streaming();
    dispatch(&f, 1);
    f.core
        .on_firmware_response(
            INSTANCE,
            1,
            Err(IpError::new("firmware", IpErrorKind::Firmware, "rejected")),
        )
        .expect("firmware response failed");
    start(&f, 1);
    f.end_frame(1, Outcome::Success);

    let done = f.completions();
    assert_eq!(done.len(), 1);
    assert_eq!(done[0].outcome, Outcome::Unprocessed);
}

#[test]
fn test_firmware_send_failure_marks_frame_unprocessed() {
    let mut f = Fixture::streaming();
    f.firmware.set_fail(true);
    dispatch(&f, 1);
    start(&f, 1);
    f.end_frame(1, Outcome::Success);

    let done = f.completions();
    assert_eq!(done.len(), 1);
    assert_eq!(done[0].outcome, Outcome::Unprocessed);
}

#[test]
fn test_orphan_firmware_response_counted() {
    let f = Fixture::streaming();
    f.core
        .on_firmware_response(INSTANCE, 99, Ok(()))
        .expect("firmware response failed");
    assert_eq!(
        f.core.instance_stats(INSTANCE).expect("stats").firmware_orphans,
        1
    );
}

// =============================================================================
// Flush / dump
// =============================================================================

#[test]
fn test_force_flush_completes_every_frame() {
    let mut f = Fixture::streaming();
    dispatch(&f, 1);
    start(&f, 1);
    dispatch(&f, 2);
    f.core
        .request_shot(INSTANCE, FrameRequest::new(3))
        .expect("request failed");

    let flushed = f
        .core
        .force_flush(INSTANCE, Outcome::Unprocessed)
        .expect("flush failed");
    assert_eq!(flushed, 3);

    let done = f.completions();
    assert_eq!(done.iter().map(|c| c.fcount).collect::<Vec<_>>(), vec![1, 2, 3]);
    assert!(done.iter().all(|c| c.outcome == Outcome::Unprocessed));

    let head = f.core.registry().slot(SlotId(0)).expect("slot");
    let capacity = head.queue().capacity();
    assert_eq!(head.queue().lock().count(FrameState::Free), capacity);
}

#[test]
fn test_dump_state_reports_queues_and_counters() {
    let f = Fixture::streaming();
    f.core
        .request_shot(INSTANCE, FrameRequest::new(1))
        .expect("request failed");
    f.core.on_config_lock(SlotId(0), 1).expect("config-lock failed");

    let dump = f.core.dump_state(INSTANCE).expect("dump failed");
    assert_eq!(dump.instance, INSTANCE);
    assert_eq!(dump.queues.len(), 1);
    assert_eq!(dump.queues[0].head, SlotId(0));
    assert_eq!(dump.queues[0].count(FrameState::Configure), 1);
    assert_eq!(dump.counters.len(), 3);
    assert_eq!(dump.counters[0].1.config_lock, 1);
    assert_eq!(f.core.registry().dumps(), 1);
    assert_eq!(f.log.slots_for(IpOp::DumpRegs), vec![SlotId(0), SlotId(1), SlotId(2)]);
}

#[test]
fn test_frames_of_other_instances_untouched_by_flush() {
    let mut slots = PRIMARY.to_vec();
    slots.extend([(3, "csis1"), (4, "byrp1")]);
    let mut f = Fixture::new(CoreConfig::default(), &slots);
    f.open_linear(InstanceId(0), &[0, 1, 2]);
    f.open_linear(InstanceId(1), &[3, 4]);

    dispatch(&f, 1);
    let other = f
        .core
        .request_shot(InstanceId(1), FrameRequest::new(1))
        .expect("request failed");

    f.core
        .force_flush(INSTANCE, Outcome::Unprocessed)
        .expect("flush failed");
    let done = f.completions();
    assert_eq!(done.len(), 1);
    assert_eq!(done[0].instance, INSTANCE);
    assert_eq!(f.record(3, other).state, FrameState::Request);
}
