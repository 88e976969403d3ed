//! Recording collaborator doubles.
//!
//! Used by the integration tests and by the `isp-sim` binary in place of real
//! hardware blocks.
//!
//! # Available Mocks
//!
//! - `MockIp` - per-IP operation table that records every call into a shared
//!   [`CallLog`] and can be told to fail `open`, `shot` or `restore`
//! - `MockFirmware` - firmware channel that records shot messages
//!
//! Several `MockIp`s share one `CallLog` so tests can assert cross-slot ordering
//! (for example that a chain was programmed tail first).

use super::{FirmwareChannel, FrameMeta, IpOps, IpResult, ParamMap, ParamRegion, ShotRequest};
use crate::error::{IpError, IpErrorKind};
use crate::frame::{FrameInfo, Outcome};
use crate::mask::{InstanceId, SlotId, SlotMask};
use crate::setfile::SetfileBlob;
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

// =============================================================================
// CallLog
// =============================================================================

/// Operation recorded by a mock.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpOp {
    Open,
    Close,
    Init,
    Deinit,
    SetParam,
    Shot,
    Restore,
    FrameNdone(Outcome),
    Enable,
    Disable,
    LoadSetfile,
    ApplySetfile(u32),
    DeleteSetfile,
    GetMeta,
    NotifyTimeout,
    DumpRegs,
}

/// One recorded call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpCall {
    /// Slot the mock stands in for.
    pub slot: SlotId,
    /// What was called.
    pub op: IpOp,
    /// Instance argument.
    pub instance: InstanceId,
    /// Frame count, for frame-scoped calls.
    pub fcount: Option<u64>,
}

/// Shared, ordered record of mock calls.
#[derive(Debug, Clone, Default)]
pub struct CallLog {
    calls: Arc<Mutex<Vec<IpCall>>>,
}

impl CallLog {
    /// Empty log.
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&self, call: IpCall) {
        self.calls.lock().push(call);
    }

    /// Every call so far, in order.
    pub fn calls(&self) -> Vec<IpCall> {
        self.calls.lock().clone()
    }

    /// Slots that saw `op`, in call order.
    pub fn slots_for(&self, op: IpOp) -> Vec<SlotId> {
        self.calls
            .lock()
            .iter()
            .filter(|c| c.op == op)
            .map(|c| c.slot)
            .collect()
    }

    /// Frame counts passed to `op` on `slot`, in call order.
    pub fn fcounts_for(&self, slot: SlotId, op: IpOp) -> Vec<u64> {
        self.calls
            .lock()
            .iter()
            .filter(|c| c.slot == slot && c.op == op)
            .filter_map(|c| c.fcount)
            .collect()
    }

    /// Number of times `slot` saw `op`.
    pub fn count(&self, slot: SlotId, op: IpOp) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|c| c.slot == slot && c.op == op)
            .count()
    }

    /// Number of calls matching `predicate` across all slots.
    pub fn count_where<P: Fn(&IpCall) -> bool>(&self, predicate: P) -> usize {
        self.calls.lock().iter().filter(|c| predicate(c)).count()
    }

    /// Forget everything.
    pub fn clear(&self) {
        self.calls.lock().clear();
    }
}

// =============================================================================
// MockIp
// =============================================================================

/// Recording per-IP operation table.
#[derive(Debug)]
pub struct MockIp {
    slot: SlotId,
    name: String,
    log: CallLog,
    fail_open: AtomicBool,
    fail_restore: AtomicBool,
    shot_failures: AtomicU32,
    emit_meta: AtomicBool,
}

impl MockIp {
    /// Mock for `slot` recording into `log`.
    pub fn new(slot: SlotId, name: impl Into<String>, log: CallLog) -> Self {
        Self {
            slot,
            name: name.into(),
            log,
            fail_open: AtomicBool::new(false),
            fail_restore: AtomicBool::new(false),
            shot_failures: AtomicU32::new(0),
            emit_meta: AtomicBool::new(true),
        }
    }

    /// Shared log.
    pub fn log(&self) -> &CallLog {
        &self.log
    }

    /// Make the next `count` shots fail.
    pub fn fail_next_shots(&self, count: u32) {
        self.shot_failures.store(count, Ordering::SeqCst);
    }

    /// Make `restore` fail until reset.
    pub fn set_fail_restore(&self, fail: bool) {
        self.fail_restore.store(fail, Ordering::SeqCst);
    }

    /// Make `open` fail until reset.
    pub fn set_fail_open(&self, fail: bool) {
        self.fail_open.store(fail, Ordering::SeqCst);
    }

    /// Whether `get_meta` returns data.
    pub fn set_emit_meta(&self, emit: bool) {
        self.emit_meta.store(emit, Ordering::SeqCst);
    }

    fn record(&self, op: IpOp, instance: InstanceId, fcount: Option<u64>) {
        self.log.record(IpCall {
            slot: self.slot,
            op,
            instance,
            fcount,
        });
    }

    fn error(&self, kind: IpErrorKind, message: &str) -> IpError {
        IpError::new(self.name.clone(), kind, message)
    }
}

impl IpOps for MockIp {
    fn name(&self) -> &str {
        &self.name
    }

    fn open(&self, instance: InstanceId) -> IpResult<()> {
        self.record(IpOp::Open, instance, None);
        if self.fail_open.load(Ordering::SeqCst) {
            return Err(self.error(IpErrorKind::Initialization, "injected open failure"));
        }
        Ok(())
    }

    fn close(&self, instance: InstanceId) -> IpResult<()> {
        self.record(IpOp::Close, instance, None);
        Ok(())
    }

    fn init(&self, instance: InstanceId) -> IpResult<()> {
        self.record(IpOp::Init, instance, None);
        Ok(())
    }

    fn deinit(&self, instance: InstanceId) -> IpResult<()> {
        self.record(IpOp::Deinit, instance, None);
        Ok(())
    }

    fn set_param(&self, _region: &ParamRegion, _pmap: ParamMap, instance: InstanceId) -> IpResult<()> {
        self.record(IpOp::SetParam, instance, None);
        Ok(())
    }

    fn shot(&self, request: &ShotRequest, _hw_mask: SlotMask) -> IpResult<()> {
        self.record(IpOp::Shot, request.instance, Some(request.fcount));
        let injected = self
            .shot_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(self.error(IpErrorKind::Shot, "injected shot failure"));
        }
        Ok(())
    }

    fn restore(&self, instance: InstanceId) -> IpResult<()> {
        self.record(IpOp::Restore, instance, None);
        if self.fail_restore.load(Ordering::SeqCst) {
            return Err(self.error(IpErrorKind::Restore, "injected restore failure"));
        }
        Ok(())
    }

    fn frame_ndone(&self, frame: &FrameInfo, outcome: Outcome) -> IpResult<()> {
        self.record(IpOp::FrameNdone(outcome), frame.instance, Some(frame.fcount));
        Ok(())
    }

    fn enable(&self, instance: InstanceId, _hw_mask: SlotMask) -> IpResult<()> {
        self.record(IpOp::Enable, instance, None);
        Ok(())
    }

    fn disable(&self, instance: InstanceId, _hw_mask: SlotMask) -> IpResult<()> {
        self.record(IpOp::Disable, instance, None);
        Ok(())
    }

    fn load_setfile(&self, instance: InstanceId, _blob: &SetfileBlob) -> IpResult<()> {
        self.record(IpOp::LoadSetfile, instance, None);
        Ok(())
    }

    fn apply_setfile(&self, instance: InstanceId, scenario: u32) -> IpResult<()> {
        self.record(IpOp::ApplySetfile(scenario), instance, None);
        Ok(())
    }

    fn delete_setfile(&self, instance: InstanceId) -> IpResult<()> {
        self.record(IpOp::DeleteSetfile, instance, None);
        Ok(())
    }

    fn get_meta(&self, frame: &FrameInfo) -> Option<FrameMeta> {
        self.record(IpOp::GetMeta, frame.instance, Some(frame.fcount));
        if !self.emit_meta.load(Ordering::SeqCst) {
            return None;
        }
        Some(FrameMeta(Bytes::from(frame.fcount.to_le_bytes().to_vec())))
    }

    fn notify_timeout(&self, instance: InstanceId) {
        self.record(IpOp::NotifyTimeout, instance, None);
    }

    fn dump_regs(&self, instance: InstanceId) {
        self.record(IpOp::DumpRegs, instance, None);
    }
}

// =============================================================================
// MockFirmware
// =============================================================================

/// Firmware channel that records every shot message.
#[derive(Debug, Default)]
pub struct MockFirmware {
    messages: Mutex<Vec<(InstanceId, u64)>>,
    fail: AtomicBool,
}

impl MockFirmware {
    /// Empty channel.
    pub fn new() -> Self {
        Self::default()
    }

    /// Messages sent so far as `(instance, fcount)`.
    pub fn messages(&self) -> Vec<(InstanceId, u64)> {
        self.messages.lock().clone()
    }

    /// Make sends fail until reset.
    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }
}

impl FirmwareChannel for MockFirmware {
    fn send_shot_message(&self, instance: InstanceId, _frame: &FrameInfo, fcount: u64) -> IpResult<()> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(IpError::new("firmware", IpErrorKind::Firmware, "injected send failure"));
        }
        self.messages.lock().push((instance, fcount));
        Ok(())
    }
}
