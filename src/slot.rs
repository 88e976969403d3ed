//! Per-IP runtime state.
//!
//! A [`HardwareIpSlot`] is registered once and lives as long as the registry.
//! Its *active* lifetime (open to close) is reference counted across the
//! instances sharing it. The slot owns a frame queue, used when it heads a
//! chain, and the watchdog timer and timestamp log that go with that queue.

use crate::hardware::{IpOps, ParamRegion};
use crate::mask::{InstanceId, InstanceMask, SlotId};
use crate::queue::FrameQueue;
use crate::timelog::FrameTimeLog;
use crate::timer::OneShotTimer;
use bitflags::bitflags;
use parking_lot::{Mutex, MutexGuard};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

bitflags! {
    /// Runtime state of a slot.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct SlotFlags: u32 {
        /// Physically open.
        const OPEN = 1 << 0;
        /// At least one instance ran `init`.
        const INITIALIZED = 1 << 1;
        /// Streaming.
        const RUNNING = 1 << 2;
        /// A config-lock has been seen since the last frame start.
        const CONFIG_LOCKED = 1 << 3;
        /// Fed on-the-fly by the previous block instead of from memory.
        const OTF_MODE = 1 << 4;
    }
}

// =============================================================================
// Counters
// =============================================================================

/// Debug counters, zeroed on physical open.
#[derive(Debug, Default)]
pub struct SlotCounters {
    frame_start: AtomicU64,
    config_lock: AtomicU64,
    frame_end: AtomicU64,
    dma_done: AtomicU64,
}

/// Point-in-time copy of [`SlotCounters`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CounterSnapshot {
    /// Frame-start interrupts.
    pub frame_start: u64,
    /// Config-lock interrupts.
    pub config_lock: u64,
    /// Frame-end interrupts.
    pub frame_end: u64,
    /// DMA-done interrupts.
    pub dma_done: u64,
}

impl SlotCounters {
    pub(crate) fn frame_start(&self) {
        self.frame_start.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn config_lock(&self) {
        self.config_lock.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn frame_end(&self) {
        self.frame_end.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn dma_done(&self) {
        self.dma_done.fetch_add(1, Ordering::Relaxed);
    }

    /// Current values.
    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            frame_start: self.frame_start.load(Ordering::Relaxed),
            config_lock: self.config_lock.load(Ordering::Relaxed),
            frame_end: self.frame_end.load(Ordering::Relaxed),
            dma_done: self.dma_done.load(Ordering::Relaxed),
        }
    }

    fn reset(&self) {
        self.frame_start.store(0, Ordering::Relaxed);
        self.config_lock.store(0, Ordering::Relaxed);
        self.frame_end.store(0, Ordering::Relaxed);
        self.dma_done.store(0, Ordering::Relaxed);
    }
}

// =============================================================================
// Cursor
// =============================================================================

/// Hardware sequence position of a slot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SlotCursor {
    /// Instance of the frame last dispatched on this slot.
    pub instance: Option<InstanceId>,
    /// Frame count last dispatched on this slot.
    pub fcount: Option<u64>,
    /// Frame count of the last config-lock.
    pub config_lock: Option<u64>,
    /// Frame count of the last frame start.
    pub frame_start: Option<u64>,
}

// =============================================================================
// HardwareIpSlot
// =============================================================================

/// What the registry needs to create a slot.
pub struct SlotDescriptor {
    /// Table index.
    pub id: SlotId,
    /// Operation table of the block.
    pub ops: Arc<dyn IpOps>,
    /// Watchdog timer used while the slot heads a chain.
    pub watchdog: Arc<dyn OneShotTimer>,
}

impl SlotDescriptor {
    /// Descriptor for `ops` at `id`.
    pub fn new(id: SlotId, ops: Arc<dyn IpOps>, watchdog: Arc<dyn OneShotTimer>) -> Self {
        Self { id, ops, watchdog }
    }
}

/// Runtime state of one hardware block.
pub struct HardwareIpSlot {
    id: SlotId,
    ops: Arc<dyn IpOps>,
    flags: AtomicU32,
    ref_count: Mutex<u32>,
    bound: AtomicU32,
    queue: Arc<FrameQueue>,
    watchdog: Arc<dyn OneShotTimer>,
    cursor: Mutex<SlotCursor>,
    regions: Mutex<HashMap<InstanceId, ParamRegion>>,
    time_log: Mutex<FrameTimeLog>,
    stuck_streak: AtomicU32,
    stalled: AtomicBool,
    counters: SlotCounters,
}

impl HardwareIpSlot {
    pub(crate) fn new(desc: SlotDescriptor, queue_capacity: usize, irq_timeout: Duration) -> Self {
        Self {
            id: desc.id,
            ops: desc.ops,
            flags: AtomicU32::new(0),
            ref_count: Mutex::new(0),
            bound: AtomicU32::new(0),
            queue: Arc::new(FrameQueue::new(desc.id, queue_capacity, irq_timeout)),
            watchdog: desc.watchdog,
            cursor: Mutex::new(SlotCursor::default()),
            regions: Mutex::new(HashMap::new()),
            time_log: Mutex::new(FrameTimeLog::new()),
            stuck_streak: AtomicU32::new(0),
            stalled: AtomicBool::new(false),
            counters: SlotCounters::default(),
        }
    }

    /// Table index.
    pub fn id(&self) -> SlotId {
        self.id
    }

    /// Block name.
    pub fn name(&self) -> &str {
        self.ops.name()
    }

    /// Operation table.
    pub fn ops(&self) -> &Arc<dyn IpOps> {
        &self.ops
    }

    /// Queue used when this slot heads a chain.
    pub fn queue(&self) -> &Arc<FrameQueue> {
        &self.queue
    }

    /// Watchdog timer.
    pub fn watchdog(&self) -> &Arc<dyn OneShotTimer> {
        &self.watchdog
    }

    /// Debug counters.
    pub fn counters(&self) -> &SlotCounters {
        &self.counters
    }

    // -- flags ---------------------------------------------------------------

    /// Current flags.
    pub fn flags(&self) -> SlotFlags {
        SlotFlags::from_bits_truncate(self.flags.load(Ordering::Acquire))
    }

    /// True if every flag in `flags` is set.
    pub fn has(&self, flags: SlotFlags) -> bool {
        self.flags().contains(flags)
    }

    pub(crate) fn set_flags(&self, flags: SlotFlags) {
        self.flags.fetch_or(flags.bits(), Ordering::AcqRel);
    }

    pub(crate) fn clear_flags(&self, flags: SlotFlags) {
        self.flags.fetch_and(!flags.bits(), Ordering::AcqRel);
    }

    // -- refcount ------------------------------------------------------------

    /// Number of instances holding the slot open.
    pub fn ref_count(&self) -> u32 {
        *self.ref_count.lock()
    }

    /// Serialises open/close of this slot. Physical activation happens while
    /// the guard is held.
    pub(crate) fn activation(&self) -> MutexGuard<'_, u32> {
        self.ref_count.lock()
    }

    /// Zero per-activation state on physical open.
    pub(crate) fn reset_runtime(&self) {
        self.counters.reset();
        *self.cursor.lock() = SlotCursor::default();
        self.time_log.lock().clear();
        self.stuck_streak.store(0, Ordering::Relaxed);
        self.stalled.store(false, Ordering::Relaxed);
    }

    // -- binding -------------------------------------------------------------

    /// Instances bound to the slot.
    pub fn bound_instances(&self) -> InstanceMask {
        InstanceMask::from_bits(self.bound.load(Ordering::Acquire))
    }

    pub(crate) fn bind(&self, instance: InstanceId) {
        let mut mask = InstanceMask::default();
        mask.insert(instance);
        self.bound.fetch_or(mask.bits(), Ordering::AcqRel);
    }

    pub(crate) fn unbind(&self, instance: InstanceId) {
        let mut mask = InstanceMask::default();
        mask.insert(instance);
        self.bound.fetch_and(!mask.bits(), Ordering::AcqRel);
        let mut cursor = self.cursor.lock();
        if cursor.instance == Some(instance) {
            cursor.instance = None;
            cursor.fcount = None;
        }
        self.regions.lock().remove(&instance);
    }

    /// Instance interrupt work on this slot should be routed to: the one last
    /// dispatched if still bound, else the lowest bound id.
    pub fn route_instance(&self) -> Option<InstanceId> {
        let bound = self.bound_instances();
        let current = self.cursor.lock().instance;
        match current {
            Some(instance) if bound.contains(instance) => Some(instance),
            _ => bound.iter().next(),
        }
    }

    // -- cursor --------------------------------------------------------------

    /// Copy of the sequence cursor.
    pub fn cursor(&self) -> SlotCursor {
        *self.cursor.lock()
    }

    /// Make `instance`/`fcount` current. Returns true if it changed.
    pub(crate) fn bind_current(&self, instance: InstanceId, fcount: u64) -> bool {
        let mut cursor = self.cursor.lock();
        let changed = cursor.instance != Some(instance) || cursor.fcount != Some(fcount);
        cursor.instance = Some(instance);
        cursor.fcount = Some(fcount);
        changed
    }

    pub(crate) fn note_config_lock(&self, fcount: u64) -> SlotCursor {
        let mut cursor = self.cursor.lock();
        cursor.config_lock = Some(fcount);
        *cursor
    }

    pub(crate) fn note_frame_start(&self, fcount: u64) {
        let mut cursor = self.cursor.lock();
        cursor.frame_start = Some(cursor.frame_start.map_or(fcount, |f| f.max(fcount)));
    }

    // -- regions -------------------------------------------------------------

    /// Parameter region last set for `instance`.
    pub fn region(&self, instance: InstanceId) -> Option<ParamRegion> {
        self.regions.lock().get(&instance).cloned()
    }

    pub(crate) fn set_region(&self, instance: InstanceId, region: ParamRegion) {
        self.regions.lock().insert(instance, region);
    }

    // -- watchdog bookkeeping ------------------------------------------------

    pub(crate) fn time_log(&self) -> MutexGuard<'_, FrameTimeLog> {
        self.time_log.lock()
    }

    /// Consecutive watchdog expiries that found the chain stuck.
    pub fn stuck_streak(&self) -> u32 {
        self.stuck_streak.load(Ordering::Relaxed)
    }

    pub(crate) fn bump_stuck_streak(&self) -> u32 {
        self.stuck_streak.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub(crate) fn clear_stuck_streak(&self) {
        self.stuck_streak.store(0, Ordering::Relaxed);
    }

    /// Marks the chain as stalled; returns true on the first call since the last
    /// [`clear_stalled`](Self::clear_stalled). Gates the once-per-stall dump.
    pub(crate) fn mark_stalled(&self) -> bool {
        !self.stalled.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn clear_stalled(&self) {
        self.stalled.store(false, Ordering::Release);
    }

    /// True between a stuck detection and the next completed frame.
    pub fn is_stalled(&self) -> bool {
        self.stalled.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for HardwareIpSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HardwareIpSlot")
            .field("id", &self.id)
            .field("name", &self.name())
            .field("flags", &self.flags())
            .field("ref_count", &self.ref_count())
            .field("bound", &self.bound_instances())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::{CallLog, MockIp};
    use crate::timer::ManualTimer;

    fn slot() -> HardwareIpSlot {
        let ops = Arc::new(MockIp::new(SlotId(2), "rgbp", CallLog::new()));
        HardwareIpSlot::new(
            SlotDescriptor::new(SlotId(2), ops, Arc::new(ManualTimer::new())),
            4,
            Duration::from_micros(100),
        )
    }

    #[test]
    fn flags_set_and_clear() {
        let s = slot();
        s.set_flags(SlotFlags::OPEN | SlotFlags::RUNNING);
        assert!(s.has(SlotFlags::OPEN));
        s.clear_flags(SlotFlags::RUNNING);
        assert!(!s.has(SlotFlags::RUNNING));
        assert_eq!(s.flags(), SlotFlags::OPEN);
    }

    #[test]
    fn routing_prefers_current_instance() {
        let s = slot();
        assert_eq!(s.route_instance(), None);
        s.bind(InstanceId(1));
        s.bind(InstanceId(3));
        assert_eq!(s.route_instance(), Some(InstanceId(1)));
        assert!(s.bind_current(InstanceId(3), 10));
        assert!(!s.bind_current(InstanceId(3), 10));
        assert_eq!(s.route_instance(), Some(InstanceId(3)));
        s.unbind(InstanceId(3));
        assert_eq!(s.route_instance(), Some(InstanceId(1)));
    }

    #[test]
    fn frame_start_cursor_never_moves_back() {
        let s = slot();
        s.note_frame_start(9);
        s.note_frame_start(7);
        assert_eq!(s.cursor().frame_start, Some(9));
    }

    #[test]
    fn reset_clears_counters_and_streak() {
        let s = slot();
        s.counters().frame_end();
        s.bump_stuck_streak();
        assert!(s.mark_stalled());
        assert!(!s.mark_stalled());
        s.reset_runtime();
        assert_eq!(s.counters().snapshot(), CounterSnapshot::default());
        assert_eq!(s.stuck_streak(), 0);
        assert!(!s.is_stalled());
    }
}
