//! Pipeline registry: the slot table and the open instances.
//!
//! The registry is created once, filled with slots at probe time and passed
//! explicitly to every operation (there is no process-wide table).
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────┐
//! │                    PipelineRegistry                       │
//! │  slots:     [ 0:csis ][ 1:byrp ][ 2:rgbp ][ 3:mcsc ] ...  │
//! │                 │ queue   watchdog   time log             │
//! │  instances: [ 0 ][ 1 ] ...                                │
//! │               │ topology (primary 0→1→2, branch 0→3)      │
//! │               │ aeb state, setfile binding                │
//! └───────────────────────────────────────────────────────────┘
//! ```
//!
//! Both tables are fixed size and read-mostly; mutation happens only on
//! registration and instance open/close.

use crate::aeb::AebMachine;
use crate::error::{IspError, IspResult};
use crate::frame::FrameGeometry;
use crate::hardware::BufferHandle;
use crate::mask::{InstanceId, SlotId, SlotMask, MAX_INSTANCES, MAX_SLOTS};
use crate::setfile::{SensorPosition, SetfileBinding};
use crate::slot::{HardwareIpSlot, SlotDescriptor};
use crate::topology::{Chain, ChainRef, ChainTopology};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

// =============================================================================
// PipelineInstance
// =============================================================================

/// Per-instance counters.
#[derive(Debug, Default)]
pub struct InstanceStats {
    pub(crate) requested: AtomicU64,
    pub(crate) internal_frames: AtomicU64,
    pub(crate) late_frames: AtomicU64,
    pub(crate) skipped_shots: AtomicU64,
    pub(crate) completed: AtomicU64,
    pub(crate) failed: AtomicU64,
    pub(crate) firmware_orphans: AtomicU64,
}

/// Point-in-time copy of [`InstanceStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InstanceStatsSnapshot {
    /// External frames accepted by `request_shot`.
    pub requested: u64,
    /// Internal frames synthesised at config-lock.
    pub internal_frames: u64,
    /// Frames completed with `LATE_FRAME`.
    pub late_frames: u64,
    /// Config-locks skipped while AEB was switching.
    pub skipped_shots: u64,
    /// Frames completed with `SUCCESS`.
    pub completed: u64,
    /// Frames completed with any failure outcome.
    pub failed: u64,
    /// Firmware responses that matched no frame.
    pub firmware_orphans: u64,
}

impl InstanceStats {
    /// Current values.
    pub fn snapshot(&self) -> InstanceStatsSnapshot {
        InstanceStatsSnapshot {
            requested: self.requested.load(Ordering::Relaxed),
            internal_frames: self.internal_frames.load(Ordering::Relaxed),
            late_frames: self.late_frames.load(Ordering::Relaxed),
            skipped_shots: self.skipped_shots.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            firmware_orphans: self.firmware_orphans.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// One open logical stream.
#[derive(Debug)]
pub struct PipelineInstance {
    id: InstanceId,
    sensor_position: SensorPosition,
    topology: ChainTopology,
    pub(crate) aeb: Mutex<AebMachine>,
    pub(crate) setfile: Mutex<SetfileBinding>,
    pub(crate) last_geometry: Mutex<Option<FrameGeometry>>,
    pub(crate) meta_buffer: Mutex<Option<BufferHandle>>,
    streaming: AtomicBool,
    stats: InstanceStats,
}

impl PipelineInstance {
    pub(crate) fn new(
        id: InstanceId,
        sensor_position: SensorPosition,
        topology: ChainTopology,
        setfile: SetfileBinding,
    ) -> Self {
        Self {
            id,
            sensor_position,
            topology,
            aeb: Mutex::new(AebMachine::new()),
            setfile: Mutex::new(setfile),
            last_geometry: Mutex::new(None),
            meta_buffer: Mutex::new(None),
            streaming: AtomicBool::new(false),
            stats: InstanceStats::default(),
        }
    }

    /// Instance id.
    pub fn id(&self) -> InstanceId {
        self.id
    }

    /// Sensor feeding the stream.
    pub fn sensor_position(&self) -> SensorPosition {
        self.sensor_position
    }

    /// Validated chain topology.
    pub fn topology(&self) -> &ChainTopology {
        &self.topology
    }

    /// Every active slot.
    pub fn hw_mask(&self) -> SlotMask {
        self.topology.hw_mask()
    }

    /// Counters.
    pub fn stats(&self) -> &InstanceStats {
        &self.stats
    }

    /// Current AEB state.
    pub fn aeb_state(&self) -> crate::aeb::AebState {
        self.aeb.lock().state()
    }

    /// Geometry of the most recent external frame.
    pub fn last_geometry(&self) -> Option<FrameGeometry> {
        *self.last_geometry.lock()
    }

    /// Metadata buffer allocated at open.
    pub fn meta_buffer(&self) -> Option<BufferHandle> {
        *self.meta_buffer.lock()
    }

    /// True between `start_stream` and `stop_stream`.
    pub fn is_streaming(&self) -> bool {
        self.streaming.load(Ordering::Acquire)
    }

    pub(crate) fn set_streaming(&self, streaming: bool) -> bool {
        self.streaming.swap(streaming, Ordering::AcqRel)
    }
}

// =============================================================================
// PipelineRegistry
// =============================================================================

/// Fixed-size slot and instance tables.
pub struct PipelineRegistry {
    slots: RwLock<Vec<Option<Arc<HardwareIpSlot>>>>,
    instances: RwLock<Vec<Option<Arc<PipelineInstance>>>>,
    queue_capacity: usize,
    irq_timeout: Duration,
    dumps: AtomicU64,
}

impl PipelineRegistry {
    /// Empty registry whose slots get `queue_capacity` frames each.
    pub fn new(queue_capacity: usize, irq_timeout: Duration) -> Self {
        Self {
            slots: RwLock::new(vec![None; MAX_SLOTS]),
            instances: RwLock::new(vec![None; MAX_INSTANCES]),
            queue_capacity,
            irq_timeout,
            dumps: AtomicU64::new(0),
        }
    }

    /// Add a slot at `desc.id`.
    pub fn register_slot(&self, desc: SlotDescriptor) -> IspResult<Arc<HardwareIpSlot>> {
        let id = desc.id;
        let mut slots = self.slots.write();
        let entry = slots
            .get_mut(id.index())
            .ok_or(IspError::SlotNotRegistered(id))?;
        if entry.is_some() {
            return Err(IspError::SlotAlreadyRegistered(id));
        }
        let slot = Arc::new(HardwareIpSlot::new(desc, self.queue_capacity, self.irq_timeout));
        info!(slot = %id, name = slot.name(), capacity = self.queue_capacity, "hardware slot registered");
        *entry = Some(Arc::clone(&slot));
        Ok(slot)
    }

    /// Slot by id.
    pub fn slot(&self, id: SlotId) -> IspResult<Arc<HardwareIpSlot>> {
        self.slots
            .read()
            .get(id.index())
            .and_then(Clone::clone)
            .ok_or(IspError::SlotNotRegistered(id))
    }

    /// Every registered slot.
    pub fn registered_mask(&self) -> SlotMask {
        self.slots
            .read()
            .iter()
            .flatten()
            .map(|slot| slot.id())
            .collect()
    }

    /// Every registered slot, ascending id.
    pub fn slots(&self) -> Vec<Arc<HardwareIpSlot>> {
        self.slots.read().iter().flatten().cloned().collect()
    }

    /// Open instance by id.
    pub fn instance(&self, id: InstanceId) -> IspResult<Arc<PipelineInstance>> {
        let instances = self.instances.read();
        let entry = instances.get(id.index()).ok_or(IspError::InvalidInstance(id))?;
        entry.clone().ok_or(IspError::InstanceNotOpen(id))
    }

    /// True if `id` is open.
    pub fn is_open(&self, id: InstanceId) -> bool {
        self.instance(id).is_ok()
    }

    /// Every open instance, ascending id.
    pub fn instances(&self) -> Vec<Arc<PipelineInstance>> {
        self.instances.read().iter().flatten().cloned().collect()
    }

    pub(crate) fn check_instance_free(&self, id: InstanceId) -> IspResult<()> {
        let instances = self.instances.read();
        match instances.get(id.index()) {
            None => Err(IspError::InvalidInstance(id)),
            Some(Some(_)) => Err(IspError::InstanceAlreadyOpen(id)),
            Some(None) => Ok(()),
        }
    }

    pub(crate) fn insert_instance(&self, instance: Arc<PipelineInstance>) -> IspResult<()> {
        let id = instance.id();
        let mut instances = self.instances.write();
        let entry = instances.get_mut(id.index()).ok_or(IspError::InvalidInstance(id))?;
        if entry.is_some() {
            return Err(IspError::InstanceAlreadyOpen(id));
        }
        *entry = Some(instance);
        Ok(())
    }

    pub(crate) fn remove_instance(&self, id: InstanceId) -> Option<Arc<PipelineInstance>> {
        self.instances
            .write()
            .get_mut(id.index())
            .and_then(Option::take)
    }

    /// Instances with a chain headed by `slot`, with the chain they use.
    pub fn chains_headed_by(&self, slot: SlotId) -> Vec<(Arc<PipelineInstance>, ChainRef)> {
        self.instances()
            .into_iter()
            .filter_map(|instance| {
                let which = instance.topology().chain_headed_by(slot).map(|(r, _)| r)?;
                Some((instance, which))
            })
            .collect()
    }

    /// Head slot of a chain, which owns the chain's queue.
    pub fn chain_head(&self, chain: &Chain) -> IspResult<Arc<HardwareIpSlot>> {
        self.slot(chain.head())
    }

    pub(crate) fn note_dump(&self) -> u64 {
        self.dumps.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Diagnostic dumps emitted so far.
    pub fn dumps(&self) -> u64 {
        self.dumps.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for PipelineRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineRegistry")
            .field("slots", &self.registered_mask())
            .field("instances", &self.instances().len())
            .field("queue_capacity", &self.queue_capacity)
            .finish()
    }
}
