//! Instance lifecycle: open/close with per-slot reference counting, streaming,
//! parameter regions, setfile sequencing and AEB updates.
//!
//! # Reference counting
//!
//! Slots are shared between instances. Physical activation (`IpOps::open`,
//! counter reset, watchdog arm) happens only on a 0→1 transition of the slot's
//! reference count and physical deactivation (watchdog cancel, queue drain,
//! `IpOps::close`) only on 1→0. `init`/`deinit` run once per instance
//! regardless of sharing.
//!
//! # Setfiles
//!
//! Blobs are loaded at open (and on scenario change), applied by the first
//! dispatch that follows, and deleted at close.
//!
//! # Example
//! ```no_run
//! use isp_core::{config::CoreConfig, lifecycle::InstanceDesc, topology::ChainSpec};
//! use isp_core::{InstanceId, IspCore, SlotId};
//!
//! let (core, _events) = IspCore::builder(CoreConfig::default()).build()?;
//! let chain = ChainSpec::linear([SlotId(0), SlotId(1), SlotId(2)]);
//! core.open(InstanceDesc::new(InstanceId(0), chain))?;
//! core.start_stream(InstanceId(0))?;
//! # Ok::<(), isp_core::IspError>(())
//! ```

use crate::aeb::{AebState, SensorHdrMode};
use crate::core::IspCore;
use crate::error::{IspError, IspResult};
use crate::frame::{FrameState, Outcome};
use crate::hardware::{BufferPurpose, ParamMap, ParamRegion};
use crate::mask::{InstanceId, SlotId};
use crate::registry::PipelineInstance;
use crate::setfile::{SensorPosition, SetfileBinding, SetfileTable};
use crate::slot::{HardwareIpSlot, SlotFlags};
use crate::topology::{ChainSpec, ChainTopology};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Everything needed to open an instance.
#[derive(Debug, Clone)]
pub struct InstanceDesc {
    /// Instance id.
    pub id: InstanceId,
    /// Sensor feeding the stream.
    pub sensor_position: SensorPosition,
    /// Chain layout.
    pub chain: ChainSpec,
    /// Tuning data for the sensor position.
    pub setfile: Option<Arc<SetfileTable>>,
    /// Initial scenario.
    pub scenario: u32,
    /// Slots are fed on-the-fly rather than from memory.
    pub otf: bool,
}

impl InstanceDesc {
    /// Instance `id` over `chain`, sensor position 0, no setfile, memory-fed.
    pub fn new(id: InstanceId, chain: ChainSpec) -> Self {
        Self {
            id,
            sensor_position: SensorPosition(0),
            chain,
            setfile: None,
            scenario: 0,
            otf: false,
        }
    }

    /// Attach a setfile table; the sensor position follows the table.
    pub fn with_setfile(mut self, table: Arc<SetfileTable>, scenario: u32) -> Self {
        self.sensor_position = table.position();
        self.setfile = Some(table);
        self.scenario = scenario;
        self
    }

    /// Set the sensor position.
    pub fn with_sensor_position(mut self, position: SensorPosition) -> Self {
        self.sensor_position = position;
        self
    }

    /// Mark the slots as on-the-fly fed.
    pub fn with_otf(mut self, otf: bool) -> Self {
        self.otf = otf;
        self
    }
}

impl IspCore {
    // =========================================================================
    // Open / close
    // =========================================================================

    /// Open an instance.
    ///
    /// Validates the chain, acquires every slot, runs `init` on each, binds the
    /// instance, allocates its metadata buffer and loads setfile data. Any
    /// failure undoes what was done so far.
    pub fn open(&self, desc: InstanceDesc) -> IspResult<Arc<PipelineInstance>> {
        let registry = self.registry();
        registry.check_instance_free(desc.id)?;
        let topology = ChainTopology::build(&desc.chain, registry.registered_mask())?;
        let slots = topology
            .hw_mask()
            .iter()
            .map(|id| registry.slot(id))
            .collect::<IspResult<Vec<_>>>()?;

        let instance = Arc::new(PipelineInstance::new(
            desc.id,
            desc.sensor_position,
            topology,
            SetfileBinding::new(desc.setfile, desc.scenario),
        ));

        let mut acquired: Vec<Arc<HardwareIpSlot>> = Vec::with_capacity(slots.len());
        for slot in &slots {
            if let Err(e) = self.acquire_slot(slot, desc.id, desc.otf) {
                warn!(instance = %desc.id, slot = %slot.id(), error = %e, "slot open failed, rolling back");
                self.release_slots(desc.id, &acquired);
                return Err(e);
            }
            acquired.push(Arc::clone(slot));
        }

        let setup = self
            .setup_instance(&instance, &slots)
            .and_then(|()| registry.insert_instance(Arc::clone(&instance)));
        if let Err(e) = setup {
            warn!(instance = %desc.id, error = %e, "instance setup failed, rolling back");
            for err in self.teardown_instance(&instance, &slots) {
                warn!(instance = %desc.id, error = %err, "rollback step failed");
            }
            self.release_slots(desc.id, &acquired);
            return Err(e);
        }

        info!(
            instance = %desc.id,
            hw_mask = ?instance.hw_mask(),
            head = %instance.topology().primary().head(),
            branches = instance.topology().branches().len(),
            "instance opened"
        );
        Ok(instance)
    }

    /// Close an instance.
    ///
    /// Every in-flight frame completes with `UNPROCESSED` before any slot
    /// reference is dropped. All teardown steps run even if some fail; the
    /// failures are returned together as [`IspError::ShutdownFailed`].
    pub fn close(&self, id: InstanceId) -> IspResult<()> {
        let registry = self.registry();
        let instance = registry.instance(id)?;
        let slots = instance
            .hw_mask()
            .iter()
            .map(|slot| registry.slot(slot))
            .collect::<IspResult<Vec<_>>>()?;
        let mut errors = Vec::new();

        if instance.is_streaming() {
            errors.extend(self.disable_slots(&instance, &slots));
            instance.set_streaming(false);
        }
        if let Err(e) = self.flush_instance(&instance, Outcome::Unprocessed) {
            errors.push(e);
        }
        errors.extend(self.teardown_instance(&instance, &slots));
        // frames queued by an interrupt that routed here before the unbind
        if let Err(e) = self.flush_instance(&instance, Outcome::Unprocessed) {
            errors.push(e);
        }
        registry.remove_instance(id);

        for slot in slots.iter().rev() {
            if let Err(e) = self.release_slot(slot, id) {
                errors.push(e);
            }
        }

        if errors.is_empty() {
            info!(instance = %id, "instance closed");
            Ok(())
        } else {
            warn!(instance = %id, errors = errors.len(), "instance closed with errors");
            Err(IspError::ShutdownFailed(errors))
        }
    }

    fn acquire_slot(&self, slot: &HardwareIpSlot, instance: InstanceId, otf: bool) -> IspResult<()> {
        let mut refs = slot.activation();
        if *refs == 0 {
            slot.ops().open(instance)?;
            slot.reset_runtime();
            slot.set_flags(SlotFlags::OPEN);
            if otf {
                slot.set_flags(SlotFlags::OTF_MODE);
            }
            self.arm_watchdog(slot);
            info!(slot = %slot.id(), name = slot.name(), "slot opened");
        }
        *refs += 1;
        debug!(slot = %slot.id(), instance = %instance, ref_count = *refs, "slot acquired");
        Ok(())
    }

    fn release_slot(&self, slot: &HardwareIpSlot, instance: InstanceId) -> IspResult<()> {
        let mut refs = slot.activation();
        match *refs {
            0 => {
                warn!(slot = %slot.id(), instance = %instance, "release of a closed slot");
                Ok(())
            }
            1 => {
                *refs = 0;
                slot.watchdog().cancel();
                let drained = self.drain_queue(slot);
                let closed = slot.ops().close(instance);
                slot.clear_flags(SlotFlags::all());
                info!(slot = %slot.id(), name = slot.name(), "slot closed");
                drained?;
                closed.map_err(IspError::from)
            }
            n => {
                *refs = n - 1;
                debug!(slot = %slot.id(), instance = %instance, ref_count = n - 1, "slot released");
                Ok(())
            }
        }
    }

    fn release_slots(&self, instance: InstanceId, slots: &[Arc<HardwareIpSlot>]) {
        for slot in slots.iter().rev() {
            if let Err(e) = self.release_slot(slot, instance) {
                warn!(slot = %slot.id(), instance = %instance, error = %e, "slot release failed");
            }
        }
    }

    /// Complete whatever is left in a slot's queue on physical close.
    fn drain_queue(&self, slot: &HardwareIpSlot) -> IspResult<()> {
        let leftovers = {
            let mut guard = slot.queue().lock();
            let ids: Vec<_> = [FrameState::WaitDone, FrameState::Configure, FrameState::Request]
                .into_iter()
                .flat_map(|state| guard.ids(state))
                .collect();
            let mut leftovers = Vec::with_capacity(ids.len());
            for id in ids {
                let Some(record) = guard.frame_mut(id) else {
                    continue;
                };
                record.record_result(Outcome::Unprocessed);
                record.owner.clear_all();
                let state = record.state;
                if state != FrameState::WaitDone {
                    guard.transition(id, state, FrameState::WaitDone)?;
                }
                leftovers.push(guard.release(id)?);
            }
            leftovers
        };
        if !leftovers.is_empty() {
            warn!(slot = %slot.id(), frames = leftovers.len(), "frames drained on slot close");
        }
        for record in leftovers {
            self.post_completion(record);
        }
        Ok(())
    }

    fn setup_instance(&self, instance: &PipelineInstance, slots: &[Arc<HardwareIpSlot>]) -> IspResult<()> {
        let id = instance.id();
        for slot in slots {
            slot.ops().init(id)?;
            slot.set_flags(SlotFlags::INITIALIZED);
            slot.bind(id);
        }
        let handle = self
            .inner
            .allocator
            .alloc(self.config().queue.meta_buffer_size, BufferPurpose::Metadata)?;
        *instance.meta_buffer.lock() = Some(handle);
        self.load_setfiles(instance)
    }

    /// Undo [`setup_instance`](Self::setup_instance) as far as it got.
    fn teardown_instance(&self, instance: &PipelineInstance, slots: &[Arc<HardwareIpSlot>]) -> Vec<IspError> {
        let id = instance.id();
        let mut errors = Vec::new();

        let loaded = instance.setfile.lock().take_loaded();
        for slot_id in loaded.iter() {
            let deleted = self
                .registry()
                .slot(slot_id)
                .and_then(|slot| slot.ops().delete_setfile(id).map_err(IspError::from));
            if let Err(e) = deleted {
                errors.push(e);
            }
        }

        for slot in slots.iter().filter(|s| s.bound_instances().contains(id)) {
            if let Err(e) = slot.ops().deinit(id) {
                errors.push(e.into());
            }
            slot.unbind(id);
            if slot.bound_instances().is_empty() {
                slot.clear_flags(SlotFlags::INITIALIZED);
            }
        }

        if let Some(handle) = instance.meta_buffer.lock().take() {
            if let Err(e) = self.inner.allocator.free(handle) {
                errors.push(e.into());
            }
        }
        errors
    }

    fn load_setfiles(&self, instance: &PipelineInstance) -> IspResult<()> {
        let blobs = instance.setfile.lock().pending_loads(instance.hw_mask());
        for blob in blobs {
            let slot = self.registry().slot(blob.slot)?;
            slot.ops().load_setfile(instance.id(), &blob).map_err(|e| {
                IspError::Setfile(format!("slot {} scenario {}: {}", blob.slot, blob.scenario, e))
            })?;
            instance.setfile.lock().mark_loaded(blob.slot);
            debug!(instance = %instance.id(), slot = %blob.slot, scenario = blob.scenario, bytes = blob.data.len(), "setfile loaded");
        }
        Ok(())
    }

    // =========================================================================
    // Streaming
    // =========================================================================

    /// Enable every slot of `instance`, tail first, and mark them RUNNING.
    pub fn start_stream(&self, id: InstanceId) -> IspResult<()> {
        let instance = self.registry().instance(id)?;
        let hw_mask = instance.hw_mask();
        let slots = hw_mask
            .iter()
            .map(|slot| self.registry().slot(slot))
            .collect::<IspResult<Vec<_>>>()?;

        let mut enabled: Vec<&Arc<HardwareIpSlot>> = Vec::with_capacity(slots.len());
        for slot in slots.iter().rev() {
            if let Err(e) = slot.ops().enable(id, hw_mask) {
                for done in enabled.iter() {
                    if let Err(err) = done.ops().disable(id, hw_mask) {
                        warn!(slot = %done.id(), error = %err, "disable during rollback failed");
                    }
                }
                return Err(e.into());
            }
            enabled.push(slot);
        }
        for slot in &slots {
            slot.set_flags(SlotFlags::RUNNING);
        }
        instance.set_streaming(true);
        info!(instance = %id, "stream started");
        Ok(())
    }

    /// Disable every slot of `instance` and flush its frames with
    /// `UNPROCESSED`. Returns the number of frames flushed.
    pub fn stop_stream(&self, id: InstanceId) -> IspResult<usize> {
        let instance = self.registry().instance(id)?;
        let slots = instance
            .hw_mask()
            .iter()
            .map(|slot| self.registry().slot(slot))
            .collect::<IspResult<Vec<_>>>()?;
        let errors = self.disable_slots(&instance, &slots);
        instance.set_streaming(false);
        let flushed = self.flush_instance(&instance, Outcome::Unprocessed)?;
        info!(instance = %id, flushed, "stream stopped");
        match errors.into_iter().next() {
            Some(e) => Err(e),
            None => Ok(flushed),
        }
    }

    fn disable_slots(&self, instance: &PipelineInstance, slots: &[Arc<HardwareIpSlot>]) -> Vec<IspError> {
        let id = instance.id();
        let hw_mask = instance.hw_mask();
        let others: Vec<_> = self
            .registry()
            .instances()
            .into_iter()
            .filter(|other| other.id() != id && other.is_streaming())
            .collect();

        let mut errors = Vec::new();
        for slot in slots {
            if let Err(e) = slot.ops().disable(id, hw_mask) {
                errors.push(e.into());
            }
            if !others.iter().any(|other| other.hw_mask().contains(slot.id())) {
                slot.clear_flags(SlotFlags::RUNNING);
            }
        }
        errors
    }

    // =========================================================================
    // Parameters / setfile / AEB
    // =========================================================================

    /// Program `region` into `slot` for `instance` and make it the region used
    /// by later shots on that slot.
    pub fn set_param(&self, instance: InstanceId, slot: SlotId, region: ParamRegion, pmap: ParamMap) -> IspResult<()> {
        let pipeline = self.registry().instance(instance)?;
        if !pipeline.hw_mask().contains(slot) {
            return Err(IspError::InvalidChain(format!(
                "slot {} is not part of instance {}",
                slot, instance
            )));
        }
        let ip = self.registry().slot(slot)?;
        ip.ops().set_param(&region, pmap, instance)?;
        debug!(instance = %instance, slot = %slot, region = region.id, pmap = pmap.0, "parameter region set");
        ip.set_region(instance, region);
        Ok(())
    }

    /// Switch `instance` to another setfile scenario. Loaded data is deleted and
    /// reloaded; the next dispatch applies it. Returns false if the scenario
    /// was already selected.
    pub fn select_scenario(&self, instance: InstanceId, scenario: u32) -> IspResult<bool> {
        let pipeline = self.registry().instance(instance)?;
        let loaded = {
            let mut binding = pipeline.setfile.lock();
            if let Some(table) = binding.table() {
                if !table.has_scenario(scenario) {
                    return Err(IspError::Setfile(format!(
                        "scenario {} not present for sensor position {}",
                        scenario,
                        table.position().0
                    )));
                }
            }
            if !binding.select(scenario) {
                return Ok(false);
            }
            binding.take_loaded()
        };
        for slot_id in loaded.iter() {
            self.registry().slot(slot_id)?.ops().delete_setfile(instance)?;
        }
        self.load_setfiles(&pipeline)?;
        info!(instance = %instance, scenario, "setfile scenario selected");
        Ok(true)
    }

    /// Feed the sensor's HDR mode for the coming frame into the instance's AEB
    /// state machine. Ignored (state unchanged) when AEB is disabled.
    pub fn update_aeb(&self, instance: InstanceId, mode: SensorHdrMode) -> IspResult<AebState> {
        let pipeline = self.registry().instance(instance)?;
        if !self.config().aeb.enabled {
            if mode == SensorHdrMode::Bracketed {
                debug!(instance = %instance, "AEB disabled, bracketed mode ignored");
            }
            return Ok(pipeline.aeb_state());
        }
        let mut aeb = pipeline.aeb.lock();
        let before = aeb.state();
        let after = aeb.on_frame_boundary(mode);
        if before != after {
            info!(instance = %instance, from = %before, to = %after, "AEB state changed");
        }
        Ok(after)
    }
}
