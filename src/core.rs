//! The orchestration core handle.
//!
//! `IspCore` is a cheap, cloneable handle around the registry, the collaborators
//! and the completion channel. Its operations are spread over the modules that
//! own each concern:
//!
//! | Module | Operations |
//! |--------|------------|
//! | [`scheduler`](crate::scheduler) | `request_shot`, `dispatch_shot`, `on_config_lock` |
//! | [`monitor`](crate::monitor) | `on_frame_start`, `on_frame_end`, `on_dma_done`, `on_firmware_response`, `on_watchdog_expired`, `force_flush`, `dump_state` |
//! | [`completion`](crate::completion) | `frame_done`, `frame_ndone` |
//! | [`lifecycle`](crate::lifecycle) | `open`, `close`, `start_stream`, `stop_stream`, `set_param`, `select_scenario`, `update_aeb` |

use crate::completion::{CompletionQueue, CompletionReceiver};
use crate::config::CoreConfig;
use crate::error::IspResult;
use crate::hardware::{BufferAllocator, FirmwareChannel, HeapAllocator, NullFirmware};
use crate::mask::{InstanceId, SlotId};
use crate::registry::{InstanceStatsSnapshot, PipelineRegistry};
use crate::slot::{CounterSnapshot, HardwareIpSlot, SlotDescriptor, SlotFlags};
use crate::timelog::Clock;
use std::sync::{Arc, Weak};
use tracing::{debug, warn};

pub(crate) struct CoreInner {
    pub(crate) config: CoreConfig,
    pub(crate) registry: PipelineRegistry,
    pub(crate) firmware: Arc<dyn FirmwareChannel>,
    pub(crate) allocator: Arc<dyn BufferAllocator>,
    pub(crate) completions: CompletionQueue,
    pub(crate) clock: Clock,
}

/// Handle to the orchestration core.
#[derive(Clone)]
pub struct IspCore {
    pub(crate) inner: Arc<CoreInner>,
}

/// Builder for [`IspCore`].
pub struct IspCoreBuilder {
    config: CoreConfig,
    firmware: Arc<dyn FirmwareChannel>,
    allocator: Arc<dyn BufferAllocator>,
    slots: Vec<SlotDescriptor>,
}

impl IspCoreBuilder {
    /// Use `firmware` for shot messages.
    pub fn firmware(mut self, firmware: Arc<dyn FirmwareChannel>) -> Self {
        self.firmware = firmware;
        self
    }

    /// Use `allocator` for metadata buffers.
    pub fn allocator(mut self, allocator: Arc<dyn BufferAllocator>) -> Self {
        self.allocator = allocator;
        self
    }

    /// Register a slot at build time.
    pub fn slot(mut self, desc: SlotDescriptor) -> Self {
        self.slots.push(desc);
        self
    }

    /// Validate the configuration, register the slots and return the core with
    /// the receiving end of its completion channel.
    pub fn build(self) -> IspResult<(IspCore, CompletionReceiver)> {
        self.config.validate()?;
        let registry = PipelineRegistry::new(
            self.config.queue.frames_per_queue,
            self.config.lock.irq_acquire_timeout(),
        );
        for desc in self.slots {
            registry.register_slot(desc)?;
        }
        let (completions, receiver) = CompletionQueue::new();
        let core = IspCore {
            inner: Arc::new(CoreInner {
                config: self.config,
                registry,
                firmware: self.firmware,
                allocator: self.allocator,
                completions,
                clock: Clock::new(),
            }),
        };
        Ok((core, receiver))
    }
}

impl IspCore {
    /// Start building a core with `config`. Defaults: no firmware, heap
    /// allocator, no slots.
    pub fn builder(config: CoreConfig) -> IspCoreBuilder {
        IspCoreBuilder {
            config,
            firmware: Arc::new(NullFirmware),
            allocator: Arc::new(HeapAllocator::new()),
            slots: Vec::new(),
        }
    }

    /// Effective configuration.
    pub fn config(&self) -> &CoreConfig {
        &self.inner.config
    }

    /// Slot and instance tables.
    pub fn registry(&self) -> &PipelineRegistry {
        &self.inner.registry
    }

    /// Register a slot after build (probe of a late block).
    pub fn register_slot(&self, desc: SlotDescriptor) -> IspResult<Arc<HardwareIpSlot>> {
        self.inner.registry.register_slot(desc)
    }

    /// Debug counters of a slot.
    pub fn slot_counters(&self, slot: SlotId) -> IspResult<CounterSnapshot> {
        Ok(self.inner.registry.slot(slot)?.counters().snapshot())
    }

    /// Flags of a slot.
    pub fn slot_flags(&self, slot: SlotId) -> IspResult<SlotFlags> {
        Ok(self.inner.registry.slot(slot)?.flags())
    }

    /// Counters of an open instance.
    pub fn instance_stats(&self, instance: InstanceId) -> IspResult<InstanceStatsSnapshot> {
        Ok(self.inner.registry.instance(instance)?.stats().snapshot())
    }

    /// Completion events posted so far, including suppressed internal frames.
    pub fn completions_posted(&self) -> u64 {
        self.inner.completions.posted()
    }

    /// Events handed to the completion channel.
    pub fn completions_delivered(&self) -> u64 {
        self.inner.completions.delivered()
    }

    pub(crate) fn now_ns(&self) -> u64 {
        self.inner.clock.now_ns()
    }

    /// Re-arm `slot`'s watchdog, replacing any pending expiry.
    pub(crate) fn arm_watchdog(&self, slot: &HardwareIpSlot) {
        let weak: Weak<CoreInner> = Arc::downgrade(&self.inner);
        let id = slot.id();
        let timeout = self.inner.config.watchdog.timeout();
        slot.watchdog().arm(
            timeout,
            Box::new(move || {
                let Some(inner) = weak.upgrade() else {
                    debug!(slot = %id, "watchdog fired after core was dropped");
                    return;
                };
                let core = IspCore { inner };
                if let Err(e) = core.on_watchdog_expired(id) {
                    warn!(slot = %id, error = %e, "watchdog handling failed");
                }
            }),
        );
    }
}

impl std::fmt::Debug for IspCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IspCore")
            .field("registry", &self.inner.registry)
            .finish_non_exhaustive()
    }
}
