//! Shared fixture for the integration tests: a core with mock IPs, manual
//! watchdog timers and a recording firmware channel.

#![allow(dead_code)]

use isp_core::config::CoreConfig;
use isp_core::frame::FrameRecord;
use isp_core::hardware::{CallLog, HeapAllocator, MockFirmware, MockIp};
use isp_core::lifecycle::InstanceDesc;
use isp_core::timer::ManualTimer;
use isp_core::topology::ChainSpec;
use isp_core::{
    CompletionReceiver, FrameCompletion, FrameId, InstanceId, IspCore, Outcome, SlotDescriptor, SlotId,
};
use std::sync::Arc;

pub const PRIMARY: [(u8, &str); 3] = [(0, "csis"), (1, "byrp"), (2, "rgbp")];

pub struct Fixture {
    pub core: IspCore,
    pub events: CompletionReceiver,
    pub log: CallLog,
    pub firmware: Arc<MockFirmware>,
    pub allocator: Arc<HeapAllocator>,
    ips: Vec<(SlotId, Arc<MockIp>)>,
    timers: Vec<(SlotId, Arc<ManualTimer>)>,
}

impl Fixture {
    pub fn new(config: CoreConfig, slots: &[(u8, &str)]) -> Self {
        let log = CallLog::new();
        let firmware = Arc::new(MockFirmware::new());
        let allocator = Arc::new(HeapAllocator::new());
        let mut ips = Vec::new();
        let mut timers = Vec::new();
        let mut builder = IspCore::builder(config)
            .firmware(firmware.clone())
            .allocator(allocator.clone());
        for (id, name) in slots {
            let slot = SlotId(*id);
            let ip = Arc::new(MockIp::new(slot, *name, log.clone()));
            let timer = Arc::new(ManualTimer::new());
            builder = builder.slot(SlotDescriptor::new(slot, ip.clone(), timer.clone()));
            ips.push((slot, ip));
            timers.push((slot, timer));
        }
        let (core, events) = builder.build().expect("Failed to build core");
        Self {
            core,
            events,
            log,
            firmware,
            allocator,
            ips,
            timers,
        }
    }

    /// Three slots 0, 1, 2 with the default configuration.
    pub fn three_slots() -> Self {
        Self::new(CoreConfig::default(), &PRIMARY)
    }

    /// Three slots with instance 0 open over the linear chain 0 → 1 → 2.
    pub fn streaming() -> Self {
        let fixture = Self::three_slots();
        fixture.open_linear(InstanceId(0), &[0, 1, 2]);
        fixture.log.clear();
        fixture
    }

    pub fn open_linear(&self, instance: InstanceId, slots: &[u8]) {
        let chain = ChainSpec::linear(slots.iter().map(|id| SlotId(*id)));
        self.core
            .open(InstanceDesc::new(instance, chain))
            .expect("Failed to open instance");
    }

    pub fn ip(&self, slot: u8) -> &Arc<MockIp> {
        self.ips
            .iter()
            .find(|(id, _)| id.0 == slot)
            .map(|(_, ip)| ip)
            .expect("No such mock IP")
    }

    pub fn timer(&self, slot: u8) -> &Arc<ManualTimer> {
        self.timers
            .iter()
            .find(|(id, _)| id.0 == slot)
            .map(|(_, timer)| timer)
            .expect("No such timer")
    }

    /// Snapshot of a record in `head`'s queue.
    pub fn record(&self, head: u8, frame: FrameId) -> FrameRecord {
        let slot = self.core.registry().slot(SlotId(head)).expect("Slot not registered");
        let guard = slot.queue().lock();
        guard.frame(frame).cloned().expect("Frame not in queue")
    }

    /// Drive config-lock, frame-start and frame-end for `fcount` on every slot
    /// of the chain 0 → 1 → 2.
    pub fn run_frame(&self, fcount: u64) {
        self.core
            .on_config_lock(SlotId(0), fcount)
            .expect("config-lock failed");
        self.core
            .on_frame_start(SlotId(0), fcount)
            .expect("frame-start failed");
        self.end_frame(fcount, Outcome::Success);
    }

    pub fn end_frame(&self, fcount: u64, outcome: Outcome) {
        for slot in [2, 1, 0] {
            self.core
                .on_frame_end(SlotId(slot), fcount, outcome)
                .expect("frame-end failed");
        }
    }

    pub fn completions(&mut self) -> Vec<FrameCompletion> {
        self.events.drain_completions()
    }
}
