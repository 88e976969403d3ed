//! Collaborator interfaces consumed by the orchestration core.
//!
//! The core never programs registers itself. Every hardware block plugs in an
//! [`IpOps`] implementation, firmware messages go through a [`FirmwareChannel`],
//! and metadata/tuning memory comes from a [`BufferAllocator`]. All three are
//! synchronous: they are invoked from request context and from interrupt-level
//! handlers, but never while a queue lock is held.
//!
//! # Available Implementations
//!
//! - [`heap::HeapAllocator`] - heap-backed buffer allocator
//! - [`mock::MockIp`], [`mock::MockFirmware`] - recording doubles for tests and
//!   the simulator

pub mod heap;
pub mod mock;

use crate::error::{IpError, IpErrorKind};
use crate::frame::{FrameId, FrameInfo, FrameKind, Outcome};
use crate::mask::{InstanceId, SlotMask};
use crate::setfile::SetfileBlob;
use bytes::Bytes;
use std::fmt;

pub use heap::HeapAllocator;
pub use mock::{CallLog, IpCall, IpOp, MockFirmware, MockIp};

/// Result type returned by collaborators.
pub type IpResult<T> = std::result::Result<T, IpError>;

// =============================================================================
// Value types
// =============================================================================

/// Opaque handle to DMA-capable memory. The core stores and forwards it but
/// never dereferences it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferHandle {
    /// Allocator-assigned identifier.
    pub id: u64,
    /// Size in bytes.
    pub size: usize,
}

/// What a buffer is used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferPurpose {
    /// Per-instance frame metadata.
    Metadata,
    /// Tuning parameter staging.
    Tuning,
}

/// Per-frame metadata returned by an IP. Opaque to the core.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FrameMeta(pub Bytes);

/// Parameter region programmed into a slot and consulted by later shots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParamRegion {
    /// Caller-chosen region id.
    pub id: u32,
    /// Parameter payload.
    pub data: Bytes,
}

/// Bitmap of parameter groups present in a region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ParamMap(pub u64);

/// Everything an IP needs to program one shot.
///
/// Owned so the scheduler can build it under the queue lock and hand it to the
/// IP after the lock is released.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShotRequest {
    /// Owning stream.
    pub instance: InstanceId,
    /// Target hardware frame count.
    pub fcount: u64,
    /// Frame being programmed.
    pub frame: FrameId,
    /// Origin of the frame.
    pub kind: FrameKind,
    /// Every slot taking part in this dispatch.
    pub hw_mask: SlotMask,
    /// Buffers per frame.
    pub num_buffers: u32,
    /// Output buffers.
    pub buffers: Vec<BufferHandle>,
    /// The slot's current parameter region, if one was set.
    pub region: Option<ParamRegion>,
}

// =============================================================================
// IpOps
// =============================================================================

/// Per-IP operation table.
///
/// # Contract
/// - `open`/`close` are called once per physical activation (refcount 0↔1).
/// - `init`/`deinit` are called once per instance open/close, even when the
///   block is shared.
/// - `shot` programs one frame; a failure makes the core call `restore` on every
///   block already programmed for the same frame.
/// - No method may block indefinitely; they can be reached from interrupt-level
///   handlers.
///
/// Optional operations have no-op defaults.
pub trait IpOps: Send + Sync {
    /// Block name used in logs and errors.
    fn name(&self) -> &str;

    /// Physical activation.
    fn open(&self, instance: InstanceId) -> IpResult<()>;

    /// Physical deactivation.
    fn close(&self, instance: InstanceId) -> IpResult<()>;

    /// Per-instance logical setup.
    fn init(&self, _instance: InstanceId) -> IpResult<()> {
        Ok(())
    }

    /// Per-instance logical teardown.
    fn deinit(&self, _instance: InstanceId) -> IpResult<()> {
        Ok(())
    }

    /// Program a parameter region.
    fn set_param(&self, _region: &ParamRegion, _pmap: ParamMap, _instance: InstanceId) -> IpResult<()> {
        Ok(())
    }

    /// Program and trigger one frame.
    fn shot(&self, request: &ShotRequest, hw_mask: SlotMask) -> IpResult<()>;

    /// Undo a shot whose chain dispatch was aborted.
    fn restore(&self, instance: InstanceId) -> IpResult<()>;

    /// Hardware cleanup for a frame that failed.
    fn frame_ndone(&self, _frame: &FrameInfo, _outcome: Outcome) -> IpResult<()> {
        Ok(())
    }

    /// Start streaming.
    fn enable(&self, _instance: InstanceId, _hw_mask: SlotMask) -> IpResult<()> {
        Ok(())
    }

    /// Stop streaming.
    fn disable(&self, _instance: InstanceId, _hw_mask: SlotMask) -> IpResult<()> {
        Ok(())
    }

    /// Load tuning data for this block.
    fn load_setfile(&self, _instance: InstanceId, _blob: &SetfileBlob) -> IpResult<()> {
        Ok(())
    }

    /// Apply a previously loaded scenario.
    fn apply_setfile(&self, _instance: InstanceId, _scenario: u32) -> IpResult<()> {
        Ok(())
    }

    /// Forget loaded tuning data.
    fn delete_setfile(&self, _instance: InstanceId) -> IpResult<()> {
        Ok(())
    }

    /// Metadata for a completed frame.
    fn get_meta(&self, _frame: &FrameInfo) -> Option<FrameMeta> {
        None
    }

    /// Told when the chain containing this block was declared stuck.
    fn notify_timeout(&self, _instance: InstanceId) {}

    /// Emit a register dump.
    fn dump_regs(&self, _instance: InstanceId) {}
}

impl fmt::Debug for dyn IpOps {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IpOps({})", self.name())
    }
}

// =============================================================================
// Firmware / Allocator
// =============================================================================

/// Message channel to the firmware co-processor.
///
/// Responses come back asynchronously through
/// [`IspCore::on_firmware_response`](crate::IspCore::on_firmware_response),
/// once per dispatched frame.
pub trait FirmwareChannel: Send + Sync {
    /// Announce a dispatched frame.
    fn send_shot_message(&self, instance: InstanceId, frame: &FrameInfo, fcount: u64) -> IpResult<()>;
}

/// Channel used when no firmware is attached.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullFirmware;

impl FirmwareChannel for NullFirmware {
    fn send_shot_message(&self, _instance: InstanceId, _frame: &FrameInfo, _fcount: u64) -> IpResult<()> {
        Ok(())
    }
}

/// Source of DMA-capable memory.
pub trait BufferAllocator: Send + Sync {
    /// Allocate `size` bytes.
    fn alloc(&self, size: usize, purpose: BufferPurpose) -> IpResult<BufferHandle>;

    /// Return a buffer. Unknown handles are an error.
    fn free(&self, handle: BufferHandle) -> IpResult<()>;
}

pub(crate) fn allocation_error(message: impl Into<String>) -> IpError {
    IpError::new("allocator", IpErrorKind::Allocation, message)
}
