//! The frame entity that travels through a hardware chain.
//!
//! A `FrameRecord` lives its whole life inside one [`FrameQueue`](crate::queue::FrameQueue):
//! it is preallocated in FREE, filled when a shot is requested, and returned to FREE
//! once every owning slot has let go of it.

use crate::hardware::{BufferHandle, FrameMeta};
use crate::mask::{InstanceId, OwnerMask, SlotId, SlotMask};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Index of a record inside its queue's preallocated pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FrameId(pub u16);

impl FrameId {
    #[inline]
    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for FrameId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

// =============================================================================
// Outcome
// =============================================================================

/// Result code carried by a frame and delivered with its completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// Processed normally.
    Success,
    /// The frame's target fcount had already passed.
    LateFrame,
    /// Dispatch aborted before hardware programming completed.
    Unprocessed,
    /// Watchdog-detected stall.
    Timeout,
    /// Hardware buffer or queue overrun reported by an IP.
    Overflow,
    /// The frame's fcount did not match the hardware sequence.
    InvalidFrameNumber,
    /// The config-lock callback arrived after the sensor vsync it was meant for.
    ConfigLockDelay,
    /// Stale WAIT_DONE frame flushed to make room.
    Drop,
}

impl Outcome {
    /// True for [`Outcome::Success`].
    pub fn is_success(self) -> bool {
        self == Outcome::Success
    }

    /// Stable lowercase label used in log fields.
    pub fn label(self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::LateFrame => "late_frame",
            Outcome::Unprocessed => "unprocessed",
            Outcome::Timeout => "timeout",
            Outcome::Overflow => "overflow",
            Outcome::InvalidFrameNumber => "invalid_frame_number",
            Outcome::ConfigLockDelay => "config_lock_delay",
            Outcome::Drop => "drop",
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

// =============================================================================
// State / Kind
// =============================================================================

/// Queue state of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameState {
    /// Parked in the pool.
    Free,
    /// Requested, waiting for its config-lock.
    Request,
    /// Programmed into the chain, waiting for frame start.
    Configure,
    /// Started in hardware, waiting for every owner to finish.
    WaitDone,
}

impl FrameState {
    /// All states in lifecycle order.
    pub const ALL: [FrameState; 4] = [
        FrameState::Free,
        FrameState::Request,
        FrameState::Configure,
        FrameState::WaitDone,
    ];

    pub(crate) fn index(self) -> usize {
        match self {
            FrameState::Free => 0,
            FrameState::Request => 1,
            FrameState::Configure => 2,
            FrameState::WaitDone => 3,
        }
    }

    /// Whether `self -> to` is a legal edge.
    ///
    /// The forward path is FREE -> REQUEST -> CONFIGURE -> WAIT_DONE -> FREE. Late
    /// and forced frames may jump REQUEST -> WAIT_DONE, and the ndone/flush paths
    /// may release REQUEST or CONFIGURE frames straight to FREE. Nothing ever moves
    /// backwards towards REQUEST.
    pub fn can_transition_to(self, to: FrameState) -> bool {
        use FrameState::*;
        matches!(
            (self, to),
            (Free, Request)
                | (Request, Configure)
                | (Request, WaitDone)
                | (Configure, WaitDone)
                | (WaitDone, Free)
                | (Request, Free)
                | (Configure, Free)
        )
    }
}

impl fmt::Display for FrameState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            FrameState::Free => "FREE",
            FrameState::Request => "REQUEST",
            FrameState::Configure => "CONFIGURE",
            FrameState::WaitDone => "WAIT_DONE",
        };
        f.write_str(label)
    }
}

/// Origin of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameKind {
    /// Requested by the caller.
    External,
    /// Synthesised by the scheduler to keep the chain running.
    Internal,
    /// External frame that missed its hardware window.
    Late,
    /// Multi-buffer frame (`num_buffers > 1`).
    Multi,
}

/// Set of states a frame has visited during one lifecycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StateTrace(u8);

impl StateTrace {
    pub(crate) fn record(&mut self, state: FrameState) {
        self.0 |= 1 << state.index();
    }

    /// True if the frame passed through `state`.
    pub fn visited(self, state: FrameState) -> bool {
        self.0 & (1 << state.index()) != 0
    }
}

/// Frame geometry reused for internal frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FrameGeometry {
    /// Output width in pixels.
    pub width: u32,
    /// Output height in pixels.
    pub height: u32,
    /// Buffers per frame; greater than one for multi-buffer (FRO) capture.
    pub num_buffers: u32,
}

impl FrameGeometry {
    /// Single-buffer geometry.
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            num_buffers: 1,
        }
    }
}

// =============================================================================
// FrameRequest / FrameRecord
// =============================================================================

/// A capture request submitted by the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameRequest {
    /// Target hardware frame count.
    pub fcount: u64,
    /// Output geometry.
    pub geometry: FrameGeometry,
    /// Output buffers, opaque to the core.
    pub buffers: Vec<BufferHandle>,
}

impl FrameRequest {
    /// Request for `fcount` with default single-buffer geometry and no buffers.
    pub fn new(fcount: u64) -> Self {
        Self {
            fcount,
            geometry: FrameGeometry {
                num_buffers: 1,
                ..FrameGeometry::default()
            },
            buffers: Vec::new(),
        }
    }

    /// Builder: set geometry.
    pub fn with_geometry(mut self, geometry: FrameGeometry) -> Self {
        self.geometry = geometry;
        self
    }

    /// Builder: attach buffers.
    pub fn with_buffers(mut self, buffers: Vec<BufferHandle>) -> Self {
        self.buffers = buffers;
        self
    }
}

/// One frame slot in a queue's pool.
#[derive(Debug, Clone)]
pub struct FrameRecord {
    /// Pool index.
    pub id: FrameId,
    /// Bumped every time the record is recycled.
    pub generation: u64,
    /// Owning logical stream.
    pub instance: InstanceId,
    /// Capture sequence number.
    pub fcount: u64,
    /// Current queue state.
    pub state: FrameState,
    /// Origin.
    pub kind: FrameKind,
    /// Slots that still hold this frame.
    pub owner: OwnerMask,
    /// First non-success result wins.
    pub result: Outcome,
    /// Geometry and buffer count.
    pub geometry: FrameGeometry,
    /// Output buffers.
    pub buffers: Vec<BufferHandle>,
    /// States visited since the record left FREE.
    pub trace: StateTrace,
    /// Metadata collected from each slot on completion.
    pub meta: Vec<(SlotId, FrameMeta)>,
    pub(crate) linked: bool,
    pub(crate) dispatching: bool,
}

impl FrameRecord {
    pub(crate) fn new(id: FrameId) -> Self {
        Self {
            id,
            generation: 0,
            instance: InstanceId(0),
            fcount: 0,
            state: FrameState::Free,
            kind: FrameKind::External,
            owner: OwnerMask::default(),
            result: Outcome::Success,
            geometry: FrameGeometry::default(),
            buffers: Vec::new(),
            trace: StateTrace::default(),
            meta: Vec::new(),
            linked: false,
            dispatching: false,
        }
    }

    /// Record an outcome; the first non-success result sticks.
    ///
    /// Returns true if the stored result changed.
    pub fn record_result(&mut self, outcome: Outcome) -> bool {
        if self.result.is_success() && !outcome.is_success() {
            self.result = outcome;
            return true;
        }
        false
    }

    /// Whether a dispatch has claimed this REQUEST frame and is programming its
    /// chain.
    pub fn is_dispatching(&self) -> bool {
        self.dispatching
    }

    /// Multi-buffer frames are exempt from fcount ordering checks.
    pub fn is_multi_buffer(&self) -> bool {
        self.geometry.num_buffers > 1
    }

    /// Internal frames never reach the caller.
    pub fn is_user_visible(&self) -> bool {
        self.kind != FrameKind::Internal
    }

    /// Copy of the fields collaborators need, taken so no lock is held while
    /// they run.
    pub fn info(&self) -> FrameInfo {
        FrameInfo {
            id: self.id,
            generation: self.generation,
            instance: self.instance,
            fcount: self.fcount,
            kind: self.kind,
            result: self.result,
            num_buffers: self.geometry.num_buffers,
            owners: self.owner.owners(),
        }
    }

    pub(crate) fn recycle(&mut self) {
        self.generation = self.generation.wrapping_add(1);
        self.fcount = 0;
        self.kind = FrameKind::External;
        self.owner.reset();
        self.result = Outcome::Success;
        self.geometry = FrameGeometry::default();
        self.buffers.clear();
        self.trace = StateTrace::default();
        self.meta.clear();
        self.dispatching = false;
    }
}

/// Snapshot of a frame handed to collaborators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameInfo {
    /// Pool index.
    pub id: FrameId,
    /// Recycle generation at snapshot time.
    pub generation: u64,
    /// Owning stream.
    pub instance: InstanceId,
    /// Capture sequence number.
    pub fcount: u64,
    /// Origin.
    pub kind: FrameKind,
    /// Result recorded so far.
    pub result: Outcome,
    /// Buffers per frame.
    pub num_buffers: u32,
    /// Owners at snapshot time.
    pub owners: SlotMask,
}
