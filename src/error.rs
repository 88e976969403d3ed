//! Error types for the ISP orchestration core.
//!
//! Two layers, following the same split as the driver stack this core talks to:
//!
//! - **`IpError`**: a structured failure reported by an external collaborator
//!   (a per-IP operation, the firmware channel, the buffer allocator). It carries
//!   the name of the block that failed and a coarse [`IpErrorKind`].
//! - **`IspError`**: the crate-wide error returned by every core operation. It
//!   wraps `IpError` where a collaborator is the root cause and adds the core's own
//!   failure modes (bad topology, queue exhaustion, mis-transitions, lock contention
//!   in interrupt context).
//!
//! `IspResult<T>` is the alias used throughout the crate.

use crate::frame::{FrameId, FrameState};
use crate::mask::{InstanceId, SlotId};
use thiserror::Error;

// =============================================================================
// Collaborator Errors
// =============================================================================

/// Coarse category of a collaborator failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpErrorKind {
    /// Opening or initialising the block failed.
    Initialization,
    /// Register programming for a shot was rejected.
    Shot,
    /// Restoring a previous register state failed.
    Restore,
    /// Tuning data could not be loaded or applied.
    Setfile,
    /// The firmware/co-processor channel did not accept a message.
    Firmware,
    /// The block reported a hardware fault.
    Hardware,
    /// The block did not answer in time.
    Timeout,
    /// Buffer allocation failed.
    Allocation,
    /// Anything else.
    Unknown,
}

impl std::fmt::Display for IpErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            IpErrorKind::Initialization => "initialization",
            IpErrorKind::Shot => "shot",
            IpErrorKind::Restore => "restore",
            IpErrorKind::Setfile => "setfile",
            IpErrorKind::Firmware => "firmware",
            IpErrorKind::Hardware => "hardware",
            IpErrorKind::Timeout => "timeout",
            IpErrorKind::Allocation => "allocation",
            IpErrorKind::Unknown => "unknown",
        };
        write!(f, "{}", label)
    }
}

/// Failure reported by an external collaborator.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("IP '{ip}' {kind} error: {message}")]
pub struct IpError {
    /// Name of the block (or collaborator) that failed.
    pub ip: String,
    /// Failure category.
    pub kind: IpErrorKind,
    /// Human-readable detail.
    pub message: String,
}

impl IpError {
    /// Create a new collaborator error.
    pub fn new(ip: impl Into<String>, kind: IpErrorKind, message: impl Into<String>) -> Self {
        Self {
            ip: ip.into(),
            kind,
            message: message.into(),
        }
    }
}

// =============================================================================
// Core Errors
// =============================================================================

/// Convenience alias for results using the core error type.
pub type IspResult<T> = std::result::Result<T, IspError>;

/// Primary error type of the orchestration core.
#[derive(Error, Debug)]
pub enum IspError {
    /// Configuration file could not be parsed or extracted.
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    /// Configuration parsed but failed semantic validation.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// Standard I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A collaborator failed outside of the shot path.
    #[error("{0}")]
    Ip(#[from] IpError),

    /// A per-IP shot failed; the chain was rolled back.
    #[error("Shot failed on slot {slot}: {source}")]
    ShotFailed {
        /// Slot whose shot operation failed.
        slot: SlotId,
        /// Collaborator error.
        source: IpError,
    },

    /// The slot id is out of range or nothing is registered there.
    #[error("Hardware slot {0} is not registered")]
    SlotNotRegistered(SlotId),

    /// A slot was registered twice.
    #[error("Hardware slot {0} is already registered")]
    SlotAlreadyRegistered(SlotId),

    /// The instance id is out of range.
    #[error("Instance {0} is out of range")]
    InvalidInstance(InstanceId),

    /// The instance is not open.
    #[error("Instance {0} is not open")]
    InstanceNotOpen(InstanceId),

    /// The instance is already open.
    #[error("Instance {0} is already open")]
    InstanceAlreadyOpen(InstanceId),

    /// The slot has no instance bound to it, so interrupt work cannot be routed.
    #[error("No active instance bound to slot {0}")]
    NoActiveInstance(SlotId),

    /// The requested chain topology is malformed.
    #[error("Invalid chain topology: {0}")]
    InvalidChain(String),

    /// Every preallocated frame of the queue is in flight.
    #[error("Frame queue of slot {0} is exhausted")]
    QueueExhausted(SlotId),

    /// A frame was not found where the caller expected it.
    #[error("Frame fcount={fcount} not found in {state} of slot {slot}")]
    FrameNotFound {
        /// Queue owner.
        slot: SlotId,
        /// Hardware frame count looked up.
        fcount: u64,
        /// State that was searched.
        state: FrameState,
    },

    /// A transition was requested from a state the frame is not in, or along a
    /// forbidden edge.
    #[error("Invalid transition of frame {frame}: {from} -> {to} (frame is {actual})")]
    InvalidTransition {
        /// Frame that was moved.
        frame: FrameId,
        /// Stated source state.
        from: FrameState,
        /// Requested target state.
        to: FrameState,
        /// State the frame is actually in.
        actual: FrameState,
    },

    /// The frame was released to FREE while a slot still owned it.
    #[error("Frame {frame} still owned by slots {owners}")]
    FrameStillOwned {
        /// Frame that was released.
        frame: FrameId,
        /// Remaining owners, rendered.
        owners: String,
    },

    /// The frame's target hardware window has already passed.
    #[error("Frame fcount={fcount} is late (hardware at {hw_fcount})")]
    LateFrame {
        /// Requested frame count.
        fcount: u64,
        /// Current hardware frame count.
        hw_fcount: u64,
    },

    /// Another frame is already active for this fcount, or fcount order was violated.
    #[error("Frame fcount={fcount} is out of order on slot {slot}")]
    InvalidFrameNumber {
        /// Queue owner.
        slot: SlotId,
        /// Offending frame count.
        fcount: u64,
    },

    /// Another context is already dispatching this frame.
    #[error("Frame {frame} is already being dispatched")]
    DispatchInProgress {
        /// Claimed frame.
        frame: FrameId,
    },

    /// The interrupt-safe lock acquire did not succeed within its bound.
    #[error("Lock '{0}' contended in interrupt context")]
    LockContended(&'static str),

    /// Setfile sequencing failed.
    #[error("Setfile error: {0}")]
    Setfile(String),

    /// A timer could not be created.
    #[error("Timer error: {0}")]
    Timer(String),

    /// Closing an instance completed with errors.
    #[error("Shutdown failed with errors")]
    ShutdownFailed(Vec<IspError>),
}

impl From<figment::Error> for IspError {
    fn from(err: figment::Error) -> Self {
        IspError::Config(Box::new(err))
    }
}

impl IspError {
    /// True when the error came from a collaborator rather than core bookkeeping.
    pub fn is_collaborator(&self) -> bool {
        matches!(self, IspError::Ip(_) | IspError::ShotFailed { .. })
    }
}
