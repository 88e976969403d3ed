//! Bracketed-exposure (AEB) sub-state machine.
//!
//! Pure bookkeeping: it is advanced with the sensor's HDR mode at each frame
//! boundary and tells the scheduler how to modify its next dispatch. It never
//! touches hardware.
//!
//! ```text
//!            Bracketed            Bracketed
//!   SINGLE ─────────────▶ SWITCHING ─────────────▶ TWO_EXPOSURE
//!     ▲                      │                          │
//!     └──────── Single ──────┴───────── Single ─────────┘
//!     ▲
//!     └──────── error (from any state)
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;

/// HDR mode reported by the sensor for the coming frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SensorHdrMode {
    /// One exposure per frame.
    Single,
    /// Long and short exposure per frame.
    Bracketed,
}

/// Bracketing sub-state of an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AebState {
    /// Normal capture.
    #[default]
    Single,
    /// Sensor is changing mode; the next sensor shot is skipped.
    Switching,
    /// Every dispatch is followed by a short-exposure dispatch.
    TwoExposure,
}

impl fmt::Display for AebState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            AebState::Single => "SINGLE",
            AebState::Switching => "SWITCHING",
            AebState::TwoExposure => "2-EXPOSURE",
        };
        f.write_str(label)
    }
}

/// How the scheduler should treat the next config-lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AebAction {
    /// Dispatch normally.
    Dispatch,
    /// Do not dispatch this frame.
    SkipSensorShot,
    /// Dispatch, then dispatch one short-exposure frame on the branch chain.
    DispatchWithShort,
}

/// AEB state plus transition accounting.
#[derive(Debug, Clone, Default)]
pub struct AebMachine {
    state: AebState,
    transitions: u64,
    errors: u64,
}

impl AebMachine {
    /// Machine in SINGLE.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current state.
    pub fn state(&self) -> AebState {
        self.state
    }

    /// Number of state changes so far.
    pub fn transitions(&self) -> u64 {
        self.transitions
    }

    /// Number of error reverts so far.
    pub fn errors(&self) -> u64 {
        self.errors
    }

    /// Advance with the sensor mode observed at a frame boundary.
    pub fn on_frame_boundary(&mut self, mode: SensorHdrMode) -> AebState {
        let next = match (self.state, mode) {
            (AebState::Single, SensorHdrMode::Bracketed) => AebState::Switching,
            (AebState::Switching, SensorHdrMode::Bracketed) => AebState::TwoExposure,
            (AebState::Switching, SensorHdrMode::Single) => AebState::Single,
            (AebState::TwoExposure, SensorHdrMode::Single) => AebState::Single,
            (state, _) => state,
        };
        self.set(next);
        next
    }

    /// Revert to SINGLE after an error.
    pub fn on_error(&mut self) {
        if self.state != AebState::Single {
            self.errors += 1;
        }
        self.set(AebState::Single);
    }

    /// Dispatch modifier for the current state.
    pub fn action(&self) -> AebAction {
        match self.state {
            AebState::Single => AebAction::Dispatch,
            AebState::Switching => AebAction::SkipSensorShot,
            AebState::TwoExposure => AebAction::DispatchWithShort,
        }
    }

    fn set(&mut self, next: AebState) {
        if next != self.state {
            self.transitions += 1;
            self.state = next;
        }
    }
}
