//! # ISP Orchestration Core
//!
//! This crate drives a chain of hardware image-processing blocks ("IPs") through
//! a per-frame shot lifecycle: it accepts frame requests, dispatches them through
//! the chain at config-lock, tracks completion interrupts, detects stuck frames
//! with a watchdog and recovers from hardware or firmware failures. Register
//! programming, sensor drivers and firmware protocols are collaborators plugged
//! in through the traits in [`hardware`].
//!
//! ## Crate Structure
//!
//! - **`core`**: the [`IspCore`] handle and its builder.
//! - **`scheduler`**: `request_shot`, `dispatch_shot`, `on_config_lock`.
//! - **`monitor`**: frame-start/end interrupts, watchdog, forced flush, dumps.
//! - **`completion`**: success/NDONE completion and the deferred event channel.
//! - **`lifecycle`**: refcounted open/close, streaming, parameters, setfiles, AEB.
//! - **`queue`** / **`frame`**: the four-state frame queue and its records.
//! - **`slot`** / **`registry`**: per-IP runtime state and the slot/instance tables.
//! - **`topology`**: validated chain layout (primary chain plus branches).
//! - **`aeb`**, **`setfile`**, **`timelog`**, **`timer`**, **`sync`**, **`mask`**:
//!   supporting state machines and primitives.
//! - **`config`** / **`logging`** / **`error`**: ambient configuration, tracing
//!   setup and error types.
//!
//! ## Frame lifecycle
//!
//! ```text
//! FREE ──request_shot──▶ REQUEST ──config-lock──▶ CONFIGURE ──frame-start──▶ WAIT_DONE
//!  ▲                        │                                                  │
//!  │                        └──── late / delayed / aborted ─────────────▶──────┤
//!  └───────────────────── frame-end, owner mask empty (one completion) ◀───────┘
//! ```

pub mod aeb;
pub mod completion;
pub mod config;
pub mod core;
pub mod error;
pub mod frame;
pub mod hardware;
pub mod lifecycle;
pub mod logging;
pub mod mask;
pub mod monitor;
pub mod queue;
pub mod registry;
pub mod scheduler;
pub mod setfile;
pub mod slot;
pub mod sync;
pub mod timelog;
pub mod timer;
pub mod topology;

pub use crate::completion::{spawn_completion_worker, CompletionReceiver, FrameCompletion, PipelineEvent};
pub use crate::core::{IspCore, IspCoreBuilder};
pub use crate::error::{IpError, IpErrorKind, IspError, IspResult};
pub use crate::frame::{FrameGeometry, FrameId, FrameKind, FrameRequest, FrameState, Outcome};
pub use crate::lifecycle::InstanceDesc;
pub use crate::mask::{InstanceId, OwnerMask, SlotId, SlotMask};
pub use crate::slot::{SlotDescriptor, SlotFlags};
