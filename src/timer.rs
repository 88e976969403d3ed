//! Cancellable one-shot timers for the per-chain watchdog.
//!
//! Arming replaces any pending expiry, so a watchdog that is re-armed on every
//! config-lock never stacks callbacks. A callback fires at most once per arm.
//!
//! - [`TokioTimer`] runs the callback on a tokio runtime after a real delay.
//! - [`ManualTimer`] only fires when the test says so.

use crate::error::{IspError, IspResult};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::trace;

/// Work run on expiry.
pub type TimerCallback = Box<dyn FnOnce() + Send + 'static>;

/// One-shot timer facility.
pub trait OneShotTimer: Send + Sync {
    /// Schedule `callback` after `duration`, replacing any pending expiry.
    fn arm(&self, duration: Duration, callback: TimerCallback);

    /// Drop the pending expiry. Returns true if one was pending.
    fn cancel(&self) -> bool;

    /// True while an expiry is pending.
    fn is_armed(&self) -> bool;
}

// =============================================================================
// TokioTimer
// =============================================================================

struct Pending {
    generation: u64,
    task: JoinHandle<()>,
}

/// Timer backed by a spawned tokio task.
pub struct TokioTimer {
    handle: Handle,
    generation: Arc<AtomicU64>,
    pending: Arc<Mutex<Option<Pending>>>,
}

impl TokioTimer {
    /// Timer on the runtime of the calling context.
    pub fn new() -> IspResult<Self> {
        let handle = Handle::try_current()
            .map_err(|e| IspError::Timer(format!("no tokio runtime: {}", e)))?;
        Ok(Self::with_handle(handle))
    }

    /// Timer on an explicit runtime.
    pub fn with_handle(handle: Handle) -> Self {
        Self {
            handle,
            generation: Arc::new(AtomicU64::new(0)),
            pending: Arc::new(Mutex::new(None)),
        }
    }
}

impl OneShotTimer for TokioTimer {
    fn arm(&self, duration: Duration, callback: TimerCallback) {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let pending = Arc::clone(&self.pending);
        let task = self.handle.spawn(async move {
            tokio::time::sleep(duration).await;
            let current = {
                let mut slot = pending.lock();
                match slot.as_ref() {
                    Some(p) if p.generation == generation => slot.take().is_some(),
                    _ => false,
                }
            };
            if current {
                callback();
            }
        });

        let previous = self.pending.lock().replace(Pending { generation, task });
        if let Some(previous) = previous {
            previous.task.abort();
        }
        trace!(generation, timeout_ms = duration.as_millis() as u64, "timer armed");
    }

    fn cancel(&self) -> bool {
        match self.pending.lock().take() {
            Some(previous) => {
                previous.task.abort();
                true
            }
            None => false,
        }
    }

    fn is_armed(&self) -> bool {
        self.pending.lock().is_some()
    }
}

impl Drop for TokioTimer {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl std::fmt::Debug for TokioTimer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokioTimer")
            .field("armed", &self.is_armed())
            .finish()
    }
}

// =============================================================================
// ManualTimer
// =============================================================================

/// Timer that never expires on its own.
#[derive(Default)]
pub struct ManualTimer {
    pending: Mutex<Option<(Duration, TimerCallback)>>,
    arms: AtomicUsize,
    cancels: AtomicUsize,
}

impl ManualTimer {
    /// Unarmed timer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Run the pending callback, if any. Returns true if something fired.
    pub fn fire(&self) -> bool {
        let pending = self.pending.lock().take();
        match pending {
            Some((_, callback)) => {
                callback();
                true
            }
            None => false,
        }
    }

    /// Times `arm` was called.
    pub fn arm_count(&self) -> usize {
        self.arms.load(Ordering::SeqCst)
    }

    /// Times `cancel` dropped a pending expiry.
    pub fn cancel_count(&self) -> usize {
        self.cancels.load(Ordering::SeqCst)
    }

    /// Duration of the pending expiry.
    pub fn armed_duration(&self) -> Option<Duration> {
        self.pending.lock().as_ref().map(|(d, _)| *d)
    }
}

impl OneShotTimer for ManualTimer {
    fn arm(&self, duration: Duration, callback: TimerCallback) {
        self.arms.fetch_add(1, Ordering::SeqCst);
        *self.pending.lock() = Some((duration, callback));
    }

    fn cancel(&self) -> bool {
        let dropped = self.pending.lock().take().is_some();
        if dropped {
            self.cancels.fetch_add(1, Ordering::SeqCst);
        }
        dropped
    }

    fn is_armed(&self) -> bool {
        self.pending.lock().is_some()
    }
}

impl std::fmt::Debug for ManualTimer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManualTimer")
            .field("armed", &self.is_armed())
            .field("arms", &self.arm_count())
            .finish()
    }
}
