//! Queue-scoped mutual exclusion with an interrupt-context variant.
//!
//! Request-context paths (shot dispatch, open/close) take the lock blocking.
//! Interrupt-context paths (frame start/end, config-lock, watchdog expiry) must
//! never wait unboundedly, so they use [`IrqMutex::lock_irq`], which gives up after
//! a configured bound and reports [`IspError::LockContended`].

use crate::error::{IspError, IspResult};
use parking_lot::{Mutex, MutexGuard};
use std::time::Duration;
use tracing::warn;

/// Default bound for interrupt-context acquires.
pub const DEFAULT_IRQ_ACQUIRE_TIMEOUT: Duration = Duration::from_micros(500);

/// Mutex with a blocking acquire and a bounded, interrupt-safe acquire.
pub struct IrqMutex<T> {
    name: &'static str,
    inner: Mutex<T>,
    irq_timeout: Duration,
}

impl<T> IrqMutex<T> {
    /// Wrap `value`. `name` identifies the lock in logs and errors.
    pub fn new(name: &'static str, value: T, irq_timeout: Duration) -> Self {
        Self {
            name,
            inner: Mutex::new(value),
            irq_timeout,
        }
    }

    /// Blocking acquire for request context.
    pub fn lock(&self) -> MutexGuard<'_, T> {
        self.inner.lock()
    }

    /// Bounded acquire for interrupt and timer context.
    pub fn lock_irq(&self) -> IspResult<MutexGuard<'_, T>> {
        if let Some(guard) = self.inner.try_lock() {
            return Ok(guard);
        }
        self.inner.try_lock_for(self.irq_timeout).ok_or_else(|| {
            warn!(lock = self.name, timeout_us = self.irq_timeout.as_micros() as u64, "irq lock contended");
            IspError::LockContended(self.name)
        })
    }

    /// Name given at construction.
    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for IrqMutex<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IrqMutex")
            .field("name", &self.name)
            .field("irq_timeout", &self.irq_timeout)
            .finish_non_exhaustive()
    }
}

/// Which acquire variant a code path must use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockContext {
    /// Blocking-capable request processing.
    Request,
    /// Interrupt or timer callback.
    Irq,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn irq_acquire_succeeds_when_free() {
        let lock = IrqMutex::new("test", 5u32, Duration::from_micros(100));
        let guard = lock.lock_irq().unwrap();
        assert_eq!(*guard, 5);
    }

    #[test]
    fn irq_acquire_gives_up_when_held() {
        let lock = Arc::new(IrqMutex::new("held", 0u32, Duration::from_millis(5)));
        let _held = lock.lock();
        let other = Arc::clone(&lock);
        let result = std::thread::spawn(move || other.lock_irq().map(|_| ()))
            .join()
            .unwrap();
        assert!(matches!(result, Err(IspError::LockContended("held"))));
    }
}
