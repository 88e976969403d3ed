//! Per-chain frame queue with four state lists over a preallocated pool.
//!
//! Every record stays in the pool for the lifetime of the queue; only its list
//! membership changes. A record is *linked* when it sits in the list matching its
//! `state`. All operations happen through a [`QueueGuard`], obtained with the
//! blocking [`FrameQueue::lock`] or the bounded [`FrameQueue::lock_irq`].
//!
//! Mis-transitions are never ignored: they are logged at `error!`, counted in
//! [`QueueStats`], and returned as [`IspError::InvalidTransition`].

use crate::error::{IspError, IspResult};
use crate::frame::{FrameId, FrameInfo, FrameRecord, FrameState};
use crate::mask::SlotId;
use crate::sync::{IrqMutex, LockContext};
use parking_lot::MutexGuard;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{error, trace};

/// Counters kept outside the lock.
#[derive(Debug, Default)]
pub struct QueueStats {
    mis_transitions: AtomicU64,
    exhausted: AtomicU64,
    released: AtomicU64,
}

impl QueueStats {
    /// Transitions rejected because the frame was not where the caller said.
    pub fn mis_transitions(&self) -> u64 {
        self.mis_transitions.load(Ordering::Relaxed)
    }

    /// Times a FREE record was requested but none was left.
    pub fn exhausted(&self) -> u64 {
        self.exhausted.load(Ordering::Relaxed)
    }

    /// Records returned to FREE.
    pub fn released(&self) -> u64 {
        self.released.load(Ordering::Relaxed)
    }
}

#[derive(Debug)]
struct QueueInner {
    frames: Vec<FrameRecord>,
    lists: [VecDeque<FrameId>; 4],
}

/// Frame queue owned by a chain head slot and shared by the whole chain.
#[derive(Debug)]
pub struct FrameQueue {
    owner: SlotId,
    capacity: usize,
    inner: IrqMutex<QueueInner>,
    stats: QueueStats,
}

impl FrameQueue {
    /// Create a queue with `capacity` records parked in FREE.
    pub fn new(owner: SlotId, capacity: usize, irq_timeout: Duration) -> Self {
        let capacity = capacity.clamp(1, u16::MAX as usize);
        let frames: Vec<FrameRecord> = (0..capacity)
            .map(|i| {
                let mut record = FrameRecord::new(FrameId(i as u16));
                record.linked = true;
                record
            })
            .collect();
        let free: VecDeque<FrameId> = frames.iter().map(|f| f.id).collect();
        Self {
            owner,
            capacity,
            inner: IrqMutex::new(
                "frame_queue",
                QueueInner {
                    frames,
                    lists: [free, VecDeque::new(), VecDeque::new(), VecDeque::new()],
                },
                irq_timeout,
            ),
            stats: QueueStats::default(),
        }
    }

    /// Slot that owns the canonical queue.
    pub fn owner(&self) -> SlotId {
        self.owner
    }

    /// Pool size.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Counters.
    pub fn stats(&self) -> &QueueStats {
        &self.stats
    }

    /// Blocking acquire (request context).
    pub fn lock(&self) -> QueueGuard<'_> {
        QueueGuard {
            inner: self.inner.lock(),
            stats: &self.stats,
            owner: self.owner,
        }
    }

    /// Bounded acquire (interrupt/timer context).
    pub fn lock_irq(&self) -> IspResult<QueueGuard<'_>> {
        Ok(QueueGuard {
            inner: self.inner.lock_irq()?,
            stats: &self.stats,
            owner: self.owner,
        })
    }

    /// Acquire with the variant matching `ctx`.
    pub fn lock_in(&self, ctx: LockContext) -> IspResult<QueueGuard<'_>> {
        match ctx {
            LockContext::Request => Ok(self.lock()),
            LockContext::Irq => self.lock_irq(),
        }
    }
}

/// Exclusive access to a queue's lists and records.
pub struct QueueGuard<'a> {
    inner: MutexGuard<'a, QueueInner>,
    stats: &'a QueueStats,
    owner: SlotId,
}

impl QueueGuard<'_> {
    /// Record by id.
    pub fn frame(&self, id: FrameId) -> Option<&FrameRecord> {
        self.inner.frames.get(id.index())
    }

    /// Mutable record by id.
    pub fn frame_mut(&mut self, id: FrameId) -> Option<&mut FrameRecord> {
        self.inner.frames.get_mut(id.index())
    }

    /// Number of records linked in `state`.
    pub fn count(&self, state: FrameState) -> usize {
        self.inner.lists[state.index()].len()
    }

    /// Ids linked in `state`, head first.
    pub fn ids(&self, state: FrameState) -> Vec<FrameId> {
        self.inner.lists[state.index()].iter().copied().collect()
    }

    /// Head of `state` without removing it.
    pub fn peek_head(&self, state: FrameState) -> Option<FrameId> {
        self.inner.lists[state.index()].front().copied()
    }

    /// Oldest record in `state` matching `predicate`.
    pub fn find<P>(&self, state: FrameState, predicate: P) -> Option<FrameId>
    where
        P: Fn(&FrameRecord) -> bool,
    {
        let inner = &*self.inner;
        inner.lists[state.index()]
            .iter()
            .copied()
            .find(|id| predicate(&inner.frames[id.index()]))
    }

    /// Unlink the head of `state`. The record keeps its state but belongs to no
    /// list until it is passed back to [`enqueue`](Self::enqueue).
    pub fn dequeue_head(&mut self, state: FrameState) -> Option<FrameId> {
        let inner = &mut *self.inner;
        let id = inner.lists[state.index()].pop_front()?;
        inner.frames[id.index()].linked = false;
        Some(id)
    }

    /// Link a detached record at the tail of `state`.
    pub fn enqueue(&mut self, state: FrameState, id: FrameId) -> IspResult<()> {
        let owner = self.owner;
        let inner = &mut *self.inner;
        let record = inner.frames.get_mut(id.index()).ok_or(IspError::FrameNotFound {
            slot: owner,
            fcount: 0,
            state,
        })?;
        if record.linked {
            let actual = record.state;
            return Err(self.reject(id, actual, state, actual));
        }
        record.state = state;
        record.linked = true;
        record.trace.record(state);
        inner.lists[state.index()].push_back(id);
        Ok(())
    }

    /// Take the oldest FREE record for a new frame. The record is recycled and
    /// left in REQUEST; the caller fills in its fields.
    pub fn acquire_free(&mut self) -> IspResult<FrameId> {
        let Some(id) = self.peek_head(FrameState::Free) else {
            self.stats.exhausted.fetch_add(1, Ordering::Relaxed);
            return Err(IspError::QueueExhausted(self.owner));
        };
        if let Some(record) = self.frame_mut(id) {
            record.recycle();
        }
        self.transition(id, FrameState::Free, FrameState::Request)?;
        Ok(id)
    }

    /// Move `id` from `from` to the tail of `to`.
    pub fn transition(&mut self, id: FrameId, from: FrameState, to: FrameState) -> IspResult<()> {
        let owner = self.owner;
        let actual = match self.inner.frames.get(id.index()) {
            Some(record) if record.linked => record.state,
            Some(_) => {
                // detached records are reported as being in FREE
                return Err(self.reject(id, from, to, FrameState::Free));
            }
            None => {
                return Err(IspError::FrameNotFound {
                    slot: owner,
                    fcount: 0,
                    state: from,
                })
            }
        };
        if actual != from || !from.can_transition_to(to) {
            return Err(self.reject(id, from, to, actual));
        }

        let inner = &mut *self.inner;
        let list = &mut inner.lists[from.index()];
        let Some(pos) = list.iter().position(|f| *f == id) else {
            return Err(self.reject(id, from, to, actual));
        };
        list.remove(pos);
        inner.lists[to.index()].push_back(id);
        let record = &mut inner.frames[id.index()];
        record.state = to;
        record.dispatching = false;
        record.trace.record(to);
        trace!(slot = %owner, frame = %id, fcount = record.fcount, %from, %to, "frame transition");
        Ok(())
    }

    /// Check that `id` is linked in `state` before moving it to `next` later,
    /// outside the lock. A mismatch is reported like a rejected transition.
    pub fn expect(&self, id: FrameId, state: FrameState, next: FrameState) -> IspResult<FrameInfo> {
        let record = self.frame(id).ok_or(IspError::FrameNotFound {
            slot: self.owner,
            fcount: 0,
            state,
        })?;
        let actual = if record.linked { record.state } else { FrameState::Free };
        if actual != state {
            return Err(self.reject(id, state, next, actual));
        }
        Ok(record.info())
    }

    /// Claim a REQUEST frame for dispatch. The frame stays linked in REQUEST but
    /// other contexts must leave it alone until it transitions.
    pub fn claim(&mut self, id: FrameId) -> IspResult<FrameInfo> {
        let info = self.expect(id, FrameState::Request, FrameState::Configure)?;
        let owner = self.owner;
        match self.frame_mut(id) {
            Some(record) if record.dispatching => Err(IspError::DispatchInProgress { frame: id }),
            Some(record) => {
                record.dispatching = true;
                Ok(info)
            }
            None => Err(IspError::FrameNotFound {
                slot: owner,
                fcount: info.fcount,
                state: FrameState::Request,
            }),
        }
    }

    /// Return a frame to FREE. Fails if any slot still owns it.
    pub fn release(&mut self, id: FrameId) -> IspResult<FrameRecord> {
        let (from, owners) = match self.frame(id) {
            Some(record) => (record.state, record.owner),
            None => {
                return Err(IspError::FrameNotFound {
                    slot: self.owner,
                    fcount: 0,
                    state: FrameState::WaitDone,
                })
            }
        };
        if !owners.is_empty() {
            error!(slot = %self.owner, frame = %id, owners = ?owners.owners(), "release of owned frame");
            self.stats.mis_transitions.fetch_add(1, Ordering::Relaxed);
            return Err(IspError::FrameStillOwned {
                frame: id,
                owners: format!("{:?}", owners.owners()),
            });
        }
        let snapshot = self.frame(id).cloned();
        self.transition(id, from, FrameState::Free)?;
        self.stats.released.fetch_add(1, Ordering::Relaxed);
        snapshot.ok_or(IspError::FrameNotFound {
            slot: self.owner,
            fcount: 0,
            state: from,
        })
    }

    fn reject(&self, id: FrameId, from: FrameState, to: FrameState, actual: FrameState) -> IspError {
        self.stats.mis_transitions.fetch_add(1, Ordering::Relaxed);
        error!(
            slot = %self.owner,
            frame = %id,
            %from,
            %to,
            %actual,
            "invalid frame transition"
        );
        IspError::InvalidTransition {
            frame: id,
            from,
            to,
            actual,
        }
    }
}
