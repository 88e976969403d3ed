//! Heap-backed [`BufferAllocator`].
//!
//! Buffers are zeroed `BytesMut` regions kept in a table keyed by handle id.
//! Handles are never reused within one allocator.

use super::{allocation_error, BufferAllocator, BufferHandle, BufferPurpose, IpResult};
use bytes::BytesMut;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, error};

/// Allocator that hands out plain heap memory.
#[derive(Debug)]
pub struct HeapAllocator {
    next_id: AtomicU64,
    limit_bytes: usize,
    buffers: Mutex<HashMap<u64, (BufferPurpose, BytesMut)>>,
}

impl HeapAllocator {
    /// Allocator without a size limit.
    pub fn new() -> Self {
        Self::with_limit(usize::MAX)
    }

    /// Allocator that refuses to hold more than `limit_bytes` at once.
    pub fn with_limit(limit_bytes: usize) -> Self {
        Self {
            next_id: AtomicU64::new(1),
            limit_bytes,
            buffers: Mutex::new(HashMap::new()),
        }
    }

    /// Number of live buffers.
    pub fn live(&self) -> usize {
        self.buffers.lock().len()
    }

    /// Bytes currently allocated.
    pub fn allocated_bytes(&self) -> usize {
        self.buffers.lock().values().map(|(_, buf)| buf.len()).sum()
    }
}

impl Default for HeapAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl BufferAllocator for HeapAllocator {
    fn alloc(&self, size: usize, purpose: BufferPurpose) -> IpResult<BufferHandle> {
        let mut buffers = self.buffers.lock();
        let in_use: usize = buffers.values().map(|(_, buf)| buf.len()).sum();
        if in_use.saturating_add(size) > self.limit_bytes {
            error!(size, in_use, limit = self.limit_bytes, "buffer allocation over limit");
            return Err(allocation_error(format!(
                "{} bytes requested, {} of {} in use",
                size, in_use, self.limit_bytes
            )));
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        buffers.insert(id, (purpose, BytesMut::zeroed(size)));
        debug!(id, size, ?purpose, "buffer allocated");
        Ok(BufferHandle { id, size })
    }

    fn free(&self, handle: BufferHandle) -> IpResult<()> {
        match self.buffers.lock().remove(&handle.id) {
            Some(_) => Ok(()),
            None => Err(allocation_error(format!("unknown buffer handle {}", handle.id))),
        }
    }
}
