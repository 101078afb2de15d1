//! Reusable scratch buffers for streaming retrievals

use parking_lot::Mutex;

/// Capacity of a pooled scratch buffer
pub const SCRATCH_BUFFER_SIZE: usize = 200_000;

const MAX_POOLED: usize = 32;

/// A free-list of reusable byte buffers shared by all recordings.
///
/// Retrieval paths copy segment bytes into a pooled buffer under the
/// recording mutex, then release the mutex before flushing to the
/// caller's writer so slow consumers don't block writers.
pub struct BufferPool {
    buffers: Mutex<Vec<Vec<u8>>>,
}

impl BufferPool {
    /// Create an empty pool.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            buffers: Mutex::new(Vec::new()),
        }
    }

    /// Take a cleared buffer from the pool, or allocate a fresh one.
    pub fn get(&self) -> Vec<u8> {
        self.buffers
            .lock()
            .pop()
            .unwrap_or_else(|| Vec::with_capacity(SCRATCH_BUFFER_SIZE))
    }

    /// Return a buffer to the pool.
    pub fn put(&self, mut buf: Vec<u8>) {
        buf.clear();
        let mut buffers = self.buffers.lock();
        if buffers.len() < MAX_POOLED {
            buffers.push(buf);
        }
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}

/// Process-wide scratch buffer pool
pub static BUFFER_POOL: BufferPool = BufferPool::new();
