//! Zero-copy buffer pool for transport datagrams.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

/// Shared pool of reusable byte buffers.
#[derive(Clone, Debug)]
pub struct BufferPool {
    inner: Arc<PoolInner>,
}

#[derive(Debug)]
struct PoolInner {
    buffers: Mutex<VecDeque<Vec<u8>>>,
    buffer_size: usize,
    max_buffers: usize,
}

impl BufferPool {
    /// Create a new buffer pool.
    #[must_use]
    pub fn new(buffer_size: usize, max_buffers: usize) -> Self {
        assert!(buffer_size > 0, "buffer_size must be positive");
        assert!(max_buffers > 0, "max_buffers must be positive");

        Self {
            inner: Arc::new(PoolInner {
                buffers: Mutex::new(VecDeque::with_capacity(max_buffers)),
                buffer_size,
                max_buffers,
            }),
        }
    }

    /// Acquire a buffer holding exactly `len` writable bytes.
    ///
    /// Requests at most the pooled size reuse a pooled backing allocation;
    /// larger requests get a dedicated allocation that is not returned to
    /// the pool.
    pub fn alloc(&self, len: usize) -> Buffer {
        let data = if len <= self.inner.buffer_size {
            let mut guard = self
                .inner
                .buffers
                .lock()
                .expect("buffer pool mutex poisoned");
            guard
                .pop_front()
                .unwrap_or_else(|| vec![0u8; self.inner.buffer_size])
        } else {
            vec![0u8; len]
        };

        Buffer {
            data: Some(data),
            pool: Arc::clone(&self.inner),
            len,
        }
    }

    /// Buffer capacity in bytes for pooled allocations.
    #[must_use]
    pub fn buffer_size(&self) -> usize {
        self.inner.buffer_size
    }

    /// Maximum number of buffers retained by the pool.
    #[must_use]
    pub fn max_buffers(&self) -> usize {
        self.inner.max_buffers
    }
}

/// Buffer leased from the pool.
///
/// Dropping the buffer releases it: pooled backing storage returns to the
/// pool, oversized allocations are freed.
pub struct Buffer {
    data: Option<Vec<u8>>,
    pool: Arc<PoolInner>,
    len: usize,
}

impl Buffer {
    /// Expose the writable portion of the buffer.
    #[must_use]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        let len = self.len;
        let data = self.data.as_mut().expect("buffer already released");
        &mut data[..len]
    }

    /// Expose the filled portion of the buffer.
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        let data = self.data.as_ref().expect("buffer already released");
        &data[..self.len]
    }

    /// Current logical length of the buffer.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Check whether the buffer contains no data.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer").field("len", &self.len).finish()
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        if let Some(mut data) = self.data.take() {
            if data.len() != self.pool.buffer_size {
                return;
            }
            data.fill(0);
            let mut guard = self
                .pool
                .buffers
                .lock()
                .expect("buffer pool mutex poisoned");
            if guard.len() < self.pool.max_buffers {
                guard.push_back(data);
            }
        }
    }
}
