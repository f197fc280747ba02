//! Reusable request buffers
//!
//! Request bodies are serialized into `BytesMut` buffers checked out from a
//! [`BufferPool`]. A [`PooledBuffer`] hands its buffer back when dropped, so
//! every exit path of a request (success, error, cancellation) returns it.
//!
//! ```text
//!   acquire() ──▶ PooledBuffer ──freeze()──▶ FrozenBuffer ──(send)──▶ drop ──▶ free list
//! ```
//!
//! Freezing hands the allocation to the request body without copying. On
//! drop the allocation is reclaimed if no other handle still shares it;
//! otherwise it is left to its last owner and the pool allocates afresh.
//!
//! Buffers that grew past `max_retained_capacity` are released instead of
//! pooled so one oversized batch cannot pin memory forever.

use bytes::{Bytes, BytesMut};
use crossbeam_channel::{bounded, Receiver, Sender};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Buffer pool configuration
#[derive(Debug, Clone)]
pub struct BufferPoolConfig {
    /// Number of idle buffers kept on the free list
    pub pool_size: usize,
    /// Capacity of freshly allocated buffers
    pub initial_capacity: usize,
    /// Buffers above this capacity are dropped on return
    pub max_retained_capacity: usize,
}

impl Default for BufferPoolConfig {
    fn default() -> Self {
        Self {
            pool_size: 32,
            initial_capacity: 64 * 1024,
            max_retained_capacity: 4 * 1024 * 1024,
        }
    }
}

impl BufferPoolConfig {
    pub fn with_pool_size(mut self, size: usize) -> Self {
        self.pool_size = size;
        self
    }
}

/// Buffer pool statistics
#[derive(Debug, Default)]
pub struct PoolStats {
    /// Total checkouts
    pub acquired: AtomicU64,
    /// Checkouts served from the free list
    pub reused: AtomicU64,
    /// Checkouts that had to allocate
    pub allocated: AtomicU64,
    /// Buffers handed back
    pub returned: AtomicU64,
    /// Returned buffers dropped (pool full, oversized or still shared)
    pub discarded: AtomicU64,
}

impl PoolStats {
    /// Buffers currently checked out
    pub fn outstanding(&self) -> u64 {
        self.acquired
            .load(Ordering::Relaxed)
            .saturating_sub(self.returned.load(Ordering::Relaxed))
    }

    /// Fraction of checkouts served without allocating (0.0 - 1.0)
    pub fn reuse_rate(&self) -> f64 {
        let acquired = self.acquired.load(Ordering::Relaxed);
        if acquired == 0 {
            0.0
        } else {
            self.reused.load(Ordering::Relaxed) as f64 / acquired as f64
        }
    }
}

/// Shared free list of request buffers
pub struct BufferPool {
    free: (Sender<BytesMut>, Receiver<BytesMut>),
    config: BufferPoolConfig,
    stats: PoolStats,
}

impl std::fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferPool")
            .field("idle", &self.free.1.len())
            .field("pool_size", &self.config.pool_size)
            .finish()
    }
}

impl BufferPool {
    pub fn new(config: BufferPoolConfig) -> Arc<Self> {
        Arc::new(Self {
            free: bounded(config.pool_size.max(1)),
            config,
            stats: PoolStats::default(),
        })
    }

    /// Check out a cleared buffer
    pub fn acquire(self: &Arc<Self>) -> PooledBuffer {
        self.stats.acquired.fetch_add(1, Ordering::Relaxed);
        let buf = match self.free.1.try_recv() {
            Ok(mut buf) => {
                self.stats.reused.fetch_add(1, Ordering::Relaxed);
                buf.clear();
                buf
            }
            Err(_) => {
                self.stats.allocated.fetch_add(1, Ordering::Relaxed);
                BytesMut::with_capacity(self.config.initial_capacity)
            }
        };
        PooledBuffer {
            inner: Some(buf),
            pool: Arc::clone(self),
        }
    }

    fn release(&self, mut buf: BytesMut) {
        self.stats.returned.fetch_add(1, Ordering::Relaxed);
        if buf.capacity() > self.config.max_retained_capacity {
            self.stats.discarded.fetch_add(1, Ordering::Relaxed);
            return;
        }
        buf.clear();
        if self.free.0.try_send(buf).is_err() {
            self.stats.discarded.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Idle buffers currently on the free list
    pub fn idle(&self) -> usize {
        self.free.1.len()
    }

    pub fn stats(&self) -> &PoolStats {
        &self.stats
    }
}

/// A buffer handle that returns to the pool on drop
pub struct PooledBuffer {
    inner: Option<BytesMut>,
    pool: Arc<BufferPool>,
}

impl PooledBuffer {
    /// Turn the written bytes into a shareable [`Bytes`] over the same
    /// allocation. The returned handle gives the buffer back on drop.
    pub fn freeze(mut self) -> FrozenBuffer {
        let bytes = self.inner.take().map(BytesMut::freeze).unwrap_or_default();
        FrozenBuffer {
            inner: Some(bytes),
            pool: Arc::clone(&self.pool),
        }
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let Some(buf) = self.inner.take() {
            self.pool.release(buf);
        }
    }
}

/// A frozen pooled buffer, lent out as a request body
pub struct FrozenBuffer {
    inner: Option<Bytes>,
    pool: Arc<BufferPool>,
}

impl FrozenBuffer {
    /// A reference-counted view of the buffer; no bytes are copied
    pub fn bytes(&self) -> Bytes {
        self.inner.clone().unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.inner.as_ref().map_or(0, Bytes::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for FrozenBuffer {
    fn drop(&mut self) {
        let Some(bytes) = self.inner.take() else {
            return;
        };
        match bytes.try_into_mut() {
            Ok(buf) => self.pool.release(buf),
            Err(_) => {
                self.pool.stats.returned.fetch_add(1, Ordering::Relaxed);
                self.pool.stats.discarded.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

impl std::ops::Deref for PooledBuffer {
    type Target = BytesMut;

    fn deref(&self) -> &Self::Target {
        // only None after drop
        self.inner.as_ref().expect("pooled buffer used after release")
    }
}

impl std::ops::DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.inner.as_mut().expect("pooled buffer used after release")
    }
}
