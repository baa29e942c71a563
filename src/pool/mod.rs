//! Batch buffer pool
//!
//! The pool owns an immutable [`PoolConfig`] and a platform backend. Each
//! [`create`](BatchBufferPool::create) produces one [`BatchBuffer`] holding
//! exactly one Ready batch; [`destroy`](BatchBufferPool::destroy) consumes
//! the handle and releases the batch. The pool itself never holds blocks.

mod allocator;

pub use allocator::{
    Allocator, AllocatorFactory, create_allocator, register_allocator, registered_allocators,
};

use std::any::Any;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use crate::backend::{BackendKind, PlatformMemoryBackend, select_backend};
use crate::block::BatchMemoryBlock;
use crate::config::PoolConfig;
use crate::error::AllocError;
use crate::registry::{BATCH_MEMORY_TAG, Memory, MemoryHeader, MemoryTag};
use crate::surface::{DevicePtr, SurfaceDriver};

static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(1);

/// Opaque handle to one allocated batch.
///
/// Created by [`BatchBufferPool::create`] and consumed by
/// [`BatchBufferPool::destroy`]; it cannot be cloned.
#[derive(Debug)]
pub struct BatchBuffer {
    header: MemoryHeader,
    pool_id: u64,
    block: BatchMemoryBlock,
}

impl BatchBuffer {
    pub fn block(&self) -> &BatchMemoryBlock {
        &self.block
    }

    /// Frame pointer table of the batch, for binding an inference call.
    pub fn frame_pointers(&self) -> &[DevicePtr] {
        self.block.frame_pointers()
    }

    pub fn pool_id(&self) -> u64 {
        self.pool_id
    }
}

impl Memory for BatchBuffer {
    fn header(&self) -> &MemoryHeader {
        &self.header
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any + Send + Sync> {
        self
    }
}

/// Pool of batched device frame buffers.
pub struct BatchBufferPool {
    id: u64,
    config: PoolConfig,
    backend: Box<dyn PlatformMemoryBackend>,
    live_batches: AtomicUsize,
    live_bytes: AtomicUsize,
}

impl BatchBufferPool {
    /// Create a pool; fails if width, height or batch size is zero.
    pub fn new(
        config: PoolConfig,
        backend: Box<dyn PlatformMemoryBackend>,
    ) -> Result<Self, AllocError> {
        config.validate()?;

        let id = NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed);
        log::info!(
            "pool {}: {}x{} {} x{} on device {} ({} backend, {} driver)",
            id,
            config.width,
            config.height,
            config.color_format,
            config.batch_size,
            config.device_id,
            backend.kind(),
            backend.driver_name()
        );

        Ok(Self {
            id,
            config,
            backend,
            live_batches: AtomicUsize::new(0),
            live_bytes: AtomicUsize::new(0),
        })
    }

    /// Create a pool with the `kind` backend on top of `driver`.
    pub fn with_driver<D>(
        config: PoolConfig,
        kind: BackendKind,
        driver: Arc<D>,
    ) -> Result<Self, AllocError>
    where
        D: SurfaceDriver + ?Sized + 'static,
    {
        Self::new(config, select_backend(kind, driver))
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn backend_kind(&self) -> BackendKind {
        self.backend.kind()
    }

    /// Tag carried by every buffer this pool produces.
    pub fn tag(&self) -> MemoryTag {
        BATCH_MEMORY_TAG
    }

    /// Allocate one batch.
    ///
    /// `requested_size` and `alignment` only describe the wrapper header;
    /// device memory is sized from the pool configuration.
    pub fn create(
        &self,
        requested_size: usize,
        alignment: usize,
    ) -> Result<BatchBuffer, AllocError> {
        let block = match self.backend.allocate(&self.config) {
            Ok(block) => block,
            Err(e) => {
                log::error!("pool {}: could not allocate batch buffer: {}", self.id, e);
                return Err(e);
            }
        };

        let bytes = block.device_bytes();
        let live = self.live_batches.fetch_add(1, Ordering::Relaxed) + 1;
        self.live_bytes.fetch_add(bytes, Ordering::Relaxed);
        log::debug!(
            "pool {}: batch created ({} bytes, {} live)",
            self.id,
            bytes,
            live
        );

        Ok(BatchBuffer {
            header: MemoryHeader::new(BATCH_MEMORY_TAG, requested_size, alignment),
            pool_id: self.id,
            block,
        })
    }

    /// Release a batch produced by this pool.
    pub fn destroy(&self, handle: BatchBuffer) {
        if handle.pool_id != self.id {
            log::error!(
                "pool {}: refusing to destroy buffer owned by pool {}",
                self.id,
                handle.pool_id
            );
            return;
        }

        let counted = handle.block.is_ready();
        let bytes = handle.block.device_bytes();
        self.backend.release(handle.block);

        if counted {
            let live = self.live_batches.fetch_sub(1, Ordering::Relaxed) - 1;
            self.live_bytes.fetch_sub(bytes, Ordering::Relaxed);
            log::debug!(
                "pool {}: batch destroyed ({} bytes, {} live)",
                self.id,
                bytes,
                live
            );
        }
    }

    /// Batches created and not yet destroyed.
    pub fn live_batches(&self) -> usize {
        self.live_batches.load(Ordering::Relaxed)
    }

    /// Device bytes held by live batches.
    pub fn live_device_bytes(&self) -> usize {
        self.live_bytes.load(Ordering::Relaxed)
    }
}

impl Drop for BatchBufferPool {
    fn drop(&mut self) {
        let live = self.live_batches();
        if live > 0 {
            log::warn!("pool {} dropped with {} live batch(es)", self.id, live);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ColorFormat;
    use crate::surface::HostDriver;

    fn pool(kind: BackendKind) -> (BatchBufferPool, Arc<HostDriver>) {
        let driver = Arc::new(HostDriver::new());
        let config = PoolConfig::new(320, 240, ColorFormat::Rgba, 2, 0);
        let pool = BatchBufferPool::with_driver(config, kind, driver.clone());
        (pool.unwrap(), driver)
    }

    #[test]
    fn create_and_destroy_track_footprint() {
        let (pool, driver) = pool(BackendKind::Discrete);
        let buf = pool.create(64, 8).unwrap();
        assert_eq!(pool.live_batches(), 1);
        assert_eq!(pool.live_device_bytes(), driver.live_bytes());
        assert_eq!(buf.header().size, 64);
        assert_eq!(buf.header().align, 8);
        assert_eq!(buf.header().tag, pool.tag());
        assert_eq!(buf.pool_id(), pool.id());

        pool.destroy(buf);
        assert_eq!(pool.live_batches(), 0);
        assert_eq!(pool.live_device_bytes(), 0);
        assert_eq!(driver.live_bytes(), 0);
    }

    #[test]
    fn wrapper_size_does_not_affect_device_size() {
        let (pool, _driver) = pool(BackendKind::Integrated);
        let small = pool.create(1, 1).unwrap();
        let large = pool.create(1 << 20, 4096).unwrap();
        assert_eq!(small.block().device_bytes(), large.block().device_bytes());
        assert_eq!(
            *pool.config(),
            PoolConfig::new(320, 240, ColorFormat::Rgba, 2, 0)
        );
        pool.destroy(small);
        pool.destroy(large);
    }

    #[test]
    fn foreign_handle_is_refused() {
        let (a, driver_a) = pool(BackendKind::Discrete);
        let (b, _driver_b) = pool(BackendKind::Discrete);
        let buf = a.create(0, 0).unwrap();

        b.destroy(buf);
        assert_eq!(b.live_batches(), 0);
        // pool a still counts it; the leaked surface stays with driver a
        assert_eq!(a.live_batches(), 1);
        assert!(driver_a.live_bytes() > 0);
    }

    #[test]
    fn zero_batch_size_fails_construction() {
        let driver = Arc::new(HostDriver::new());
        let config = PoolConfig::new(640, 480, ColorFormat::Rgba, 0, 0);
        let err = BatchBufferPool::with_driver(config, BackendKind::Discrete, driver.clone())
            .err()
            .unwrap();
        assert!(matches!(err, AllocError::InvalidConfig(_)));
        assert_eq!(driver.stats().calls, 0);
    }
}
