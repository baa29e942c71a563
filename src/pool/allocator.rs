//! Allocator capability and the process-wide allocator registry.

use std::collections::HashMap;
use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::RwLock;

use super::{BatchBuffer, BatchBufferPool};
use crate::backend::BackendKind;
use crate::config::PoolConfig;
use crate::error::AllocError;
use crate::registry::{Memory, MemoryTag};
use crate::surface::HostDriver;

/// Object-safe allocate/free interface driven by a buffer framework.
pub trait Allocator: Send + Sync {
    /// Tag stamped on every memory this allocator produces.
    fn mem_type(&self) -> MemoryTag;

    fn config(&self) -> &PoolConfig;

    fn alloc(&self, size: usize, align: usize) -> Result<Box<dyn Memory>, AllocError>;

    /// Release a memory returned by [`alloc`](Allocator::alloc).
    fn free(&self, memory: Box<dyn Memory>);

    fn live_batches(&self) -> usize;

    fn live_device_bytes(&self) -> usize;
}

impl Allocator for BatchBufferPool {
    fn mem_type(&self) -> MemoryTag {
        self.tag()
    }

    fn config(&self) -> &PoolConfig {
        BatchBufferPool::config(self)
    }

    fn alloc(&self, size: usize, align: usize) -> Result<Box<dyn Memory>, AllocError> {
        Ok(Box::new(self.create(size, align)?))
    }

    fn free(&self, memory: Box<dyn Memory>) {
        let tag = memory.header().tag;
        match memory.into_any().downcast::<BatchBuffer>() {
            Ok(buffer) => self.destroy(*buffer),
            Err(_) => log::error!("pool {}: cannot free memory of type '{}'", self.id(), tag),
        }
    }

    fn live_batches(&self) -> usize {
        BatchBufferPool::live_batches(self)
    }

    fn live_device_bytes(&self) -> usize {
        BatchBufferPool::live_device_bytes(self)
    }
}

/// Builds an allocator for a pool configuration.
pub type AllocatorFactory =
    Arc<dyn Fn(&PoolConfig) -> Result<Box<dyn Allocator>, AllocError> + Send + Sync>;

static ALLOCATORS: Lazy<RwLock<HashMap<String, AllocatorFactory>>> =
    Lazy::new(|| RwLock::new(builtin_allocators()));

fn host_factory(kind: BackendKind) -> AllocatorFactory {
    Arc::new(move |config: &PoolConfig| {
        let driver = Arc::new(HostDriver::new());
        let pool = BatchBufferPool::with_driver(*config, kind, driver)?;
        Ok(Box::new(pool) as Box<dyn Allocator>)
    })
}

fn builtin_allocators() -> HashMap<String, AllocatorFactory> {
    let mut map: HashMap<String, AllocatorFactory> = HashMap::new();
    map.insert(
        "host-discrete".to_string(),
        host_factory(BackendKind::Discrete),
    );
    map.insert(
        "host-integrated".to_string(),
        host_factory(BackendKind::Integrated),
    );
    #[cfg(feature = "opencl")]
    map.insert(
        "opencl-discrete".to_string(),
        crate::opencl::allocator_factory(),
    );
    map
}

/// Register `factory` under `name`, returning the factory it replaced.
pub fn register_allocator<F>(name: &str, factory: F) -> Option<AllocatorFactory>
where
    F: Fn(&PoolConfig) -> Result<Box<dyn Allocator>, AllocError> + Send + Sync + 'static,
{
    log::debug!("registering allocator '{}'", name);
    ALLOCATORS
        .write()
        .insert(name.to_string(), Arc::new(factory))
}

/// Build the allocator registered under `name`.
pub fn create_allocator(name: &str, config: &PoolConfig) -> Result<Box<dyn Allocator>, AllocError> {
    let factory = ALLOCATORS
        .read()
        .get(name)
        .cloned()
        .ok_or_else(|| AllocError::UnknownAllocator(name.to_string()))?;
    (*factory)(config)
}

/// Registered allocator names, sorted.
pub fn registered_allocators() -> Vec<String> {
    let mut names: Vec<String> = ALLOCATORS.read().keys().cloned().collect();
    names.sort();
    names
}
