//! OpenCL module for GPU batch surface allocation
//!
//! This module handles interaction with the GPU via OpenCL: platform and
//! device selection, and shared-virtual-memory allocations that give the
//! discrete backend real device addresses for each frame slot.

mod driver;

pub use driver::{list_devices, OpenClDriver, OpenClDriverConfig};

use std::sync::Arc;

use crate::backend::BackendKind;
use crate::config::PoolConfig;
use crate::error::{AllocError, DriverError};
use crate::pool::{Allocator, AllocatorFactory, BatchBufferPool};

/// Registry factory for `opencl-discrete`: platform 0, GPU `device_id`.
pub(crate) fn allocator_factory() -> AllocatorFactory {
    Arc::new(|config: &PoolConfig| {
        let driver = OpenClDriver::new(&OpenClDriverConfig {
            platform_index: 0,
            device_index: config.device_id as usize,
        })
        .map_err(|e| AllocError::Allocation {
            device_id: config.device_id,
            source: DriverError::new("opencl_init", format!("{:#}", e)),
        })?;
        let pool = BatchBufferPool::with_driver(*config, BackendKind::Discrete, Arc::new(driver))?;
        Ok(Box::new(pool) as Box<dyn Allocator>)
    })
}
