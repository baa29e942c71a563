//! Discrete accelerator backend: frame pointers come straight from the
//! surface slots.

use std::sync::Arc;

use super::{BackendKind, PlatformMemoryBackend, begin_allocation, destroy_block_surface};
use crate::block::{BatchMemoryBlock, BlockState};
use crate::error::{AllocError, DriverError};
use crate::surface::{DevicePtr, SurfaceCreateParams, SurfaceDriver};

/// Backend for directly addressable device memory.
pub struct DiscreteBackend<D: ?Sized> {
    driver: Arc<D>,
}

impl<D: SurfaceDriver + ?Sized> DiscreteBackend<D> {
    pub fn new(driver: Arc<D>) -> Self {
        Self { driver }
    }

    fn try_populate(&self, block: &mut BatchMemoryBlock) -> Result<(), AllocError> {
        begin_allocation(block)?;
        let config = *block.config();

        let params = SurfaceCreateParams::for_pool(&config);
        let surface = self
            .driver
            .create_surface(&params, config.batch_size)
            .map_err(|source| AllocError::Allocation {
                device_id: config.device_id,
                source,
            })?;
        let ptrs: Vec<DevicePtr> = surface.slots.iter().map(|s| s.data_ptr).collect();
        block.surface = Some(surface);

        if ptrs.len() != config.batch_len() {
            let msg = format!(
                "expected {} slots, driver returned {}",
                config.batch_size,
                ptrs.len()
            );
            return Err(AllocError::Allocation {
                device_id: config.device_id,
                source: DriverError::new("create_surface", msg),
            });
        }

        for (i, ptr) in ptrs.into_iter().enumerate() {
            if ptr.is_null() {
                let msg = format!("slot {} has no device address", i);
                return Err(AllocError::Allocation {
                    device_id: config.device_id,
                    source: DriverError::new("create_surface", msg),
                });
            }
            block.set_frame_pointer(i, ptr);
        }

        block.transition(BlockState::Ready)?;
        log::debug!(
            "{}: batch of {} {}x{} {} frames ready on device {} (pitch {:?}, {} bytes)",
            self.driver.name(),
            config.batch_size,
            config.width,
            config.height,
            config.color_format,
            config.device_id,
            block.pitch(),
            block.device_bytes()
        );
        Ok(())
    }
}

impl<D: SurfaceDriver + ?Sized> PlatformMemoryBackend for DiscreteBackend<D> {
    fn kind(&self) -> BackendKind {
        BackendKind::Discrete
    }

    fn driver_name(&self) -> &str {
        self.driver.name()
    }

    fn populate(&self, block: &mut BatchMemoryBlock) -> Result<(), AllocError> {
        let result = self.try_populate(block);
        if result.is_err() {
            block.fail();
        }
        result
    }

    fn teardown(&self, block: &mut BatchMemoryBlock) {
        if !block.begin_release() {
            log::debug!("teardown skipped: block already released");
            return;
        }
        destroy_block_surface(&*self.driver, block);
        block.finish_release();
    }
}
