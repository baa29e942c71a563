//! Integrated accelerator backend.
//!
//! The surface is mapped into the image-interop layer once for the whole
//! batch, then every slot is registered as a graphics resource and its
//! mapped frame supplies the device pointer. Teardown always runs
//! unregister-all, unmap, destroy, in that order.

use std::sync::Arc;

use super::{BackendKind, PlatformMemoryBackend, begin_allocation, destroy_block_surface};
use crate::block::{BatchMemoryBlock, BlockState};
use crate::error::{AllocError, DriverError, TeardownStep, TeardownWarning};
use crate::surface::{SurfaceCreateParams, SurfaceDriver};

/// Backend for memory reached through image-interop registration.
pub struct IntegratedBackend<D: ?Sized> {
    driver: Arc<D>,
}

impl<D: SurfaceDriver + ?Sized> IntegratedBackend<D> {
    pub fn new(driver: Arc<D>) -> Self {
        Self { driver }
    }

    fn try_populate(&self, block: &mut BatchMemoryBlock) -> Result<(), AllocError> {
        begin_allocation(block)?;
        let config = *block.config();
        let batch = config.batch_len();

        let params = SurfaceCreateParams::for_pool(&config);
        let surface = self
            .driver
            .create_surface(&params, config.batch_size)
            .map_err(|source| AllocError::Allocation {
                device_id: config.device_id,
                source,
            })?;
        let surface_id = surface.id;
        let slot_count = surface.slots.len();
        block.surface = Some(surface);

        if slot_count != batch {
            let msg = format!("expected {} slots, driver returned {}", batch, slot_count);
            return Err(AllocError::Allocation {
                device_id: config.device_id,
                source: DriverError::new("create_surface", msg),
            });
        }

        self.driver
            .map_interop_image(surface_id)
            .map_err(|source| AllocError::Interop { slot: None, source })?;
        block.interop_mapped = true;
        block.transition(BlockState::Mapped)?;

        block.resources = vec![None; batch];
        block.frames = vec![None; batch];

        for slot in 0..batch {
            let interop = |source: DriverError| AllocError::Interop {
                slot: Some(slot),
                source,
            };
            let resource = self
                .driver
                .register_resource(surface_id, slot)
                .map_err(interop)?;
            block.resources[slot] = Some(resource);

            let frame = self.driver.mapped_frame(resource).map_err(interop)?;
            if frame.pitch_ptr.is_null() {
                let source = DriverError::new("mapped_frame", "frame has no plane 0 address");
                return Err(interop(source));
            }
            block.frames[slot] = Some(frame);
            block.set_frame_pointer(slot, frame.pitch_ptr);
            log::trace!(
                "slot {}: resource {:?} -> {:?}",
                slot,
                resource,
                frame.pitch_ptr
            );
        }

        block.transition(BlockState::Ready)?;
        log::debug!(
            "{}: batch of {} {}x{} {} frames mapped and registered on device {} (pitch {:?})",
            self.driver.name(),
            config.batch_size,
            config.width,
            config.height,
            config.color_format,
            config.device_id,
            block.pitch()
        );
        Ok(())
    }
}

impl<D: SurfaceDriver + ?Sized> PlatformMemoryBackend for IntegratedBackend<D> {
    fn kind(&self) -> BackendKind {
        BackendKind::Integrated
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

        for (slot, entry) in block.resources.iter_mut().enumerate() {
            // Taken before the call: a failed unregister is not retried.
            if let Some(resource) = entry.take() {
                if let Err(e) = self.driver.unregister_resource(resource) {
                    let warning = TeardownWarning::new(TeardownStep::Unregister, Some(slot), e);
                    warning.log();
                }
            }
        }
        block.frames.iter_mut().for_each(|f| *f = None);

        if block.interop_mapped {
            block.interop_mapped = false;
            if let Some(surface_id) = block.surface.as_ref().map(|s| s.id) {
                if let Err(e) = self.driver.unmap_interop_image(surface_id) {
                    TeardownWarning::new(TeardownStep::Unmap, None, e).log();
                }
            }
        }

        destroy_block_surface(&*self.driver, block);
        block.finish_release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ColorFormat, PoolConfig};
    use crate::surface::{FaultPlan, HostDriver};

    fn config(batch: u32) -> PoolConfig {
        PoolConfig::new(640, 480, ColorFormat::Rgba, batch, 0)
    }

    #[test]
    fn allocate_registers_every_slot() {
        let driver = Arc::new(HostDriver::new());
        let backend = IntegratedBackend::new(driver.clone());

        let block = backend.allocate(&config(4)).unwrap();
        assert!(block.is_ready());
        assert_eq!(block.registered_slots(), 4);
        assert_eq!(block.mapped_frames().count(), 4);
        assert!(block.frame_pointers().iter().all(|p| !p.is_null()));

        let stats = driver.stats();
        assert_eq!(stats.maps, 1);
        assert_eq!(stats.registrations, 4);
        assert_eq!(stats.ordering_violations, 0);

        backend.release(block);
        let stats = driver.stats();
        assert_eq!(stats.unregistrations, 4);
        assert_eq!(stats.unmaps, 1);
        assert_eq!(stats.live_registrations, 0);
        assert_eq!(stats.live_bytes, 0);
        assert_eq!(stats.ordering_violations, 0);
    }

    #[test]
    fn partial_registration_releases_only_registered_slots() {
        let driver = Arc::new(HostDriver::with_faults(FaultPlan {
            fail_register_at: Some(2),
            ..FaultPlan::default()
        }));
        let backend = IntegratedBackend::new(driver.clone());
        let mut block = BatchMemoryBlock::new(&config(4));

        let err = backend.populate(&mut block).unwrap_err();
        assert!(matches!(err, AllocError::Interop { slot: Some(2), .. }));
        assert_eq!(block.state(), BlockState::Failed);
        assert_eq!(block.registered_slots(), 2);
        assert_eq!(driver.live_registrations(), 2);

        backend.release(block);
        let stats = driver.stats();
        assert_eq!(stats.unregistered_slots, vec![0, 1]);
        assert_eq!(stats.unmaps, 1);
        assert_eq!(stats.live_surfaces, 0);
        assert_eq!(stats.ordering_violations, 0);
    }

    #[test]
    fn mapped_frame_failure_keeps_registration_for_teardown() {
        let driver = Arc::new(HostDriver::with_faults(FaultPlan {
            fail_mapped_frame_at: Some(1),
            ..FaultPlan::default()
        }));
        let backend = IntegratedBackend::new(driver.clone());

        let err = backend.allocate(&config(3)).unwrap_err();
        assert!(err.is_interop());
        let stats = driver.stats();
        assert_eq!(stats.registrations, 2);
        assert_eq!(stats.unregistered_slots, vec![0, 1]);
        assert_eq!(stats.live_bytes, 0);
    }

    #[test]
    fn map_failure_destroys_surface_without_unmap() {
        let driver = Arc::new(HostDriver::with_faults(FaultPlan {
            fail_map: true,
            ..FaultPlan::default()
        }));
        let backend = IntegratedBackend::new(driver.clone());

        let err = backend.allocate(&config(2)).unwrap_err();
        assert!(matches!(err, AllocError::Interop { slot: None, .. }));
        let stats = driver.stats();
        assert_eq!(stats.registrations, 0);
        assert_eq!(stats.unmaps, 0);
        assert_eq!(stats.surfaces_destroyed, 1);
    }

    #[test]
    fn teardown_continues_after_unregister_failures() {
        let driver = Arc::new(HostDriver::new());
        let backend = IntegratedBackend::new(driver.clone());
        let block = backend.allocate(&config(2)).unwrap();

        driver.set_faults(FaultPlan {
            fail_unregister: true,
            ..FaultPlan::default()
        });
        let before = driver.stats().calls;
        backend.release(block);

        // 2 unregister attempts, then unmap and destroy are still issued
        let stats = driver.stats();
        assert_eq!(stats.calls - before, 4);
        assert_eq!(stats.unregistrations, 0);
        assert_eq!(stats.unmaps, 1);
    }

    #[test]
    fn release_of_unpopulated_block_makes_no_driver_calls() {
        let driver = Arc::new(HostDriver::new());
        let backend = IntegratedBackend::new(driver.clone());
        let block = BatchMemoryBlock::new(&config(4));

        backend.release(block);
        assert_eq!(driver.stats().calls, 0);
    }
}
