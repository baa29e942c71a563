//! OpenCL shared-virtual-memory surface driver.

use std::collections::HashMap;
use std::ffi::c_void;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{Context as _, Result, bail};
use opencl3::{
    context::Context,
    device::{CL_DEVICE_TYPE_GPU, Device, get_device_ids},
    memory::CL_MEM_READ_WRITE,
    platform::get_platforms,
};
use parking_lot::Mutex;

use crate::error::{DriverError, DriverResult};
use crate::surface::{
    DevicePtr, MappedFrame, PITCH_ALIGNMENT, ResourceId, Surface, SurfaceCreateParams,
    SurfaceDriver, SurfaceId, SurfaceSlot, pitched_slot_geometry,
};

const SVM_ALIGNMENT: u32 = 4096;

/// Which OpenCL device to allocate on.
#[derive(Debug, Clone)]
pub struct OpenClDriverConfig {
    pub platform_index: usize,
    pub device_index: usize,
}

struct SvmAllocation {
    ptr: *mut c_void,
    size: usize,
}

/// Surface driver allocating batches as single SVM regions.
///
/// Only supports the discrete memory model: interop calls are rejected.
pub struct OpenClDriver {
    context: Context,
    device_name: String,
    next_id: AtomicU64,
    surfaces: Mutex<HashMap<SurfaceId, SvmAllocation>>,
}

// SAFETY: OpenCL contexts may be shared between host threads, and SVM
// pointers are only handed to the driver under the surfaces lock.
unsafe impl Send for OpenClDriver {}
unsafe impl Sync for OpenClDriver {}

impl OpenClDriver {
    pub fn new(config: &OpenClDriverConfig) -> Result<Self> {
        let platforms = get_platforms().context("Failed to get OpenCL platforms")?;
        let Some(platform) = platforms.get(config.platform_index) else {
            bail!("OpenCL platform {} not found", config.platform_index);
        };

        let device_ids = get_device_ids(platform.id(), CL_DEVICE_TYPE_GPU)
            .context("Failed to get GPU devices")?;
        let Some(device_id) = device_ids.get(config.device_index) else {
            bail!(
                "GPU device {} not found on platform {} ({} available)",
                config.device_index,
                config.platform_index,
                device_ids.len()
            );
        };

        let device = Device::new(*device_id);
        let device_name = device
            .name()
            .unwrap_or_else(|_| "Unknown Device".to_string());
        let context = Context::from_device(&device)
            .context("Failed to create OpenCL context")?;
        log::info!("OpenCL driver using {}", device_name);

        Ok(Self {
            context,
            device_name,
            next_id: AtomicU64::new(1),
            surfaces: Mutex::new(HashMap::new()),
        })
    }

    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    fn unsupported<T>(op: &'static str) -> DriverResult<T> {
        Err(DriverError::new(
            op,
            "image interop is not available through OpenCL",
        ))
    }
}

impl Drop for OpenClDriver {
    fn drop(&mut self) {
        for (id, alloc) in self.surfaces.lock().drain() {
            log::warn!("freeing leaked SVM surface {:?} ({} bytes)", id, alloc.size);
            // SAFETY: ptr came from svm_alloc on this context.
            let _ = unsafe { self.context.svm_free(alloc.ptr) };
        }
    }
}

impl SurfaceDriver for OpenClDriver {
    fn name(&self) -> &str {
        "opencl"
    }

    fn create_surface(
        &self,
        params: &SurfaceCreateParams,
        batch_size: u32,
    ) -> DriverResult<Surface> {
        const OP: &str = "create_surface";
        let (pitch, slot_size) = pitched_slot_geometry(params, PITCH_ALIGNMENT)?;
        let total = slot_size
            .checked_mul(batch_size as usize)
            .filter(|&t| t > 0)
            .ok_or_else(|| DriverError::new(OP, "invalid surface size"))?;

        let context = &self.context;
        // SAFETY: size and alignment validated above; the pointer is freed
        // with svm_free in destroy_surface or on drop.
        let ptr = match unsafe { context.svm_alloc(CL_MEM_READ_WRITE, total, SVM_ALIGNMENT) } {
            Ok(ptr) if !ptr.is_null() => ptr,
            Ok(_) => {
                let msg = format!("svm_alloc of {} bytes returned null", total);
                return Err(DriverError::new(OP, msg));
            }
            Err(e) => {
                let msg = format!("svm_alloc of {} bytes: {:?}", total, e);
                return Err(DriverError::new(OP, msg));
            }
        };

        let base = ptr as *mut u8;
        let slots = (0..batch_size as usize)
            .map(|i| SurfaceSlot {
                // SAFETY: i * slot_size < total, inside the SVM region.
                data_ptr: DevicePtr::new(unsafe { base.add(i * slot_size) } as *mut c_void),
                pitch,
                data_size: slot_size,
            })
            .collect();

        let id = SurfaceId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let alloc = SvmAllocation { ptr, size: total };
        self.surfaces.lock().insert(id, alloc);
        log::trace!("opencl: surface {:?} at {:?} ({} bytes)", id, ptr, total);
        Ok(Surface { id, slots })
    }

    fn destroy_surface(&self, surface: SurfaceId) -> DriverResult<()> {
        let Some(alloc) = self.surfaces.lock().remove(&surface) else {
            let msg = format!("unknown surface {:?}", surface);
            return Err(DriverError::new("destroy_surface", msg));
        };
        // SAFETY: ptr came from svm_alloc on this context and is removed
        // from the table, so it cannot be freed twice.
        let _ = unsafe { self.context.svm_free(alloc.ptr) };
        Ok(())
    }

    fn map_interop_image(&self, _surface: SurfaceId) -> DriverResult<()> {
        Self::unsupported("map_interop_image")
    }

    fn unmap_interop_image(&self, _surface: SurfaceId) -> DriverResult<()> {
        Self::unsupported("unmap_interop_image")
    }

    fn register_resource(&self, _surface: SurfaceId, _slot: usize) -> DriverResult<ResourceId> {
        Self::unsupported("register_resource")
    }

    fn mapped_frame(&self, _resource: ResourceId) -> DriverResult<MappedFrame> {
        Self::unsupported("mapped_frame")
    }

    fn unregister_resource(&self, _resource: ResourceId) -> DriverResult<()> {
        Self::unsupported("unregister_resource")
    }
}

/// Lists available OpenCL devices.
pub fn list_devices() -> Result<()> {
    println!("Available OpenCL Platforms and Devices:");
    let platforms = get_platforms().context("Failed to get OpenCL platforms")?;
    if platforms.is_empty() {
        println!("  No OpenCL platforms found.");
        return Ok(());
    }

    for (plat_idx, platform) in platforms.iter().enumerate() {
        let plat_name = platform
            .name()
            .unwrap_or_else(|_| "Unknown Platform".to_string());
        println!("\nPlatform {}: {}", plat_idx, plat_name);

        match get_device_ids(platform.id(), CL_DEVICE_TYPE_GPU) {
            Ok(device_ids) if device_ids.is_empty() => {
                println!("  No GPU devices found on this platform.");
            }
            Ok(device_ids) => {
                for (dev_idx, device_id) in device_ids.iter().enumerate() {
                    let device = Device::new(*device_id);
                    let dev_name = device
                        .name()
                        .unwrap_or_else(|_| "Unknown Device".to_string());
                    let dev_mem = device.global_mem_size().unwrap_or(0);
                    println!(
                        "  Device {}: {} - Memory: {} MB",
                        dev_idx,
                        dev_name,
                        dev_mem / (1024 * 1024)
                    );
                }
            }
            Err(e) => {
                println!("  Error getting devices for this platform: {}", e);
            }
        }
    }
    Ok(())
}
