//! Surface driver layer
//!
//! This module describes the device API that both platform backends are
//! built on: creating and destroying batched pitched surfaces, mapping a
//! surface into the image-interop layer, and registering individual slots
//! as graphics resources.

mod host;

pub use host::{DriverStats, FaultPlan, HostDriver, PITCH_ALIGNMENT};

use std::ffi::c_void;
use std::sync::Arc;

use crate::config::{ColorFormat, PoolConfig};
use crate::error::{DriverError, DriverResult};

/// Device address of one frame (or plane) inside a surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct DevicePtr(*mut c_void);

// SAFETY: DevicePtr is an opaque device address. It is never dereferenced
// by this crate; consumers bind it to device-side work.
unsafe impl Send for DevicePtr {}
unsafe impl Sync for DevicePtr {}

impl DevicePtr {
    pub const NULL: DevicePtr = DevicePtr(std::ptr::null_mut());

    pub fn new(ptr: *mut c_void) -> Self {
        DevicePtr(ptr)
    }

    pub fn as_ptr(self) -> *mut c_void {
        self.0
    }

    pub fn addr(self) -> usize {
        self.0 as usize
    }

    pub fn is_null(self) -> bool {
        self.0.is_null()
    }
}

impl Default for DevicePtr {
    fn default() -> Self {
        DevicePtr::NULL
    }
}

/// Driver-assigned identifier of a batch surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SurfaceId(pub u64);

/// Driver-assigned identifier of a registered graphics resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResourceId(pub u64);

/// Parameters for [`SurfaceDriver::create_surface`].
///
/// Surfaces are always pitched (rows padded to the driver's pitch
/// alignment) with every slot in one allocation, laid out back to back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SurfaceCreateParams {
    pub device_id: u32,
    pub width: u32,
    pub height: u32,
    pub color_format: ColorFormat,
}

impl SurfaceCreateParams {
    pub fn for_pool(config: &PoolConfig) -> Self {
        Self {
            device_id: config.device_id,
            width: config.width,
            height: config.height,
            color_format: config.color_format,
        }
    }
}

/// One slot of a created surface, as reported by the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SurfaceSlot {
    /// Base device address of the slot.
    pub data_ptr: DevicePtr,
    /// Row stride in bytes of plane 0.
    pub pitch: u32,
    /// Bytes occupied by the slot, all planes included.
    pub data_size: usize,
}

/// A created batch surface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Surface {
    pub id: SurfaceId,
    pub slots: Vec<SurfaceSlot>,
}

impl Surface {
    /// Total bytes held by every slot.
    pub fn total_size(&self) -> usize {
        self.slots.iter().map(|s| s.data_size).sum()
    }
}

/// Frame descriptor obtained from a registered graphics resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MappedFrame {
    /// Base address of plane 0, usable by device compute.
    pub pitch_ptr: DevicePtr,
    pub pitch: u32,
}

/// Device API consumed by the platform backends.
///
/// Implementations are called synchronously from the thread that owns the
/// pool lifecycle; they must not rely on any particular thread.
pub trait SurfaceDriver: Send + Sync {
    /// Human-readable driver name for logs.
    fn name(&self) -> &str;

    /// Create a surface holding `batch_size` slots.
    fn create_surface(
        &self,
        params: &SurfaceCreateParams,
        batch_size: u32,
    ) -> DriverResult<Surface>;

    fn destroy_surface(&self, surface: SurfaceId) -> DriverResult<()>;

    /// Map the whole surface into the image-interop layer.
    fn map_interop_image(&self, surface: SurfaceId) -> DriverResult<()>;

    fn unmap_interop_image(&self, surface: SurfaceId) -> DriverResult<()>;

    /// Register the interop image of `slot` as a graphics resource.
    fn register_resource(&self, surface: SurfaceId, slot: usize) -> DriverResult<ResourceId>;

    fn mapped_frame(&self, resource: ResourceId) -> DriverResult<MappedFrame>;

    fn unregister_resource(&self, resource: ResourceId) -> DriverResult<()>;
}

impl<T> SurfaceDriver for Arc<T>
where
    T: SurfaceDriver + ?Sized,
{
    fn name(&self) -> &str {
        (**self).name()
    }

    fn create_surface(
        &self,
        params: &SurfaceCreateParams,
        batch_size: u32,
    ) -> DriverResult<Surface> {
        (**self).create_surface(params, batch_size)
    }

    fn destroy_surface(&self, surface: SurfaceId) -> DriverResult<()> {
        (**self).destroy_surface(surface)
    }

    fn map_interop_image(&self, surface: SurfaceId) -> DriverResult<()> {
        (**self).map_interop_image(surface)
    }

    fn unmap_interop_image(&self, surface: SurfaceId) -> DriverResult<()> {
        (**self).unmap_interop_image(surface)
    }

    fn register_resource(&self, surface: SurfaceId, slot: usize) -> DriverResult<ResourceId> {
        (**self).register_resource(surface, slot)
    }

    fn mapped_frame(&self, resource: ResourceId) -> DriverResult<MappedFrame> {
        (**self).mapped_frame(resource)
    }

    fn unregister_resource(&self, resource: ResourceId) -> DriverResult<()> {
        (**self).unregister_resource(resource)
    }
}

/// Rounds `value` up to the next multiple of `align` (a power of two).
///
/// Returns `None` if the rounded value does not fit in `usize`.
pub(crate) fn align_up(value: usize, align: usize) -> Option<usize> {
    debug_assert!(align.is_power_of_two());
    value.checked_add(align - 1).map(|v| v & !(align - 1))
}

/// Pitch and slot size for a pitched single-slot layout.
///
/// Fails when the pitch does not fit the `u32` reported to consumers or the
/// slot size overflows `usize`.
pub(crate) fn pitched_slot_geometry(
    params: &SurfaceCreateParams,
    pitch_align: usize,
) -> DriverResult<(u32, usize)> {
    const OP: &str = "create_surface";
    let fmt = params.color_format;
    let too_large = || {
        DriverError::new(
            OP,
            format!(
                "{}x{} {} slot is too large",
                params.width, params.height, fmt
            ),
        )
    };

    let pitch = (params.width as usize)
        .checked_mul(fmt.bytes_per_pixel() as usize)
        .and_then(|row_bytes| align_up(row_bytes, pitch_align))
        .ok_or_else(too_large)?;
    let pitch_u32 = u32::try_from(pitch).map_err(|_| too_large())?;

    let (num, den) = fmt.height_factor();
    let slot_size = (params.height as usize)
        .checked_mul(num as usize)
        .map(|r| r.div_ceil(den as usize))
        .and_then(|rows| pitch.checked_mul(rows))
        .ok_or_else(too_large)?;
    Ok((pitch_u32, slot_size))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align_up_rounds_to_multiple() {
        assert_eq!(align_up(0, 256), Some(0));
        assert_eq!(align_up(1, 256), Some(256));
        assert_eq!(align_up(2560, 256), Some(2560));
        assert_eq!(align_up(2600, 256), Some(2816));
        assert_eq!(align_up(usize::MAX - 10, 256), None);
    }

    fn geometry(config: PoolConfig) -> DriverResult<(u32, usize)> {
        pitched_slot_geometry(&SurfaceCreateParams::for_pool(&config), PITCH_ALIGNMENT)
    }

    #[test]
    fn slot_geometry_accounts_for_planes_and_padding() {
        let rgba = PoolConfig::new(650, 480, ColorFormat::Rgba, 1, 0);
        assert_eq!(geometry(rgba).unwrap(), (2816, 2816 * 480));

        let nv12 = PoolConfig::new(640, 480, ColorFormat::Nv12, 1, 0);
        assert_eq!(geometry(nv12).unwrap(), (768, 768 * 720));
    }

    #[test]
    fn slot_geometry_rejects_pitch_beyond_u32() {
        // 4.4 GB rows: a truncated pitch would disagree with the slot size
        let wide = PoolConfig::new(1_100_000_000, 1, ColorFormat::Rgba, 1, 0);
        let err = geometry(wide).unwrap_err();
        assert_eq!(err.op, "create_surface");
        assert!(err.message.contains("too large"), "{err}");

        let huge = PoolConfig::new(u32::MAX, u32::MAX, ColorFormat::Rgba, 1, 0);
        assert!(geometry(huge).is_err());
    }

    #[test]
    fn slot_geometry_rejects_size_overflow() {
        // pitch fits u32, pitch * 1.5 * u32::MAX rows does not fit usize
        let tall = PoolConfig::new(4_000_000_000, u32::MAX, ColorFormat::Yuv420, 1, 0);
        let err = geometry(tall).unwrap_err();
        assert!(err.message.contains("too large"), "{err}");
    }

    #[test]
    fn null_device_ptr() {
        assert!(DevicePtr::NULL.is_null());
        assert!(DevicePtr::default().is_null());
        assert_eq!(DevicePtr::NULL.addr(), 0);
    }
}
