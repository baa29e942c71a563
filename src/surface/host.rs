//! Host-memory surface driver.
//!
//! Backs surfaces with page-aligned host allocations and emulates the
//! interop registration table. Every call is counted in [`DriverStats`], and
//! individual steps can be made to fail through a [`FaultPlan`], which makes
//! this driver the instrumented double used to verify the backends.

use std::alloc::{self, Layout};
use std::collections::HashMap;
use std::ffi::c_void;
use std::ptr::NonNull;

use parking_lot::Mutex;

use super::{
    DevicePtr, MappedFrame, ResourceId, Surface, SurfaceCreateParams, SurfaceDriver, SurfaceId,
    SurfaceSlot, pitched_slot_geometry,
};
use crate::error::{DriverError, DriverResult};

/// Row pitch alignment in bytes.
pub const PITCH_ALIGNMENT: usize = 256;

const SURFACE_ALIGNMENT: usize = 4096;

/// Steps the driver should fail on purpose.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FaultPlan {
    pub fail_create: bool,
    pub fail_map: bool,
    /// Fail `register_resource` for this slot index.
    pub fail_register_at: Option<usize>,
    /// Fail `mapped_frame` for the resource registered at this slot index.
    pub fail_mapped_frame_at: Option<usize>,
    pub fail_unregister: bool,
    pub fail_unmap: bool,
}

/// Counters kept by [`HostDriver`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DriverStats {
    /// Every driver entry point invoked, failed or not.
    pub calls: usize,
    pub surfaces_created: usize,
    pub surfaces_destroyed: usize,
    pub live_surfaces: usize,
    pub live_bytes: usize,
    pub peak_bytes: usize,
    pub maps: usize,
    pub unmaps: usize,
    pub registrations: usize,
    pub unregistrations: usize,
    pub live_registrations: usize,
    /// Slot index of each successful unregister, in call order.
    pub unregistered_slots: Vec<usize>,
    /// Register before map, or destroy/unmap while still in use.
    pub ordering_violations: usize,
}

struct HostSurface {
    base: NonNull<u8>,
    layout: Layout,
    slots: Vec<SurfaceSlot>,
    mapped: bool,
    registered: usize,
}

// SAFETY: the allocation is owned by the surface entry and only touched
// while the driver lock is held.
unsafe impl Send for HostSurface {}

struct HostResource {
    surface: SurfaceId,
    slot: usize,
}

#[derive(Default)]
struct HostState {
    next_id: u64,
    surfaces: HashMap<SurfaceId, HostSurface>,
    resources: HashMap<ResourceId, HostResource>,
    stats: DriverStats,
    faults: FaultPlan,
}

impl HostState {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn surface_mut(&mut self, id: SurfaceId, op: &'static str) -> DriverResult<&mut HostSurface> {
        self.surfaces
            .get_mut(&id)
            .ok_or_else(|| DriverError::new(op, format!("unknown surface {:?}", id)))
    }
}

impl Drop for HostState {
    fn drop(&mut self) {
        if !self.surfaces.is_empty() {
            log::warn!(
                "host driver dropped with {} live surface(s), freeing",
                self.surfaces.len()
            );
        }
        for (_, surface) in self.surfaces.drain() {
            // SAFETY: base/layout come from the matching alloc_zeroed call.
            unsafe { alloc::dealloc(surface.base.as_ptr(), surface.layout) };
        }
    }
}

/// Surface driver backed by host memory.
#[derive(Default)]
pub struct HostDriver {
    state: Mutex<HostState>,
}

impl HostDriver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_faults(faults: FaultPlan) -> Self {
        let driver = Self::default();
        driver.set_faults(faults);
        driver
    }

    /// Replace the active fault plan.
    pub fn set_faults(&self, faults: FaultPlan) {
        self.state.lock().faults = faults;
    }

    /// Snapshot of the driver counters.
    pub fn stats(&self) -> DriverStats {
        self.state.lock().stats.clone()
    }

    pub fn live_bytes(&self) -> usize {
        self.state.lock().stats.live_bytes
    }

    pub fn live_registrations(&self) -> usize {
        self.state.lock().stats.live_registrations
    }
}

impl SurfaceDriver for HostDriver {
    fn name(&self) -> &str {
        "host"
    }

    fn create_surface(
        &self,
        params: &SurfaceCreateParams,
        batch_size: u32,
    ) -> DriverResult<Surface> {
        const OP: &str = "create_surface";
        let mut state = self.state.lock();
        state.stats.calls += 1;

        if state.faults.fail_create {
            return Err(DriverError::new(OP, "injected allocation failure"));
        }
        if batch_size == 0 || params.width == 0 || params.height == 0 {
            return Err(DriverError::new(OP, "empty surface requested"));
        }

        let (pitch, slot_size) = pitched_slot_geometry(params, PITCH_ALIGNMENT)?;
        let total = slot_size
            .checked_mul(batch_size as usize)
            .ok_or_else(|| DriverError::new(OP, "surface size overflows usize"))?;
        let layout = Layout::from_size_align(total, SURFACE_ALIGNMENT)
            .map_err(|e| DriverError::new(OP, e.to_string()))?;

        // SAFETY: layout has non-zero size (all dimensions checked above).
        let raw = unsafe { alloc::alloc_zeroed(layout) };
        let Some(base) = NonNull::new(raw) else {
            let msg = format!("out of memory for {} bytes", total);
            return Err(DriverError::new(OP, msg));
        };

        let slots: Vec<SurfaceSlot> = (0..batch_size as usize)
            .map(|i| SurfaceSlot {
                // SAFETY: i * slot_size < total, inside the allocation.
                data_ptr: DevicePtr::new(
                    unsafe { base.as_ptr().add(i * slot_size) } as *mut c_void,
                ),
                pitch,
                data_size: slot_size,
            })
            .collect();

        let id = SurfaceId(state.next_id());
        state.surfaces.insert(
            id,
            HostSurface {
                base,
                layout,
                slots: slots.clone(),
                mapped: false,
                registered: 0,
            },
        );

        let stats = &mut state.stats;
        stats.surfaces_created += 1;
        stats.live_surfaces += 1;
        stats.live_bytes += total;
        stats.peak_bytes = stats.peak_bytes.max(stats.live_bytes);
        log::trace!(
            "host: created surface {:?} ({} slots, pitch {}, {} bytes)",
            id,
            batch_size,
            pitch,
            total
        );

        Ok(Surface { id, slots })
    }

    fn destroy_surface(&self, surface: SurfaceId) -> DriverResult<()> {
        const OP: &str = "destroy_surface";
        let mut state = self.state.lock();
        state.stats.calls += 1;

        let entry = state.surface_mut(surface, OP)?;
        if entry.registered > 0 || entry.mapped {
            let msg = format!(
                "surface {:?} still in use ({} registered, mapped={})",
                surface, entry.registered, entry.mapped
            );
            state.stats.ordering_violations += 1;
            return Err(DriverError::new(OP, msg));
        }

        if let Some(entry) = state.surfaces.remove(&surface) {
            // SAFETY: base/layout come from the matching alloc_zeroed call.
            unsafe { alloc::dealloc(entry.base.as_ptr(), entry.layout) };
            let stats = &mut state.stats;
            stats.surfaces_destroyed += 1;
            stats.live_surfaces -= 1;
            stats.live_bytes -= entry.layout.size();
        }
        Ok(())
    }

    fn map_interop_image(&self, surface: SurfaceId) -> DriverResult<()> {
        const OP: &str = "map_interop_image";
        let mut state = self.state.lock();
        state.stats.calls += 1;

        if state.faults.fail_map {
            return Err(DriverError::new(OP, "injected mapping failure"));
        }
        let entry = state.surface_mut(surface, OP)?;
        if entry.mapped {
            return Err(DriverError::new(OP, "surface already mapped"));
        }
        entry.mapped = true;
        state.stats.maps += 1;
        Ok(())
    }

    fn unmap_interop_image(&self, surface: SurfaceId) -> DriverResult<()> {
        const OP: &str = "unmap_interop_image";
        let mut state = self.state.lock();
        state.stats.calls += 1;

        let fail = state.faults.fail_unmap;
        let entry = state.surface_mut(surface, OP)?;
        if !entry.mapped {
            return Err(DriverError::new(OP, "surface is not mapped"));
        }
        if fail {
            return Err(DriverError::new(OP, "injected unmap failure"));
        }
        let still_registered = entry.registered > 0;
        entry.mapped = false;
        if still_registered {
            state.stats.ordering_violations += 1;
        }
        state.stats.unmaps += 1;
        Ok(())
    }

    fn register_resource(&self, surface: SurfaceId, slot: usize) -> DriverResult<ResourceId> {
        const OP: &str = "register_resource";
        let mut state = self.state.lock();
        state.stats.calls += 1;

        let fail = state.faults.fail_register_at == Some(slot);
        let entry = state.surface_mut(surface, OP)?;
        if !entry.mapped {
            state.stats.ordering_violations += 1;
            return Err(DriverError::new(OP, "surface is not mapped"));
        }
        if slot >= entry.slots.len() {
            return Err(DriverError::new(
                OP,
                format!("slot {} out of range ({} slots)", slot, entry.slots.len()),
            ));
        }
        if fail {
            let msg = format!("injected failure at slot {}", slot);
            return Err(DriverError::new(OP, msg));
        }
        entry.registered += 1;

        let id = ResourceId(state.next_id());
        state.resources.insert(id, HostResource { surface, slot });
        state.stats.registrations += 1;
        state.stats.live_registrations += 1;
        Ok(id)
    }

    fn mapped_frame(&self, resource: ResourceId) -> DriverResult<MappedFrame> {
        const OP: &str = "mapped_frame";
        let mut state = self.state.lock();
        state.stats.calls += 1;

        let Some(res) = state.resources.get(&resource) else {
            let msg = format!("unknown resource {:?}", resource);
            return Err(DriverError::new(OP, msg));
        };
        let (surface, slot) = (res.surface, res.slot);
        if state.faults.fail_mapped_frame_at == Some(slot) {
            let msg = format!("injected failure at slot {}", slot);
            return Err(DriverError::new(OP, msg));
        }

        let entry = state.surface_mut(surface, OP)?;
        let s = entry.slots[slot];
        Ok(MappedFrame {
            pitch_ptr: s.data_ptr,
            pitch: s.pitch,
        })
    }

    fn unregister_resource(&self, resource: ResourceId) -> DriverResult<()> {
        const OP: &str = "unregister_resource";
        let mut state = self.state.lock();
        state.stats.calls += 1;

        if !state.resources.contains_key(&resource) {
            let msg = format!("unknown resource {:?}", resource);
            return Err(DriverError::new(OP, msg));
        }
        if state.faults.fail_unregister {
            return Err(DriverError::new(OP, "injected unregister failure"));
        }
        let Some(res) = state.resources.remove(&resource) else {
            let msg = format!("unknown resource {:?}", resource);
            return Err(DriverError::new(OP, msg));
        };
        if let Some(entry) = state.surfaces.get_mut(&res.surface) {
            entry.registered -= 1;
        }
        let stats = &mut state.stats;
        stats.unregistrations += 1;
        stats.live_registrations -= 1;
        stats.unregistered_slots.push(res.slot);
        Ok(())
    }
}
