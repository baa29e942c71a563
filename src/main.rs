//! vrambatch - exercise a batched GPU frame-buffer pool
//!
//! Builds a pool through the allocator registry, runs a number of
//! create/destroy cycles, prints each batch's frame pointer table and
//! checks that the device footprint returns to zero after every cycle.

use anyhow::{Context, Result, bail};
use clap::Parser;

use vrambatch::config::parse_resolution;
use vrambatch::logging::init_logging;
use vrambatch::pool::{Allocator, create_allocator, register_allocator, registered_allocators};
use vrambatch::surface::{FaultPlan, HostDriver};
use vrambatch::{BackendKind, BatchBufferPool, ColorFormat, GenericBuffer, PoolConfig, lookup};

use std::sync::Arc;

/// Command line arguments for the batch pool exerciser
#[derive(Parser, Debug)]
#[clap(
    name = "vrambatch",
    about = "Allocate batches of pitched GPU frame buffers and verify they are reclaimed.",
    version
)]
struct Args {
    /// Frame resolution as WIDTHxHEIGHT
    #[clap(short, long, value_parser = parse_resolution, default_value = "640x480")]
    resolution: (u32, u32),

    /// Color format (gray8, rgb, bgr, rgba, bgra, bgrx, nv12, yuv420)
    #[clap(short, long, default_value = "rgba")]
    format: ColorFormat,

    /// Frames per batch
    #[clap(short, long, default_value = "4")]
    batch_size: u32,

    /// GPU device index to allocate on
    #[clap(short, long, default_value = "0")]
    device: u32,

    /// Registered allocator to use (see --list-allocators)
    #[clap(short, long, default_value = "host-discrete")]
    allocator: String,

    /// Number of create/destroy cycles
    #[clap(short, long, default_value = "2")]
    cycles: u32,

    /// Make interop registration fail at this slot (host-integrated only)
    #[clap(long)]
    fail_register_at: Option<usize>,

    /// Enable verbose logging
    #[clap(short, long)]
    verbose: bool,

    /// List registered allocators and exit
    #[clap(long)]
    list_allocators: bool,

    /// List available OpenCL platforms and devices and exit
    #[cfg(feature = "opencl")]
    #[clap(long)]
    list_devices: bool,
}

/// Registers a host-integrated allocator whose driver fails at `slot`.
fn register_faulty_allocator(slot: usize) -> String {
    let name = format!("host-integrated-fail-{}", slot);
    register_allocator(&name, move |config: &PoolConfig| {
        let driver = Arc::new(HostDriver::with_faults(FaultPlan {
            fail_register_at: Some(slot),
            ..FaultPlan::default()
        }));
        let pool = BatchBufferPool::with_driver(*config, BackendKind::Integrated, driver)?;
        Ok(Box::new(pool) as Box<dyn Allocator>)
    });
    name
}

fn run_cycle(allocator: &dyn Allocator, cycle: u32) -> Result<usize> {
    let config = *allocator.config();
    let memory = allocator
        .alloc(0, 0)
        .with_context(|| format!("Cycle {}: failed to allocate batch", cycle))?;
    let mut buffer = GenericBuffer::from_memory(memory);

    let Some(block) = lookup(&buffer) else {
        bail!("Cycle {}: buffer was not produced by a batch pool", cycle);
    };
    let footprint = allocator.live_device_bytes();
    log::info!(
        "Cycle {}: {} frames, pitch {:?}, {} bytes on device {}",
        cycle,
        block.batch_size(),
        block.pitch(),
        footprint,
        config.device_id
    );
    for (i, ptr) in block.frame_pointers().iter().enumerate() {
        log::info!("  frame {}: {:?}", i, ptr.as_ptr());
    }

    if let Some(memory) = buffer.take_memory(0) {
        allocator.free(memory);
    }
    if allocator.live_batches() != 0 || allocator.live_device_bytes() != 0 {
        bail!(
            "Cycle {}: {} batch(es) / {} bytes still live after destroy",
            cycle,
            allocator.live_batches(),
            allocator.live_device_bytes()
        );
    }
    Ok(footprint)
}

fn main() -> Result<()> {
    let args = Args::parse();

    #[cfg(feature = "opencl")]
    if args.list_devices {
        return vrambatch::opencl::list_devices();
    }

    if args.list_allocators {
        for name in registered_allocators() {
            println!("{}", name);
        }
        return Ok(());
    }

    init_logging(args.verbose);

    let (width, height) = args.resolution;
    let config = PoolConfig::new(width, height, args.format, args.batch_size, args.device);

    let allocator_name = match args.fail_register_at {
        Some(slot) => register_faulty_allocator(slot),
        None => args.allocator.clone(),
    };

    log::info!(
        "Starting {} batch pool: {}x{} {} x{} on device {}",
        allocator_name,
        width,
        height,
        args.format,
        args.batch_size,
        args.device
    );

    let allocator = create_allocator(&allocator_name, &config)
        .with_context(|| format!("Failed to create allocator '{allocator_name}'"))?;

    let mut footprints = Vec::with_capacity(args.cycles as usize);
    for cycle in 0..args.cycles {
        footprints.push(run_cycle(allocator.as_ref(), cycle)?);
    }

    if footprints.windows(2).any(|w| w[0] != w[1]) {
        bail!("Device footprint changed across cycles: {:?}", footprints);
    }

    log::info!(
        "Completed {} cycle(s), {} bytes per batch, no leaks.",
        args.cycles,
        footprints.first().copied().unwrap_or(0)
    );
    Ok(())
}
