//! vrambatch - batched GPU frame buffers for batched inference
//!
//! Allocates `batch_size` equally shaped frames as one contiguous pitched
//! surface, exposes them as a table of per-frame device pointers, and
//! reclaims every device-side handle deterministically. Two hardware memory
//! models are supported behind one backend contract: discrete accelerators
//! (pointers read directly from the surface) and integrated accelerators
//! (surface mapped into an image-interop layer and every slot registered as
//! a graphics resource).

pub mod backend;
pub mod block;
pub mod config;
pub mod error;
pub mod logging;
#[cfg(feature = "opencl")]
pub mod opencl;
pub mod pool;
pub mod registry;
pub mod surface;

pub use backend::{BackendKind, DiscreteBackend, IntegratedBackend, PlatformMemoryBackend};
pub use block::{BatchMemoryBlock, BlockState};
pub use config::{ColorFormat, PoolConfig};
pub use error::{AllocError, DriverError, ErrorKind, TeardownWarning};
pub use pool::{Allocator, BatchBuffer, BatchBufferPool};
pub use registry::{BATCH_MEMORY_TAG, GenericBuffer, MemoryTag, lookup};
pub use surface::{DevicePtr, HostDriver, SurfaceDriver};
