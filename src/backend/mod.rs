//! Platform memory backends
//!
//! A backend turns a [`PoolConfig`] into a Ready [`BatchMemoryBlock`] and
//! tears it back down. Two hardware memory models are supported:
//!
//! - [`DiscreteBackend`]: device memory is directly addressable, frame
//!   pointers are read straight from the surface slots.
//! - [`IntegratedBackend`]: the surface is mapped into the image-interop
//!   layer and each slot is registered as a graphics resource to obtain a
//!   device pointer.
//!
//! The variant is chosen once, at pool construction, through
//! [`BackendKind`]; shared code never branches on it.

mod discrete;
mod integrated;

pub use discrete::DiscreteBackend;
pub use integrated::IntegratedBackend;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::bail;

use crate::block::{BatchMemoryBlock, BlockState};
use crate::config::PoolConfig;
use crate::error::{AllocError, TeardownStep, TeardownWarning};
use crate::surface::SurfaceDriver;

/// Create/destroy contract shared by both hardware memory models.
pub trait PlatformMemoryBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Name of the driver underneath, for logs.
    fn driver_name(&self) -> &str;

    /// Bring an `Unallocated` block to `Ready`.
    ///
    /// On error the block is left `Failed` and still holds whatever was
    /// acquired before the failing step; pass it to [`release`] to undo.
    ///
    /// [`release`]: PlatformMemoryBackend::release
    fn populate(&self, block: &mut BatchMemoryBlock) -> Result<(), AllocError>;

    /// Undo every step `populate` completed on this block. Never fails;
    /// driver errors are logged as teardown warnings.
    fn teardown(&self, block: &mut BatchMemoryBlock);

    /// Allocate a Ready block for `config`.
    ///
    /// A partially built block is torn down before the error is returned,
    /// so a failed allocation holds no device resources.
    fn allocate(&self, config: &PoolConfig) -> Result<BatchMemoryBlock, AllocError> {
        config.validate()?;

        let mut block = BatchMemoryBlock::new(config);
        if let Err(err) = self.populate(&mut block) {
            log::error!("batch allocation failed: {}", err);
            self.release(block);
            return Err(err);
        }
        Ok(block)
    }

    fn release(&self, mut block: BatchMemoryBlock) {
        self.teardown(&mut block);
    }
}

/// Hardware memory model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendKind {
    /// Discrete accelerator, device memory directly addressable.
    Discrete,
    /// Integrated accelerator, image-interop registration required.
    Integrated,
}

impl BackendKind {
    pub fn name(self) -> &'static str {
        match self {
            BackendKind::Discrete => "discrete",
            BackendKind::Integrated => "integrated",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for BackendKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "discrete" | "dgpu" => Ok(BackendKind::Discrete),
            "integrated" | "igpu" | "tegra" => Ok(BackendKind::Integrated),
            other => bail!("Unknown backend kind: '{}'", other),
        }
    }
}

/// Build the backend for `kind` on top of `driver`.
pub fn select_backend<D>(kind: BackendKind, driver: Arc<D>) -> Box<dyn PlatformMemoryBackend>
where
    D: SurfaceDriver + ?Sized + 'static,
{
    match kind {
        BackendKind::Discrete => Box::new(DiscreteBackend::new(driver)),
        BackendKind::Integrated => Box::new(IntegratedBackend::new(driver)),
    }
}

/// Destroy the block's surface if one was created.
///
/// Shared last step of both teardown paths.
fn destroy_block_surface<D: SurfaceDriver + ?Sized>(driver: &D, block: &mut BatchMemoryBlock) {
    if let Some(surface) = block.surface.take() {
        log::trace!("destroying surface {:?}", surface.id);
        if let Err(e) = driver.destroy_surface(surface.id) {
            let warning = TeardownWarning::new(TeardownStep::DestroySurface, None, e);
            warning.log();
        }
    }
}

/// Enter `Allocating`, rejecting blocks that were already populated.
fn begin_allocation(block: &mut BatchMemoryBlock) -> Result<(), AllocError> {
    if block.state() != BlockState::Unallocated {
        return Err(AllocError::InvalidTransition {
            from: block.state(),
            to: BlockState::Allocating,
        });
    }
    block.config().validate()?;
    block.transition(BlockState::Allocating)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_backend_kind() {
        let discrete: BackendKind = "discrete".parse().unwrap();
        assert_eq!(discrete, BackendKind::Discrete);
        let tegra: BackendKind = "IGPU".parse().unwrap();
        assert_eq!(tegra, BackendKind::Integrated);
        assert!("fpga".parse::<BackendKind>().is_err());
        assert_eq!(BackendKind::Integrated.to_string(), "integrated");
    }
}
