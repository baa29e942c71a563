//! Error types for batch allocation and teardown.

use std::fmt;

use thiserror::Error;

use crate::block::BlockState;

/// Failure reported by a [`SurfaceDriver`](crate::surface::SurfaceDriver) call.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{op} failed: {message}")]
pub struct DriverError {
    /// Driver operation that failed (e.g. `create_surface`).
    pub op: &'static str,
    pub message: String,
}

impl DriverError {
    pub fn new(op: &'static str, message: impl Into<String>) -> Self {
        Self {
            op,
            message: message.into(),
        }
    }
}

pub type DriverResult<T> = Result<T, DriverError>;

/// Escalation class of an [`AllocError`].
///
/// Both classes are fatal for the requested batch; the owning pipeline
/// decides whether to halt or reconfigure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Surface or device memory could not be created, or the config is invalid.
    Allocation,
    /// Image-interop mapping or per-slot resource registration failed.
    Interop,
}

/// Errors returned synchronously by pool and backend allocation paths.
#[derive(Error, Debug)]
pub enum AllocError {
    #[error("invalid pool configuration: {0}")]
    InvalidConfig(String),

    #[error("batch surface allocation failed on device {device_id}: {source}")]
    Allocation {
        device_id: u32,
        #[source]
        source: DriverError,
    },

    /// `slot` is `None` when the whole-surface mapping failed.
    #[error("interop setup failed{}: {source}", SlotSuffix(.slot))]
    Interop {
        slot: Option<usize>,
        #[source]
        source: DriverError,
    },

    #[error("invalid block state transition {from:?} -> {to:?}")]
    InvalidTransition { from: BlockState, to: BlockState },

    #[error("no allocator registered under '{0}'")]
    UnknownAllocator(String),
}

impl AllocError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AllocError::Interop { .. } => ErrorKind::Interop,
            AllocError::InvalidConfig(_)
            | AllocError::Allocation { .. }
            | AllocError::InvalidTransition { .. }
            | AllocError::UnknownAllocator(_) => ErrorKind::Allocation,
        }
    }

    pub fn is_interop(&self) -> bool {
        self.kind() == ErrorKind::Interop
    }
}

struct SlotSuffix<'a>(&'a Option<usize>);

impl fmt::Display for SlotSuffix<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self.0 {
            Some(slot) => write!(f, " at slot {}", slot),
            None => Ok(()),
        }
    }
}

/// Teardown step that can fail without aborting the rest of a release.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TeardownStep {
    Unregister,
    Unmap,
    DestroySurface,
}

impl fmt::Display for TeardownStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TeardownStep::Unregister => "unregister resource",
            TeardownStep::Unmap => "unmap interop image",
            TeardownStep::DestroySurface => "destroy surface",
        };
        f.write_str(name)
    }
}

/// A teardown failure. Logged, never propagated.
#[derive(Error, Debug, Clone)]
#[error("teardown warning: {step}{} failed: {source}", SlotSuffix(.slot))]
pub struct TeardownWarning {
    pub step: TeardownStep,
    pub slot: Option<usize>,
    #[source]
    pub source: DriverError,
}

impl TeardownWarning {
    pub fn new(step: TeardownStep, slot: Option<usize>, source: DriverError) -> Self {
        Self { step, slot, source }
    }

    /// Emit the warning through the `log` facade.
    pub fn log(&self) {
        log::warn!("{}", self);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_config_is_an_allocation_error() {
        let err = AllocError::InvalidConfig("batch_size must be non-zero".into());
        assert_eq!(err.kind(), ErrorKind::Allocation);
        assert!(!err.is_interop());
    }

    #[test]
    fn interop_error_mentions_slot() {
        let err = AllocError::Interop {
            slot: Some(2),
            source: DriverError::new("register_resource", "table full"),
        };
        assert_eq!(err.kind(), ErrorKind::Interop);
        let msg = err.to_string();
        assert!(msg.contains("at slot 2"), "{msg}");
        assert!(
            msg.contains("register_resource failed: table full"),
            "{msg}"
        );
    }

    #[test]
    fn whole_surface_interop_error_has_no_slot() {
        let err = AllocError::Interop {
            slot: None,
            source: DriverError::new("map_interop_image", "no display"),
        };
        assert!(!err.to_string().contains("slot"));
    }

    #[test]
    fn teardown_warning_display() {
        let w = TeardownWarning::new(
            TeardownStep::Unregister,
            Some(1),
            DriverError::new("unregister_resource", "busy"),
        );
        assert_eq!(
            w.to_string(),
            "teardown warning: unregister resource at slot 1 failed: unregister_resource failed: busy"
        );
    }
}
