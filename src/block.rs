//! Batch memory block: one contiguous surface plus its frame pointer table.

use crate::config::PoolConfig;
use crate::error::AllocError;
use crate::surface::{DevicePtr, MappedFrame, ResourceId, Surface};

/// Lifecycle of a [`BatchMemoryBlock`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockState {
    Unallocated,
    /// Surface creation requested.
    Allocating,
    /// Surface mapped into the interop layer (integrated backends only).
    Mapped,
    /// Every frame pointer is valid.
    Ready,
    Releasing,
    Released,
    /// Allocation failed; partial resources await teardown.
    Failed,
}

impl BlockState {
    pub fn can_transition_to(self, next: BlockState) -> bool {
        use BlockState::*;
        matches!(
            (self, next),
            (Unallocated, Allocating)
                | (Allocating, Mapped)
                | (Allocating, Ready)
                | (Mapped, Ready)
                | (Allocating, Failed)
                | (Mapped, Failed)
                | (Unallocated, Releasing)
                | (Ready, Releasing)
                | (Failed, Releasing)
                | (Releasing, Released)
        )
    }

    pub fn is_terminal(self) -> bool {
        self == BlockState::Released
    }
}

/// One batch of `batch_size` equally shaped frames in a single surface.
///
/// The block exclusively owns its surface and, on integrated hardware, one
/// interop resource per slot. Each owned handle is held in an `Option` that
/// teardown takes, so a handle is released at most once and only if the
/// step that produced it actually ran.
#[derive(Debug)]
pub struct BatchMemoryBlock {
    config: PoolConfig,
    state: BlockState,
    pub(crate) surface: Option<Surface>,
    pub(crate) interop_mapped: bool,
    pub(crate) resources: Vec<Option<ResourceId>>,
    pub(crate) frames: Vec<Option<MappedFrame>>,
    frame_ptrs: Vec<DevicePtr>,
}

impl BatchMemoryBlock {
    /// An unallocated block sized for `config`.
    pub fn new(config: &PoolConfig) -> Self {
        Self {
            config: *config,
            state: BlockState::Unallocated,
            surface: None,
            interop_mapped: false,
            resources: Vec::new(),
            frames: Vec::new(),
            frame_ptrs: vec![DevicePtr::NULL; config.batch_len()],
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn state(&self) -> BlockState {
        self.state
    }

    pub fn batch_size(&self) -> usize {
        self.frame_ptrs.len()
    }

    pub fn is_ready(&self) -> bool {
        self.state == BlockState::Ready
    }

    /// Per-frame device pointers, `batch_size` entries.
    ///
    /// Entries are only guaranteed non-null once the block is
    /// [`Ready`](BlockState::Ready); the table is not written again until
    /// teardown.
    pub fn frame_pointers(&self) -> &[DevicePtr] {
        &self.frame_ptrs
    }

    /// Surface backing this block, if one was created.
    pub fn surface(&self) -> Option<&Surface> {
        self.surface.as_ref()
    }

    /// Row pitch of slot 0, if a surface exists.
    pub fn pitch(&self) -> Option<u32> {
        self.surface
            .as_ref()
            .and_then(|s| s.slots.first())
            .map(|slot| slot.pitch)
    }

    /// Device bytes held by the surface.
    pub fn device_bytes(&self) -> usize {
        self.surface.as_ref().map_or(0, Surface::total_size)
    }

    /// Mapped frame descriptors (integrated backends only).
    pub fn mapped_frames(&self) -> impl Iterator<Item = &MappedFrame> {
        self.frames.iter().flatten()
    }

    /// Number of slots currently registered as graphics resources.
    pub fn registered_slots(&self) -> usize {
        self.resources.iter().filter(|r| r.is_some()).count()
    }

    pub(crate) fn transition(&mut self, next: BlockState) -> Result<(), AllocError> {
        if !self.state.can_transition_to(next) {
            return Err(AllocError::InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        log::trace!("block state {:?} -> {:?}", self.state, next);
        self.state = next;
        Ok(())
    }

    /// Mark an in-flight allocation as failed.
    pub(crate) fn fail(&mut self) {
        if self.transition(BlockState::Failed).is_err() {
            log::debug!("block in {:?} cannot be marked failed", self.state);
        }
    }

    pub(crate) fn set_frame_pointer(&mut self, index: usize, ptr: DevicePtr) {
        self.frame_ptrs[index] = ptr;
    }

    pub(crate) fn clear_frame_pointers(&mut self) {
        self.frame_ptrs.fill(DevicePtr::NULL);
    }

    /// Move into `Releasing`, whatever stage allocation reached.
    ///
    /// Returns `false` if the block is already released.
    pub(crate) fn begin_release(&mut self) -> bool {
        match self.state {
            BlockState::Released | BlockState::Releasing => false,
            BlockState::Allocating | BlockState::Mapped => {
                // Allocation was interrupted without being marked failed.
                self.fail();
                self.state = BlockState::Releasing;
                true
            }
            _ => {
                self.state = BlockState::Releasing;
                true
            }
        }
    }

    pub(crate) fn finish_release(&mut self) {
        self.clear_frame_pointers();
        self.state = BlockState::Released;
    }

    /// True when no surface, mapping or registration is held.
    pub fn holds_no_resources(&self) -> bool {
        self.surface.is_none() && !self.interop_mapped && self.registered_slots() == 0
    }
}

impl Drop for BatchMemoryBlock {
    fn drop(&mut self) {
        if !self.holds_no_resources() {
            log::warn!(
                "block dropped in state {:?} without release, leaking {:?} ({} registered slots)",
                self.state,
                self.surface.as_ref().map(|s| s.id),
                self.registered_slots()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ColorFormat;

    fn config(batch: u32) -> PoolConfig {
        PoolConfig::new(64, 32, ColorFormat::Rgba, batch, 0)
    }

    #[test]
    fn new_block_has_null_table_of_batch_length() {
        let block = BatchMemoryBlock::new(&config(4));
        assert_eq!(block.state(), BlockState::Unallocated);
        assert_eq!(block.frame_pointers().len(), 4);
        assert!(block.frame_pointers().iter().all(|p| p.is_null()));
        assert!(block.holds_no_resources());
        assert_eq!(block.device_bytes(), 0);
    }

    #[test]
    fn allowed_transitions() {
        use BlockState::*;
        assert!(Unallocated.can_transition_to(Allocating));
        assert!(Allocating.can_transition_to(Ready));
        assert!(Allocating.can_transition_to(Mapped));
        assert!(Mapped.can_transition_to(Ready));
        assert!(Mapped.can_transition_to(Failed));
        assert!(Ready.can_transition_to(Releasing));
        assert!(Releasing.can_transition_to(Released));

        assert!(!Ready.can_transition_to(Mapped));
        assert!(!Unallocated.can_transition_to(Ready));
        for next in [Unallocated, Allocating, Mapped, Ready, Releasing, Released, Failed] {
            assert!(!Released.can_transition_to(next), "Released -> {next:?}");
        }
    }

    #[test]
    fn illegal_transition_is_an_error() {
        let mut block = BatchMemoryBlock::new(&config(1));
        let err = block.transition(BlockState::Ready).unwrap_err();
        assert!(matches!(
            err,
            AllocError::InvalidTransition {
                from: BlockState::Unallocated,
                to: BlockState::Ready
            }
        ));
        assert_eq!(block.state(), BlockState::Unallocated);
    }

    #[test]
    fn interrupted_allocation_can_be_released() {
        let mut block = BatchMemoryBlock::new(&config(2));
        block.transition(BlockState::Allocating).unwrap();
        assert!(block.begin_release());
        assert_eq!(block.state(), BlockState::Releasing);
        block.finish_release();
        assert!(block.state().is_terminal());
        assert!(!block.begin_release());
    }
}
