//! Memory tagging and tag-based lookup
//!
//! Generic buffers carry type-erased [`Memory`] objects. Every memory
//! produced by a batch pool is stamped with [`BATCH_MEMORY_TAG`], so any
//! collaborator holding a [`GenericBuffer`] can ask whether it came from a
//! batch pool and, if so, reach the [`BatchMemoryBlock`] inside.

use std::any::Any;
use std::fmt;

use crate::block::BatchMemoryBlock;
use crate::pool::BatchBuffer;

/// Identifies which allocator produced a memory object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MemoryTag(&'static str);

impl MemoryTag {
    pub const fn new(name: &'static str) -> Self {
        MemoryTag(name)
    }

    pub fn as_str(self) -> &'static str {
        self.0
    }
}

impl fmt::Display for MemoryTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0)
    }
}

/// Tag of every memory produced by a [`BatchBufferPool`](crate::pool::BatchBufferPool).
pub const BATCH_MEMORY_TAG: MemoryTag = MemoryTag::new("vrambatch");

/// Size/alignment record shared by all memory objects.
///
/// These describe the wrapper object handed to the buffer framework, not the
/// device memory behind it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryHeader {
    pub tag: MemoryTag,
    pub size: usize,
    pub align: usize,
    pub offset: usize,
    pub maxsize: usize,
}

impl MemoryHeader {
    pub fn new(tag: MemoryTag, size: usize, align: usize) -> Self {
        Self {
            tag,
            size,
            align,
            offset: 0,
            maxsize: size,
        }
    }
}

/// A type-erased memory object that can live inside a [`GenericBuffer`].
pub trait Memory: Any + Send + Sync + fmt::Debug {
    fn header(&self) -> &MemoryHeader;

    fn as_any(&self) -> &dyn Any;

    fn into_any(self: Box<Self>) -> Box<dyn Any + Send + Sync>;

    fn is_type(&self, tag: MemoryTag) -> bool {
        self.header().tag == tag
    }
}

/// Ordered list of memories, as passed around by a buffer framework.
#[derive(Debug, Default)]
pub struct GenericBuffer {
    memories: Vec<Box<dyn Memory>>,
}

impl GenericBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_memory(memory: Box<dyn Memory>) -> Self {
        Self {
            memories: vec![memory],
        }
    }

    pub fn append_memory(&mut self, memory: Box<dyn Memory>) {
        self.memories.push(memory);
    }

    pub fn n_memory(&self) -> usize {
        self.memories.len()
    }

    pub fn peek_memory(&self, index: usize) -> Option<&dyn Memory> {
        self.memories.get(index).map(|m| m.as_ref())
    }

    /// Remove and return the memory at `index`.
    pub fn take_memory(&mut self, index: usize) -> Option<Box<dyn Memory>> {
        if index < self.memories.len() {
            Some(self.memories.remove(index))
        } else {
            None
        }
    }
}

/// Batch block of the buffer's first memory, if a batch pool produced it.
///
/// Returns `None` for empty buffers and for memories carrying another tag.
/// Never mutates and may be called from any thread.
pub fn lookup(buffer: &GenericBuffer) -> Option<&BatchMemoryBlock> {
    let memory = buffer.peek_memory(0)?;
    if !memory.is_type(BATCH_MEMORY_TAG) {
        return None;
    }
    memory
        .as_any()
        .downcast_ref::<BatchBuffer>()
        .map(BatchBuffer::block)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct SysMemory {
        header: MemoryHeader,
    }

    impl Memory for SysMemory {
        fn header(&self) -> &MemoryHeader {
            &self.header
        }

        fn as_any(&self) -> &dyn Any {
            self
        }

        fn into_any(self: Box<Self>) -> Box<dyn Any + Send + Sync> {
            self
        }
    }

    #[test]
    fn foreign_memory_is_not_found() {
        let buffer = GenericBuffer::from_memory(Box::new(SysMemory {
            header: MemoryHeader::new(MemoryTag::new("system"), 128, 16),
        }));
        assert!(lookup(&buffer).is_none());
    }

    #[test]
    fn spoofed_tag_without_batch_payload_is_not_found() {
        let buffer = GenericBuffer::from_memory(Box::new(SysMemory {
            header: MemoryHeader::new(BATCH_MEMORY_TAG, 128, 16),
        }));
        assert!(lookup(&buffer).is_none());
    }

    #[test]
    fn empty_buffer_is_not_found() {
        assert!(lookup(&GenericBuffer::new()).is_none());
    }

    #[test]
    fn take_memory_out_of_range() {
        let mut buffer = GenericBuffer::new();
        assert!(buffer.take_memory(0).is_none());
        assert_eq!(buffer.n_memory(), 0);
    }
}
