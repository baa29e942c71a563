//! Tag-based lookup of batch memory inside generic buffers.

use std::any::Any;
use std::sync::Arc;
use std::thread;

use vrambatch::logging::init_test_logging;
use vrambatch::pool::{Allocator, create_allocator};
use vrambatch::registry::{Memory, MemoryHeader};
use vrambatch::{
    BATCH_MEMORY_TAG, BackendKind, BatchBufferPool, ColorFormat, GenericBuffer, HostDriver,
    MemoryTag, PoolConfig, lookup,
};

#[derive(Debug)]
struct PlainMemory(MemoryHeader);

impl Memory for PlainMemory {
    fn header(&self) -> &MemoryHeader {
        &self.0
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any + Send + Sync> {
        self
    }
}

fn sysmem() -> Box<dyn Memory> {
    let header = MemoryHeader::new(MemoryTag::new("sysmem"), 16, 0);
    Box::new(PlainMemory(header))
}

fn config() -> PoolConfig {
    PoolConfig::new(300, 300, ColorFormat::Rgba, 4, 0)
}

#[test]
fn pool_memory_is_found_by_tag() {
    init_test_logging();
    let driver = Arc::new(HostDriver::new());
    let pool = BatchBufferPool::with_driver(config(), BackendKind::Discrete, driver).unwrap();
    assert_eq!(pool.tag(), BATCH_MEMORY_TAG);

    let memory: Box<dyn Memory> = Box::new(pool.create(4096, 64).unwrap());
    assert!(memory.is_type(pool.tag()));
    assert_eq!(memory.header().size, 4096);

    let mut buffer = GenericBuffer::from_memory(memory);
    let block = lookup(&buffer).expect("pool buffer");
    assert_eq!(block.frame_pointers().len(), 4);
    assert_eq!(block.config(), &config());

    pool.free(buffer.take_memory(0).unwrap());
    assert_eq!(pool.live_batches(), 0);
}

#[test]
fn only_first_memory_is_considered() {
    init_test_logging();
    let alloc = create_allocator("host-discrete", &config()).unwrap();

    let mut buffer = GenericBuffer::from_memory(sysmem());
    buffer.append_memory(alloc.alloc(0, 0).unwrap());
    assert_eq!(buffer.n_memory(), 2);
    assert!(lookup(&buffer).is_none());

    alloc.free(buffer.take_memory(1).unwrap());
    assert_eq!(alloc.live_batches(), 0);
}

#[test]
fn freeing_foreign_memory_is_ignored() {
    init_test_logging();
    let alloc = create_allocator("host-integrated", &config()).unwrap();
    alloc.free(sysmem());
    assert_eq!(alloc.live_batches(), 0);
}

#[test]
fn ready_table_is_readable_from_many_threads() {
    init_test_logging();
    let alloc = create_allocator("host-integrated", &config()).unwrap();
    let buffer = GenericBuffer::from_memory(alloc.alloc(0, 0).unwrap());
    let expected: Vec<usize> = lookup(&buffer)
        .unwrap()
        .frame_pointers()
        .iter()
        .map(|p| p.addr())
        .collect();

    thread::scope(|s| {
        for _ in 0..4 {
            s.spawn(|| {
                let block = lookup(&buffer).expect("pool buffer");
                let seen: Vec<usize> = block.frame_pointers().iter().map(|p| p.addr()).collect();
                assert_eq!(seen, expected);
            });
        }
    });

    let mut buffer = buffer;
    alloc.free(buffer.take_memory(0).unwrap());
}
