//! Fixtures shared by the integration tests.
#![allow(dead_code)]

use abyss::addressing::{PAGE_SIZE, Pa, Va};
use platform::{
    fs::{Disk, File, MemDisk, MemFile, RegularFile},
    mm::PhysicalAllocator,
};
use std::sync::Arc;
use vm::{
    Vm,
    config::{USER_STACK_TOP, VmConfigurationBuilder},
    frame::EvictionPolicy,
    swap::SECTORS_PER_SLOT,
};

/// Where the tests place their anonymous pages.
pub const HEAP: usize = 0x1000_0000;

/// Where the tests place their file mappings.
pub const MMAP: usize = 0x2000_0000;

pub fn va(addr: usize) -> Va {
    Va::new(addr).unwrap()
}

/// The `n`-th page above `base`.
pub fn page(base: usize, n: usize) -> Va {
    va(base + n * PAGE_SIZE)
}

pub fn stack_top() -> Va {
    va(USER_STACK_TOP)
}

/// A paging service over `frames` frames and a swap disk of `slots` slots.
pub fn vm(frames: usize, slots: usize) -> Arc<Vm> {
    VmConfigurationBuilder::new()
        .build(
            PhysicalAllocator::new(Pa::new(0x10_0000).unwrap(), frames),
            Disk::new(MemDisk::new(slots * SECTORS_PER_SLOT)),
        )
        .expect("the default configuration is valid")
}

/// Same as [`vm`], with another eviction policy.
pub fn vm_with_policy(frames: usize, slots: usize, policy: impl EvictionPolicy + 'static) -> Arc<Vm> {
    VmConfigurationBuilder::new()
        .policy(policy)
        .build(
            PhysicalAllocator::new(Pa::new(0x10_0000).unwrap(), frames),
            Disk::new(MemDisk::new(slots * SECTORS_PER_SLOT)),
        )
        .expect("the default configuration is valid")
}

/// An in-memory file, together with a handle to it.
pub fn file(contents: &[u8]) -> (Arc<MemFile>, File) {
    let mem = Arc::new(MemFile::new(contents));
    let file = File::open(RegularFile(mem.clone()));
    (mem, file)
}

/// A page filled with `byte`.
pub fn pattern(byte: u8) -> Vec<u8> {
    vec![byte; PAGE_SIZE]
}
