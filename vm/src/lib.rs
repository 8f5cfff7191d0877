//! # Demand-paged virtual memory.
//!
//! This crate lazily populates the pages of user address spaces, binds them
//! to physical frames, evicts frames under memory pressure, and keeps the
//! contents of evicted anonymous pages on a swap disk.
//!
//! ## Overview
//!
//! A user address space ([`MmStruct`]) never maps anything up front. A call
//! to [`MmStruct::mmap`] or [`MmStruct::alloc_page_with_initializer`] only
//! records *how* a page will be populated, as a [`Page`] record in the
//! [`SupplementalPageTable`]. The first access faults, and
//! [`MmStruct::handle_page_fault`] resolves the fault:
//!
//! ```text
//!   fault ──> find record ──> Vm::get_frame ──> map ──> swap_in ──> resume
//!                 │                 │
//!                 │ (none)          └─> evict a victim when out of frames
//!                 └─> grow the stack, or kill the process
//! ```
//!
//! The frames and the swap disk are shared by every address space, so they
//! are owned by a single [`Vm`] service object that every [`MmStruct`] holds.
//! A victim is chosen by a pluggable [`EvictionPolicy`]; by default the
//! second-chance [`ClockPolicy`].
//!
//! ## Locking
//!
//! Locks are always taken in this order:
//!
//! 1. the address space ([`MmStruct`]),
//! 2. the frame table,
//! 3. page records,
//! 4. page tables,
//! 5. the swap table.
//!
//! Every lock is a [`SpinLock`] and must be released explicitly.
//!
//! [`Page`]: page::Page
//! [`SupplementalPageTable`]: spt::SupplementalPageTable
//! [`EvictionPolicy`]: frame::EvictionPolicy
//! [`ClockPolicy`]: frame::ClockPolicy
//! [`SpinLock`]: abyss::spinlock::SpinLock

#![cfg_attr(not(test), no_std)]
#![deny(missing_docs, rustdoc::broken_intra_doc_links)]

extern crate alloc;

pub mod config;
pub mod fork;
pub mod frame;
pub mod loader;
pub mod mm_struct;
pub mod mmap;
pub mod page;
pub mod spt;
pub mod swap;

pub use mm_struct::{MmStruct, PageFaultReason};

use abyss::{info, spinlock::SpinLock};
use alloc::{boxed::Box, sync::Arc};
use config::VmConfiguration;
use frame::{EvictionPolicy, FrameOwner, FrameTable};
use page::Page;
use platform::{
    KernelError,
    fs::Disk,
    mm::{PhysicalAllocator, page_table::PageTable},
};
use swap::SwapTable;

/// A physical frame holding the contents of a page.
pub type Frame = platform::mm::Page;

/// The paging service shared by every address space.
///
/// A [`Vm`] owns the pool of physical frames, the frame table with its
/// eviction policy, and the swap table. Build one with
/// [`VmConfigurationBuilder`].
///
/// [`VmConfigurationBuilder`]: config::VmConfigurationBuilder
pub struct Vm {
    palloc: PhysicalAllocator,
    frames: SpinLock<FrameTable>,
    swap: SpinLock<SwapTable>,
    config: VmConfiguration,
}

impl Vm {
    pub(crate) fn new(
        palloc: PhysicalAllocator,
        swap_disk: Disk,
        config: VmConfiguration,
        policy: Box<dyn EvictionPolicy>,
    ) -> Arc<Self> {
        let swap = SwapTable::new(swap_disk);
        info!(
            "VM: {} frames, {} swap slots",
            palloc.capacity(),
            swap.capacity()
        );
        Arc::new(Self {
            palloc,
            frames: SpinLock::new(FrameTable::new(policy)),
            swap: SpinLock::new(swap),
            config,
        })
    }

    /// The layout of the address spaces.
    pub fn config(&self) -> &VmConfiguration {
        &self.config
    }

    /// Gets a zero-filled frame, evicting a victim if no frame is free.
    ///
    /// The frame is registered in the frame table without an owner, which
    /// keeps it from being evicted until [`Vm::add_owner`] or
    /// [`Vm::release_frame`] is called.
    ///
    /// # Errors
    /// - [`KernelError::NoMemory`] if every frame is in flight.
    /// - [`KernelError::NoSpace`] if the swap disk is full.
    /// - The error of the file or the disk the victim is saved to.
    pub fn get_frame(&self) -> Result<Frame, KernelError> {
        let mut frames = self.frames.lock();
        let frame = match self.palloc.alloc() {
            Some(frame) => Ok(frame),
            None => frames.evict_one(&self.swap),
        };
        if let Ok(frame) = &frame {
            frames.push(frame.clone());
        }
        frames.unlock();
        frame
    }

    /// Gives back a frame from [`Vm::get_frame`] that was never installed.
    pub fn release_frame(&self, frame: &Frame) {
        let mut frames = self.frames.lock();
        frames.release(frame);
        frames.unlock();
    }

    pub(crate) fn add_owner(&self, frame: &Frame, owner: FrameOwner) {
        let mut frames = self.frames.lock();
        frames.add_owner(frame, owner);
        frames.unlock();
    }

    /// Destroys a page record: unmaps it, writes back a dirty file-backed
    /// page, and releases its frame and its swap slot.
    ///
    /// The record is gone even if the write back fails; the error tells the
    /// caller that the file misses the last writes.
    pub(crate) fn destroy_page(
        &self,
        record: &Arc<SpinLock<Page>>,
        page_table: &SpinLock<PageTable>,
    ) -> Result<(), KernelError> {
        let mut result = Ok(());
        let mut frames = self.frames.lock();
        let mut page = record.lock();
        if let Some(frame) = page.unbind() {
            let mut pt = page_table.lock();
            let dirty = pt.is_dirty(page.va());
            let unmapped = pt.unmap(page.va());
            pt.unlock();
            debug_assert!(unmapped.is_ok(), "resident page {} is not mapped", page.va());
            if dirty {
                result = page.write_back(&frame);
            }
            frames.remove_owner(&frame, record);
        }
        if let Some(slot) = page.take_swap_slot() {
            let mut swap = self.swap.lock();
            swap.free_slot(slot);
            swap.unlock();
        }
        page.unlock();
        frames.unlock();
        result
    }

    /// The number of frames currently registered in the frame table.
    pub fn resident_frames(&self) -> usize {
        let frames = self.frames.lock();
        let len = frames.len();
        frames.unlock();
        len
    }

    /// The number of frames nobody uses.
    pub fn free_frames(&self) -> usize {
        self.palloc.free_frames()
    }

    /// The number of swap slots in use.
    pub fn used_swap_slots(&self) -> usize {
        let swap = self.swap.lock();
        let used = swap.used();
        swap.unlock();
        used
    }

    /// The number of swap slots available.
    pub fn free_swap_slots(&self) -> usize {
        let swap = self.swap.lock();
        let free = swap.capacity() - swap.used();
        swap.unlock();
        free
    }

    pub(crate) fn frames(&self) -> &SpinLock<FrameTable> {
        &self.frames
    }

    pub(crate) fn swap(&self) -> &SpinLock<SwapTable> {
        &self.swap
    }
}
