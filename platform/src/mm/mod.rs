//! Memory Management.
//!
//! This module implements the raw pool of physical frames that the paging
//! subsystem distributes to user pages. The core abstraction is the [`Page`],
//! which represents a single physical frame.
//!
//! Frame allocation and deallocation is tied to Rust's ownership system: a
//! frame is allocated by [`PhysicalAllocator::alloc`], which returns a
//! [`Page`]. Cloning a [`Page`] increases the frame's reference count, and the
//! frame returns to the pool once the last clone is dropped.
//!
//! The pool is finite. When it is exhausted,
//! [`PhysicalAllocator::alloc`] returns `None` and the caller (the frame
//! table of the `vm` crate) has to evict a resident page to make room.
pub mod page_table;

use crate::{
    addressing::{PAGE_SHIFT, PAGE_SIZE, Pa},
    sync::SpinLock,
};
use alloc::{boxed::Box, sync::Arc, vec, vec::Vec};
use core::{
    cell::UnsafeCell,
    sync::atomic::{AtomicU64, Ordering},
};

// Backing store of a pool of frames.
struct Arena {
    start: Pa,
    frames: Box<[UnsafeCell<[u8; PAGE_SIZE]>]>,
    // 0: used, 1: unused
    bitmap: SpinLock<Vec<u64>>,
    ref_cnts: Box<[AtomicU64]>,
}

unsafe impl Send for Arena {}
unsafe impl Sync for Arena {}

impl Arena {
    fn set_used(bitmap: &mut [u64], index: usize) {
        let (pos, ofs) = (index / 64, index % 64);
        debug_assert_ne!(bitmap[pos] & (1 << ofs), 0);
        bitmap[pos] &= !(1 << ofs);
    }

    fn set_unused(bitmap: &mut [u64], index: usize) {
        let (pos, ofs) = (index / 64, index % 64);
        debug_assert_eq!(bitmap[pos] & (1 << ofs), 0);
        bitmap[pos] |= 1 << ofs;
    }

    fn alloc(&self) -> Option<usize> {
        let mut bitmap = self.bitmap.lock();
        let found = bitmap
            .iter()
            .position(|qword| *qword != 0)
            .map(|pos| pos * 64 + bitmap[pos].trailing_zeros() as usize);
        if let Some(index) = found {
            Self::set_used(&mut bitmap, index);
            let prev = self.ref_cnts[index].fetch_add(1, Ordering::SeqCst);
            debug_assert_eq!(prev, 0);
        }
        bitmap.unlock();
        found
    }

    fn dealloc(&self, index: usize) {
        let mut bitmap = self.bitmap.lock();
        Self::set_unused(&mut bitmap, index);
        bitmap.unlock();
    }

    fn free_frames(&self) -> usize {
        let bitmap = self.bitmap.lock();
        let cnt = bitmap.iter().map(|qword| qword.count_ones() as usize).sum();
        bitmap.unlock();
        cnt
    }
}

/// A pool of physical frames.
///
/// The allocator is a cheap handle: cloning it yields another handle onto
/// the same pool.
///
/// ## Example:
/// ```
/// let palloc = PhysicalAllocator::new(Pa::new(0x10_0000).unwrap(), 4);
/// let page = palloc.alloc().unwrap();
/// assert_eq!(palloc.free_frames(), 3);
/// drop(page);
/// assert_eq!(palloc.free_frames(), 4);
/// ```
#[derive(Clone)]
pub struct PhysicalAllocator {
    arena: Arc<Arena>,
}

impl PhysicalAllocator {
    /// Create a pool of `cnt` frames whose first frame lives at `start`.
    ///
    /// `start` is rounded down to the page boundary.
    pub fn new(start: Pa, cnt: usize) -> Self {
        let mut bitmap = vec![u64::MAX; cnt.div_ceil(64)];
        // Pad back.
        for i in cnt..bitmap.len() * 64 {
            Arena::set_used(&mut bitmap, i);
        }
        Self {
            arena: Arc::new(Arena {
                start: start.page_down(),
                frames: (0..cnt).map(|_| UnsafeCell::new([0; PAGE_SIZE])).collect(),
                bitmap: SpinLock::new(bitmap),
                ref_cnts: (0..cnt).map(|_| AtomicU64::new(0)).collect(),
            }),
        }
    }

    /// Allocate a zero-filled frame.
    ///
    /// # Returns
    /// - `Some(Page)` on success.
    /// - `None` if every frame of the pool is in use.
    pub fn alloc(&self) -> Option<Page> {
        let index = self.arena.alloc()?;
        let mut page = Page {
            arena: self.arena.clone(),
            index,
        };
        page.inner_mut().fill(0);
        Some(page)
    }

    /// The number of frames that are currently not in use.
    pub fn free_frames(&self) -> usize {
        self.arena.free_frames()
    }

    /// The total number of frames in this pool.
    pub fn capacity(&self) -> usize {
        self.arena.frames.len()
    }
}

/// A handle to one frame of a [`PhysicalAllocator`].
///
/// Handles are counted: [`Clone`] adds a handle to the same frame, and the
/// frame goes back to its pool when the last handle is dropped. A frame
/// mapped by a page table and bound to a page record therefore has (at
/// least) two handles.
pub struct Page {
    arena: Arc<Arena>,
    index: usize,
}

impl Clone for Page {
    fn clone(&self) -> Self {
        self.arena.ref_cnts[self.index].fetch_add(1, Ordering::SeqCst);
        Self {
            arena: self.arena.clone(),
            index: self.index,
        }
    }
}

impl Drop for Page {
    fn drop(&mut self) {
        if self.arena.ref_cnts[self.index].fetch_sub(1, Ordering::SeqCst) == 1 {
            self.arena.dealloc(self.index);
        }
    }
}

impl core::fmt::Debug for Page {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Page({})", self.pa())
    }
}

impl Page {
    /// The physical address of the frame.
    #[inline]
    pub fn pa(&self) -> Pa {
        self.arena.start + (self.index << PAGE_SHIFT)
    }

    /// The number of live [`Page`] handles to this frame.
    #[inline]
    pub fn ref_count(&self) -> usize {
        self.arena.ref_cnts[self.index].load(Ordering::SeqCst) as usize
    }

    /// The bytes of the frame.
    pub fn inner(&self) -> &[u8] {
        unsafe { &*self.arena.frames[self.index].get() }
    }

    /// The bytes of the frame, for writing.
    ///
    /// Clones of this [`Page`] observe the modification. Whoever shares a
    /// frame must serialize the accesses, which the paging subsystem does by
    /// holding the lock of the page record that owns the frame.
    pub fn inner_mut(&mut self) -> &mut [u8] {
        unsafe { &mut *self.arena.frames[self.index].get() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exhaust_and_refill() {
        let palloc = PhysicalAllocator::new(Pa::new(0x20_0000).unwrap(), 3);
        let pages = (0..3).map(|_| palloc.alloc().unwrap()).collect::<Vec<_>>();
        assert!(palloc.alloc().is_none());
        assert_eq!(palloc.free_frames(), 0);
        assert_eq!(pages[2].pa(), Pa::new(0x20_2000).unwrap());
        drop(pages);
        assert_eq!(palloc.free_frames(), 3);
    }

    #[test]
    fn clones_share_the_frame() {
        let palloc = PhysicalAllocator::new(Pa::new(0x20_0000).unwrap(), 1);
        let mut page = palloc.alloc().unwrap();
        page.inner_mut()[7] = 0x42;
        let other = page.clone();
        assert_eq!(other.ref_count(), 2);
        assert_eq!(other.inner()[7], 0x42);
        drop(page);
        assert_eq!(palloc.free_frames(), 0);
        drop(other);
        assert_eq!(palloc.free_frames(), 1);
    }

    #[test]
    fn reallocated_frame_is_zeroed() {
        let palloc = PhysicalAllocator::new(Pa::new(0x20_0000).unwrap(), 1);
        let mut page = palloc.alloc().unwrap();
        page.inner_mut().fill(0xff);
        drop(page);
        let page = palloc.alloc().unwrap();
        assert!(page.inner().iter().all(|b| *b == 0));
    }
}
