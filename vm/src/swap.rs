//! Swap space of anonymous pages.
//!
//! The swap disk is cut into page-sized slots of [`SECTORS_PER_SLOT`]
//! consecutive sectors. A bitmap records which slots are in use (bit set).
//! The table only knows whether a slot is taken: which page owns a slot is
//! recorded by the owning anonymous page alone.
use abyss::addressing::PAGE_SIZE;
use alloc::{vec, vec::Vec};
use platform::{
    KernelError,
    fs::{Disk, Sector},
};

/// The number of disk sectors that hold a page.
pub const SECTORS_PER_SLOT: usize = PAGE_SIZE / Sector::SIZE;

/// Index of a page-sized slot in the swap disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct SwapSlot(usize);

impl SwapSlot {
    /// Cast into usize.
    #[inline]
    pub fn into_usize(self) -> usize {
        self.0
    }

    #[inline]
    fn first_sector(self) -> Sector {
        Sector(self.0 * SECTORS_PER_SLOT)
    }
}

/// The table of swap slots over the swap disk.
pub struct SwapTable {
    disk: Disk,
    // 1: used, 0: free
    bitmap: Vec<u64>,
    capacity: usize,
    used: usize,
}

impl SwapTable {
    /// Cut the disk into slots. Trailing sectors that do not fill a whole
    /// slot are left unused.
    pub fn new(disk: Disk) -> Self {
        let capacity = disk.sector_count() / SECTORS_PER_SLOT;
        Self {
            disk,
            bitmap: vec![0; capacity.div_ceil(64)],
            capacity,
            used: 0,
        }
    }

    /// The number of slots of the swap disk.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// The number of slots in use.
    pub fn used(&self) -> usize {
        self.used
    }

    /// Returns `true` if the slot is in use.
    pub fn is_used(&self, slot: SwapSlot) -> bool {
        let (pos, ofs) = (slot.0 / 64, slot.0 % 64);
        slot.0 < self.capacity && self.bitmap[pos] & (1 << ofs) != 0
    }

    /// Takes the lowest free slot.
    ///
    /// Returns `None` when the swap disk is full.
    pub fn allocate_slot(&mut self) -> Option<SwapSlot> {
        let (pos, qword) = self
            .bitmap
            .iter_mut()
            .enumerate()
            .find(|(_, qword)| **qword != u64::MAX)?;
        let index = pos * 64 + qword.trailing_ones() as usize;
        if index >= self.capacity {
            return None;
        }
        *qword |= 1 << (index % 64);
        self.used += 1;
        Some(SwapSlot(index))
    }

    /// Returns the slot to the free pool.
    pub fn free_slot(&mut self, slot: SwapSlot) {
        debug_assert!(self.is_used(slot), "{slot:?} is not in use");
        if self.is_used(slot) {
            self.bitmap[slot.0 / 64] &= !(1 << (slot.0 % 64));
            self.used -= 1;
        }
    }

    /// Stores a page into the slot.
    pub fn write_slot(&self, slot: SwapSlot, page: &[u8]) -> Result<(), KernelError> {
        if page.len() != PAGE_SIZE || !self.is_used(slot) {
            return Err(KernelError::InvalidArgument);
        }
        for (i, chunk) in page.chunks_exact(Sector::SIZE).enumerate() {
            let buf: &[u8; 512] = chunk.try_into().map_err(|_| KernelError::InvalidArgument)?;
            self.disk.write(slot.first_sector() + i, buf)?;
        }
        Ok(())
    }

    /// Loads a page from the slot.
    pub fn read_slot(&self, slot: SwapSlot, page: &mut [u8]) -> Result<(), KernelError> {
        if page.len() != PAGE_SIZE || !self.is_used(slot) {
            return Err(KernelError::InvalidArgument);
        }
        for (i, chunk) in page.chunks_exact_mut(Sector::SIZE).enumerate() {
            let buf: &mut [u8; 512] = chunk.try_into().map_err(|_| KernelError::InvalidArgument)?;
            self.disk.read(slot.first_sector() + i, buf)?;
        }
        Ok(())
    }

    /// Takes a slot and stores the page into it.
    ///
    /// # Errors
    /// - [`KernelError::NoSpace`] if the swap disk is full.
    /// - The error of the disk, after which the slot is free again.
    pub fn swap_out(&mut self, page: &[u8]) -> Result<SwapSlot, KernelError> {
        let slot = self.allocate_slot().ok_or(KernelError::NoSpace)?;
        match self.write_slot(slot, page) {
            Ok(()) => Ok(slot),
            Err(e) => {
                self.free_slot(slot);
                Err(e)
            }
        }
    }
}
