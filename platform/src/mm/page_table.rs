//! Hardware page table of a process.
//!
//! The table is a software model of the last level of the x86_64 page
//! table: each mapped page-aligned virtual address has a [`Pte`] holding the
//! frame and the [`PteFlags`]. As on the real hardware, the "CPU" (here,
//! [`PageTable::translate`]) sets the accessed bit on every access and the
//! dirty bit on every write, and raises a page fault with a [`PFErrorCode`]
//! when the entry is missing or does not permit the access.
use crate::{
    KernelError,
    addressing::Va,
    mm::Page,
    task::PFErrorCode,
};
use alloc::{collections::BTreeMap, vec::Vec};

bitflags::bitflags! {
    /// Flags for pte.
    pub struct PteFlags: usize {
        /// Present; must be 1 to map a 4-KByte page
        const P = 1 << 0;
        /// Read/write; if 0, writes may not be allowed to the 4-KByte page referenced by this entry
        const RW = 1 << 1;
        /// User/supervisor; if 0, user-mode accesses are not allowed to the 4-KByte page referenced by this entry
        const US = 1 << 2;
        /// Accessed; indicates whether software has accessed the 4-KByte page referenced by this entry
        const A = 1 << 5;
        /// Dirty; indicates whether software has written to the 4-KByte page referenced by this entry
        const D = 1 << 6;
        /// Execute-disable; instruction fetches are not allowed from the 4-KByte page controlled by this entry
        const XD = 1 << 63;
    }
}

bitflags::bitflags! {
    /// Possible memory permissions for a page.
    ///
    /// The [`Permission`] allows you to specify memory access permissions such as:
    /// - Whether a page is readable.
    /// - Whether a page is writable.
    /// - Whether a page is executable.
    /// - Whether a page can be accessed by user applications.
    pub struct Permission: usize {
        /// Page is readable.
        const READ = 1 << 0;
        /// Page is writable.
        const WRITE = 1 << 1;
        /// Page is executable.
        const EXECUTABLE = 1 << 2;
        /// Page can be referred by user application.
        const USER = 1 << 3;
    }
}

impl Permission {
    /// The permission of a user page, writable or not.
    pub fn user(writable: bool) -> Self {
        if writable {
            Permission::READ | Permission::WRITE | Permission::USER
        } else {
            Permission::READ | Permission::USER
        }
    }

    fn into_pte_flags(self) -> PteFlags {
        let mut flags = PteFlags::P;
        if self.contains(Permission::WRITE) {
            flags |= PteFlags::RW;
        }
        if self.contains(Permission::USER) {
            flags |= PteFlags::US;
        }
        if !self.contains(Permission::EXECUTABLE) {
            flags |= PteFlags::XD;
        }
        flags
    }
}

/// Page Table Mapping Error.
///
/// This enum represents errors that can occur when working with page table
/// mappings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageTableMappingError {
    /// The address provided for a page table entry is not a multiple of the
    /// page size.
    Unaligned,
    /// The requested page table entry does not exist.
    NotExist,
    /// The address already has an existing mapping.
    Duplicated,
    /// The mapping was requested with an invalid permission.
    InvalidPermission,
}

impl From<PageTableMappingError> for KernelError {
    fn from(e: PageTableMappingError) -> Self {
        match e {
            PageTableMappingError::Unaligned => KernelError::InvalidArgument,
            PageTableMappingError::NotExist => KernelError::BadAddress,
            PageTableMappingError::Duplicated => KernelError::FileExist,
            PageTableMappingError::InvalidPermission => KernelError::InvalidAccess,
        }
    }
}

/// A page table entry.
#[derive(Debug)]
pub struct Pte {
    page: Page,
    flags: PteFlags,
}

impl Pte {
    /// The frame this entry maps.
    #[inline]
    pub fn page(&self) -> &Page {
        &self.page
    }

    /// Get the flags of this entry.
    #[inline]
    pub fn flags(&self) -> PteFlags {
        self.flags
    }

    /// Overwrite the flags of this entry.
    ///
    /// The present bit is kept regardless of `flags`.
    pub fn set_flags(&mut self, flags: PteFlags) -> &mut Self {
        self.flags = flags | PteFlags::P;
        self
    }
}

/// The page table of a process.
#[derive(Debug, Default)]
pub struct PageTable {
    entries: BTreeMap<Va, Pte>,
}

impl PageTable {
    /// Create an empty page table.
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }

    /// Maps a virtual address to a frame with the specified permissions.
    ///
    /// The accessed and dirty bits of a fresh mapping are clear.
    ///
    /// # Errors
    /// - [`PageTableMappingError::Unaligned`] if `va` is not page aligned.
    /// - [`PageTableMappingError::InvalidPermission`] if `perm` is not
    ///   readable.
    /// - [`PageTableMappingError::Duplicated`] if `va` is already mapped.
    pub fn map(&mut self, va: Va, page: Page, perm: Permission) -> Result<(), PageTableMappingError> {
        if !va.is_page_aligned() {
            return Err(PageTableMappingError::Unaligned);
        }
        if !perm.contains(Permission::READ) {
            return Err(PageTableMappingError::InvalidPermission);
        }
        if self.entries.contains_key(&va) {
            return Err(PageTableMappingError::Duplicated);
        }
        self.entries.insert(
            va,
            Pte {
                page,
                flags: perm.into_pte_flags(),
            },
        );
        Ok(())
    }

    /// Unmaps the virtual address, returning the frame that was mapped.
    pub fn unmap(&mut self, va: Va) -> Result<Page, PageTableMappingError> {
        if !va.is_page_aligned() {
            return Err(PageTableMappingError::Unaligned);
        }
        self.entries
            .remove(&va)
            .map(|pte| pte.page)
            .ok_or(PageTableMappingError::NotExist)
    }

    /// Get the entry of the page-aligned virtual address.
    pub fn walk(&self, va: Va) -> Result<&Pte, PageTableMappingError> {
        if !va.is_page_aligned() {
            return Err(PageTableMappingError::Unaligned);
        }
        self.entries.get(&va).ok_or(PageTableMappingError::NotExist)
    }

    /// Get the mutable entry of the page-aligned virtual address.
    pub fn walk_mut(&mut self, va: Va) -> Result<&mut Pte, PageTableMappingError> {
        if !va.is_page_aligned() {
            return Err(PageTableMappingError::Unaligned);
        }
        self.entries
            .get_mut(&va)
            .ok_or(PageTableMappingError::NotExist)
    }

    /// Changes the permission of an existing mapping.
    ///
    /// The accessed and dirty bits are preserved.
    pub fn set_permission(&mut self, va: Va, perm: Permission) -> Result<(), PageTableMappingError> {
        if !perm.contains(Permission::READ) {
            return Err(PageTableMappingError::InvalidPermission);
        }
        let pte = self.walk_mut(va)?;
        let keep = pte.flags & (PteFlags::A | PteFlags::D);
        pte.set_flags(perm.into_pte_flags() | keep);
        Ok(())
    }

    /// Grants or revokes the write permission of an existing user mapping.
    pub fn set_writable(&mut self, va: Va, writable: bool) -> Result<(), PageTableMappingError> {
        self.set_permission(va, Permission::user(writable))
    }

    fn test_flag(&self, va: Va, flag: PteFlags) -> bool {
        self.walk(va)
            .map(|pte| pte.flags.contains(flag))
            .unwrap_or(false)
    }

    fn clear_flag(&mut self, va: Va, flag: PteFlags) {
        if let Ok(pte) = self.walk_mut(va) {
            pte.flags.remove(flag);
        }
    }

    /// Returns `true` if `va` is mapped and has been written since the dirty
    /// bit was last cleared.
    pub fn is_dirty(&self, va: Va) -> bool {
        self.test_flag(va, PteFlags::D)
    }

    /// Clears the dirty bit of `va`. Unmapped addresses are ignored.
    pub fn clear_dirty(&mut self, va: Va) {
        self.clear_flag(va, PteFlags::D)
    }

    /// Returns `true` if `va` is mapped and has been accessed since the
    /// accessed bit was last cleared.
    pub fn is_accessed(&self, va: Va) -> bool {
        self.test_flag(va, PteFlags::A)
    }

    /// Clears the accessed bit of `va`. Unmapped addresses are ignored.
    pub fn clear_accessed(&mut self, va: Va) {
        self.clear_flag(va, PteFlags::A)
    }

    /// Performs the address translation of a single access, as the MMU
    /// does.
    ///
    /// On success, the accessed bit (and the dirty bit for a write) of the
    /// entry is set and the mapped frame is returned. Otherwise, the error
    /// code of the page fault the access raises is returned.
    pub fn translate(&mut self, va: Va, is_write: bool, is_user: bool) -> Result<Page, PFErrorCode> {
        let mut ec = PFErrorCode::empty();
        if is_write {
            ec |= PFErrorCode::WRITE_ACCESS;
        }
        if is_user {
            ec |= PFErrorCode::USER;
        }
        let Ok(pte) = self.walk_mut(va.page_down()) else {
            return Err(ec);
        };
        if (is_write && !pte.flags.contains(PteFlags::RW))
            || (is_user && !pte.flags.contains(PteFlags::US))
        {
            return Err(ec | PFErrorCode::PRESENT);
        }
        pte.flags |= PteFlags::A;
        if is_write {
            pte.flags |= PteFlags::D;
        }
        Ok(pte.page.clone())
    }

    /// Iterates the mapped addresses in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = (Va, &Pte)> {
        self.entries.iter().map(|(va, pte)| (*va, pte))
    }

    /// The number of mapped pages.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if nothing is mapped.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Unmaps everything, returning the frames that were mapped.
    pub fn clear(&mut self) -> Vec<(Va, Page)> {
        core::mem::take(&mut self.entries)
            .into_iter()
            .map(|(va, pte)| (va, pte.page))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{addressing::Pa, mm::PhysicalAllocator};

    fn va(addr: usize) -> Va {
        Va::new(addr).unwrap()
    }

    #[test]
    fn map_walk_unmap() {
        let palloc = PhysicalAllocator::new(Pa::new(0x10_0000).unwrap(), 2);
        let mut pt = PageTable::new();
        let page = palloc.alloc().unwrap();
        let pa = page.pa();
        pt.map(va(0x40_0000), page, Permission::user(false)).unwrap();
        assert_eq!(pt.walk(va(0x40_0000)).unwrap().page().pa(), pa);
        assert_eq!(
            pt.map(va(0x40_0000), palloc.alloc().unwrap(), Permission::user(true)),
            Err(PageTableMappingError::Duplicated)
        );
        assert_eq!(
            pt.walk(va(0x40_0010)).err(),
            Some(PageTableMappingError::Unaligned)
        );
        assert_eq!(pt.unmap(va(0x40_0000)).unwrap().pa(), pa);
        assert_eq!(pt.unmap(va(0x40_0000)).err(), Some(PageTableMappingError::NotExist));
    }

    #[test]
    fn translate_sets_accessed_and_dirty() {
        let palloc = PhysicalAllocator::new(Pa::new(0x10_0000).unwrap(), 1);
        let mut pt = PageTable::new();
        pt.map(va(0x40_0000), palloc.alloc().unwrap(), Permission::user(true))
            .unwrap();
        assert!(!pt.is_accessed(va(0x40_0000)));
        pt.translate(va(0x40_0123), false, true).unwrap();
        assert!(pt.is_accessed(va(0x40_0000)));
        assert!(!pt.is_dirty(va(0x40_0000)));
        pt.translate(va(0x40_0123), true, true).unwrap();
        assert!(pt.is_dirty(va(0x40_0000)));
        pt.clear_dirty(va(0x40_0000));
        assert!(!pt.is_dirty(va(0x40_0000)));
    }

    #[test]
    fn translate_faults() {
        let palloc = PhysicalAllocator::new(Pa::new(0x10_0000).unwrap(), 1);
        let mut pt = PageTable::new();
        assert_eq!(
            pt.translate(va(0x40_0000), true, true).err(),
            Some(PFErrorCode::WRITE_ACCESS | PFErrorCode::USER)
        );
        pt.map(va(0x40_0000), palloc.alloc().unwrap(), Permission::user(false))
            .unwrap();
        assert_eq!(
            pt.translate(va(0x40_0000), true, true).err(),
            Some(PFErrorCode::PRESENT | PFErrorCode::WRITE_ACCESS | PFErrorCode::USER)
        );
        pt.set_writable(va(0x40_0000), true).unwrap();
        assert!(pt.translate(va(0x40_0000), true, true).is_ok());
    }
}
