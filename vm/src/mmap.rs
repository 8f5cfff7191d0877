//! Memory-mapped files.
//!
//! `mmap` makes a region of a file show up in the address space. The pages
//! are file-backed and lazily loaded: the mapping only records, for each
//! page, the file offset and the number of bytes that come from the file.
//! Bytes past the end of the file read as zero and are never written back.
//!
//! The mapping holds its own handle to the file (see [`File::reopen`]), so
//! closing the descriptor the mapping was made from does not affect it.
//! Unmapping writes every dirty page back.
use crate::{
    config::KERNEL_BASE,
    mm_struct::MmStruct,
    page::{FileBacking, Page, Target},
};
use abyss::{
    addressing::{PAGE_MASK, PAGE_SIZE, Va},
    debug, warning,
};
use alloc::sync::Arc;
use platform::{KernelError, fs::File};

impl MmStruct {
    /// Maps `length` bytes of `file` from `offset` at `addr`.
    ///
    /// # Returns
    /// - `Ok(addr)` on success.
    /// - `Err(KernelError::InvalidArgument)` if `addr` is null or unaligned,
    ///   `length` is zero, `offset` is unaligned or too large, the file is
    ///   empty, or the region leaves user space, overlaps a page or the
    ///   stack area. Nothing
    ///   is mapped in that case.
    pub fn mmap(
        &self,
        addr: Va,
        length: usize,
        writable: bool,
        file: &File,
        offset: usize,
    ) -> Result<Va, KernelError> {
        if addr == Va::NULL || !addr.is_page_aligned() || length == 0 || offset & PAGE_MASK != 0 {
            return Err(KernelError::InvalidArgument);
        }
        let pages = length.div_ceil(PAGE_SIZE);
        let span = pages
            .checked_mul(PAGE_SIZE)
            .ok_or(KernelError::InvalidArgument)?;
        let end = addr
            .checked_add(span)
            .filter(|end| end.into_usize() <= KERNEL_BASE)
            .ok_or(KernelError::InvalidArgument)?;
        // Every page's file offset must be representable.
        offset
            .checked_add(span)
            .ok_or(KernelError::InvalidArgument)?;
        let file_size = file.size();
        if file_size == 0 {
            return Err(KernelError::InvalidArgument);
        }
        let config = self.vm.config();
        if addr < config.stack_top && config.stack_limit < end {
            return Err(KernelError::InvalidArgument);
        }

        let mut inner = self.inner.lock();
        if inner.spt.overlaps(addr, end) {
            inner.unlock();
            return Err(KernelError::InvalidArgument);
        }
        let file = Arc::new(file.reopen());
        for i in 0..pages {
            let ofs = offset + i * PAGE_SIZE;
            let valid_bytes = (length - i * PAGE_SIZE)
                .min(PAGE_SIZE)
                .min(file_size.saturating_sub(ofs));
            let page = Page::new_uninit(
                addr + i * PAGE_SIZE,
                writable,
                Target::File(FileBacking::new(file.clone(), ofs, valid_bytes)),
                None,
            );
            if let Err(e) = inner.spt.insert(page) {
                for j in 0..i {
                    // Never touched, so there is nothing to write back.
                    let removed = inner.spt.remove(addr + j * PAGE_SIZE);
                    debug_assert_eq!(removed, Ok(true));
                }
                inner.unlock();
                return Err(e);
            }
        }
        inner.mappings.insert(addr, pages);
        inner.unlock();
        debug!("mmap {} pages at {} (offset {:#x})", pages, addr, offset);
        Ok(addr)
    }

    /// Unmaps the mapping that starts at `addr`, writing dirty pages back.
    ///
    /// Unmapping an address where no mapping starts does nothing.
    ///
    /// # Errors
    /// - [`KernelError::InvalidArgument`] if `addr` is not page aligned.
    /// - The first error of writing a dirty page back. Every page of the
    ///   mapping is unmapped regardless.
    pub fn munmap(&self, addr: Va) -> Result<usize, KernelError> {
        if !addr.is_page_aligned() {
            return Err(KernelError::InvalidArgument);
        }
        let mut result = Ok(0);
        let mut inner = self.inner.lock();
        if let Some(pages) = inner.mappings.remove(&addr) {
            for i in 0..pages {
                if let Err(e) = inner.spt.remove(addr + i * PAGE_SIZE) {
                    warning!("munmap: lost writes to {}: {:?}", addr + i * PAGE_SIZE, e);
                    if result.is_ok() {
                        result = Err(e);
                    }
                }
            }
        }
        inner.unlock();
        result
    }
}
