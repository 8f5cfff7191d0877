//! Memory state of a process.
//!
//! An [`MmStruct`] is the address space of one process: its hardware page
//! table, its supplemental page table, the extent of its stack and its live
//! file mappings. It is the entry point of everything the rest of the
//! kernel asks of the paging subsystem:
//!
//! - the page fault handler ([`MmStruct::handle_page_fault`]),
//! - lazy allocation ([`MmStruct::alloc_page_with_initializer`],
//!   [`MmStruct::alloc_page`], [`MmStruct::setup_stack`]),
//! - memory-mapped files ([`MmStruct::mmap`], [`MmStruct::munmap`]),
//! - duplication on fork ([`MmStruct::fork`]),
//! - validation of, and access to, user buffers ([`MmStruct::access_ok`],
//!   [`MmStruct::read_user`], [`MmStruct::write_user`]).
//!
//! ## Page faults
//!
//! A fault on a page that has a record is resolved by *claiming* the page:
//! a frame is obtained from the [`Vm`], mapped at the page, and filled with
//! the page's contents. A fault just below the stack, within
//! [`VmConfiguration::stack_slack`] of the stack pointer, grows the stack by
//! one page. Any other fault is fatal to the process, and the handler
//! returns the error the process is killed with.
//!
//! [`VmConfiguration::stack_slack`]: crate::config::VmConfiguration::stack_slack
use crate::{
    Vm,
    config::KERNEL_BASE,
    frame::FrameOwner,
    loader::MmLoader,
    page::{Page, Target, VmType},
    spt::SupplementalPageTable,
};
use abyss::{
    addressing::{PAGE_SIZE, Pa, Va},
    debug,
    spinlock::SpinLock,
    warning,
};
use alloc::{collections::BTreeMap, sync::Arc};
use core::{
    ops::Range,
    sync::atomic::{AtomicUsize, Ordering},
};
use platform::{
    KernelError,
    mm::page_table::{PageTable, Permission},
    task::PFErrorCode,
};

/// Represents the reason for a page fault in a virtual memory system.
///
/// This struct is used to capture various details about a page fault,
/// including the faulting address, the type of access that caused the
/// fault, and the stack pointer at the time of the fault.
#[derive(Debug, Clone, Copy)]
pub struct PageFaultReason {
    /// The address that caused the page fault.
    pub fault_addr: Va,

    /// Indicates whether the fault was due to a write access.
    pub is_write_access: bool,

    /// Indicates whether the page that caused the fault is present in memory.
    ///
    /// A value of `true` means the access violated the protection of a
    /// mapped page. A value of `false` means nothing is mapped at the
    /// address.
    pub is_present: bool,

    /// Indicates whether the fault was raised in user mode.
    pub is_user: bool,

    /// The user stack pointer at the time of the fault.
    ///
    /// Only meaningful for a fault raised in user mode. A fault raised by
    /// the kernel while serving a system call uses the stack pointer saved
    /// on entry to the kernel instead.
    pub rsp: usize,
}

impl PageFaultReason {
    /// Probe the cause of page fault into a [`PageFaultReason`].
    ///
    /// This function decodes a hardware-provided [`PFErrorCode`] together
    /// with the faulting address (`cr2`) and the stack pointer.
    pub fn new(ec: PFErrorCode, cr2: Va, rsp: usize) -> Self {
        PageFaultReason {
            fault_addr: cr2,
            is_write_access: ec.contains(PFErrorCode::WRITE_ACCESS),
            is_present: ec.contains(PFErrorCode::PRESENT),
            is_user: ec.contains(PFErrorCode::USER),
            rsp,
        }
    }

    /// Returns `true` if nothing was mapped at the faulting address.
    #[inline]
    pub fn is_demand_paging_fault(&self) -> bool {
        !self.is_present
    }

    /// Returns `true` if the fault is a write to a read-only mapping.
    #[inline]
    pub fn is_cow_fault(&self) -> bool {
        self.is_present && self.is_write_access
    }
}

pub(crate) struct AddressSpace {
    pub(crate) spt: SupplementalPageTable,
    /// The lowest address of the stack.
    pub(crate) stack_bottom: Va,
    /// Start address and page count of every live file mapping.
    pub(crate) mappings: BTreeMap<Va, usize>,
}

/// The memory state of a process.
pub struct MmStruct {
    pub(crate) vm: Arc<Vm>,
    pub(crate) page_table: Arc<SpinLock<PageTable>>,
    pub(crate) inner: SpinLock<AddressSpace>,
    saved_rsp: AtomicUsize,
}

impl MmStruct {
    /// Creates an empty address space served by `vm`.
    pub fn new(vm: Arc<Vm>) -> Self {
        let page_table = Arc::new(SpinLock::new(PageTable::new()));
        let stack_top = vm.config().stack_top;
        Self {
            inner: SpinLock::new(AddressSpace {
                spt: SupplementalPageTable::new(vm.clone(), page_table.clone()),
                stack_bottom: stack_top,
                mappings: BTreeMap::new(),
            }),
            saved_rsp: AtomicUsize::new(stack_top.into_usize()),
            vm,
            page_table,
        }
    }

    /// The paging service of this address space.
    pub fn vm(&self) -> &Arc<Vm> {
        &self.vm
    }

    /// The hardware page table.
    pub fn page_table(&self) -> &Arc<SpinLock<PageTable>> {
        &self.page_table
    }

    /// Records the user stack pointer on entry to the kernel.
    ///
    /// Faults raised while the kernel accesses user memory decide on stack
    /// growth with this value.
    pub fn set_user_stack_pointer(&self, rsp: usize) {
        self.saved_rsp.store(rsp, Ordering::SeqCst);
    }

    /// The user stack pointer recorded on entry to the kernel.
    pub fn user_stack_pointer(&self) -> usize {
        self.saved_rsp.load(Ordering::SeqCst)
    }

    /// The lowest address of the stack.
    pub fn stack_bottom(&self) -> Va {
        let inner = self.inner.lock();
        let bottom = inner.stack_bottom;
        inner.unlock();
        bottom
    }

    /// Creates the first stack page, right below the stack top, and returns
    /// the initial stack pointer.
    ///
    /// # Errors
    /// - [`KernelError::FileExist`] if the stack already exists.
    /// - Any error of claiming the page.
    pub fn setup_stack(&self) -> Result<Va, KernelError> {
        let top = self.vm.config().stack_top;
        let mut inner = self.inner.lock();
        let result = if inner.stack_bottom != top {
            Err(KernelError::FileExist)
        } else {
            self.grow_stack(&mut inner)
        };
        inner.unlock();
        result?;
        self.set_user_stack_pointer(top.into_usize());
        Ok(top)
    }

    fn check_user_page(va: Va) -> Result<(), KernelError> {
        if va == Va::NULL || !va.is_page_aligned() || va.into_usize() >= KERNEL_BASE {
            Err(KernelError::InvalidArgument)
        } else {
            Ok(())
        }
    }

    /// Creates an uninitialized page at `va` that turns into `target` on its
    /// first access, after which `init` (if any) fills it.
    ///
    /// # Errors
    /// - [`KernelError::InvalidArgument`] if `va` is null, unaligned or not
    ///   a user address.
    /// - [`KernelError::FileExist`] if a page exists at `va`.
    pub fn alloc_page_with_initializer(
        &self,
        va: Va,
        writable: bool,
        target: Target,
        init: Option<Arc<dyn MmLoader>>,
    ) -> Result<(), KernelError> {
        Self::check_user_page(va)?;
        let mut inner = self.inner.lock();
        let result = inner
            .spt
            .insert(Page::new_uninit(va, writable, target, init))
            .map(|_| ());
        inner.unlock();
        result
    }

    /// Creates a page of type `ty` at `va` without an initializer.
    ///
    /// Only anonymous pages can be created this way: a file-backed page
    /// needs its backing, which [`MmStruct::mmap`] or
    /// [`MmStruct::alloc_page_with_initializer`] provide.
    pub fn alloc_page(&self, ty: VmType, va: Va, writable: bool) -> Result<(), KernelError> {
        match ty {
            VmType::Anon => self.alloc_page_with_initializer(va, writable, Target::Anon, None),
            VmType::File | VmType::Uninit => Err(KernelError::InvalidArgument),
        }
    }

    /// Brings the page at `va` in, as if it had been touched.
    pub fn claim_page(&self, va: Va) -> Result<(), KernelError> {
        let inner = self.inner.lock();
        let result = match inner.spt.find(va) {
            Some(record) => self.do_claim_page(&record),
            None => Err(KernelError::BadAddress),
        };
        inner.unlock();
        result
    }

    /// Handles a page fault.
    ///
    /// # Returns
    /// - `Ok(())` if the faulting access can be restarted.
    /// - `Err(KernelError)` if the fault is fatal to the process.
    pub fn handle_page_fault(&self, reason: &PageFaultReason) -> Result<(), KernelError> {
        let addr = reason.fault_addr;
        if addr.page_down() == Va::NULL || addr.into_usize() >= KERNEL_BASE {
            warning!("Page fault at invalid address {}", addr);
            return Err(KernelError::BadAddress);
        }

        let mut inner = self.inner.lock();
        let result = if reason.is_demand_paging_fault() {
            self.do_lazy_load(&mut inner, reason)
        } else if reason.is_cow_fault() {
            self.do_copy_on_write(&inner, reason)
        } else {
            Err(KernelError::InvalidAccess)
        };
        inner.unlock();

        if let Err(e) = result {
            warning!(
                "Unresolved page fault at {} ({}{}): {:?}",
                addr,
                if reason.is_write_access { "write" } else { "read" },
                if reason.is_present { ", protection" } else { "" },
                e
            );
        }
        result
    }

    fn do_lazy_load(&self, inner: &mut AddressSpace, reason: &PageFaultReason) -> Result<(), KernelError> {
        match inner.spt.find(reason.fault_addr) {
            Some(record) => {
                let page = record.lock();
                let writable = page.writable();
                page.unlock();
                if reason.is_write_access && !writable {
                    return Err(KernelError::InvalidAccess);
                }
                self.do_claim_page(&record)
            }
            None if self.is_stack_access(inner, reason) => self.grow_stack(inner),
            None => Err(KernelError::BadAddress),
        }
    }

    fn is_stack_access(&self, inner: &AddressSpace, reason: &PageFaultReason) -> bool {
        let config = self.vm.config();
        let rsp = if reason.is_user {
            reason.rsp
        } else {
            self.user_stack_pointer()
        };
        let addr = reason.fault_addr;
        addr.into_usize() >= rsp.saturating_sub(config.stack_slack)
            && addr >= config.stack_limit
            && addr < config.stack_top
            && addr < inner.stack_bottom
    }

    fn grow_stack(&self, inner: &mut AddressSpace) -> Result<(), KernelError> {
        let va = inner
            .stack_bottom
            .checked_sub(PAGE_SIZE)
            .filter(|va| *va >= self.vm.config().stack_limit.page_down())
            .ok_or(KernelError::BadAddress)?;
        let record = inner
            .spt
            .insert(Page::new_uninit(va, true, Target::Anon, None))?;
        if let Err(e) = self.do_claim_page(&record) {
            let removed = inner.spt.remove(va);
            debug_assert_eq!(removed, Ok(true));
            return Err(e);
        }
        inner.stack_bottom = va;
        debug!("Stack grows down to {}", va);
        Ok(())
    }

    /// Gets a frame for the page, maps it, and fills it with the contents of
    /// the page. Claiming a resident page does nothing.
    pub(crate) fn do_claim_page(&self, record: &Arc<SpinLock<Page>>) -> Result<(), KernelError> {
        let page = record.lock();
        let resident = page.is_resident();
        page.unlock();
        if resident {
            return Ok(());
        }

        let frame = self.vm.get_frame()?;
        let mut page = record.lock();
        // Brought in by someone else while the frame was found.
        if page.is_resident() {
            page.unlock();
            self.vm.release_frame(&frame);
            return Ok(());
        }
        let va = page.va();
        let mut pt = self.page_table.lock();
        let mapped = pt.map(va, frame.clone(), Permission::user(page.writable()));
        pt.unlock();
        if let Err(e) = mapped {
            page.unlock();
            self.vm.release_frame(&frame);
            return Err(e.into());
        }

        page.bind(frame.clone());
        let result = page.swap_in(self.vm.swap());
        if result.is_err() {
            page.unbind();
            let mut pt = self.page_table.lock();
            let unmapped = pt.unmap(va);
            pt.unlock();
            debug_assert!(unmapped.is_ok(), "{} was mapped above", va);
        }
        page.unlock();

        match result {
            Ok(()) => {
                self.vm
                    .add_owner(&frame, FrameOwner::new(record, &self.page_table, va));
                Ok(())
            }
            Err(e) => {
                self.vm.release_frame(&frame);
                Err(e)
            }
        }
    }

    /// Checks whether a given memory range is accessible by the process.
    ///
    /// Every page of `addr` must have a record, and a writable one if
    /// `is_write`. The pages are not brought in.
    pub fn access_ok(&self, addr: Range<Va>, is_write: bool) -> bool {
        if addr.start > addr.end || addr.end.into_usize() > KERNEL_BASE {
            return false;
        }
        let inner = self.inner.lock();
        let mut va = addr.start.page_down();
        let mut ok = true;
        while ok && va < addr.end {
            ok = match inner.spt.find(va) {
                Some(record) => {
                    let page = record.lock();
                    let writable = page.writable();
                    page.unlock();
                    !is_write || writable
                }
                None => false,
            };
            va += PAGE_SIZE;
        }
        inner.unlock();
        ok
    }

    /// Walks the user memory at `va` page by page as the CPU does, faulting
    /// pages in as needed, and hands every chunk to `f` together with its
    /// position within the access.
    fn access_user(
        &self,
        va: Va,
        len: usize,
        is_write: bool,
        mut f: impl FnMut(&mut [u8], usize),
    ) -> Result<(), KernelError> {
        let max_faults = self.vm.config().max_stack_pages() + 2;
        let (mut done, mut faults) = (0, 0);
        while done < len {
            let cur = va.checked_add(done).ok_or(KernelError::BadAddress)?;
            let chunk = (PAGE_SIZE - cur.offset()).min(len - done);
            let mut pt = self.page_table.lock();
            match pt.translate(cur, is_write, true) {
                Ok(mut frame) => {
                    f(&mut frame.inner_mut()[cur.offset()..cur.offset() + chunk], done);
                    pt.unlock();
                    done += chunk;
                    faults = 0;
                }
                Err(ec) => {
                    pt.unlock();
                    faults += 1;
                    if faults > max_faults {
                        return Err(KernelError::BadAddress);
                    }
                    self.handle_page_fault(&PageFaultReason::new(
                        ec,
                        cur,
                        self.user_stack_pointer(),
                    ))?;
                }
            }
        }
        Ok(())
    }

    /// Reads user memory at `va` into `buf`, as a user load would.
    pub fn read_user(&self, va: Va, buf: &mut [u8]) -> Result<(), KernelError> {
        let len = buf.len();
        self.access_user(va, len, false, |chunk, pos| {
            buf[pos..pos + chunk.len()].copy_from_slice(chunk)
        })
    }

    /// Writes `buf` into user memory at `va`, as a user store would.
    pub fn write_user(&self, va: Va, buf: &[u8]) -> Result<(), KernelError> {
        self.access_user(va, buf.len(), true, |chunk, pos| {
            chunk.copy_from_slice(&buf[pos..pos + chunk.len()])
        })
    }

    /// Translates `va` into the physical address it is mapped to, if the
    /// page is resident.
    pub fn get_phys(&self, va: Va) -> Option<Pa> {
        let pt = self.page_table.lock();
        let pa = pt
            .walk(va.page_down())
            .map(|pte| pte.page().pa() + va.offset())
            .ok();
        pt.unlock();
        pa
    }

    /// The type of the page at `va`. An uninitialized page reports the type
    /// it turns into.
    pub fn page_type(&self, va: Va) -> Option<VmType> {
        let inner = self.inner.lock();
        let ty = inner.spt.find(va).map(|record| {
            let page = record.lock();
            let ty = page.effective_type();
            page.unlock();
            ty
        });
        inner.unlock();
        ty
    }

    /// Returns `true` if a page record covers `va`.
    pub fn is_allocated(&self, va: Va) -> bool {
        let inner = self.inner.lock();
        let found = inner.spt.contains(va);
        inner.unlock();
        found
    }

    /// Destroys every page of the address space, writing dirty file-backed
    /// pages back. Destroying twice is harmless.
    pub fn destroy(&self) {
        let mut inner = self.inner.lock();
        inner.spt.destroy_all();
        inner.mappings.clear();
        inner.stack_bottom = self.vm.config().stack_top;
        inner.unlock();
    }
}

impl Drop for MmStruct {
    fn drop(&mut self) {
        self.destroy();
    }
}
