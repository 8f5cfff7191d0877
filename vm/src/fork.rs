//! # Duplication of an address space on `fork`.
//!
//! The child receives an equivalent record for every page of the parent, in
//! address order:
//!
//! - An uninitialized page stays uninitialized in the child, with the same
//!   target and initializer. Nothing is loaded eagerly.
//! - An anonymous page is copied byte for byte right away. The child's page
//!   is claimed during the fork, so the two never share a frame.
//! - A resident file-backed page is shared: the child maps the parent's
//!   frame, and both mappings become read-only. A dirty page is written back
//!   first so that the shared frame is clean.
//!
//! ### Copy-On-Write
//!
//! The first write to a shared file-backed page by either process faults on
//! the read-only mapping. If the page is writable, the fault handler gives
//! the writer a private copy of the frame ([`MmStruct::do_copy_on_write`]).
//! The last owner of a shared frame does not need to copy: its write
//! permission is simply restored.
//!
//! If anything fails midway, the partial child is torn down and the error is
//! returned to the parent.
use crate::{
    mm_struct::{AddressSpace, MmStruct, PageFaultReason},
    frame::FrameOwner,
    loader::SnapshotLoader,
    page::{Page, PageState, Target, VmType},
};
use abyss::{
    addressing::{PAGE_SIZE, Va},
    spinlock::SpinLock,
};
use alloc::{sync::Arc, vec};
use platform::{KernelError, mm::page_table::Permission};

impl MmStruct {
    /// Creates the address space of a forked child.
    ///
    /// # Returns
    /// - `Ok(MmStruct)`: the child's address space.
    /// - `Err(KernelError)`: if a page could not be duplicated. No trace of
    ///   the child remains.
    pub fn fork(&self) -> Result<MmStruct, KernelError> {
        let child = MmStruct::new(self.vm.clone());
        child.set_user_stack_pointer(self.user_stack_pointer());

        let parent = self.inner.lock();
        let mut inner = child.inner.lock();
        inner.stack_bottom = parent.stack_bottom;
        inner.mappings = parent.mappings.clone();

        let mut result = Ok(());
        for (va, record) in parent.spt.iter() {
            result = self.fork_page(&child, &mut inner, va, record);
            if result.is_err() {
                break;
            }
        }
        if result.is_err() {
            inner.spt.destroy_all();
            inner.mappings.clear();
        }
        inner.unlock();
        parent.unlock();
        result.map(|_| child)
    }

    fn fork_page(
        &self,
        child: &MmStruct,
        inner: &mut AddressSpace,
        va: Va,
        record: &Arc<SpinLock<Page>>,
    ) -> Result<(), KernelError> {
        let page = record.lock();
        let writable = page.writable();
        match page.state() {
            PageState::Uninit(uninit) => {
                let copy = Page::new_uninit(
                    va,
                    writable,
                    uninit.target().clone(),
                    uninit.init().cloned(),
                );
                page.unlock();
                inner.spt.insert(copy).map(|_| ())
            }
            PageState::Anon(anon) => {
                let mut snapshot = vec![0; PAGE_SIZE].into_boxed_slice();
                let copied = match (page.frame(), anon.slot()) {
                    (Some(frame), _) => {
                        snapshot.copy_from_slice(frame.inner());
                        Ok(())
                    }
                    // The parent keeps its slot.
                    (None, Some(slot)) => {
                        let swap = self.vm.swap().lock();
                        let result = swap.read_slot(slot, &mut snapshot);
                        swap.unlock();
                        result
                    }
                    (None, None) => Ok(()),
                };
                page.unlock();
                copied?;
                let record = inner.spt.insert(Page::new_uninit(
                    va,
                    writable,
                    Target::Anon,
                    Some(Arc::new(SnapshotLoader(snapshot))),
                ))?;
                child.do_claim_page(&record)
            }
            PageState::File(_) => {
                page.unlock();
                self.share_file_page(child, inner, va, record)
            }
        }
    }

    /// Gives the child a file-backed page sharing the parent's frame, if
    /// resident.
    fn share_file_page(
        &self,
        child: &MmStruct,
        inner: &mut AddressSpace,
        va: Va,
        record: &Arc<SpinLock<Page>>,
    ) -> Result<(), KernelError> {
        let mut frames = self.vm.frames().lock();
        let page = record.lock();
        let Some(backing) = page.file_backing().cloned() else {
            page.unlock();
            frames.unlock();
            return Err(KernelError::InvalidArgument);
        };
        let mut copy = Page::new_file(va, page.writable(), backing);

        let Some(frame) = page.frame().cloned() else {
            page.unlock();
            frames.unlock();
            return inner.spt.insert(copy).map(|_| ());
        };

        // Write-protect first, so that no write slips in between the write
        // back and the clearing of the dirty bit.
        let mut pt = self.page_table.lock();
        let dirty = pt.is_dirty(va);
        let mut result = pt.set_writable(va, false).map_err(KernelError::from);
        pt.unlock();
        if result.is_ok() && dirty {
            result = page.write_back(&frame);
            if result.is_ok() {
                let mut pt = self.page_table.lock();
                pt.clear_dirty(va);
                pt.unlock();
            }
        }
        page.unlock();

        if result.is_ok() {
            let mut pt = child.page_table.lock();
            result = pt
                .map(va, frame.clone(), Permission::user(false))
                .map_err(KernelError::from);
            pt.unlock();
        }
        if result.is_ok() {
            copy.bind(frame.clone());
            match inner.spt.insert(copy) {
                Ok(child_record) => {
                    frames.add_owner(&frame, FrameOwner::new(&child_record, &child.page_table, va));
                }
                Err(e) => {
                    let mut pt = child.page_table.lock();
                    let unmapped = pt.unmap(va);
                    pt.unlock();
                    debug_assert!(unmapped.is_ok(), "{} was mapped above", va);
                    result = Err(e);
                }
            }
        }
        frames.unlock();
        result
    }

    /// Handles a write to a read-only mapping of a writable page by giving
    /// the writer a private copy of the shared frame.
    ///
    /// # Errors
    /// - [`KernelError::InvalidAccess`] if the page is not writable, or was
    ///   never shared.
    pub(crate) fn do_copy_on_write(
        &self,
        inner: &AddressSpace,
        reason: &PageFaultReason,
    ) -> Result<(), KernelError> {
        let record = inner
            .spt
            .find(reason.fault_addr)
            .ok_or(KernelError::BadAddress)?;
        let page = record.lock();
        let (va, writable, resident, ty) = (page.va(), page.writable(), page.is_resident(), page.ty());
        page.unlock();
        if !writable {
            return Err(KernelError::InvalidAccess);
        }
        if !resident {
            // Evicted since the fault was raised.
            return self.do_claim_page(&record);
        }
        if ty != VmType::File {
            return Err(KernelError::InvalidAccess);
        }

        let frames = self.vm.frames().lock();
        let page = record.lock();
        let shared = page
            .frame()
            .is_some_and(|frame| frames.owner_count(frame) > 1);
        if !shared {
            let result = if page.is_resident() {
                let mut pt = self.page_table.lock();
                let result = pt.set_writable(va, true);
                pt.unlock();
                result.map_err(KernelError::from)
            } else {
                Ok(())
            };
            page.unlock();
            frames.unlock();
            return result;
        }
        page.unlock();
        frames.unlock();

        let mut copy = self.vm.get_frame()?;
        let mut frames = self.vm.frames().lock();
        let mut page = record.lock();
        let result = match page.frame().cloned() {
            Some(old) => {
                copy.inner_mut().copy_from_slice(old.inner());
                let mut pt = self.page_table.lock();
                let mapped = match pt.unmap(va) {
                    Ok(_) => {
                        let mapped = pt.map(va, copy.clone(), Permission::user(true));
                        if mapped.is_err() {
                            let restored = pt.map(va, old.clone(), Permission::user(false));
                            debug_assert!(restored.is_ok());
                        }
                        mapped
                    }
                    Err(e) => Err(e),
                };
                pt.unlock();
                match mapped {
                    Ok(()) => {
                        page.unbind();
                        page.bind(copy.clone());
                        frames.remove_owner(&old, &record);
                        frames.add_owner(&copy, FrameOwner::new(&record, &self.page_table, va));
                        Ok(true)
                    }
                    Err(e) => Err(KernelError::from(e)),
                }
            }
            // Evicted meanwhile. The access faults again.
            None => Ok(false),
        };
        page.unlock();
        frames.unlock();
        match result {
            Ok(true) => Ok(()),
            Ok(false) => {
                self.vm.release_frame(&copy);
                Ok(())
            }
            Err(e) => {
                self.vm.release_frame(&copy);
                Err(e)
            }
        }
    }
}
