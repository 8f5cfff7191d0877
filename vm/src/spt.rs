//! Supplemental page table.
//!
//! The hardware page table only knows about resident pages. The
//! supplemental page table knows about every page of the address space,
//! resident or not, and is what the fault handler consults to find out how
//! to bring a page in.
use crate::{Vm, page::Page};
use abyss::{addressing::Va, spinlock::SpinLock, warning};
use alloc::{collections::BTreeMap, sync::Arc};
use platform::{KernelError, mm::page_table::PageTable};

/// The page records of an address space, keyed by their page-aligned
/// virtual address.
pub struct SupplementalPageTable {
    pages: BTreeMap<Va, Arc<SpinLock<Page>>>,
    vm: Arc<Vm>,
    page_table: Arc<SpinLock<PageTable>>,
}

impl SupplementalPageTable {
    /// Creates an empty table whose pages are mapped into `page_table`.
    pub fn new(vm: Arc<Vm>, page_table: Arc<SpinLock<PageTable>>) -> Self {
        Self {
            pages: BTreeMap::new(),
            vm,
            page_table,
        }
    }

    /// Inserts a page record.
    ///
    /// # Errors
    /// - [`KernelError::InvalidArgument`] if the page is not page aligned.
    /// - [`KernelError::FileExist`] if a record exists at the address.
    pub fn insert(&mut self, page: Page) -> Result<Arc<SpinLock<Page>>, KernelError> {
        let va = page.va();
        if !va.is_page_aligned() {
            return Err(KernelError::InvalidArgument);
        }
        if self.pages.contains_key(&va) {
            return Err(KernelError::FileExist);
        }
        let record = Arc::new(SpinLock::new(page));
        self.pages.insert(va, record.clone());
        Ok(record)
    }

    /// Finds the record of the page containing `va`.
    pub fn find(&self, va: Va) -> Option<Arc<SpinLock<Page>>> {
        self.pages.get(&va.page_down()).cloned()
    }

    /// Returns `true` if a record covers `va`.
    pub fn contains(&self, va: Va) -> bool {
        self.pages.contains_key(&va.page_down())
    }

    /// Returns `true` if any record lies within `[start, end)`.
    pub fn overlaps(&self, start: Va, end: Va) -> bool {
        start < end && self.pages.range(start.page_down()..end).next().is_some()
    }

    /// Removes the record of the page containing `va` and destroys it.
    ///
    /// # Returns
    /// - `Ok(true)` if a record was removed.
    /// - `Ok(false)` if there was no such record.
    /// - `Err(KernelError)` if the record was removed but its dirty contents
    ///   could not be written back.
    pub fn remove(&mut self, va: Va) -> Result<bool, KernelError> {
        match self.pages.remove(&va.page_down()) {
            Some(record) => self.vm.destroy_page(&record, &self.page_table).map(|_| true),
            None => Ok(false),
        }
    }

    /// Destroys every record and empties the table.
    ///
    /// A failed write back only loses that page's last writes; the teardown
    /// goes on. Calling this on an empty table does nothing.
    pub fn destroy_all(&mut self) {
        while let Some((va, record)) = self.pages.pop_first() {
            if let Err(e) = self.vm.destroy_page(&record, &self.page_table) {
                warning!("Failed to write back {} on teardown: {:?}", va, e);
            }
        }
    }

    /// Iterates the records in ascending address order.
    pub fn iter(&self) -> impl Iterator<Item = (Va, &Arc<SpinLock<Page>>)> {
        self.pages.iter().map(|(va, record)| (*va, record))
    }

    /// The number of records.
    pub fn len(&self) -> usize {
        self.pages.len()
    }

    /// Returns `true` if there is no record.
    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    /// The hardware page table the records are mapped into.
    pub fn page_table(&self) -> &Arc<SpinLock<PageTable>> {
        &self.page_table
    }

    /// The paging service.
    pub fn vm(&self) -> &Arc<Vm> {
        &self.vm
    }
}
