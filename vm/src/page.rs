//! Page records.
//!
//! A [`Page`] describes one page of a user address space: where its contents
//! come from, where they go when the frame is taken away, and which frame
//! holds them right now. A record starts as [`PageState::Uninit`] and, on the
//! first fault, turns exactly once into its target variant:
//!
//! ```text
//!                    first fault
//!   Uninit(target) ───────────────┬──> Anon(slot)
//!                                 └──> File(backing)
//! ```
//!
//! An anonymous page has nowhere to go but the swap disk, so its payload is
//! the swap slot that holds it while it is not resident. A file-backed page
//! is written back to its file (if dirty) and re-read from it.
use crate::{Frame, loader::MmLoader, swap::{SwapSlot, SwapTable}};
use abyss::{addressing::Va, spinlock::SpinLock};
use alloc::sync::Arc;
use platform::{KernelError, fs::File};

/// The variant of a page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmType {
    /// Not touched yet.
    Uninit,
    /// Anonymous memory, backed by the swap disk.
    Anon,
    /// Backed by a region of a file.
    File,
}

/// The region of a file a page shows.
#[derive(Clone)]
pub struct FileBacking {
    file: Arc<File>,
    offset: usize,
    valid_bytes: usize,
}

impl FileBacking {
    /// `valid_bytes` bytes of `file` from `offset`. The remainder of the page
    /// reads as zero and is never written back.
    pub fn new(file: Arc<File>, offset: usize, valid_bytes: usize) -> Self {
        Self {
            file,
            offset,
            valid_bytes: valid_bytes.min(abyss::addressing::PAGE_SIZE),
        }
    }

    /// The file.
    pub fn file(&self) -> &Arc<File> {
        &self.file
    }

    /// Offset of the page within the file.
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// The number of bytes of the page that come from the file.
    pub fn valid_bytes(&self) -> usize {
        self.valid_bytes
    }

    fn read_into(&self, frame: &mut [u8]) -> Result<(), KernelError> {
        let read = self
            .file
            .read_at(self.offset, &mut frame[..self.valid_bytes])?;
        frame[read..].fill(0);
        Ok(())
    }

    fn write_back(&self, frame: &[u8]) -> Result<(), KernelError> {
        if self.valid_bytes != 0 {
            self.file.write_at(self.offset, &frame[..self.valid_bytes])?;
        }
        Ok(())
    }
}

/// What an uninitialized page becomes on its first fault.
#[derive(Clone)]
pub enum Target {
    /// An anonymous page.
    Anon,
    /// A file-backed page over the region.
    File(FileBacking),
}

impl Target {
    /// The variant of the target.
    pub fn ty(&self) -> VmType {
        match self {
            Target::Anon => VmType::Anon,
            Target::File(_) => VmType::File,
        }
    }
}

/// Payload of a page that has not been touched yet.
#[derive(Clone)]
pub struct UninitPage {
    target: Target,
    init: Option<Arc<dyn MmLoader>>,
}

impl UninitPage {
    /// The variant the page turns into.
    pub fn target(&self) -> &Target {
        &self.target
    }

    pub(crate) fn init(&self) -> Option<&Arc<dyn MmLoader>> {
        self.init.as_ref()
    }
}

/// Payload of an anonymous page.
pub struct AnonPage {
    slot: Option<SwapSlot>,
}

impl AnonPage {
    /// The slot holding the contents while the page is not resident.
    pub fn slot(&self) -> Option<SwapSlot> {
        self.slot
    }
}

/// Payload of a file-backed page.
pub struct FilePage {
    backing: FileBacking,
}

impl FilePage {
    /// The region of the file the page shows.
    pub fn backing(&self) -> &FileBacking {
        &self.backing
    }
}

/// The variant of a page together with its payload.
pub enum PageState {
    /// Not touched yet.
    Uninit(UninitPage),
    /// Anonymous.
    Anon(AnonPage),
    /// File-backed.
    File(FilePage),
}

/// A page record of a supplemental page table.
pub struct Page {
    va: Va,
    writable: bool,
    state: PageState,
    frame: Option<Frame>,
}

impl Page {
    /// Creates an uninitialized page at the page-aligned `va`.
    ///
    /// On the first fault, the page turns into `target`, and then `init`
    /// fills the frame. Without `init`, an anonymous page starts zeroed and
    /// a file-backed page is read from its backing.
    pub fn new_uninit(
        va: Va,
        writable: bool,
        target: Target,
        init: Option<Arc<dyn MmLoader>>,
    ) -> Self {
        Self {
            va,
            writable,
            state: PageState::Uninit(UninitPage { target, init }),
            frame: None,
        }
    }

    pub(crate) fn new_file(va: Va, writable: bool, backing: FileBacking) -> Self {
        Self {
            va,
            writable,
            state: PageState::File(FilePage { backing }),
            frame: None,
        }
    }

    /// The page-aligned virtual address of the page.
    #[inline]
    pub fn va(&self) -> Va {
        self.va
    }

    /// Whether user writes are permitted.
    #[inline]
    pub fn writable(&self) -> bool {
        self.writable
    }

    /// The variant and payload.
    pub fn state(&self) -> &PageState {
        &self.state
    }

    /// The frame holding the contents, if resident.
    pub fn frame(&self) -> Option<&Frame> {
        self.frame.as_ref()
    }

    /// Returns `true` if the page has a frame.
    pub fn is_resident(&self) -> bool {
        self.frame.is_some()
    }

    /// The current variant.
    pub fn ty(&self) -> VmType {
        match self.state {
            PageState::Uninit(_) => VmType::Uninit,
            PageState::Anon(_) => VmType::Anon,
            PageState::File(_) => VmType::File,
        }
    }

    /// The variant the page is or will be once touched.
    pub fn effective_type(&self) -> VmType {
        match &self.state {
            PageState::Uninit(uninit) => uninit.target.ty(),
            _ => self.ty(),
        }
    }

    pub(crate) fn bind(&mut self, frame: Frame) {
        debug_assert!(self.frame.is_none());
        self.frame = Some(frame);
    }

    pub(crate) fn unbind(&mut self) -> Option<Frame> {
        self.frame.take()
    }

    pub(crate) fn file_backing(&self) -> Option<&FileBacking> {
        match &self.state {
            PageState::File(file) => Some(&file.backing),
            _ => None,
        }
    }

    pub(crate) fn take_swap_slot(&mut self) -> Option<SwapSlot> {
        match &mut self.state {
            PageState::Anon(anon) => anon.slot.take(),
            _ => None,
        }
    }

    /// Fills the bound frame with the contents of the page.
    ///
    /// An uninitialized page first turns into its target variant and then
    /// runs its initializer. If the initializer fails, the page stays
    /// uninitialized.
    pub(crate) fn swap_in(&mut self, swap: &SpinLock<SwapTable>) -> Result<(), KernelError> {
        let mut frame = self.frame.clone().ok_or(KernelError::BadAddress)?;
        let buf = frame.inner_mut();

        if let PageState::Uninit(uninit) = &self.state {
            let uninit = uninit.clone();
            self.state = match &uninit.target {
                Target::Anon => PageState::Anon(AnonPage { slot: None }),
                Target::File(backing) => PageState::File(FilePage {
                    backing: backing.clone(),
                }),
            };
            let result = match (&uninit.init, &uninit.target) {
                (Some(init), _) => init.load(self.va, buf),
                (None, Target::File(backing)) => backing.read_into(buf),
                (None, Target::Anon) => Ok(()),
            };
            if result.is_err() {
                self.state = PageState::Uninit(uninit);
            }
            return result;
        }

        match &mut self.state {
            PageState::Anon(anon) => {
                if let Some(slot) = anon.slot {
                    let mut swap = swap.lock();
                    let result = swap.read_slot(slot, buf);
                    if result.is_ok() {
                        swap.free_slot(slot);
                    }
                    swap.unlock();
                    result?;
                    anon.slot = None;
                }
                Ok(())
            }
            PageState::File(file) => file.backing.read_into(buf),
            PageState::Uninit(_) => unreachable!(),
        }
    }

    /// Saves the contents of `frame` before the frame is taken away.
    ///
    /// An anonymous page goes to a fresh swap slot. A file-backed page is
    /// written back only if `dirty`.
    pub(crate) fn swap_out(
        &mut self,
        frame: &Frame,
        dirty: bool,
        swap: &SpinLock<SwapTable>,
    ) -> Result<(), KernelError> {
        match &mut self.state {
            PageState::Anon(anon) => {
                let mut swap = swap.lock();
                let result = swap.swap_out(frame.inner());
                swap.unlock();
                anon.slot = Some(result?);
                Ok(())
            }
            PageState::File(file) if dirty => file.backing.write_back(frame.inner()),
            _ => Ok(()),
        }
    }

    /// Writes the contents of `frame` back to the file of a file-backed
    /// page. Other variants have nothing to write back.
    pub(crate) fn write_back(&self, frame: &Frame) -> Result<(), KernelError> {
        match &self.state {
            PageState::File(file) => file.backing.write_back(frame.inner()),
            _ => Ok(()),
        }
    }
}

impl core::fmt::Debug for Page {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Page")
            .field("va", &self.va)
            .field("writable", &self.writable)
            .field("ty", &self.ty())
            .field("frame", &self.frame)
            .finish()
    }
}
