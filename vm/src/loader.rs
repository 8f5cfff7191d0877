//! Lazy initializers of pages.
//!
//! A page that is allocated with an initializer stays uninitialized until it
//! is first touched. On that first fault, the page turns into its target
//! type and then the [`MmLoader`] fills the freshly zeroed frame. This is
//! how program segments, memory-mapped files and the pages of a forked child
//! get their contents on demand.
use abyss::addressing::{PAGE_SIZE, Va};
use alloc::{boxed::Box, sync::Arc};
use platform::{KernelError, fs::File};

/// A trait for loading the contents of a virtual memory page on demand.
///
/// Implementors of this trait can define custom behaviors, such as reading
/// from a file, or copying a snapshot of another page.
///
/// Any `Fn(Va, &mut [u8]) -> Result<(), KernelError>` closure is a loader.
pub trait MmLoader
where
    Self: Send + Sync,
{
    /// Fills `frame` with the contents of the page at `addr`.
    ///
    /// `frame` is exactly one page long and zero-filled on entry.
    ///
    /// # Returns
    /// - `Ok(())` if the page is loaded.
    /// - `Err(KernelError)` if the contents cannot be supplied, which kills
    ///   the faulting process.
    fn load(&self, addr: Va, frame: &mut [u8]) -> Result<(), KernelError>;
}

impl<F> MmLoader for F
where
    F: Fn(Va, &mut [u8]) -> Result<(), KernelError> + Send + Sync,
{
    fn load(&self, addr: Va, frame: &mut [u8]) -> Result<(), KernelError> {
        self(addr, frame)
    }
}

/// A loader for file-backed memory regions, such as a program segment.
///
/// The region starting at `base` shows `size` bytes of the file from
/// `offset`; the rest of the region reads as zero. The offset within the
/// file of a page is determined by its distance from `base`.
pub struct FileBackedLoader {
    file: Arc<File>,
    base: Va,
    offset: usize,
    size: usize,
}

impl FileBackedLoader {
    /// Creates a loader of the region at `base` showing `size` bytes of
    /// `file` starting at `offset`.
    pub fn new(file: Arc<File>, base: Va, offset: usize, size: usize) -> Self {
        Self {
            file,
            base: base.page_down(),
            offset,
            size,
        }
    }
}

impl MmLoader for FileBackedLoader {
    fn load(&self, addr: Va, frame: &mut [u8]) -> Result<(), KernelError> {
        let delta = addr
            .page_down()
            .into_usize()
            .checked_sub(self.base.into_usize())
            .ok_or(KernelError::BadAddress)?;
        let len = self.size.saturating_sub(delta).min(PAGE_SIZE);
        let position = self
            .offset
            .checked_add(delta)
            .ok_or(KernelError::InvalidArgument)?;
        let read = self.file.read_at(position, &mut frame[..len])?;
        frame[read..].fill(0);
        Ok(())
    }
}

/// A loader that replays a copy of a page taken beforehand.
pub(crate) struct SnapshotLoader(pub(crate) Box<[u8]>);

impl MmLoader for SnapshotLoader {
    fn load(&self, _addr: Va, frame: &mut [u8]) -> Result<(), KernelError> {
        frame.copy_from_slice(&self.0);
        Ok(())
    }
}
