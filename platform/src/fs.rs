//! Filesystem and block device abstraction.
//!
//! The paging subsystem touches storage in two places: file-backed pages are
//! read from and written back to a [`File`], and anonymous pages are swapped
//! to a [`Disk`]. Both are thin handles over trait objects from [`traits`],
//! so any filesystem or block driver can be plugged in. [`MemFile`] and
//! [`MemDisk`] are the in-memory implementations.

/// Defines traits for file and block device operations.
pub mod traits {
    use super::Sector;
    use crate::KernelError;

    /// Trait representing a regular file in the filesystem.
    ///
    /// A regular file contains user data and supports positional read and
    /// write operations.
    pub trait RegularFile
    where
        Self: Send + Sync,
    {
        /// Returns the size of the file in bytes.
        fn size(&self) -> usize;

        /// Reads data at `position` into the provided buffer.
        ///
        /// # Returns
        /// - `Ok(usize)`: The number of bytes read, which is short only at the
        ///   end of the file.
        /// - `Err(KernelError)`: An error occured while the read operation.
        fn read_at(&self, position: usize, buf: &mut [u8]) -> Result<usize, KernelError>;

        /// Writes `buf` at `position`, extending the file if the write
        /// reaches past the end.
        ///
        /// # Returns
        /// - `Ok(usize)`: The number of bytes written.
        /// - `Err(KernelError)`: An error occured while the write operation.
        fn write_at(&self, position: usize, buf: &[u8]) -> Result<usize, KernelError>;
    }

    /// Trait representing a device of fixed-size sectors.
    pub trait BlockDevice
    where
        Self: Send + Sync,
    {
        /// The number of sectors of the device.
        fn sector_count(&self) -> usize;

        /// Read 512 bytes from the sector.
        fn read(&self, sector: Sector, buf: &mut [u8; 512]) -> Result<(), KernelError>;

        /// Write 512 bytes to the sector.
        fn write(&self, sector: Sector, buf: &[u8; 512]) -> Result<(), KernelError>;
    }
}

use crate::{KernelError, sync::SpinLock};
use alloc::{sync::Arc, vec, vec::Vec};
use core::sync::atomic::{AtomicBool, Ordering};

/// This struct provides a reference-counted handle to a file that supports
/// reading and writing operations at the kernel level.
#[derive(Clone)]
pub struct RegularFile(pub Arc<dyn traits::RegularFile>);

impl RegularFile {
    /// Creates a new [`RegularFile`] handle from a given implementation of
    /// [`traits::RegularFile`].
    pub fn new(r: impl traits::RegularFile + 'static) -> Self {
        Self(Arc::new(r))
    }

    /// Returns the size of the file in bytes.
    #[inline]
    pub fn size(&self) -> usize {
        self.0.size()
    }

    /// Reads data at `position` into the provided buffer.
    #[inline]
    pub fn read(&self, position: usize, buf: &mut [u8]) -> Result<usize, KernelError> {
        self.0.read_at(position, buf)
    }

    /// Writes data from the buffer into the file at `position`.
    #[inline]
    pub fn write(&self, position: usize, buf: &[u8]) -> Result<usize, KernelError> {
        self.0.write_at(position, buf)
    }

    /// Returns `true` if both handles refer to the same file.
    pub fn same_file(&self, other: &RegularFile) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

/// An opened file.
///
/// A [`File`] is a cursor over a [`RegularFile`]. Handles obtained through
/// [`File::reopen`] share the file but move their position independently,
/// so a mapping that reopens its file keeps working after the original
/// handle is closed.
pub struct File {
    file: RegularFile,
    position: usize,
}

impl File {
    /// Open the `file`, positioned at the beginning.
    pub fn open(file: RegularFile) -> Self {
        Self { file, position: 0 }
    }

    /// Open another handle to the same file, positioned at the beginning.
    pub fn reopen(&self) -> Self {
        Self::open(self.file.clone())
    }

    /// The underlying file.
    pub fn regular_file(&self) -> &RegularFile {
        &self.file
    }

    /// Returns the size of the file in bytes.
    pub fn size(&self) -> usize {
        self.file.size()
    }

    /// Moves the position of this handle.
    pub fn seek(&mut self, position: usize) {
        self.position = position;
    }

    /// The current position of this handle.
    pub fn tell(&self) -> usize {
        self.position
    }

    /// Reads from the current position, advancing it by the number of bytes
    /// read.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize, KernelError> {
        let read = self.file.read(self.position, buf)?;
        self.position += read;
        Ok(read)
    }

    /// Reads at `position` without moving the handle.
    pub fn read_at(&self, position: usize, buf: &mut [u8]) -> Result<usize, KernelError> {
        self.file.read(position, buf)
    }

    /// Writes at `position` without moving the handle.
    pub fn write_at(&self, position: usize, buf: &[u8]) -> Result<usize, KernelError> {
        self.file.write(position, buf)
    }
}

/// A file kept in memory.
///
/// Every successful `write_at` is recorded as a `(position, length)` pair,
/// which can be inspected with [`MemFile::writes`].
#[derive(Default)]
pub struct MemFile {
    data: SpinLock<Vec<u8>>,
    writes: SpinLock<Vec<(usize, usize)>>,
    faulty: AtomicBool,
}

impl MemFile {
    /// Create a file with the given contents.
    pub fn new(contents: &[u8]) -> Self {
        Self {
            data: SpinLock::new(contents.to_vec()),
            writes: SpinLock::new(Vec::new()),
            faulty: AtomicBool::new(false),
        }
    }

    /// Makes every following access fail with [`KernelError::IOError`] while
    /// `faulty` is set.
    pub fn set_faulty(&self, faulty: bool) {
        self.faulty.store(faulty, Ordering::SeqCst);
    }

    /// A snapshot of the file contents.
    pub fn contents(&self) -> Vec<u8> {
        let data = self.data.lock();
        let out = data.clone();
        data.unlock();
        out
    }

    /// The `(position, length)` of every write so far.
    pub fn writes(&self) -> Vec<(usize, usize)> {
        let writes = self.writes.lock();
        let out = writes.clone();
        writes.unlock();
        out
    }
}

impl traits::RegularFile for MemFile {
    fn size(&self) -> usize {
        let data = self.data.lock();
        let size = data.len();
        data.unlock();
        size
    }

    fn read_at(&self, position: usize, buf: &mut [u8]) -> Result<usize, KernelError> {
        if self.faulty.load(Ordering::SeqCst) {
            return Err(KernelError::IOError);
        }
        let data = self.data.lock();
        let end = data.len().min(position.saturating_add(buf.len()));
        let read = end.saturating_sub(position);
        if read != 0 {
            buf[..read].copy_from_slice(&data[position..end]);
        }
        data.unlock();
        Ok(read)
    }

    fn write_at(&self, position: usize, buf: &[u8]) -> Result<usize, KernelError> {
        if self.faulty.load(Ordering::SeqCst) {
            return Err(KernelError::IOError);
        }
        let end = position
            .checked_add(buf.len())
            .ok_or(KernelError::InvalidArgument)?;
        let mut data = self.data.lock();
        if data.len() < end {
            data.resize(end, 0);
        }
        data[position..end].copy_from_slice(buf);
        data.unlock();

        let mut writes = self.writes.lock();
        writes.push((position, buf.len()));
        writes.unlock();
        Ok(buf.len())
    }
}

/// Sector, an access granuality for the disk.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd)]
pub struct Sector(pub usize);

impl Sector {
    /// The size of a sector in bytes.
    pub const SIZE: usize = 512;

    /// Get offset that represented by the sector.
    #[inline]
    pub fn into_offset(self) -> usize {
        self.0 * Self::SIZE
    }

    /// Cast into usize.
    #[inline]
    pub fn into_usize(self) -> usize {
        self.0
    }
}

impl core::ops::Add<usize> for Sector {
    type Output = Self;

    fn add(self, rhs: usize) -> Self {
        Self(self.0 + rhs)
    }
}

// The type for disk hooking.
#[doc(hidden)]
pub type Hook =
    Arc<dyn Fn(Sector, &[u8; 512], bool) -> Result<(), KernelError> + Send + Sync + 'static>;

/// The disk, a device that has byte sink.
///
/// A hook installed with [`Disk::hook`] runs before every access and can
/// veto it, which is how tests provoke swap I/O failures.
#[derive(Clone)]
pub struct Disk {
    dev: Arc<dyn traits::BlockDevice>,
    is_ro: bool,
    hook: Option<Hook>,
}

impl Disk {
    /// Create a new disk over the block device.
    pub fn new(dev: impl traits::BlockDevice + 'static) -> Self {
        Self {
            dev: Arc::new(dev),
            is_ro: false,
            hook: None,
        }
    }

    /// Make the disk read-only.
    pub fn ro(self) -> Self {
        Self {
            is_ro: true,
            ..self
        }
    }

    /// Add a hook for the disk.
    pub fn hook(self, hook: Hook) -> Self {
        Self {
            hook: Some(hook),
            ..self
        }
    }

    /// The number of sectors of the disk.
    pub fn sector_count(&self) -> usize {
        self.dev.sector_count()
    }

    /// Read 512 bytes from disk starting from sector.
    pub fn read(&self, sector: Sector, buf: &mut [u8; 512]) -> Result<(), KernelError> {
        if sector.into_usize() >= self.sector_count() {
            return Err(KernelError::IOError);
        }
        if let Some(hook) = self.hook.as_ref() {
            hook(sector, buf, false)?;
        }
        self.dev.read(sector, buf)
    }

    /// Write 512 bytes to disk starting from sector.
    pub fn write(&self, sector: Sector, buf: &[u8; 512]) -> Result<(), KernelError> {
        if self.is_ro {
            Err(KernelError::NotSupportedOperation)
        } else if sector.into_usize() >= self.sector_count() {
            Err(KernelError::IOError)
        } else {
            if let Some(hook) = self.hook.as_ref() {
                hook(sector, buf, true)?;
            }
            self.dev.write(sector, buf)
        }
    }
}

/// A block device kept in memory.
pub struct MemDisk {
    sectors: SpinLock<Vec<[u8; 512]>>,
}

impl MemDisk {
    /// Create a zero-filled device of `cnt` sectors.
    pub fn new(cnt: usize) -> Self {
        Self {
            sectors: SpinLock::new(vec![[0; 512]; cnt]),
        }
    }
}

impl traits::BlockDevice for MemDisk {
    fn sector_count(&self) -> usize {
        let sectors = self.sectors.lock();
        let cnt = sectors.len();
        sectors.unlock();
        cnt
    }

    fn read(&self, sector: Sector, buf: &mut [u8; 512]) -> Result<(), KernelError> {
        let sectors = self.sectors.lock();
        let r = sectors
            .get(sector.into_usize())
            .map(|data| buf.copy_from_slice(data))
            .ok_or(KernelError::IOError);
        sectors.unlock();
        r
    }

    fn write(&self, sector: Sector, buf: &[u8; 512]) -> Result<(), KernelError> {
        let mut sectors = self.sectors.lock();
        let r = sectors
            .get_mut(sector.into_usize())
            .map(|data| data.copy_from_slice(buf))
            .ok_or(KernelError::IOError);
        sectors.unlock();
        r
    }
}
