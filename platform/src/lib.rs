//! # Platform: the collaborators of the paging subsystem.
//!
//! The virtual memory manager in the `vm` crate never talks to hardware or to
//! a filesystem directly. It consumes the capabilities collected here:
//!
//! - [`mm`]: the raw physical-frame allocator ([`PhysicalAllocator`]) handing
//!   out reference-counted [`Page`]s, and the per-process hardware
//!   [`PageTable`] with its present/writable/accessed/dirty bits.
//! - [`fs`]: regular files ([`RegularFile`], opened as [`File`] handles) and
//!   the sector-addressed [`Disk`] backing the swap area.
//! - [`task`]: the page-fault error code pushed by the CPU.
//!
//! Every capability has an in-memory implementation ([`MemFile`],
//! [`MemDisk`], a software page table) so that the paging policy can run,
//! and be tested, without a machine underneath.
//!
//! [`PhysicalAllocator`]: mm::PhysicalAllocator
//! [`Page`]: mm::Page
//! [`PageTable`]: mm::page_table::PageTable
//! [`RegularFile`]: fs::RegularFile
//! [`File`]: fs::File
//! [`Disk`]: fs::Disk
//! [`MemFile`]: fs::MemFile
//! [`MemDisk`]: fs::MemDisk

#![cfg_attr(not(test), no_std)]
#![deny(missing_docs, rustdoc::broken_intra_doc_links)]

extern crate alloc;

pub mod fs;
pub mod mm;
pub mod task;

pub use abyss::{addressing, debug, info, print, println, spinlock, warning};

/// Synchronization primitives.
pub mod sync {
    pub use abyss::spinlock::{SpinLock, SpinLockGuard, WouldBlock};
}

use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Enum representing errors that can occur during a kernel operation.
///
/// Each variant corresponds to an errno value, which is what a system call
/// returns to the user program when the operation fails.
#[derive(Debug, Clone, Copy, Eq, PartialEq, IntoPrimitive, TryFromPrimitive)]
#[repr(isize)]
pub enum KernelError {
    /// IO Error. (EIO)
    IOError = -5,
    /// Out of memory. (ENOMEM)
    NoMemory = -12,
    /// Permission denied. (EACCES)
    InvalidAccess = -13,
    /// Bad address. (EFAULT)
    BadAddress = -14,
    /// File exists. (EEXIST)
    FileExist = -17,
    /// Invalid arguement. (EINVAL)
    InvalidArgument = -22,
    /// No space left on device. (ENOSPC)
    NoSpace = -28,
    /// Operation is not supported. (ENOTSUPP)
    NotSupportedOperation = -524,
}

impl KernelError {
    /// Converts the [`KernelError`] into the `usize` returned by a system
    /// call.
    pub fn into_usize(self) -> usize {
        isize::from(self) as usize
    }
}
