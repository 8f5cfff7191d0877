//! Typed addresses and page geometry.
//!
//! A process sees [`Va`]s; the physical allocator hands out frames named by
//! [`Pa`]s. The paging code never mixes the two up because they are
//! different types, and converts to a raw `usize` only at the edges.
//!
//! ```
//! use abyss::addressing::{PAGE_SIZE, Va};
//!
//! let va = Va::new(0x1234_5678).unwrap();
//! assert_eq!(va.page_down().into_usize(), 0x1234_5000);
//! assert_eq!(va.offset(), 0x678);
//! assert_eq!((va.page_down() + PAGE_SIZE).into_usize(), 0x1234_6000);
//! ```

/// Bytes per page. Frames, swap slots and page table entries all cover one
/// page.
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;

/// `log2(PAGE_SIZE)`.
pub const PAGE_SHIFT: usize = 12;

/// The bits of an address that select a byte within its page.
pub const PAGE_MASK: usize = PAGE_SIZE - 1;

/// The address of a byte of physical memory.
#[repr(transparent)]
#[derive(Clone, Copy, Eq, PartialEq, PartialOrd, Ord, Hash)]
pub struct Pa(usize);

/// The address of a byte in a virtual address space.
///
/// Only canonical x86_64 addresses exist: bits 48 and up copy bit 47.
/// Which half belongs to the kernel is up to the paging layer.
#[repr(transparent)]
#[derive(Clone, Copy, Eq, PartialEq, PartialOrd, Ord, Hash)]
pub struct Va(usize);

impl Pa {
    /// Physical addresses stop below this bound.
    const END: usize = 0xffff_0000_0000_0000;

    /// Returns `None` past the end of the physical address space.
    #[inline]
    pub const fn new(addr: usize) -> Option<Self> {
        if addr < Self::END { Some(Self(addr)) } else { None }
    }
}

impl Va {
    /// Address zero. No user page is ever mapped there.
    pub const NULL: Self = Self(0);

    const SIGN_BITS: usize = 0xffff_8000_0000_0000;

    /// Returns `None` for a non-canonical address.
    #[inline(always)]
    pub const fn new(addr: usize) -> Option<Self> {
        let high = addr & Self::SIGN_BITS;
        if high == 0 || high == Self::SIGN_BITS {
            Some(Self(addr))
        } else {
            None
        }
    }

    /// `self + rhs`, or `None` if that overflows or leaves canonical space.
    #[inline]
    pub const fn checked_add(self, rhs: usize) -> Option<Self> {
        match self.0.checked_add(rhs) {
            Some(addr) => Self::new(addr),
            None => None,
        }
    }

    /// `self - rhs`, or `None` below zero.
    #[inline]
    pub const fn checked_sub(self, rhs: usize) -> Option<Self> {
        match self.0.checked_sub(rhs) {
            Some(addr) => Self::new(addr),
            None => None,
        }
    }
}

macro_rules! address {
    ($t: ident) => {
        impl $t {
            /// The raw address.
            #[inline]
            pub const fn into_usize(self) -> usize {
                self.0
            }

            /// The start of the page holding this address.
            #[inline]
            pub const fn page_down(self) -> Self {
                Self(self.0 & !PAGE_MASK)
            }

            /// The first page boundary at or above this address.
            #[inline]
            pub const fn page_up(self) -> Self {
                Self((self.0 + PAGE_MASK) & !PAGE_MASK)
            }

            /// Position of the byte within its page.
            #[inline]
            pub const fn offset(self) -> usize {
                self.0 & PAGE_MASK
            }

            /// Whether the address starts a page.
            #[inline]
            pub const fn is_page_aligned(self) -> bool {
                self.offset() == 0
            }
        }

        impl core::ops::Add<usize> for $t {
            type Output = Self;

            fn add(self, bytes: usize) -> Self {
                Self(self.0 + bytes)
            }
        }

        impl core::ops::AddAssign<usize> for $t {
            fn add_assign(&mut self, bytes: usize) {
                self.0 += bytes;
            }
        }

        impl core::ops::Sub<usize> for $t {
            type Output = Self;

            fn sub(self, bytes: usize) -> Self {
                Self(self.0 - bytes)
            }
        }

        /// Distance in bytes.
        impl core::ops::Sub<$t> for $t {
            type Output = usize;

            fn sub(self, lower: $t) -> usize {
                self.0 - lower.0
            }
        }

        impl core::fmt::Debug for $t {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                write!(f, concat!(stringify!($t), "({:#x})"), self.0)
            }
        }

        impl core::fmt::Display for $t {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                write!(f, "{:#x}", self.0)
            }
        }
    };
}

address!(Pa);
address!(Va);
