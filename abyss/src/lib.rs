//! # Abyss: the lowest layer of the paging subsystem.
//!
//! This crate hosts the primitives that every other layer of the virtual
//! memory manager is written against:
//!
//! - [`addressing`]: typed virtual and physical addresses ([`Va`], [`Pa`])
//!   and the page geometry constants.
//! - [`spinlock`]: the [`SpinLock`] used for every shared table.
//! - [`kprint`]: the kernel print macros ([`info!`], [`warning!`],
//!   [`debug!`], [`println!`]) and the console sink they write into.
//!
//! Nothing here knows about pages, frames or swap. Those live in the
//! `platform` and `vm` crates.
//!
//! [`Va`]: addressing::Va
//! [`Pa`]: addressing::Pa
//! [`SpinLock`]: spinlock::SpinLock

#![cfg_attr(not(test), no_std)]
#![deny(missing_docs, rustdoc::broken_intra_doc_links)]

pub mod addressing;
pub mod kprint;
pub mod spinlock;

/// Silences [`info!`], [`warning!`] and [`debug!`] when set.
///
/// [`print!`] and [`println!`] are never silenced.
pub static QUITE: core::sync::atomic::AtomicBool = core::sync::atomic::AtomicBool::new(false);
