//! The system-wide frame table and its eviction policies.
//!
//! Every frame handed out by [`Vm::get_frame`] is registered here until the
//! page that owns it is destroyed or the frame is evicted. A frame normally
//! has exactly one owner. A resident file-backed page shared read-only
//! between a parent and its forked child has one owner per address space.
//!
//! A frame with no owner is *in flight*: it was just handed out and is being
//! filled. In-flight frames are never chosen as victims.
//!
//! [`Vm::get_frame`]: crate::Vm::get_frame
use crate::{Frame, page::Page, swap::SwapTable};
use abyss::{
    addressing::{Pa, Va},
    debug,
    spinlock::SpinLock,
    warning,
};
use alloc::{
    boxed::Box,
    sync::{Arc, Weak},
    vec::Vec,
};
use platform::{
    KernelError,
    mm::page_table::{PageTable, Permission, PteFlags},
};

/// A mapping of a frame into an address space.
pub struct FrameOwner {
    pub(crate) page: Weak<SpinLock<Page>>,
    pub(crate) page_table: Weak<SpinLock<PageTable>>,
    pub(crate) va: Va,
}

impl FrameOwner {
    pub(crate) fn new(page: &Arc<SpinLock<Page>>, page_table: &Arc<SpinLock<PageTable>>, va: Va) -> Self {
        Self {
            page: Arc::downgrade(page),
            page_table: Arc::downgrade(page_table),
            va,
        }
    }

    fn is(&self, page: &Arc<SpinLock<Page>>) -> bool {
        core::ptr::eq(self.page.as_ptr(), Arc::as_ptr(page))
    }
}

/// An entry of the frame table.
pub struct FrameEntry {
    frame: Frame,
    owners: Vec<FrameOwner>,
}

impl FrameEntry {
    /// Physical address of the frame.
    pub fn pa(&self) -> Pa {
        self.frame.pa()
    }

    /// Returns `true` if the frame is being filled and has no owner yet.
    pub fn is_in_flight(&self) -> bool {
        self.owners.is_empty()
    }

    /// The number of address spaces mapping the frame.
    pub fn owner_count(&self) -> usize {
        self.owners.len()
    }

    /// Returns `true` if any mapping of the frame was accessed since the
    /// accessed bits were last cleared.
    pub fn is_accessed(&self) -> bool {
        self.owners.iter().any(|owner| {
            owner.page_table.upgrade().is_some_and(|pt| {
                let pt = pt.lock();
                let accessed = pt.is_accessed(owner.va);
                pt.unlock();
                accessed
            })
        })
    }

    /// Clears the accessed bit of every mapping of the frame.
    pub fn clear_accessed(&self) {
        for owner in self.owners.iter() {
            if let Some(pt) = owner.page_table.upgrade() {
                let mut pt = pt.lock();
                pt.clear_accessed(owner.va);
                pt.unlock();
            }
        }
    }
}

/// A victim selection policy.
///
/// The policy is consulted with the frame table locked, and returns the
/// index of the entry to evict. It must not pick an in-flight entry.
pub trait EvictionPolicy
where
    Self: Send,
{
    /// Picks a victim among `frames`, or `None` if no entry can be evicted.
    fn select_victim(&mut self, frames: &[FrameEntry]) -> Option<usize>;
}

/// Evicts the frame that was handed out first.
#[derive(Default)]
pub struct FifoPolicy;

impl EvictionPolicy for FifoPolicy {
    fn select_victim(&mut self, frames: &[FrameEntry]) -> Option<usize> {
        frames.iter().position(|entry| !entry.is_in_flight())
    }
}

/// The second-chance (clock) policy.
///
/// The hand sweeps the frame table. A frame whose accessed bit is set gets a
/// second chance: the bit is cleared and the hand moves on. The first frame
/// found with the bit clear is the victim.
#[derive(Default)]
pub struct ClockPolicy {
    hand: usize,
}

impl ClockPolicy {
    /// A clock whose hand starts at the oldest frame.
    pub fn new() -> Self {
        Self { hand: 0 }
    }
}

impl EvictionPolicy for ClockPolicy {
    fn select_victim(&mut self, frames: &[FrameEntry]) -> Option<usize> {
        let len = frames.len();
        // Two sweeps: the first one may clear every accessed bit.
        for step in 0..2 * len {
            let idx = (self.hand + step) % len;
            let entry = &frames[idx];
            if entry.is_in_flight() {
                continue;
            }
            if entry.is_accessed() {
                entry.clear_accessed();
                continue;
            }
            // The victim is removed, so `idx` names its successor next time.
            self.hand = idx;
            return Some(idx);
        }
        None
    }
}

/// The frame table.
pub struct FrameTable {
    entries: Vec<FrameEntry>,
    policy: Box<dyn EvictionPolicy>,
}

impl FrameTable {
    pub(crate) fn new(policy: Box<dyn EvictionPolicy>) -> Self {
        Self {
            entries: Vec::new(),
            policy,
        }
    }

    /// The number of registered frames.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if no frame is registered.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The entries, from the oldest.
    pub fn entries(&self) -> &[FrameEntry] {
        &self.entries
    }

    fn position(&self, frame: &Frame) -> Option<usize> {
        let pa = frame.pa();
        self.entries.iter().position(|entry| entry.pa() == pa)
    }

    /// Registers a frame in flight.
    pub(crate) fn push(&mut self, frame: Frame) {
        self.entries.push(FrameEntry {
            frame,
            owners: Vec::new(),
        });
    }

    /// Unregisters an in-flight frame that was not installed after all.
    pub(crate) fn release(&mut self, frame: &Frame) {
        if let Some(idx) = self.position(frame) {
            debug_assert!(self.entries[idx].is_in_flight());
            self.entries.remove(idx);
        }
    }

    pub(crate) fn add_owner(&mut self, frame: &Frame, owner: FrameOwner) {
        if let Some(idx) = self.position(frame) {
            self.entries[idx].owners.push(owner);
        }
    }

    /// Removes the owner. The frame leaves the table with its last owner.
    pub(crate) fn remove_owner(&mut self, frame: &Frame, page: &Arc<SpinLock<Page>>) {
        if let Some(idx) = self.position(frame) {
            let entry = &mut self.entries[idx];
            entry.owners.retain(|owner| !owner.is(page));
            if entry.owners.is_empty() {
                self.entries.remove(idx);
            }
        }
    }

    pub(crate) fn owner_count(&self, frame: &Frame) -> usize {
        self.position(frame)
            .map(|idx| self.entries[idx].owner_count())
            .unwrap_or(0)
    }

    /// Evicts a victim chosen by the policy and returns its frame, zeroed
    /// and no longer registered.
    ///
    /// Every owner loses its mapping and its frame. The contents go to the
    /// swap disk (anonymous) or back to the file (file-backed, if any owner
    /// dirtied it). When saving the contents fails, every owner is mapped
    /// back as it was and the error is returned.
    pub(crate) fn evict_one(&mut self, swap: &SpinLock<SwapTable>) -> Result<Frame, KernelError> {
        let idx = self
            .policy
            .select_victim(&self.entries)
            .ok_or(KernelError::NoMemory)?;
        let frame = self.entries[idx].frame.clone();
        let owners = self.entries[idx]
            .owners
            .iter()
            .filter_map(|owner| Some((owner.page.upgrade()?, owner.page_table.upgrade()?, owner.va)))
            .collect::<Vec<_>>();

        let mut pages = owners.iter().map(|(page, _, _)| page.lock()).collect::<Vec<_>>();
        let mut dirty = false;
        let mut saved = Vec::with_capacity(owners.len());
        for (_, pt, va) in owners.iter() {
            let mut pt = pt.lock();
            let flags = pt.walk(*va).map(|pte| pte.flags()).ok();
            debug_assert!(flags.is_some(), "owner mapping at {} is missing", va);
            dirty |= pt.is_dirty(*va);
            if flags.is_some() {
                let unmapped = pt.unmap(*va);
                debug_assert!(unmapped.is_ok());
            }
            pt.unlock();
            saved.push(flags);
        }

        let result = match pages.first_mut() {
            Some(page) => page.swap_out(&frame, dirty, swap),
            None => Ok(()),
        };

        if let Err(e) = result {
            for ((_, pt, va), flags) in owners.iter().zip(saved) {
                if let Some(flags) = flags {
                    let writable = flags.contains(PteFlags::RW);
                    let mut pt = pt.lock();
                    if pt.map(*va, frame.clone(), Permission::user(writable)).is_ok() {
                        if let Ok(pte) = pt.walk_mut(*va) {
                            pte.set_flags(flags);
                        }
                    }
                    pt.unlock();
                }
            }
            for page in pages {
                page.unlock();
            }
            if e == KernelError::NoSpace {
                warning!("Out of swap: cannot evict {}", frame.pa());
            }
            return Err(e);
        }

        for page in pages.iter_mut() {
            page.unbind();
        }
        for page in pages {
            page.unlock();
        }
        debug!(
            "Evicted {} from {} mapping(s){}",
            frame.pa(),
            owners.len(),
            if dirty { " (dirty)" } else { "" }
        );
        drop(frame);

        let mut frame = self.entries.remove(idx).frame;
        frame.inner_mut().fill(0);
        Ok(frame)
    }
}
