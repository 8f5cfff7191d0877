//! Busy-waiting lock for the paging tables.
//!
//! Every table that is shared between faulting threads (the frame table, the
//! swap table, a process's supplemental page table, each page record and each
//! page table) is guarded by a [`SpinLock`].
//!
//! A waiter spins on a single flag, backing off with
//! [`crossbeam_utils::Backoff`] between attempts.
//!
//! The guard returned by [`SpinLock::lock`] is *not* a scoped guard: the
//! holder releases the lock with [`SpinLockGuard::unlock`]. A guard that is
//! dropped while held panics and reports where the lock was taken, which
//! turns a forgotten unlock on an error path into a loud failure instead of
//! a deadlock later on.

use core::{
    cell::UnsafeCell,
    marker::PhantomData,
    ops::{Deref, DerefMut},
    panic::Location,
    sync::atomic::{AtomicBool, Ordering},
};
use crossbeam_utils::Backoff;

/// Returned by [`SpinLock::try_lock`] when the lock is held elsewhere.
#[derive(Debug)]
pub struct WouldBlock;

/// A spinning mutual exclusion lock around a `T`.
///
/// The data is reachable only through a [`SpinLockGuard`].
///
/// ```
/// use abyss::spinlock::SpinLock;
///
/// let frames = SpinLock::new(Vec::new());
/// let mut guard = frames.lock();
/// guard.push(0x10_0000);
/// guard.unlock();
/// ```
pub struct SpinLock<T: ?Sized> {
    held: AtomicBool,
    data: UnsafeCell<T>,
}

unsafe impl<T: ?Sized + Send> Send for SpinLock<T> {}
unsafe impl<T: ?Sized + Send> Sync for SpinLock<T> {}

impl<T> SpinLock<T> {
    /// Wraps `data` in an unlocked lock.
    #[inline]
    pub const fn new(data: T) -> Self {
        Self {
            held: AtomicBool::new(false),
            data: UnsafeCell::new(data),
        }
    }
}

impl<T: Default> Default for SpinLock<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T: ?Sized> SpinLock<T> {
    fn acquire(&self) -> bool {
        self.held
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    fn guard(&self, caller: &'static Location<'static>) -> SpinLockGuard<'_, T> {
        SpinLockGuard {
            caller,
            lock: self,
            _not_send: PhantomData,
        }
    }

    /// Spins until the lock is free, then takes it.
    ///
    /// The lock is not reentrant: taking it twice on one thread spins
    /// forever.
    #[track_caller]
    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        let caller = Location::caller();
        let backoff = Backoff::new();
        while !self.acquire() {
            while self.held.load(Ordering::Relaxed) {
                backoff.snooze();
            }
        }
        self.guard(caller)
    }

    /// Takes the lock if it is free.
    #[track_caller]
    pub fn try_lock(&self) -> Result<SpinLockGuard<'_, T>, WouldBlock> {
        let caller = Location::caller();
        if self
            .held
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            Ok(self.guard(caller))
        } else {
            Err(WouldBlock)
        }
    }
}

/// Exclusive access to the data of a [`SpinLock`].
///
/// Release it with [`SpinLockGuard::unlock`]; dropping it panics.
pub struct SpinLockGuard<'a, T: ?Sized + 'a> {
    caller: &'static Location<'static>,
    lock: &'a SpinLock<T>,
    // Released by the thread that took it.
    _not_send: PhantomData<*const ()>,
}

unsafe impl<T: ?Sized + Sync> Sync for SpinLockGuard<'_, T> {}

impl<T: ?Sized> SpinLockGuard<'_, T> {
    /// Releases the lock.
    pub fn unlock(self) {
        self.lock.held.store(false, Ordering::Release);
        core::mem::forget(self);
    }
}

impl<T: ?Sized> Deref for SpinLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: ?Sized> DerefMut for SpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T: ?Sized> Drop for SpinLockGuard<'_, T> {
    fn drop(&mut self) {
        panic!("SpinLockGuard taken at {} dropped without unlock()", self.caller);
    }
}

#[cfg(test)]
mod tests {
    use super::SpinLock;
    use std::{sync::Arc, thread};

    #[test]
    fn counter() {
        let data = Arc::new(SpinLock::new(0usize));
        let handles = (0..8)
            .map(|_| {
                let data = data.clone();
                thread::spawn(move || {
                    for _ in 0..1000 {
                        let mut guard = data.lock();
                        *guard += 1;
                        guard.unlock();
                    }
                })
            })
            .collect::<Vec<_>>();
        for handle in handles {
            handle.join().unwrap();
        }
        let guard = data.lock();
        assert_eq!(*guard, 8000);
        guard.unlock();
    }

    #[test]
    fn try_lock_would_block() {
        let lock = SpinLock::new(());
        let guard = lock.lock();
        assert!(lock.try_lock().is_err());
        guard.unlock();
        lock.try_lock().unwrap().unlock();
    }

    #[test]
    #[should_panic(expected = "dropped without unlock()")]
    fn dropping_a_held_guard_panics() {
        let lock = SpinLock::new(1);
        let _guard = lock.lock();
    }
}
