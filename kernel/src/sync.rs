use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, Ordering};

use crate::arch;

/// A spinning lock that also masks interrupts on the current core while held.
///
/// A lock built with [`SpinLock::new_held`] starts out owned by whoever
/// constructed it; that owner takes the guard exactly once through
/// [`SpinLock::adopt`].
pub struct SpinLock<T> {
    locked: AtomicBool,
    adoptable: AtomicBool,
    value: UnsafeCell<T>,
}

unsafe impl<T: Send> Sync for SpinLock<T> {}
unsafe impl<T: Send> Send for SpinLock<T> {}

impl<T> SpinLock<T> {
    /// Creates a new lock around the provided value.
    pub const fn new(value: T) -> Self {
        Self {
            locked: AtomicBool::new(false),
            adoptable: AtomicBool::new(false),
            value: UnsafeCell::new(value),
        }
    }

    /// Creates a lock that is already held by its creator.
    pub const fn new_held(value: T) -> Self {
        Self {
            locked: AtomicBool::new(true),
            adoptable: AtomicBool::new(true),
            value: UnsafeCell::new(value),
        }
    }

    /// Acquires the lock, spinning until it is free.
    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        let interrupts_were_enabled = arch::interrupts_enabled();
        if interrupts_were_enabled {
            arch::disable_interrupts();
        }

        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            core::hint::spin_loop();
        }

        SpinLockGuard {
            lock: self,
            interrupts_were_enabled,
        }
    }

    /// Acquires the lock only if nobody holds it right now.
    pub fn try_lock(&self) -> Option<SpinLockGuard<'_, T>> {
        let interrupts_were_enabled = arch::interrupts_enabled();
        if interrupts_were_enabled {
            arch::disable_interrupts();
        }

        if self
            .locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            Some(SpinLockGuard {
                lock: self,
                interrupts_were_enabled,
            })
        } else {
            if interrupts_were_enabled {
                arch::enable_interrupts();
            }
            None
        }
    }

    /// Hands the creator of a [`SpinLock::new_held`] lock its guard.
    ///
    /// Returns `None` for ordinary locks and on every call after the first.
    pub fn adopt(&self) -> Option<SpinLockGuard<'_, T>> {
        if self
            .adoptable
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Relaxed)
            .is_err()
        {
            return None;
        }

        Some(SpinLockGuard {
            lock: self,
            interrupts_were_enabled: false,
        })
    }

    /// Returns whether some owner currently holds the lock.
    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Acquire)
    }
}

/// Guard returned by [`SpinLock::lock`] and [`SpinLock::adopt`].
pub struct SpinLockGuard<'a, T> {
    lock: &'a SpinLock<T>,
    interrupts_were_enabled: bool,
}

impl<'a, T> Drop for SpinLockGuard<'a, T> {
    fn drop(&mut self) {
        self.lock.locked.store(false, Ordering::Release);
        if self.interrupts_were_enabled {
            arch::enable_interrupts();
        }
    }
}

impl<'a, T> Deref for SpinLockGuard<'a, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        unsafe { &*self.lock.value.get() }
    }
}

impl<'a, T> DerefMut for SpinLockGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        unsafe { &mut *self.lock.value.get() }
    }
}

/// Executes the provided closure while holding the lock.
pub fn with_lock<T, R, F>(lock: &SpinLock<T>, f: F) -> R
where
    F: FnOnce(&mut T) -> R,
{
    let mut guard = lock.lock();
    f(&mut guard)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn held_lock_is_adopted_once() {
        let lock = SpinLock::new_held(5u32);
        assert!(lock.is_locked());
        assert!(lock.try_lock().is_none());

        let mut guard = lock.adopt().expect("first adoption");
        *guard += 1;
        assert!(lock.adopt().is_none());
        drop(guard);

        assert!(!lock.is_locked());
        assert_eq!(*lock.lock(), 6);
    }

    #[test]
    fn ordinary_lock_cannot_be_adopted() {
        let lock = SpinLock::new(0u8);
        assert!(lock.adopt().is_none());
        assert!(!lock.is_locked());
    }

    #[test]
    fn with_lock_returns_closure_result() {
        let lock = SpinLock::new([1u8, 2, 3]);
        let sum = with_lock(&lock, |values| values.iter().map(|v| *v as u32).sum::<u32>());
        assert_eq!(sum, 6);
        assert!(lock.try_lock().is_some());
    }
}
