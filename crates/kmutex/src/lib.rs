//! Concrete lock backends implementing [`mutex_api::Mutex`].
//!
//! The spec this workspace implements treats the spinlock and sleep-lock
//! primitives as external collaborators, specified only through the
//! interface the core consumes (`init`/`acquire`/`release`, plus `holding`
//! for the sleep-lock). This crate supplies that interface with two
//! concrete backends:
//!
//! - [`SpinMutex`]: busy-waits, used for `hashlocks[i]`, `bcache.lock`, and
//!   each CPU's `kmem[i].lock`.
//! - [`SleepMutex`]: blocks the caller rather than spinning, used for a
//!   buffer's content lock.
#![cfg_attr(any(not(feature = "std"), target_os = "none"), no_std)]

use core::{
    cell::UnsafeCell,
    marker::PhantomData,
    ops::{Deref, DerefMut},
    sync::atomic::{AtomicBool, Ordering},
};

use mutex_api::Mutex;

/// Disables preemption/interrupts for the duration a spinlock is held.
///
/// Out of scope per the spec: a real kernel plugs its own nestable
/// `push_off`/`pop_off` in here. Ordinary OS threads have no interrupts to
/// disable, so [`NoInterruptControl`] is a correct no-op stand-in for
/// hosted use.
pub trait InterruptControl {
    fn push_off();
    fn pop_off();
}

/// The default [`InterruptControl`]: does nothing.
#[derive(Debug, Default)]
pub struct NoInterruptControl;

impl InterruptControl for NoInterruptControl {
    fn push_off() {}
    fn pop_off() {}
}

/// A busy-wait lock.
///
/// Loops until the lock is acquired; never yields the CPU. Correct only
/// when critical sections are short and interrupts/preemption are disabled
/// for their duration (see [`InterruptControl`]).
pub struct SpinMutex<T, IC = NoInterruptControl> {
    locked: AtomicBool,
    value: UnsafeCell<T>,
    _interrupt_control: PhantomData<IC>,
}

unsafe impl<T, IC> Sync for SpinMutex<T, IC> where T: Send {}

impl<T, IC> SpinMutex<T, IC> {
    pub const fn new(value: T) -> Self {
        Self {
            locked: AtomicBool::new(false),
            value: UnsafeCell::new(value),
            _interrupt_control: PhantomData,
        }
    }
}

impl<T, IC> SpinMutex<T, IC>
where
    IC: InterruptControl,
{
    /// Acquires the lock, spinning until it is free.
    pub fn lock(&self) -> SpinMutexGuard<'_, T, IC> {
        IC::push_off();

        // `Ordering::Acquire` ensures the critical section's loads/stores
        // happen strictly after the lock is observed free.
        while self.locked.swap(true, Ordering::Acquire) {
            core::hint::spin_loop();
        }

        SpinMutexGuard { lock: self }
    }
}

impl<T, IC> Mutex for SpinMutex<T, IC>
where
    IC: InterruptControl,
{
    type Data = T;
    type Guard<'a>
        = SpinMutexGuard<'a, T, IC>
    where
        Self: 'a;

    fn new(data: Self::Data) -> Self {
        Self::new(data)
    }

    fn lock(&self) -> Self::Guard<'_> {
        self.lock()
    }
}

pub struct SpinMutexGuard<'a, T, IC> {
    lock: &'a SpinMutex<T, IC>,
}

unsafe impl<T, IC> Send for SpinMutexGuard<'_, T, IC> where T: Send {}
unsafe impl<T, IC> Sync for SpinMutexGuard<'_, T, IC> where T: Sync {}

impl<T, IC> Drop for SpinMutexGuard<'_, T, IC>
where
    IC: InterruptControl,
{
    fn drop(&mut self) {
        // `Ordering::Release` ensures the critical section's stores are
        // visible to the next lock holder before we mark it free.
        self.lock.locked.store(false, Ordering::Release);
        IC::pop_off();
    }
}

impl<T, IC> Deref for SpinMutexGuard<'_, T, IC> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        unsafe { &*self.lock.value.get() }
    }
}

impl<T, IC> DerefMut for SpinMutexGuard<'_, T, IC> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        unsafe { &mut *self.lock.value.get() }
    }
}

#[cfg(feature = "std")]
mod sleep {
    use std::{
        cell::UnsafeCell,
        sync::{Condvar, Mutex as StdMutex},
    };

    use super::Mutex;

    /// A lock whose waiters block rather than spin.
    ///
    /// Stands in for the scheduler-integrated sleep-lock the spec treats as
    /// an external collaborator (a real kernel would park the waiter on its
    /// own run queue instead of a condition variable). Backed by
    /// [`std::sync::Condvar`], so it is only available with the `std`
    /// feature.
    pub struct SleepMutex<T> {
        locked: StdMutex<bool>,
        not_locked: Condvar,
        value: UnsafeCell<T>,
    }

    unsafe impl<T> Sync for SleepMutex<T> where T: Send {}

    impl<T> SleepMutex<T> {
        pub fn new(data: T) -> Self {
            Self {
                locked: StdMutex::new(false),
                not_locked: Condvar::new(),
                value: UnsafeCell::new(data),
            }
        }

        /// Acquires the lock, blocking the calling thread while it is held
        /// elsewhere.
        pub fn lock(&self) -> SleepMutexGuard<'_, T> {
            let mut locked = self.locked.lock().unwrap();
            while *locked {
                locked = self.not_locked.wait(locked).unwrap();
            }
            *locked = true;
            drop(locked);
            SleepMutexGuard { lock: self }
        }

        /// Returns whether the lock is currently held by anyone.
        ///
        /// Analogous to `holdingsleep`, minus the per-holder identity check
        /// (process identity is out of scope here).
        pub fn is_locked(&self) -> bool {
            *self.locked.lock().unwrap()
        }
    }

    pub struct SleepMutexGuard<'a, T> {
        lock: &'a SleepMutex<T>,
    }

    unsafe impl<T> Send for SleepMutexGuard<'_, T> where T: Send {}
    unsafe impl<T> Sync for SleepMutexGuard<'_, T> where T: Sync {}

    impl<T> Drop for SleepMutexGuard<'_, T> {
        fn drop(&mut self) {
            let mut locked = self.lock.locked.lock().unwrap();
            *locked = false;
            drop(locked);
            self.lock.not_locked.notify_one();
        }
    }

    impl<T> std::ops::Deref for SleepMutexGuard<'_, T> {
        type Target = T;

        fn deref(&self) -> &Self::Target {
            unsafe { &*self.lock.value.get() }
        }
    }

    impl<T> std::ops::DerefMut for SleepMutexGuard<'_, T> {
        fn deref_mut(&mut self) -> &mut Self::Target {
            unsafe { &mut *self.lock.value.get() }
        }
    }

    impl<T> Mutex for SleepMutex<T> {
        type Data = T;
        type Guard<'a>
            = SleepMutexGuard<'a, T>
        where
            T: 'a;

        fn new(data: Self::Data) -> Self {
            Self::new(data)
        }

        fn lock(&self) -> Self::Guard<'_> {
            self.lock()
        }
    }
}

#[cfg(feature = "std")]
pub use sleep::{SleepMutex, SleepMutexGuard};
