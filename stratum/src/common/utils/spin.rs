//! Spin locks. Critical sections guarded by them are short (a few arithmetic
//! operations for aggregation states) or rare (resizing the hash table), busy waiting
//! with [`Backoff`] is cheaper than parking the thread

use std::cell::UnsafeCell;
use std::fmt::Debug;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering::{Acquire, Relaxed, Release};

use crossbeam_utils::{Backoff, CachePadded};

/// Mutual exclusion spin lock that protects `T`
pub struct SpinMutex<T> {
    locked: CachePadded<AtomicBool>,
    data: UnsafeCell<T>,
}

// SAFETY: the lock guarantees that only one thread can access the data at the same time
unsafe impl<T: Send> Send for SpinMutex<T> {}
// SAFETY: the lock guarantees that only one thread can access the data at the same time
unsafe impl<T: Send> Sync for SpinMutex<T> {}

impl<T> SpinMutex<T> {
    /// Create a new spin mutex
    #[inline]
    pub fn new(data: T) -> Self {
        Self {
            locked: CachePadded::new(AtomicBool::new(false)),
            data: UnsafeCell::new(data),
        }
    }

    /// Acquire the lock, spin until it is available
    #[inline]
    pub fn lock(&self) -> SpinMutexGuard<'_, T> {
        let backoff = Backoff::new();
        while self
            .locked
            .compare_exchange_weak(false, true, Acquire, Relaxed)
            .is_err()
        {
            while self.locked.load(Relaxed) {
                backoff.snooze();
            }
        }
        SpinMutexGuard { mutex: self }
    }

    /// Get the data through the exclusive reference, no lock is required
    #[inline]
    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }

    /// Consume the lock
    #[inline]
    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<T: Debug> Debug for SpinMutex<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpinMutex")
            .field("data", &*self.lock())
            .finish()
    }
}

impl<T: Default> Default for SpinMutex<T> {
    #[inline]
    fn default() -> Self {
        Self::new(T::default())
    }
}

/// Guard of the [`SpinMutex`], the lock is released when it is dropped
#[derive(Debug)]
pub struct SpinMutexGuard<'a, T> {
    mutex: &'a SpinMutex<T>,
}

impl<T> Deref for SpinMutexGuard<'_, T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &Self::Target {
        // SAFETY: the guard holds the lock
        unsafe { &*self.mutex.data.get() }
    }
}

impl<T> DerefMut for SpinMutexGuard<'_, T> {
    #[inline]
    fn deref_mut(&mut self) -> &mut Self::Target {
        // SAFETY: the guard holds the lock
        unsafe { &mut *self.mutex.data.get() }
    }
}

impl<T> Drop for SpinMutexGuard<'_, T> {
    #[inline]
    fn drop(&mut self) {
        self.mutex.locked.store(false, Release);
    }
}

/// Highest bit of the state marks the writer. Remaining bits count the readers
const WRITER: usize = 1 << (usize::BITS - 1);
const READERS_MASK: usize = !WRITER;

/// Reader writer spin lock that protects `T`. Many readers can hold the shared lock
/// at the same time, the exclusive lock excludes everyone else
///
/// A writer that is waiting for the exclusive lock blocks the new readers, so the
/// writer will not starve
pub struct SpinSharedMutex<T> {
    state: CachePadded<AtomicUsize>,
    data: UnsafeCell<T>,
}

// SAFETY: the exclusive lock guarantees that mutation happens in a single thread, the
// shared lock only hands out shared references
unsafe impl<T: Send> Send for SpinSharedMutex<T> {}
// SAFETY: readers in different threads share `&T`, therefore `T: Sync` is required
unsafe impl<T: Send + Sync> Sync for SpinSharedMutex<T> {}

impl<T> SpinSharedMutex<T> {
    /// Create a new shared spin mutex
    #[inline]
    pub fn new(data: T) -> Self {
        Self {
            state: CachePadded::new(AtomicUsize::new(0)),
            data: UnsafeCell::new(data),
        }
    }

    /// Acquire the shared lock
    #[inline]
    pub fn read(&self) -> SpinSharedGuard<'_, T> {
        let backoff = Backoff::new();
        loop {
            let previous = self.state.fetch_add(1, Acquire);
            if previous & WRITER == 0 {
                return SpinSharedGuard { mutex: self };
            }
            // Writer holds or waits for the lock, retreat and wait
            self.state.fetch_sub(1, Relaxed);
            while self.state.load(Relaxed) & WRITER != 0 {
                backoff.snooze();
            }
        }
    }

    /// Acquire the exclusive lock
    #[inline]
    pub fn write(&self) -> SpinExclusiveGuard<'_, T> {
        let backoff = Backoff::new();
        // Claim the writer bit first, it stops new readers
        while self.state.fetch_or(WRITER, Acquire) & WRITER != 0 {
            backoff.snooze();
        }
        // Wait for the existing readers
        while self.state.load(Acquire) & READERS_MASK != 0 {
            backoff.snooze();
        }
        SpinExclusiveGuard { mutex: self }
    }

    /// Get the data through the exclusive reference, no lock is required
    #[inline]
    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }
}

impl<T: Debug> Debug for SpinSharedMutex<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpinSharedMutex")
            .field("data", &*self.read())
            .finish()
    }
}

/// Guard of the shared lock
#[derive(Debug)]
pub struct SpinSharedGuard<'a, T> {
    mutex: &'a SpinSharedMutex<T>,
}

impl<'a, T> SpinSharedGuard<'a, T> {
    /// Get the reference that lives as long as the lock, instead of the guard.
    ///
    /// # Safety
    ///
    /// The returned reference must not outlive the guard
    #[inline]
    pub(crate) unsafe fn data_unbounded(&self) -> &'a T {
        // SAFETY: the guard holds the shared lock
        unsafe { &*self.mutex.data.get() }
    }
}

impl<T> Deref for SpinSharedGuard<'_, T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &Self::Target {
        // SAFETY: the guard holds the shared lock, nobody can mutate the data
        unsafe { &*self.mutex.data.get() }
    }
}

impl<T> Drop for SpinSharedGuard<'_, T> {
    #[inline]
    fn drop(&mut self) {
        self.mutex.state.fetch_sub(1, Release);
    }
}

/// Guard of the exclusive lock
#[derive(Debug)]
pub struct SpinExclusiveGuard<'a, T> {
    mutex: &'a SpinSharedMutex<T>,
}

impl<T> Deref for SpinExclusiveGuard<'_, T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &Self::Target {
        // SAFETY: the guard holds the exclusive lock
        unsafe { &*self.mutex.data.get() }
    }
}

impl<T> DerefMut for SpinExclusiveGuard<'_, T> {
    #[inline]
    fn deref_mut(&mut self) -> &mut Self::Target {
        // SAFETY: the guard holds the exclusive lock
        unsafe { &mut *self.mutex.data.get() }
    }
}

impl<T> Drop for SpinExclusiveGuard<'_, T> {
    #[inline]
    fn drop(&mut self) {
        self.mutex.state.fetch_and(READERS_MASK, Release);
    }
}
