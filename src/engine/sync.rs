//! Synchronization primitives for the tier locking protocol.
//!
//! Each tier of the store is guarded by two independent primitives:
//!
//! - A writer-preferring reader-writer lock ([`RwLock`]). Readers share it;
//!   a writer holds it exclusively; and as soon as a writer queues up, new
//!   readers wait. Without the preference, a steady stream of point lookups
//!   could starve flush and compaction installs indefinitely.
//! - A merge permit ([`Semaphore`]). Held for the full duration of a bulk
//!   rewrite of a tier's run set, across phases where the rw-lock must be
//!   released. The permit is acquired and released by explicit calls rather
//!   than a guard because ownership legitimately moves between threads: the
//!   flusher acquires tier 1's permit and hands it to the compactor, and a
//!   cascading compaction retains the next tier's permit into its recursive
//!   step.
//!
//! The lock keeps an explicit state machine (`readers`, `writers_waiting`,
//! `writer_active`) under a mutex with separate condvars for the reader and
//! writer queues.

use std::cell::UnsafeCell;
use std::ops::{Deref, DerefMut};
use std::sync::{Condvar, Mutex};

#[derive(Default)]
struct LockState {
    readers: usize,
    writers_waiting: usize,
    writer_active: bool,
}

/// A writer-preferring reader-writer lock owning its value.
pub struct RwLock<T> {
    state: Mutex<LockState>,
    readers_cv: Condvar,
    writers_cv: Condvar,
    value: UnsafeCell<T>,
}

unsafe impl<T: Send> Send for RwLock<T> {}
unsafe impl<T: Send + Sync> Sync for RwLock<T> {}

impl<T> RwLock<T> {
    pub fn new(value: T) -> Self {
        Self {
            state: Mutex::new(LockState::default()),
            readers_cv: Condvar::new(),
            writers_cv: Condvar::new(),
            value: UnsafeCell::new(value),
        }
    }

    /// Acquire shared read access. Blocks while a writer is active or queued.
    pub fn read(&self) -> ReadGuard<'_, T> {
        let mut state = self.state.lock().unwrap();
        while state.writer_active || state.writers_waiting > 0 {
            state = self.readers_cv.wait(state).unwrap();
        }
        state.readers += 1;
        ReadGuard { lock: self }
    }

    /// Acquire exclusive write access. Queued writers block new readers.
    pub fn write(&self) -> WriteGuard<'_, T> {
        let mut state = self.state.lock().unwrap();
        state.writers_waiting += 1;
        while state.writer_active || state.readers > 0 {
            state = self.writers_cv.wait(state).unwrap();
        }
        state.writers_waiting -= 1;
        state.writer_active = true;
        WriteGuard { lock: self }
    }
}

pub struct ReadGuard<'a, T> {
    lock: &'a RwLock<T>,
}

impl<T> Deref for ReadGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.lock.value.get() }
    }
}

impl<T> Drop for ReadGuard<'_, T> {
    fn drop(&mut self) {
        let mut state = self.lock.state.lock().unwrap();
        state.readers -= 1;
        if state.readers == 0 && state.writers_waiting > 0 {
            self.lock.writers_cv.notify_one();
        }
    }
}

pub struct WriteGuard<'a, T> {
    lock: &'a RwLock<T>,
}

impl<T> Deref for WriteGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.lock.value.get() }
    }
}

impl<T> DerefMut for WriteGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.value.get() }
    }
}

impl<T> Drop for WriteGuard<'_, T> {
    fn drop(&mut self) {
        let mut state = self.lock.state.lock().unwrap();
        state.writer_active = false;
        if state.writers_waiting > 0 {
            self.lock.writers_cv.notify_one();
        } else {
            self.lock.readers_cv.notify_all();
        }
    }
}

/// A counted semaphore. Used with one permit per tier as the merge permit.
pub struct Semaphore {
    permits: Mutex<usize>,
    cv: Condvar,
}

impl Semaphore {
    pub fn new(permits: usize) -> Self {
        Self {
            permits: Mutex::new(permits),
            cv: Condvar::new(),
        }
    }

    /// Block until a permit is available and take it.
    pub fn acquire(&self) {
        let mut permits = self.permits.lock().unwrap();
        while *permits == 0 {
            permits = self.cv.wait(permits).unwrap();
        }
        *permits -= 1;
    }

    /// Return a permit. May be called from a different thread than the one
    /// that acquired it.
    pub fn release(&self) {
        let mut permits = self.permits.lock().unwrap();
        *permits += 1;
        self.cv.notify_one();
    }
}
