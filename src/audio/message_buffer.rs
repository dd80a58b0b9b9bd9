// src/audio/message_buffer.rs
// Two-slot latest-value mailbox between one writer thread and one reader thread

use crossbeam::utils::{Backoff, CachePadded};
use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

struct Slot<T> {
    busy: AtomicBool,
    data: UnsafeCell<T>,
}

impl<T> Slot<T> {
    fn new(value: T) -> Self {
        Self {
            busy: AtomicBool::new(false),
            data: UnsafeCell::new(value),
        }
    }
}

/// Passes the latest value of some state from exactly one writer to exactly
/// one reader without blocking either side for more than a short spin.
///
/// There is no queueing: if the writer writes twice before the reader reads,
/// only the second value is ever seen.
pub struct MessageBuffer<T> {
    slots: [CachePadded<Slot<T>>; 2],
    last_written: CachePadded<AtomicUsize>,
}

// SAFETY: a slot's payload is only touched by the thread that won its busy flag
unsafe impl<T: Send> Send for MessageBuffer<T> {}
unsafe impl<T: Send> Sync for MessageBuffer<T> {}

impl<T: Default> MessageBuffer<T> {
    pub fn new() -> Self {
        Self {
            slots: [
                CachePadded::new(Slot::new(T::default())),
                CachePadded::new(Slot::new(T::default())),
            ],
            last_written: CachePadded::new(AtomicUsize::new(0)),
        }
    }

    /// Move the latest value out, leaving the default in its place
    pub fn take(&self) -> T {
        let idx = self.lock_slot(self.last_written.load(Ordering::Acquire));
        // SAFETY: slot `idx` is marked busy by this thread
        let value = unsafe { std::mem::take(&mut *self.slots[idx].data.get()) };
        self.slots[idx].busy.store(false, Ordering::Release);
        value
    }
}

impl<T: Default> Default for MessageBuffer<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone> MessageBuffer<T> {
    /// Both slots start out holding `value`
    pub fn with_value(value: T) -> Self {
        Self {
            slots: [
                CachePadded::new(Slot::new(value.clone())),
                CachePadded::new(Slot::new(value)),
            ],
            last_written: CachePadded::new(AtomicUsize::new(0)),
        }
    }

    /// Copy out the most recently written value
    pub fn read(&self) -> T {
        let idx = self.lock_slot(self.last_written.load(Ordering::Acquire));
        // SAFETY: slot `idx` is marked busy by this thread
        let value = unsafe { (*self.slots[idx].data.get()).clone() };
        self.slots[idx].busy.store(false, Ordering::Release);
        value
    }
}

impl<T> MessageBuffer<T> {
    /// Store a new value, preferring the slot the reader is not looking at
    pub fn write(&self, value: T) {
        let idx = self.lock_slot(1 - self.last_written.load(Ordering::Relaxed));
        // SAFETY: slot `idx` is marked busy by this thread
        unsafe {
            *self.slots[idx].data.get() = value;
        }
        self.last_written.store(idx, Ordering::Release);
        self.slots[idx].busy.store(false, Ordering::Release);
    }

    /// Mark a slot busy, starting with `preferred` and alternating while the
    /// other side holds it. Returns the slot that was won.
    fn lock_slot(&self, preferred: usize) -> usize {
        let backoff = Backoff::new();
        let mut idx = preferred;
        while self.slots[idx].busy.swap(true, Ordering::Acquire) {
            idx = 1 - idx;
            backoff.spin();
        }
        idx
    }
}
