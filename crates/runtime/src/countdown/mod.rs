//! countdown
//!
//! A counting synchronization primitive whose waitable signal is set exactly when the count is
//! zero. Threadpools use one to track outstanding submissions.

use crate::event::{self, BorrowedEventHandle, Event, EventError, EventInitialState, EventReset};
use parking_lot::Mutex;
use std::{
    fmt,
    sync::atomic::{AtomicUsize, Ordering},
    time::Duration,
};

/// An atomic counter with a manual-reset event which is signaled while the count is zero
pub struct CountdownEvent {
    /// The current count. Readable without locking
    count: AtomicUsize,
    /// Serializes count transitions with the signal so a waiter never observes a set signal
    /// with a non zero count
    transition: Mutex<()>,
    /// Signaled iff count == 0
    event: event::OwnedEventHandle,
}

impl CountdownEvent {
    /// Create a countdown event. The signal is set iff `initial` is zero
    pub fn new(initial: usize) -> Self {
        let state = match initial {
            0 => EventInitialState::Set,
            _ => EventInitialState::Unset,
        };
        Self {
            count: AtomicUsize::new(initial),
            transition: Mutex::new(()),
            event: event::anonymous(EventReset::Manual, state),
        }
    }

    /// Add `n` to the count. If the count was zero the signal is cleared before the new count is
    /// published.
    pub fn add_count(&self, n: usize) {
        debug_assert!(n > 0, "countdown add_count must be greater than zero");
        let _guard = self.transition.lock();
        if self.count.load(Ordering::Acquire) == 0 {
            self.event.reset();
        }
        self.count.fetch_add(n, Ordering::AcqRel);
    }

    /// Subtract `n` from the count. Returns true if the count reached zero, in which case the
    /// signal is set.
    ///
    /// Decrementing below zero is a caller bug. Debug builds panic, release builds saturate.
    pub fn decrement(&self, n: usize) -> bool {
        debug_assert!(n > 0, "countdown decrement must be greater than zero");
        let _guard = self.transition.lock();
        let prev = self.count.load(Ordering::Acquire);
        debug_assert!(prev >= n, "countdown decremented below zero ({prev} - {n})");
        let next = prev.saturating_sub(n);
        self.count.store(next, Ordering::Release);
        if next == 0 {
            self.event.set();
        }
        next == 0
    }

    /// The current count
    pub fn count(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    /// True while the count is zero
    pub fn is_set(&self) -> bool {
        self.event.is_set()
    }

    /// A handle which may be used with [`Event::wait`]
    pub fn wait_handle(&self) -> BorrowedEventHandle<'_> {
        self.event.as_handle()
    }

    /// Block until the count reaches zero or the timeout elapses
    pub fn wait(&self, timeout: Option<Duration>) -> Result<(), EventError> {
        self.event.wait(timeout)
    }
}

impl Default for CountdownEvent {
    fn default() -> Self {
        Self::new(0)
    }
}

impl fmt::Debug for CountdownEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CountdownEvent")
            .field("count", &self.count())
            .field("signaled", &self.is_set())
            .finish()
    }
}
