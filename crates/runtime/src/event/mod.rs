//! event
//!
//! Waitable signal objects. An event is either manual-reset (stays set and releases every
//! waiter until reset) or auto-reset (releases a single waiter and clears itself).

use parking_lot::{Condvar, Mutex};
use std::{
    sync::Arc,
    time::{Duration, Instant},
};

/// See [`OwnedEventHandle::anonymous`]
pub fn anonymous(reset: EventReset, state: EventInitialState) -> OwnedEventHandle {
    OwnedEventHandle::anonymous(reset, state)
}

/// The Event API is impled for Owned and Borrowed Event handles
/// See OwnedEventHandle::anonymous for details
pub trait Event {
    /// Sets the specified event object to the signaled state.
    fn set(&self);

    /// Sets the specified event object to the nonsignaled state.
    fn reset(&self);

    /// Returns true if the event is currently signaled. Does not consume an auto-reset signal.
    fn is_set(&self) -> bool;

    /// Wait for event with optional timeout. A `None` timeout waits forever.
    fn wait(&self, duration: Option<Duration>) -> Result<(), EventError>;
}

#[derive(thiserror::Error, Copy, Clone, Debug, PartialEq, Eq)]
pub enum EventError {
    /// The event was not signaled before the timeout elapsed
    #[error("event timeout")]
    Timeout,
}

/// Event creation argument
///
/// A manual-reset event requires [`Event::reset`] to set the event state to nonsignaled. An
/// auto-reset event is reset automatically after a single waiting thread has been released.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum EventReset {
    Manual,
    Automatic,
}

/// Event creation argument
///
/// The initial state of the event object
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum EventInitialState {
    Set,
    Unset,
}

#[derive(Debug)]
pub(crate) struct EventInner {
    reset: EventReset,
    signaled: Mutex<bool>,
    cond: Condvar,
}

/// An event object. Cloning the handle shares the underlying event (like duplicating a handle)
#[derive(Clone, Debug)]
pub struct OwnedEventHandle(Arc<EventInner>);

impl OwnedEventHandle {
    /// Create an event without a name
    pub fn anonymous(reset: EventReset, state: EventInitialState) -> OwnedEventHandle {
        Self(Arc::new(EventInner {
            reset,
            signaled: Mutex::new(state == EventInitialState::Set),
            cond: Condvar::new(),
        }))
    }

    pub fn as_handle(&self) -> BorrowedEventHandle<'_> {
        BorrowedEventHandle(&self.0)
    }

    /// True if both handles refer to the same event object
    pub fn ptr_eq(&self, other: &OwnedEventHandle) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

/// Like [`OwnedEventHandle`] except borrowed
#[derive(Copy, Clone, Debug)]
pub struct BorrowedEventHandle<'handle>(&'handle EventInner);

macro_rules! impl_event {
    ($handle:ty) => {
        impl Event for $handle {
            fn set(&self) {
                self::set(&self.0)
            }

            fn reset(&self) {
                self::reset(&self.0)
            }

            fn is_set(&self) -> bool {
                *self.0.signaled.lock()
            }

            fn wait(&self, duration: Option<Duration>) -> Result<(), EventError> {
                self::wait(&self.0, duration)
            }
        }
    };
}

impl_event!(OwnedEventHandle);
impl_event!(BorrowedEventHandle<'_>);

#[inline(always)]
fn set(event: &EventInner) {
    let mut signaled = event.signaled.lock();
    *signaled = true;
    match event.reset {
        EventReset::Manual => {
            event.cond.notify_all();
        }
        EventReset::Automatic => {
            event.cond.notify_one();
        }
    }
}

#[inline(always)]
fn reset(event: &EventInner) {
    *event.signaled.lock() = false;
}

fn wait(event: &EventInner, duration: Option<Duration>) -> Result<(), EventError> {
    let mut signaled = event.signaled.lock();
    // A deadline past the range of Instant waits forever
    match duration.and_then(|duration| Instant::now().checked_add(duration)) {
        None => {
            while !*signaled {
                event.cond.wait(&mut signaled);
            }
        }
        Some(deadline) => {
            // Spurious wakeups must not extend the total wait
            while !*signaled {
                if event.cond.wait_until(&mut signaled, deadline).timed_out() && !*signaled {
                    return Err(EventError::Timeout);
                }
            }
        }
    }
    if event.reset == EventReset::Automatic {
        *signaled = false;
    }
    Ok(())
}
