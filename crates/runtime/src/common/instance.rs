//! instance

use crate::{
    backend::BackendKind,
    error::{Error, Result},
    event::{Event, OwnedEventHandle},
    pool::PoolShared,
};
use std::{
    cell::RefCell,
    panic::{self, AssertUnwindSafe},
    sync::Arc,
};
use tracing::error;

/// A CallbackInstance is passed to every threadpool callback. It is only valid for the duration
/// of the callback.
pub struct CallbackInstance<'pool> {
    /// The portable pool running this callback. Native callbacks have no portable pool
    pool: Option<&'pool Arc<PoolShared>>,
    /// Events to set once the callback returns
    on_return: RefCell<Vec<OwnedEventHandle>>,
}

impl<'pool> CallbackInstance<'pool> {
    pub(crate) fn portable(pool: &'pool Arc<PoolShared>) -> Self {
        Self {
            pool: Some(pool),
            on_return: RefCell::new(Vec::new()),
        }
    }

    pub(crate) fn detached() -> CallbackInstance<'static> {
        CallbackInstance {
            pool: None,
            on_return: RefCell::new(Vec::new()),
        }
    }

    /// Provide a hint to the threadpool that this callback may run long. The threadpool makes
    /// another worker available to service the queue. Fails with [`Error::Busy`] if the pool is
    /// already running its maximum number of workers.
    pub fn callback_may_run_long(&self) -> Result<&Self> {
        match self.pool {
            Some(pool) => pool.make_worker_available().map(|_| self),
            None => Err(Error::not_supported(
                "callback_may_run_long",
                BackendKind::Native,
            )),
        }
    }

    /// Set an event when the callback returns
    pub fn set_event_when_callback_returns(&self, event: &OwnedEventHandle) -> &Self {
        self.on_return.borrow_mut().push(event.clone());
        self
    }

    /// The callback returned, run the deferred actions
    pub(crate) fn complete(self) {
        for event in self.on_return.into_inner() {
            event.set();
        }
    }
}

/// Run a callback, logging instead of unwinding if it panics. Unwinding must never escape a
/// worker or cross a native callback boundary.
pub(crate) fn run_guarded<F: FnOnce()>(f: F) {
    if panic::catch_unwind(AssertUnwindSafe(f)).is_err() {
        error!("threadpool callback panicked");
    }
}
