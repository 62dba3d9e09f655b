//! once
//!
//! Run a closure exactly once on a threadpool and resolve its output through a future

use super::Work;
use crate::{
    common::{CallbackEnvironment, CallbackInstance, WaitPending},
    error::Result,
};
use futures::task::AtomicWaker;
use parking_lot::Mutex;
use std::{
    future::Future,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

/// Submit `workfn` to the default threadpool
pub fn once<F, O>(workfn: F) -> Result<WorkOnceGuard<F>>
where
    F: FnOnce(&CallbackInstance<'_>) -> O + Send + 'static,
    O: Send + 'static,
{
    once_with_environment(&CallbackEnvironment::new(), workfn)
}

/// Submit `workfn` with a callback environment
pub fn once_with_environment<F, O>(
    env: &CallbackEnvironment,
    workfn: F,
) -> Result<WorkOnceGuard<F>>
where
    F: FnOnce(&CallbackInstance<'_>) -> O + Send + 'static,
    O: Send + 'static,
{
    let oneshot = Arc::new(Oneshot::new(workfn));
    let shared = Arc::clone(&oneshot);
    let work = Work::with_environment(env, move |instance| shared.run(instance))?;
    work.submit()?;
    Ok(WorkOnceGuard { work, oneshot })
}

/// A WorkOnceFn is called once by a threadpool work
pub trait WorkOnceFn {
    type Output;
    fn work_once(self, instance: &CallbackInstance<'_>) -> Self::Output;
}

impl<F, O> WorkOnceFn for F
where
    F: FnOnce(&CallbackInstance<'_>) -> O,
{
    type Output = O;
    fn work_once(self, instance: &CallbackInstance<'_>) -> Self::Output {
        (self)(instance)
    }
}

/// Returned by [`once`]. The work can not be submitted again
pub struct WorkOnceGuard<W: WorkOnceFn> {
    work: Work,
    oneshot: Arc<Oneshot<W>>,
}

impl<W: WorkOnceFn> WorkOnceGuard<W> {
    /// Wait for the worker to finish its work. Additionally, you may specify to cancel the
    /// callback if it has not started
    pub fn wait(&self, pending: WaitPending) -> Result<&Self> {
        self.work.wait(pending).map(|_| self)
    }

    /// Cancel the callback if it has not started, wait for it otherwise. If the callback never
    /// ran the future resolves with `result`
    pub fn cancel_with(&self, result: W::Output) -> Result<&Self> {
        self.wait(WaitPending::Cancel)?;
        if self.oneshot.take().is_some() {
            self.oneshot.resolve(result);
        }
        Ok(self)
    }

    pub fn future(&self) -> WorkOnceFuture<W> {
        WorkOnceFuture {
            oneshot: Arc::clone(&self.oneshot),
        }
    }
}

/// Resolves with the output of the callback (or the value given to
/// [`WorkOnceGuard::cancel_with`])
pub struct WorkOnceFuture<W: WorkOnceFn> {
    oneshot: Arc<Oneshot<W>>,
}

impl<W: WorkOnceFn> Future for WorkOnceFuture<W> {
    type Output = W::Output;
    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.oneshot.waker.register(cx.waker());
        match self.oneshot.result.lock().take() {
            Some(result) => Poll::Ready(result),
            None => Poll::Pending,
        }
    }
}

/// Shared between the callback, the guard and the future
struct Oneshot<W: WorkOnceFn> {
    inner: Mutex<Option<W>>,
    result: Mutex<Option<W::Output>>,
    waker: AtomicWaker,
}

impl<W: WorkOnceFn> Oneshot<W> {
    fn new(work: W) -> Self {
        Self {
            inner: Mutex::new(Some(work)),
            result: Mutex::new(None),
            waker: AtomicWaker::new(),
        }
    }

    fn take(&self) -> Option<W> {
        self.inner.lock().take()
    }

    fn run(&self, instance: &CallbackInstance<'_>) {
        if let Some(work) = self.take() {
            self.resolve(work.work_once(instance));
        }
    }

    fn resolve(&self, result: W::Output) {
        *self.result.lock() = Some(result);
        self.waker.wake();
    }
}
