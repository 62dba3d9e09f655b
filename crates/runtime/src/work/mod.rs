//! Threadpool Work
//!
//! A work item binds a callback to a [`CallbackEnvironment`]. Every submission runs the callback
//! once on the environment's pool. Completion is tracked per item, so [`Work::wait`] returns as
//! soon as this item's submissions are done regardless of other work queued on the pool.

mod callback;
mod once;

pub use callback::try_submit_callback;
pub use once::{once, once_with_environment, WorkOnceFn, WorkOnceFuture, WorkOnceGuard};

use crate::{
    backend::{BackendKind, NativeCallback, NativeHandle, NativeThreadpool},
    common::{
        cleanup::GroupMember,
        environment::Finalizer,
        instance::run_guarded,
        CallbackEnvironment, CallbackFlags, CallbackInstance, WaitPending,
    },
    countdown::CountdownEvent,
    error::{Error, Result},
    pool::{PoolShared, Runnable, Task},
};
use parking_lot::Mutex;
use std::{
    fmt,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, OnceLock, Weak,
    },
    time::Duration,
};
use tracing::trace;

static NEXT_WORK_ID: AtomicUsize = AtomicUsize::new(1);

/// Identifies the queued submissions of one item, shared with one shot callbacks
pub(crate) fn next_key() -> usize {
    NEXT_WORK_ID.fetch_add(1, Ordering::Relaxed)
}

/// The callback run for every submission of a work item
pub type WorkCallback = Arc<dyn Fn(&CallbackInstance<'_>) + Send + Sync>;

/// An owned handle to a threadpool work item
///
/// Dropping (or [`Work::close`]) releases the handle and leaves the cleanup group. Submissions
/// which are queued or running are not cancelled.
pub struct Work {
    inner: WorkKind,
}

enum WorkKind {
    Portable(Arc<PortableWork>),
    Native(Arc<NativeWork>),
}

impl Work {
    /// Create a work item for the default threadpool
    pub fn new<F>(callback: F) -> Result<Self>
    where
        F: Fn(&CallbackInstance<'_>) + Send + Sync + 'static,
    {
        Self::with_environment(&CallbackEnvironment::new(), callback)
    }

    /// Create a work item with a callback environment. The environment is copied, later changes
    /// to `env` do not affect this item
    pub fn with_environment<F>(env: &CallbackEnvironment, callback: F) -> Result<Self>
    where
        F: Fn(&CallbackInstance<'_>) + Send + Sync + 'static,
    {
        Self::from_callback(env.clone(), Arc::new(callback))
    }

    /// Create a work item whose callback receives a shared context
    pub fn with_context<C, F>(
        env: Option<&CallbackEnvironment>,
        context: Arc<C>,
        callback: F,
    ) -> Result<Self>
    where
        C: Send + Sync + 'static,
        F: Fn(&CallbackInstance<'_>, &C) + Send + Sync + 'static,
    {
        let env = env.cloned().unwrap_or_default();
        Self::from_callback(env, Arc::new(move |instance| callback(instance, &context)))
    }

    fn from_callback(env: CallbackEnvironment, callback: WorkCallback) -> Result<Self> {
        let key = next_key();
        let inner = match env.backend_kind()? {
            BackendKind::Portable => WorkKind::Portable(Arc::new(PortableWork {
                key,
                callback,
                env,
                pool: OnceLock::new(),
                outstanding: CountdownEvent::new(0),
            })),
            BackendKind::Native => WorkKind::Native(Arc::new(NativeWork {
                key,
                api: env.native_api()?,
                callback,
                env,
                handle: Mutex::new(None),
            })),
        };
        trace!(key, "work created");
        Ok(Self { inner })
    }

    pub fn backend(&self) -> BackendKind {
        match self.inner {
            WorkKind::Portable(_) => BackendKind::Portable,
            WorkKind::Native(_) => BackendKind::Native,
        }
    }

    /// Submit the work to its threadpool. May be called any number of times, including from
    /// inside a running callback. On error nothing was queued.
    pub fn submit(&self) -> Result<()> {
        match &self.inner {
            WorkKind::Portable(work) => work.submit(),
            WorkKind::Native(work) => work.submit(),
        }
    }

    /// Block until every submission of this item has returned. With [`WaitPending::Cancel`]
    /// submissions which have not started are cancelled first.
    pub fn wait(&self, pending: WaitPending) -> Result<()> {
        match &self.inner {
            WorkKind::Portable(work) => {
                work.cancel_if(pending);
                work.outstanding.wait(None).map_err(Error::from)
            }
            WorkKind::Native(work) => {
                work.wait(pending);
                Ok(())
            }
        }
    }

    /// [`Work::wait`] bounded by `timeout`. A timeout resolves with [`Error::Event`] and
    /// leaves every submission in place. Portable backend only.
    pub fn wait_timeout(&self, pending: WaitPending, timeout: Duration) -> Result<()> {
        match &self.inner {
            WorkKind::Portable(work) => {
                work.cancel_if(pending);
                work.outstanding.wait(Some(timeout)).map_err(Error::from)
            }
            WorkKind::Native(_) => Err(Error::not_supported("wait_timeout", BackendKind::Native)),
        }
    }

    /// Number of submissions of this item queued or running. Portable backend only.
    pub fn outstanding(&self) -> Result<usize> {
        match &self.inner {
            WorkKind::Portable(work) => Ok(work.outstanding.count()),
            WorkKind::Native(_) => Err(Error::not_supported("outstanding", BackendKind::Native)),
        }
    }

    /// Release the work handle
    pub fn close(self) {
        drop(self)
    }
}

impl Drop for Work {
    fn drop(&mut self) {
        match &self.inner {
            WorkKind::Portable(work) => work.leave_group(),
            WorkKind::Native(work) => work.close(),
        }
    }
}

impl fmt::Debug for Work {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (key, env) = match &self.inner {
            WorkKind::Portable(work) => (work.key, &work.env),
            WorkKind::Native(work) => (work.key, &work.env),
        };
        f.debug_struct("Work")
            .field("key", &key)
            .field("backend", &self.backend())
            .field("env", env)
            .finish()
    }
}

/// A work item serviced by a portable threadpool
struct PortableWork {
    key: usize,
    callback: WorkCallback,
    env: CallbackEnvironment,
    /// Resolved on first submission
    pool: OnceLock<Arc<PoolShared>>,
    /// One count per queued or running submission
    outstanding: CountdownEvent,
}

impl PortableWork {
    fn pool(&self) -> Result<&Arc<PoolShared>> {
        if let Some(pool) = self.pool.get() {
            return Ok(pool);
        }
        let resolved = self.env.resolve_pool();
        let shared = resolved.portable()?;
        Ok(self.pool.get_or_init(|| Arc::clone(shared)))
    }

    fn submit(self: &Arc<Self>) -> Result<()> {
        let pool = self.pool()?;
        let task = Task::new(self.key, Arc::clone(self) as Arc<dyn Runnable>);
        match self.env.cleanup_group() {
            Some(group) => {
                let member: Weak<dyn GroupMember> = Arc::downgrade(self) as Weak<dyn GroupMember>;
                group.associate(self.key, member, || pool.enqueue(task))
            }
            None => pool.enqueue(task),
        }
    }

    fn cancel_if(&self, pending: WaitPending) {
        if pending == WaitPending::Cancel {
            self.cancel_pending();
        }
    }

    fn leave_group(&self) {
        if let Some(group) = self.env.cleanup_group() {
            group.remove(self.key);
        }
    }
}

impl Runnable for PortableWork {
    fn enqueued(&self) {
        self.outstanding.add_count(1);
    }

    fn run(&self, instance: &CallbackInstance<'_>) {
        (self.callback)(instance)
    }

    fn completed(&self) {
        self.outstanding.decrement(1);
    }

    fn cancelled(&self) {
        self.outstanding.decrement(1);
    }

    fn runs_long(&self) -> bool {
        self.env.flags().contains(CallbackFlags::LONG_FUNCTION)
    }
}

impl GroupMember for PortableWork {
    fn cancel_pending(&self) {
        if let Some(pool) = self.pool.get() {
            pool.cancel(self.key);
        }
    }

    fn wait_callbacks(&self) {
        // Waits without a timeout cannot time out
        let _ = self.outstanding.wait(None);
    }

    fn finalizer(&self) -> Option<Finalizer> {
        self.env.finalizer().cloned()
    }
}

/// A work item forwarded to the native threadpool. The native work object is created on first
/// submission and closed with the handle or by its cleanup group
struct NativeWork {
    key: usize,
    api: Arc<dyn NativeThreadpool>,
    callback: WorkCallback,
    env: CallbackEnvironment,
    handle: Mutex<Option<NativeHandle>>,
}

impl NativeWork {
    fn trampoline(&self) -> NativeCallback {
        let callback = Arc::clone(&self.callback);
        Arc::new(move || {
            let instance = CallbackInstance::detached();
            run_guarded(|| callback(&instance));
            instance.complete();
        })
    }

    fn submit_native(&self) -> Result<()> {
        self.env.resolve_pool().ensure_open()?;
        let mut handle = self.handle.lock();
        let work = match *handle {
            Some(work) => work,
            None => {
                let work = self
                    .api
                    .create_work(self.trampoline(), &self.env.native_environment())?;
                *handle = Some(work);
                work
            }
        };
        self.api.submit_work(work);
        Ok(())
    }

    fn submit(self: &Arc<Self>) -> Result<()> {
        match self.env.cleanup_group() {
            Some(group) => {
                let member: Weak<dyn GroupMember> = Arc::downgrade(self) as Weak<dyn GroupMember>;
                group.associate(self.key, member, || self.submit_native())
            }
            None => self.submit_native(),
        }
    }

    fn wait(&self, pending: WaitPending) {
        let work = *self.handle.lock();
        if let Some(work) = work {
            self.api
                .wait_for_work_callbacks(work, pending == WaitPending::Cancel);
        }
    }

    fn close(&self) {
        if let Some(group) = self.env.cleanup_group() {
            group.remove(self.key);
        }
        let work = self.handle.lock().take();
        if let Some(work) = work {
            self.api.close_work(work);
        }
    }
}

impl GroupMember for NativeWork {
    fn cancel_pending(&self) {
        let work = *self.handle.lock();
        if let Some(work) = work {
            self.api.wait_for_work_callbacks(work, true);
        }
    }

    fn wait_callbacks(&self) {
        self.wait(WaitPending::Wait);
    }

    fn release_native(&self) {
        self.handle.lock().take();
    }

    fn finalizer(&self) -> Option<Finalizer> {
        self.env.finalizer().cloned()
    }
}
