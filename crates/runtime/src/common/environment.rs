//! environment

use crate::{
    backend::{self, Backend, BackendKind, NativeEnvironment, NativeHandle, NativeThreadpool},
    common::cleanup::{CleanupGroup, GroupShared},
    error::{Error, Result},
    pool::{PoolShared, ThreadpoolOptions},
};
use bitflags::bitflags;
use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use tracing::debug;

/// A private native threadpool, or the process default native pool when `handle` is None
pub(crate) struct NativePool {
    pub(crate) api: Arc<dyn NativeThreadpool>,
    pub(crate) handle: Option<NativeHandle>,
    closed: AtomicBool,
}

pub(crate) enum PoolKind {
    Portable(Arc<PoolShared>),
    Native(NativePool),
}

/// Pool state referenced by owners and callback environments
pub(crate) struct PoolRef {
    pub(crate) backend: usize,
    pub(crate) kind: PoolKind,
}

impl PoolRef {
    pub(crate) fn backend_kind(&self) -> BackendKind {
        match self.kind {
            PoolKind::Portable(_) => BackendKind::Portable,
            PoolKind::Native(_) => BackendKind::Native,
        }
    }

    /// The portable engine, or [`Error::BackendMismatch`] for native pools
    pub(crate) fn portable(&self) -> Result<&Arc<PoolShared>> {
        match &self.kind {
            PoolKind::Portable(shared) => Ok(shared),
            PoolKind::Native(_) => Err(Error::BackendMismatch),
        }
    }

    /// Native pools are not told about submissions after they are closed
    pub(crate) fn ensure_open(&self) -> Result<()> {
        match &self.kind {
            PoolKind::Native(native) if native.closed.load(Ordering::Acquire) => Err(Error::Closed),
            _ => Ok(()),
        }
    }

    fn close(&self) {
        match &self.kind {
            PoolKind::Portable(shared) => shared.close(),
            PoolKind::Native(native) => {
                if let Some(handle) = native.handle {
                    if !native.closed.swap(true, Ordering::AcqRel) {
                        native.api.close_pool(handle);
                    }
                }
            }
        }
    }
}

/// Threadpool
///
/// Either the default threadpool of a backend (see [`Threadpool::default_pool`]) or a private
/// threadpool. A private threadpool is closed when it is dropped: queued callbacks are drained
/// and every worker is joined.
pub struct Threadpool {
    inner: Arc<PoolRef>,
    /// Default pools are never closed by their handle
    private: bool,
}

impl Threadpool {
    /// Create a threadpool with the process wide backend
    pub fn new() -> Result<Self> {
        Self::with_options(ThreadpoolOptions::default())
    }

    /// Create a threadpool with the process wide backend
    pub fn with_options(options: ThreadpoolOptions) -> Result<Self> {
        backend::global().create_pool(options)
    }

    /// The process wide default threadpool. Created on first use, every caller sees the same
    /// instance.
    pub fn default_pool() -> &'static Threadpool {
        backend::global().default_pool()
    }

    pub(crate) fn portable(backend: usize, options: ThreadpoolOptions) -> Result<Self> {
        let min = options.min_threads;
        let shared = PoolShared::new(options);
        let pool = Self::from_kind(backend, PoolKind::Portable(Arc::clone(&shared)), true);
        shared.set_min(min)?;
        Ok(pool)
    }

    pub(crate) fn portable_default(backend: usize) -> Self {
        let options = ThreadpoolOptions {
            name: String::from("threadpool-default"),
            ..Default::default()
        };
        Self::from_kind(backend, PoolKind::Portable(PoolShared::new(options)), false)
    }

    pub(crate) fn native(
        backend: usize,
        api: Arc<dyn NativeThreadpool>,
        options: &ThreadpoolOptions,
    ) -> Result<Self> {
        let handle = api.create_pool()?;
        let pool = Self::from_kind(
            backend,
            PoolKind::Native(NativePool {
                api,
                handle: Some(handle),
                closed: AtomicBool::new(false),
            }),
            true,
        );
        pool.max_threads(u32::try_from(options.max_threads).unwrap_or(u32::MAX));
        if options.min_threads > 0 {
            pool.min_threads(u32::try_from(options.min_threads).unwrap_or(u32::MAX))?;
        }
        if let Some(size) = options.stack_size {
            pool.set_stack_size(size, 0)?;
        }
        Ok(pool)
    }

    pub(crate) fn native_default(backend: usize, api: Arc<dyn NativeThreadpool>) -> Self {
        let kind = PoolKind::Native(NativePool {
            api,
            handle: None,
            closed: AtomicBool::new(false),
        });
        Self::from_kind(backend, kind, false)
    }

    fn from_kind(backend: usize, kind: PoolKind, private: bool) -> Self {
        Self {
            inner: Arc::new(PoolRef { backend, kind }),
            private,
        }
    }

    pub(crate) fn shared(&self) -> &Arc<PoolRef> {
        &self.inner
    }

    /// Which backend services this pool
    pub fn backend(&self) -> BackendKind {
        self.inner.backend_kind()
    }

    /// Set the stack sizes for the threads of this pool. Portable pools only honor `reserve`,
    /// and only for workers spawned afterwards.
    pub fn set_stack_size(&self, reserve: usize, commit: usize) -> Result<&Self> {
        match &self.inner.kind {
            PoolKind::Portable(shared) => {
                shared.set_stack_size(reserve);
                Ok(self)
            }
            PoolKind::Native(native) => {
                let handle = native_private(native, "set_stack_size")?;
                match native.api.set_stack_information(handle, reserve, commit) {
                    Ok(()) => Ok(self),
                    Err(e) if e.kind() == std::io::ErrorKind::Unsupported => {
                        Err(Error::not_supported("set_stack_size", BackendKind::Native))
                    }
                    Err(e) => Err(e.into()),
                }
            }
        }
    }

    /// Set the minimum number of threads. Portable pools start the missing workers immediately
    pub fn min_threads(&self, min: u32) -> Result<&Self> {
        match &self.inner.kind {
            PoolKind::Portable(shared) => shared.set_min(min as usize).map(|_| self),
            PoolKind::Native(native) => {
                let handle = native_private(native, "min_threads")?;
                native.api.set_thread_minimum(handle, min)?;
                Ok(self)
            }
        }
    }

    /// Set the maximum number of threads
    pub fn max_threads(&self, max: u32) -> &Self {
        match &self.inner.kind {
            PoolKind::Portable(shared) => shared.set_max(max as usize),
            PoolKind::Native(native) => match native.handle {
                Some(handle) => native.api.set_thread_maximum(handle, max),
                None => debug!("ignoring max_threads on the native default threadpool"),
            },
        }
        self
    }

    /// Helper function to create a new callback environment associated with this threadpool
    pub fn new_environment(&self) -> CallbackEnvironment {
        CallbackEnvironment {
            pool: Some(Arc::clone(&self.inner)),
            ..Default::default()
        }
    }

    /// Block until every submission to this pool has completed or was cancelled. A timeout
    /// resolves with [`Error::Event`]. Portable backend only.
    pub fn wait_idle(&self, timeout: Option<Duration>) -> Result<()> {
        match &self.inner.kind {
            PoolKind::Portable(shared) => shared.wait_idle(timeout).map_err(Error::from),
            PoolKind::Native(_) => Err(Error::not_supported("wait_idle", BackendKind::Native)),
        }
    }

    /// Number of submissions queued or running. Portable backend only.
    pub fn outstanding(&self) -> Result<usize> {
        match &self.inner.kind {
            PoolKind::Portable(shared) => Ok(shared.outstanding()),
            PoolKind::Native(_) => Err(Error::not_supported("outstanding", BackendKind::Native)),
        }
    }

    /// Close the threadpool. Queued callbacks still run. Blocks until every worker has exited
    pub fn close(self) {
        drop(self)
    }
}

impl Drop for Threadpool {
    fn drop(&mut self) {
        if self.private {
            self.inner.close();
        }
    }
}

impl fmt::Debug for Threadpool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Threadpool")
            .field("backend", &self.backend())
            .field("private", &self.private)
            .finish()
    }
}

fn native_private(native: &NativePool, operation: &'static str) -> Result<NativeHandle> {
    native
        .handle
        .ok_or_else(|| Error::not_supported(operation, BackendKind::Native))
}

bitflags! {
    /// Callback environment options
    #[repr(transparent)]
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct CallbackFlags: u32 {
        /// Callbacks may run long. The pool keeps another worker available for the backlog
        const LONG_FUNCTION = 0x1;
        /// Callbacks should run on a persistent thread. Only honored by native backends
        const PERSISTENT = 0x2;
    }
}

/// Invoked once for a work item when its cleanup group releases it
pub type Finalizer = Arc<dyn Fn() + Send + Sync>;

/// A CallbackEnvironment
///
/// Binds work to a pool, an optional cleanup group and an optional finalizer. Work items take a
/// snapshot of the environment when they are created, later changes do not affect them.
#[derive(Clone, Default)]
pub struct CallbackEnvironment {
    /// Resolves the default pool when no pool is set. `None` is the process wide backend
    backend: Option<Backend>,
    pool: Option<Arc<PoolRef>>,
    cleanup_group: Option<Arc<GroupShared>>,
    finalizer: Option<Finalizer>,
    flags: CallbackFlags,
}

impl CallbackEnvironment {
    /// Initialize a default CallbackEnvironment. If no pool is set, then the default threadpool
    /// is used.
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn for_backend(backend: Backend) -> Self {
        Self {
            backend: Some(backend),
            ..Default::default()
        }
    }

    /// Set the threadpool callback pool
    pub fn with_pool(mut self, pool: &Threadpool) -> Self {
        self.pool = Some(Arc::clone(pool.shared()));
        self
    }

    /// Associates the specified cleanup group with this callback environment
    pub fn with_cleanup_group(mut self, group: &CleanupGroup) -> Self {
        self.cleanup_group = Some(Arc::clone(group.shared()));
        self
    }

    /// Set a finalizer invoked once per work item when the cleanup group releases the item
    pub fn with_finalizer<F>(mut self, finalizer: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.finalizer = Some(Arc::new(finalizer));
        self
    }

    pub fn with_flags(mut self, flags: CallbackFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Indicate that callbacks may run long
    pub fn runs_long(mut self) -> Self {
        self.flags |= CallbackFlags::LONG_FUNCTION;
        self
    }

    pub fn flags(&self) -> CallbackFlags {
        self.flags
    }

    fn backend(&self) -> &Backend {
        self.backend.as_ref().unwrap_or_else(|| backend::global())
    }

    /// Which backend services work created with this environment. Fails if the pool, cleanup
    /// group and backend of this environment were not all created by the same backend
    pub(crate) fn backend_kind(&self) -> Result<BackendKind> {
        let (id, kind) = match &self.pool {
            Some(pool) => (pool.backend, pool.backend_kind()),
            None => (self.backend().id(), self.backend().kind()),
        };
        if self.backend.as_ref().is_some_and(|backend| backend.id() != id) {
            return Err(Error::BackendMismatch);
        }
        if self.cleanup_group.as_ref().is_some_and(|group| group.backend != id) {
            return Err(Error::BackendMismatch);
        }
        Ok(kind)
    }

    /// The target pool. Resolved on every call so the default pool is only created once work is
    /// actually submitted
    pub(crate) fn resolve_pool(&self) -> Arc<PoolRef> {
        match &self.pool {
            Some(pool) => Arc::clone(pool),
            None => Arc::clone(self.backend().default_pool().shared()),
        }
    }

    /// The native facility servicing this environment
    pub(crate) fn native_api(&self) -> Result<Arc<dyn NativeThreadpool>> {
        let api = match self.pool.as_ref().map(|pool| &pool.kind) {
            Some(PoolKind::Native(native)) => Some(&native.api),
            Some(PoolKind::Portable(_)) => None,
            None => self.backend().native_api(),
        };
        api.cloned().ok_or(Error::BackendMismatch)
    }

    pub(crate) fn cleanup_group(&self) -> Option<&Arc<GroupShared>> {
        self.cleanup_group.as_ref()
    }

    pub(crate) fn finalizer(&self) -> Option<&Finalizer> {
        self.finalizer.as_ref()
    }

    /// Express this environment in native handles, resolving the default pool
    pub(crate) fn native_environment(&self) -> NativeEnvironment {
        let pool = self.resolve_pool();
        NativeEnvironment {
            pool: match &pool.kind {
                PoolKind::Native(native) => native.handle,
                PoolKind::Portable(_) => None,
            },
            cleanup_group: self.cleanup_group.as_ref().and_then(|group| group.native_handle()),
            flags: self.flags,
        }
    }
}

impl fmt::Debug for CallbackEnvironment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackEnvironment")
            .field("backend", &self.backend)
            .field("pool", &self.pool.as_ref().map(|pool| pool.backend_kind()))
            .field("cleanup_group", &self.cleanup_group.is_some())
            .field("finalizer", &self.finalizer.is_some())
            .field("flags", &self.flags)
            .finish()
    }
}
