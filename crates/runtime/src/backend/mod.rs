//! backend
//!
//! Every process uses exactly one threadpool backend. On first use the host is probed for a
//! native threadpool facility. If one is found every operation is forwarded to it, otherwise the
//! portable threadpool is used for the lifetime of the process.

pub mod native;
#[cfg(windows)]
mod windows;

pub use native::{NativeCallback, NativeEnvironment, NativeHandle, NativeThreadpool};

use crate::{
    common::{CallbackEnvironment, CleanupGroup, Threadpool},
    error::Result,
    pool::ThreadpoolOptions,
};
use std::{
    fmt,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, OnceLock,
    },
};
use tracing::{debug, info};

static NEXT_BACKEND_ID: AtomicUsize = AtomicUsize::new(1);

/// Which implementation services threadpool operations
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum BackendKind {
    /// Operations are forwarded to a host threadpool facility
    Native,
    /// Operations are serviced by this crate's worker threads
    Portable,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Native => write!(f, "native"),
            BackendKind::Portable => write!(f, "portable"),
        }
    }
}

/// Selection state of a [`BackendSelector`]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BackendState {
    Unprobed,
    Native,
    Portable,
}

struct BackendInner {
    id: usize,
    native: Option<Arc<dyn NativeThreadpool>>,
    default_pool: OnceLock<Threadpool>,
}

/// A threadpool backend. Objects created through one backend must not be mixed with objects of
/// another.
#[derive(Clone)]
pub struct Backend(Arc<BackendInner>);

impl Backend {
    /// A backend serviced by portable worker threads
    pub fn portable() -> Self {
        Self::new(None)
    }

    /// A backend forwarding every operation to `api`
    pub fn native(api: Arc<dyn NativeThreadpool>) -> Self {
        Self::new(Some(api))
    }

    fn new(native: Option<Arc<dyn NativeThreadpool>>) -> Self {
        Self(Arc::new(BackendInner {
            id: NEXT_BACKEND_ID.fetch_add(1, Ordering::Relaxed),
            native,
            default_pool: OnceLock::new(),
        }))
    }

    pub fn kind(&self) -> BackendKind {
        match self.0.native {
            Some(_) => BackendKind::Native,
            None => BackendKind::Portable,
        }
    }

    pub(crate) fn id(&self) -> usize {
        self.0.id
    }

    /// The default threadpool of this backend, created on first use
    pub fn default_pool(&self) -> &Threadpool {
        self.0.default_pool.get_or_init(|| {
            debug!(backend = %self.kind(), "creating default threadpool");
            match &self.0.native {
                Some(api) => Threadpool::native_default(self.id(), Arc::clone(api)),
                None => Threadpool::portable_default(self.id()),
            }
        })
    }

    /// Create a private threadpool
    pub fn create_pool(&self, options: ThreadpoolOptions) -> Result<Threadpool> {
        match &self.0.native {
            Some(api) => Threadpool::native(self.id(), Arc::clone(api), &options),
            None => Threadpool::portable(self.id(), options),
        }
    }

    /// Create a cleanup group
    pub fn create_cleanup_group(&self) -> Result<CleanupGroup> {
        match &self.0.native {
            Some(api) => CleanupGroup::native(self.id(), Arc::clone(api)),
            None => Ok(CleanupGroup::portable(self.id())),
        }
    }

    /// A callback environment targeting the default pool of this backend
    pub fn new_environment(&self) -> CallbackEnvironment {
        CallbackEnvironment::for_backend(self.clone())
    }

    pub(crate) fn native_api(&self) -> Option<&Arc<dyn NativeThreadpool>> {
        self.0.native.as_ref()
    }
}

impl fmt::Debug for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Backend")
            .field("id", &self.0.id)
            .field("kind", &self.kind())
            .finish()
    }
}

/// Detect a native threadpool facility
#[cfg_attr(test, mockall::automock)]
pub trait NativeProbe: Send + Sync {
    /// Returns the native facility if it is present and every operation is usable
    fn probe(&self) -> Option<Arc<dyn NativeThreadpool>>;
}

/// Probe the host operating system. On Windows the threadpool symbols are resolved from
/// kernel32. Other hosts have no native facility.
#[derive(Debug, Default, Copy, Clone)]
pub struct SystemProbe;

impl NativeProbe for SystemProbe {
    #[cfg(windows)]
    fn probe(&self) -> Option<Arc<dyn NativeThreadpool>> {
        windows::Kernel32Threadpool::load().map(|api| Arc::new(api) as Arc<dyn NativeThreadpool>)
    }

    #[cfg(not(windows))]
    fn probe(&self) -> Option<Arc<dyn NativeThreadpool>> {
        None
    }
}

/// Select a backend exactly once. Concurrent first users block until the single probe finishes
/// and all observe the same result.
pub struct BackendSelector<P> {
    probe: P,
    selected: OnceLock<Backend>,
}

impl<P: NativeProbe> BackendSelector<P> {
    pub const fn new(probe: P) -> Self {
        Self {
            probe,
            selected: OnceLock::new(),
        }
    }

    /// The selected backend, probing on first call
    pub fn get(&self) -> &Backend {
        self.selected.get_or_init(|| match self.probe.probe() {
            Some(api) => {
                info!(facility = api.name(), "using native threadpool backend");
                Backend::native(api)
            }
            None => {
                info!("no native threadpool facility, using portable threadpool backend");
                Backend::portable()
            }
        })
    }

    /// Install a backend without probing. Fails (returning the backend) if a backend was already
    /// selected.
    pub fn install(&self, backend: Backend) -> std::result::Result<(), Backend> {
        self.selected.set(backend)
    }

    pub fn state(&self) -> BackendState {
        match self.selected.get().map(Backend::kind) {
            None => BackendState::Unprobed,
            Some(BackendKind::Native) => BackendState::Native,
            Some(BackendKind::Portable) => BackendState::Portable,
        }
    }
}

static GLOBAL: BackendSelector<SystemProbe> = BackendSelector::new(SystemProbe);

/// The process wide backend
pub fn global() -> &'static Backend {
    GLOBAL.get()
}

/// Force the process wide backend. Must be called before any other threadpool operation, use
/// [`Backend::portable`] to opt out of the native facility.
pub fn init(backend: Backend) -> std::result::Result<(), Backend> {
    GLOBAL.install(backend)
}

/// Selection state of the process wide backend
pub fn state() -> BackendState {
    GLOBAL.state()
}
