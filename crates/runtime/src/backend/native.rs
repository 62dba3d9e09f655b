//! native
//!
//! The boundary to a host threadpool facility. When a native facility is selected, every
//! threadpool, work and cleanup group operation is forwarded through [`NativeThreadpool`].

use crate::common::CallbackFlags;
use std::{io, sync::Arc};

/// An opaque handle to a native threadpool object (pool, work or cleanup group)
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct NativeHandle(pub usize);

/// The callback a native work object runs. The portable layer wraps the caller's callback so the
/// native facility never needs to know about [`crate::common::CallbackInstance`]
pub type NativeCallback = Arc<dyn Fn() + Send + Sync>;

/// A callback environment expressed in native handles
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct NativeEnvironment {
    /// `None` targets the process default native pool
    pub pool: Option<NativeHandle>,
    pub cleanup_group: Option<NativeHandle>,
    pub flags: CallbackFlags,
}

/// A host threadpool facility.
///
/// Implementations must keep a work object's callback alive for as long as any submission of it
/// may still run. [`NativeThreadpool::close_work`] and
/// [`NativeThreadpool::close_cleanup_group_members`] may block until outstanding callbacks return.
#[cfg_attr(test, mockall::automock)]
pub trait NativeThreadpool: Send + Sync {
    /// A name for diagnostics
    fn name(&self) -> &'static str;

    /// Create a private threadpool
    fn create_pool(&self) -> io::Result<NativeHandle>;

    /// Set the minimum number of threads
    fn set_thread_minimum(&self, pool: NativeHandle, min: u32) -> io::Result<()>;

    /// Set the maximum number of threads
    fn set_thread_maximum(&self, pool: NativeHandle, max: u32);

    /// Set the stack reserve and commit sizes for the threads of a pool
    fn set_stack_information(
        &self,
        _pool: NativeHandle,
        _reserve: usize,
        _commit: usize,
    ) -> io::Result<()> {
        Err(io::ErrorKind::Unsupported.into())
    }

    /// Release a private threadpool
    fn close_pool(&self, pool: NativeHandle);

    fn create_cleanup_group(&self) -> io::Result<NativeHandle>;

    /// Release every member of the group, cancelling unstarted callbacks when `cancel_pending`,
    /// and wait for the rest
    fn close_cleanup_group_members(&self, group: NativeHandle, cancel_pending: bool);

    fn close_cleanup_group(&self, group: NativeHandle);

    fn create_work(
        &self,
        callback: NativeCallback,
        env: &NativeEnvironment,
    ) -> io::Result<NativeHandle>;

    fn submit_work(&self, work: NativeHandle);

    /// Wait for outstanding callbacks, optionally cancelling those that have not started
    fn wait_for_work_callbacks(&self, work: NativeHandle, cancel_pending: bool);

    fn close_work(&self, work: NativeHandle);

    /// Run a one shot callback without creating a work object
    fn try_submit_callback(
        &self,
        callback: NativeCallback,
        env: &NativeEnvironment,
    ) -> io::Result<()>;
}
