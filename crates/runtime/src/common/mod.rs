//! common

pub mod cleanup;
pub mod environment;
pub mod instance;

pub use cleanup::CleanupGroup;
pub use environment::{CallbackEnvironment, CallbackFlags, Finalizer, Threadpool};
pub use instance::CallbackInstance;

/// Wait for pending threadpool callbacks, or cancel pending threadpool callbacks
#[repr(u32)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum WaitPending {
    /// Wait for pending threadpool callbacks
    Wait = 0,
    /// Cancel pending threadpool callbacks
    Cancel = 1,
}
