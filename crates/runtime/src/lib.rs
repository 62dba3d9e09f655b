//! threadpool
//!
//! Schedule callbacks on a threadpool. The host's native threadpool is used when the process
//! has one, otherwise the portable threadpool of this crate services every operation.

#[cfg(test)]
mod tests;

pub mod backend;
pub mod common;
pub mod countdown;
pub mod error;
pub mod event;
pub mod pool;
pub mod work;

pub use common::{
    CallbackEnvironment, CallbackFlags, CallbackInstance, CleanupGroup, Threadpool, WaitPending,
};
pub use error::{Error, Result};
pub use pool::ThreadpoolOptions;
pub use work::Work;
