//! cleanup

use super::{environment::Finalizer, WaitPending};
use crate::{
    backend::{self, NativeHandle, NativeThreadpool},
    error::{Error, Result},
};
use parking_lot::Mutex;
use std::{
    collections::HashMap,
    fmt, mem,
    sync::{Arc, Weak},
};
use tracing::{debug, trace};

/// Something tracked by a cleanup group
pub(crate) trait GroupMember: Send + Sync {
    /// Remove queued submissions which have not started
    fn cancel_pending(&self);
    /// Block until every outstanding submission has returned
    fn wait_callbacks(&self);
    /// The native group closed this member's native object
    fn release_native(&self) {}
    fn finalizer(&self) -> Option<Finalizer>;
}

#[derive(Default)]
struct Members {
    closed: bool,
    items: HashMap<usize, Weak<dyn GroupMember>>,
}

/// Cleanup group state shared with callback environments
pub(crate) struct GroupShared {
    pub(crate) backend: usize,
    members: Mutex<Members>,
    native: Option<(Arc<dyn NativeThreadpool>, NativeHandle)>,
}

impl GroupShared {
    pub(crate) fn native_handle(&self) -> Option<NativeHandle> {
        self.native.as_ref().map(|(_, handle)| *handle)
    }

    /// Register `member` and run `enqueue` in one critical section. A concurrent close either
    /// sees the member and its queued submission, or neither. Membership is rolled back if
    /// `enqueue` fails.
    pub(crate) fn associate<F>(&self, key: usize, member: Weak<dyn GroupMember>, enqueue: F) -> Result<()>
    where
        F: FnOnce() -> Result<()>,
    {
        let mut members = self.members.lock();
        if members.closed {
            return Err(Error::Closed);
        }
        let inserted = members.items.insert(key, member).is_none();
        let result = enqueue();
        if result.is_err() && inserted {
            members.items.remove(&key);
        }
        result
    }

    pub(crate) fn remove(&self, key: usize) {
        if self.members.lock().items.remove(&key).is_some() {
            trace!(key, "removed cleanup group member");
        }
    }

    /// Release every member. Returns false if the group was already closed
    fn drain(&self, pending: WaitPending, close: bool) -> bool {
        let mut members = self.members.lock();
        if members.closed {
            return false;
        }
        members.closed = close;
        let drained: Vec<Arc<dyn GroupMember>> = mem::take(&mut members.items)
            .into_values()
            .filter_map(|member| member.upgrade())
            .collect();
        debug!(members = drained.len(), ?pending, "closing cleanup group members");

        match &self.native {
            Some((api, handle)) => {
                // The native group closes its members' objects, forget them first
                for member in &drained {
                    member.release_native();
                }
                api.close_cleanup_group_members(*handle, pending == WaitPending::Cancel);
                drop(members);
            }
            None => {
                if pending == WaitPending::Cancel {
                    for member in &drained {
                        member.cancel_pending();
                    }
                }
                drop(members);
                for member in &drained {
                    member.wait_callbacks();
                }
            }
        }

        for finalizer in drained.iter().filter_map(|member| member.finalizer()) {
            finalizer();
        }
        true
    }

    fn shutdown(&self) {
        if self.drain(WaitPending::Cancel, true) {
            if let Some((api, handle)) = &self.native {
                api.close_cleanup_group(*handle);
            }
        }
    }
}

/// A cleanup group
///
/// Work submitted with an environment naming this group becomes a member. Closing the group
/// cancels or waits for every member, then invokes each member environment's finalizer.
/// Dropping the group closes its members with [`WaitPending::Cancel`].
pub struct CleanupGroup {
    inner: Arc<GroupShared>,
}

impl CleanupGroup {
    /// Create a cleanup group with the process wide backend
    pub fn new() -> Result<Self> {
        backend::global().create_cleanup_group()
    }

    pub(crate) fn portable(backend: usize) -> Self {
        Self::from_parts(backend, None)
    }

    pub(crate) fn native(backend: usize, api: Arc<dyn NativeThreadpool>) -> Result<Self> {
        let handle = api.create_cleanup_group()?;
        Ok(Self::from_parts(backend, Some((api, handle))))
    }

    fn from_parts(backend: usize, native: Option<(Arc<dyn NativeThreadpool>, NativeHandle)>) -> Self {
        Self {
            inner: Arc::new(GroupShared {
                backend,
                members: Mutex::new(Members::default()),
                native,
            }),
        }
    }

    pub(crate) fn shared(&self) -> &Arc<GroupShared> {
        &self.inner
    }

    /// Number of members which have not been released
    pub fn len(&self) -> usize {
        self.inner.members.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Release every current member. With [`WaitPending::Cancel`] submissions that have not
    /// started are cancelled, the rest are waited for. The group stays usable.
    pub fn close_members(&self, pending: WaitPending) -> &Self {
        self.inner.drain(pending, false);
        self
    }

    /// Release every member and close the group
    pub fn close(self, pending: WaitPending) {
        self.close_with(pending, || {})
    }

    /// Release every member, invoke `finalizer` once all members are resolved and close the
    /// group. Submissions naming a closed group fail with [`Error::Closed`].
    pub fn close_with<F: FnOnce()>(self, pending: WaitPending, finalizer: F) {
        self.inner.drain(pending, true);
        finalizer();
        if let Some((api, handle)) = &self.inner.native {
            api.close_cleanup_group(*handle);
        }
        // Already closed, drop has nothing left to do
    }
}

impl Drop for CleanupGroup {
    fn drop(&mut self) {
        self.inner.shutdown();
    }
}

impl fmt::Debug for CleanupGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CleanupGroup")
            .field("backend", &self.inner.backend)
            .field("native", &self.inner.native_handle())
            .field("members", &self.len())
            .finish()
    }
}
