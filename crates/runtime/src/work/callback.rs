//! callback

use super::next_key;
use crate::{
    backend::BackendKind,
    common::{
        cleanup::{GroupMember, GroupShared},
        environment::Finalizer,
        instance::run_guarded,
        CallbackEnvironment, CallbackFlags, CallbackInstance,
    },
    countdown::CountdownEvent,
    error::Result,
    pool::{PoolShared, Runnable, Task},
};
use parking_lot::Mutex;
use std::sync::{Arc, Weak};

type SimpleFn = Box<dyn FnOnce(&CallbackInstance<'_>) + Send>;

/// Run `callback` once on a threadpool without creating a work handle. With a cleanup group in
/// the environment the callback is a member until it returns.
pub fn try_submit_callback<F>(env: Option<&CallbackEnvironment>, callback: F) -> Result<()>
where
    F: FnOnce(&CallbackInstance<'_>) + Send + 'static,
{
    let env = env.cloned().unwrap_or_default();
    let callback: SimpleFn = Box::new(callback);
    match env.backend_kind()? {
        BackendKind::Portable => {
            let pool = Arc::clone(env.resolve_pool().portable()?);
            let simple = Arc::new(SimpleCallback {
                key: next_key(),
                callback: Mutex::new(Some(callback)),
                pool,
                outstanding: CountdownEvent::new(0),
                env,
            });
            simple.submit()
        }
        BackendKind::Native => {
            let api = env.native_api()?;
            env.resolve_pool().ensure_open()?;
            let callback = Mutex::new(Some(callback));
            api.try_submit_callback(
                Arc::new(move || {
                    let instance = CallbackInstance::detached();
                    let callback = callback.lock().take();
                    if let Some(callback) = callback {
                        run_guarded(|| callback(&instance));
                    }
                    instance.complete();
                }),
                &env.native_environment(),
            )?;
            Ok(())
        }
    }
}

struct SimpleCallback {
    key: usize,
    callback: Mutex<Option<SimpleFn>>,
    pool: Arc<PoolShared>,
    outstanding: CountdownEvent,
    env: CallbackEnvironment,
}

impl SimpleCallback {
    fn group(&self) -> Option<&Arc<GroupShared>> {
        self.env.cleanup_group()
    }

    fn submit(self: &Arc<Self>) -> Result<()> {
        let task = Task::new(self.key, Arc::clone(self) as Arc<dyn Runnable>);
        match self.group() {
            Some(group) => {
                let member: Weak<dyn GroupMember> = Arc::downgrade(self) as Weak<dyn GroupMember>;
                group.associate(self.key, member, || self.pool.enqueue(task))
            }
            None => self.pool.enqueue(task),
        }
    }
}

impl Runnable for SimpleCallback {
    fn enqueued(&self) {
        self.outstanding.add_count(1);
    }

    fn run(&self, instance: &CallbackInstance<'_>) {
        let callback = self.callback.lock().take();
        if let Some(callback) = callback {
            callback(instance);
        }
    }

    fn completed(&self) {
        self.outstanding.decrement(1);
        if let Some(group) = self.group() {
            group.remove(self.key);
        }
    }

    fn cancelled(&self) {
        // Only cancelled by a closing group, which already dropped the membership
        self.outstanding.decrement(1);
    }

    fn runs_long(&self) -> bool {
        self.env.flags().contains(CallbackFlags::LONG_FUNCTION)
    }
}

impl GroupMember for SimpleCallback {
    fn cancel_pending(&self) {
        self.pool.cancel(self.key);
    }

    fn wait_callbacks(&self) {
        let _ = self.outstanding.wait(None);
    }

    fn finalizer(&self) -> Option<Finalizer> {
        self.env.finalizer().cloned()
    }
}
