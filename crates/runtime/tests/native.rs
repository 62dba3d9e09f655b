//! native.rs

use compat_runtime::{
    backend::{
        Backend, BackendKind, NativeCallback, NativeEnvironment, NativeHandle, NativeThreadpool,
    },
    event::{self, Event, EventInitialState, EventReset},
    work, CallbackFlags, Error, ThreadpoolOptions, WaitPending, Work,
};
use parking_lot::Mutex;
use std::{
    collections::HashMap,
    io, mem,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

struct FakeWork {
    callback: NativeCallback,
    group: Option<NativeHandle>,
    running: Vec<JoinHandle<()>>,
}

/// A native facility running every submission on its own thread
#[derive(Default)]
struct FakeNative {
    next: AtomicUsize,
    works: Mutex<HashMap<NativeHandle, FakeWork>>,
    flags: Mutex<Vec<CallbackFlags>>,
    pools: AtomicUsize,
}

impl FakeNative {
    fn handle(&self) -> NativeHandle {
        NativeHandle(self.next.fetch_add(1, Ordering::Relaxed) + 1)
    }

    fn join(&self, work: NativeHandle) {
        let running = match self.works.lock().get_mut(&work) {
            Some(fake) => mem::take(&mut fake.running),
            None => Vec::new(),
        };
        for handle in running {
            handle.join().unwrap();
        }
    }
}

impl NativeThreadpool for FakeNative {
    fn name(&self) -> &'static str {
        "fake"
    }

    fn create_pool(&self) -> io::Result<NativeHandle> {
        self.pools.fetch_add(1, Ordering::SeqCst);
        Ok(self.handle())
    }

    fn set_thread_minimum(&self, _pool: NativeHandle, _min: u32) -> io::Result<()> {
        Ok(())
    }

    fn set_thread_maximum(&self, _pool: NativeHandle, _max: u32) {}

    fn close_pool(&self, _pool: NativeHandle) {
        self.pools.fetch_sub(1, Ordering::SeqCst);
    }

    fn create_cleanup_group(&self) -> io::Result<NativeHandle> {
        Ok(self.handle())
    }

    fn close_cleanup_group_members(&self, group: NativeHandle, _cancel_pending: bool) {
        let members: Vec<NativeHandle> = self
            .works
            .lock()
            .iter()
            .filter(|(_, fake)| fake.group == Some(group))
            .map(|(handle, _)| *handle)
            .collect();
        for member in members {
            self.close_work(member);
        }
    }

    fn close_cleanup_group(&self, _group: NativeHandle) {}

    fn create_work(
        &self,
        callback: NativeCallback,
        env: &NativeEnvironment,
    ) -> io::Result<NativeHandle> {
        let handle = self.handle();
        self.flags.lock().push(env.flags);
        self.works.lock().insert(
            handle,
            FakeWork {
                callback,
                group: env.cleanup_group,
                running: Vec::new(),
            },
        );
        Ok(handle)
    }

    fn submit_work(&self, work: NativeHandle) {
        let mut works = self.works.lock();
        if let Some(fake) = works.get_mut(&work) {
            let callback = Arc::clone(&fake.callback);
            fake.running.push(thread::spawn(move || callback()));
        }
    }

    fn wait_for_work_callbacks(&self, work: NativeHandle, _cancel_pending: bool) {
        self.join(work)
    }

    fn close_work(&self, work: NativeHandle) {
        self.join(work);
        self.works.lock().remove(&work);
    }

    fn try_submit_callback(
        &self,
        callback: NativeCallback,
        _env: &NativeEnvironment,
    ) -> io::Result<()> {
        thread::spawn(move || callback());
        Ok(())
    }
}

/// Submit `items` items `rounds` times each and report every item's execution count
fn workload(backend: &Backend, items: usize, rounds: usize) -> Vec<usize> {
    let pool = backend.create_pool(ThreadpoolOptions::default()).unwrap();
    let env = pool.new_environment();
    let counts: Arc<Vec<AtomicUsize>> = Arc::new((0..items).map(|_| AtomicUsize::new(0)).collect());
    let works: Vec<Work> = (0..items)
        .map(|i| {
            Work::with_context(Some(&env), Arc::clone(&counts), move |_, counts| {
                counts[i].fetch_add(1, Ordering::SeqCst);
            })
            .unwrap()
        })
        .collect();
    for _ in 0..rounds {
        for work in &works {
            work.submit().unwrap();
        }
    }
    for work in &works {
        work.wait(WaitPending::Wait).unwrap();
    }
    counts.iter().map(|count| count.load(Ordering::SeqCst)).collect()
}

#[test]
fn threadpool_test_native_transparency() {
    super::logging();
    let portable = Backend::portable();
    let native = Backend::native(Arc::new(FakeNative::default()));
    assert_eq!(BackendKind::Portable, portable.kind());
    assert_eq!(BackendKind::Native, native.kind());

    let expected = vec![3; 16];
    assert_eq!(expected, workload(&portable, 16, 3));
    assert_eq!(expected, workload(&native, 16, 3));
}

#[test]
fn threadpool_test_native_pool_lifecycle() {
    let api = Arc::new(FakeNative::default());
    let backend = Backend::native(api.clone());
    let pool = backend.create_pool(ThreadpoolOptions::default()).unwrap();
    assert_eq!(1, api.pools.load(Ordering::SeqCst));
    let env = pool.new_environment().runs_long();
    let work = Work::with_environment(&env, |_| {}).unwrap();
    work.submit().unwrap();
    work.wait(WaitPending::Wait).unwrap();
    assert_eq!(vec![CallbackFlags::LONG_FUNCTION], *api.flags.lock());

    // Closed native pools reject submissions instead of forwarding them
    pool.close();
    assert_eq!(0, api.pools.load(Ordering::SeqCst));
    assert!(matches!(work.submit(), Err(Error::Closed)));
}

#[test]
fn threadpool_test_native_cleanup_group() {
    let backend = Backend::native(Arc::new(FakeNative::default()));
    let group = backend.create_cleanup_group().unwrap();
    let finalized = Arc::new(AtomicUsize::new(0));
    let count = Arc::new(AtomicUsize::new(0));
    let env = {
        let finalized = Arc::clone(&finalized);
        backend
            .new_environment()
            .with_cleanup_group(&group)
            .with_finalizer(move || {
                finalized.fetch_add(1, Ordering::SeqCst);
            })
    };
    let work = {
        let count = Arc::clone(&count);
        Work::with_environment(&env, move |_| {
            count.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap()
    };
    for _ in 0..4 {
        work.submit().unwrap();
    }
    group.close(WaitPending::Wait);
    assert_eq!(4, count.load(Ordering::SeqCst));
    assert_eq!(1, finalized.load(Ordering::SeqCst));

    // The group released the native work, closing the handle does not close it again
    work.close();
}

#[test]
fn threadpool_test_native_try_submit() {
    let backend = Backend::native(Arc::new(FakeNative::default()));
    let done = event::anonymous(EventReset::Manual, EventInitialState::Unset);
    let env = backend.new_environment();
    {
        let done = done.clone();
        work::try_submit_callback(Some(&env), move |instance| {
            instance.set_event_when_callback_returns(&done);
        })
        .unwrap();
    }
    done.wait(Some(Duration::from_secs(10))).unwrap();
}

#[test]
fn threadpool_test_native_unsupported() {
    let backend = Backend::native(Arc::new(FakeNative::default()));
    let pool = backend.create_pool(ThreadpoolOptions::default()).unwrap();
    assert!(matches!(
        pool.wait_idle(Some(Duration::from_millis(1))),
        Err(Error::NotSupported { backend: BackendKind::Native, .. })
    ));
    assert!(matches!(pool.outstanding(), Err(Error::NotSupported { .. })));
    let work = Work::with_environment(&pool.new_environment(), |_| {}).unwrap();
    assert!(matches!(work.outstanding(), Err(Error::NotSupported { .. })));
    let err = pool.set_stack_size(1 << 20, 1 << 16).unwrap_err();
    assert!(err.to_string().contains("not supported by the native"));
}
