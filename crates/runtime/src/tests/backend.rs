use crate::{
    backend::{
        native::MockNativeThreadpool, Backend, BackendKind, BackendSelector, BackendState,
        MockNativeProbe, NativeCallback, NativeHandle, NativeThreadpool,
    },
    common::{CallbackEnvironment, WaitPending},
    error::Error,
    pool::ThreadpoolOptions,
    work::Work,
};
use mockall::predicate::eq;
use parking_lot::Mutex;
use std::{
    io,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

fn native_backend(api: MockNativeThreadpool) -> Backend {
    Backend::native(Arc::new(api))
}

#[test]
fn threadpool_test_backend_probe_once() {
    let mut probe = MockNativeProbe::new();
    probe.expect_probe().times(1).returning(|| None);
    let selector = BackendSelector::new(probe);
    assert_eq!(BackendState::Unprobed, selector.state());

    // Every concurrent first user observes the single probe
    let kinds: Vec<BackendKind> = crossbeam::scope(|scope| {
        let handles: Vec<_> = (0..8)
            .map(|_| scope.spawn(|_| selector.get().kind()))
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    })
    .unwrap();
    assert!(kinds.iter().all(|kind| *kind == BackendKind::Portable));
    assert_eq!(BackendState::Portable, selector.state());
}

#[test]
fn threadpool_test_backend_probe_native() {
    let mut probe = MockNativeProbe::new();
    probe.expect_probe().times(1).returning(|| {
        let mut api = MockNativeThreadpool::new();
        api.expect_name().return_const("mock");
        Some(Arc::new(api) as Arc<dyn NativeThreadpool>)
    });
    let selector = BackendSelector::new(probe);
    assert_eq!(BackendKind::Native, selector.get().kind());
    assert_eq!(BackendKind::Native, selector.get().kind());
    assert_eq!(BackendState::Native, selector.state());
}

#[test]
fn threadpool_test_backend_install() {
    let mut probe = MockNativeProbe::new();
    probe.expect_probe().never();
    let selector = BackendSelector::new(probe);
    assert!(selector.install(Backend::portable()).is_ok());
    assert!(selector.install(Backend::portable()).is_err());
    assert_eq!(BackendKind::Portable, selector.get().kind());
}

#[test]
fn threadpool_test_backend_default_pool_once() {
    let backend = Backend::portable();
    let a = backend.default_pool() as *const _;
    let b = backend.default_pool() as *const _;
    assert_eq!(a, b);
    assert_eq!(BackendKind::Portable, backend.default_pool().backend());
}

#[test]
fn threadpool_test_backend_mismatch() {
    let a = Backend::portable();
    let b = Backend::portable();
    let pool = a.create_pool(ThreadpoolOptions::default()).unwrap();
    let group = b.create_cleanup_group().unwrap();

    let env = b.new_environment().with_pool(&pool);
    assert!(matches!(
        Work::with_environment(&env, |_| {}),
        Err(Error::BackendMismatch)
    ));

    let env = pool.new_environment().with_cleanup_group(&group);
    assert!(matches!(
        Work::with_environment(&env, |_| {}),
        Err(Error::BackendMismatch)
    ));

    let env = pool.new_environment();
    assert!(Work::with_environment(&env, |_| {}).is_ok());
}

#[test]
fn threadpool_test_backend_native_not_supported() {
    let mut api = MockNativeThreadpool::new();
    api.expect_create_pool().times(1).returning(|| Ok(NativeHandle(1)));
    api.expect_set_thread_maximum().returning(|_, _| ());
    api.expect_set_stack_information()
        .returning(|_, _, _| Err(io::ErrorKind::Unsupported.into()));
    api.expect_close_pool().with(eq(NativeHandle(1))).times(1).returning(|_| ());
    let backend = native_backend(api);

    let default = backend.default_pool();
    assert!(matches!(
        default.wait_idle(None),
        Err(Error::NotSupported { operation: "wait_idle", backend: BackendKind::Native })
    ));
    assert!(matches!(default.outstanding(), Err(Error::NotSupported { .. })));
    assert!(matches!(default.min_threads(2), Err(Error::NotSupported { .. })));

    let options = ThreadpoolOptions {
        max_threads: 4,
        ..Default::default()
    };
    let pool = backend.create_pool(options).unwrap();
    assert_eq!(BackendKind::Native, pool.backend());
    assert!(matches!(
        pool.set_stack_size(1 << 20, 0),
        Err(Error::NotSupported { operation: "set_stack_size", .. })
    ));
    pool.close();
}

#[test]
#[cfg(target_pointer_width = "64")]
fn threadpool_test_backend_native_limits_saturate() {
    let mut api = MockNativeThreadpool::new();
    api.expect_create_pool().times(1).returning(|| Ok(NativeHandle(7)));
    api.expect_set_thread_maximum()
        .with(eq(NativeHandle(7)), eq(u32::MAX))
        .times(1)
        .returning(|_, _| ());
    api.expect_set_thread_minimum()
        .with(eq(NativeHandle(7)), eq(u32::MAX))
        .times(1)
        .returning(|_, _| Ok(()));
    api.expect_close_pool().with(eq(NativeHandle(7))).times(1).returning(|_| ());
    let backend = native_backend(api);

    let options = ThreadpoolOptions {
        min_threads: u32::MAX as usize + 1,
        max_threads: usize::MAX,
        ..Default::default()
    };
    backend.create_pool(options).unwrap().close();
}

#[test]
fn threadpool_test_backend_native_forwarding() {
    let slot: Arc<Mutex<Option<NativeCallback>>> = Arc::new(Mutex::new(None));
    let mut api = MockNativeThreadpool::new();
    {
        let slot = Arc::clone(&slot);
        api.expect_create_work()
            .times(1)
            .returning(move |callback, env| {
                assert_eq!(None, env.pool);
                *slot.lock() = Some(callback);
                Ok(NativeHandle(7))
            });
    }
    {
        // The mock runs the callback inline on submit
        let slot = Arc::clone(&slot);
        api.expect_submit_work()
            .with(eq(NativeHandle(7)))
            .times(2)
            .returning(move |_| {
                let callback = slot.lock().clone();
                if let Some(callback) = callback {
                    callback();
                }
            });
    }
    api.expect_wait_for_work_callbacks()
        .with(eq(NativeHandle(7)), eq(true))
        .times(1)
        .returning(|_, _| ());
    api.expect_close_work()
        .with(eq(NativeHandle(7)))
        .times(1)
        .returning(|_| ());
    let backend = native_backend(api);

    let count = Arc::new(AtomicUsize::new(0));
    let env = backend.new_environment();
    let work = {
        let count = Arc::clone(&count);
        Work::with_environment(&env, move |instance| {
            assert!(matches!(
                instance.callback_may_run_long(),
                Err(Error::NotSupported { .. })
            ));
            count.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap()
    };
    assert_eq!(BackendKind::Native, work.backend());
    work.submit().unwrap();
    work.submit().unwrap();
    work.wait(WaitPending::Cancel).unwrap();
    assert_eq!(2, count.load(Ordering::SeqCst));
    assert!(matches!(
        work.wait_timeout(WaitPending::Wait, std::time::Duration::from_millis(1)),
        Err(Error::NotSupported { .. })
    ));
    work.close();
}

#[test]
fn threadpool_test_backend_native_create_failure() {
    let mut api = MockNativeThreadpool::new();
    api.expect_create_work()
        .times(1)
        .returning(|_, _| Err(io::Error::new(io::ErrorKind::OutOfMemory, "no memory")));
    api.expect_submit_work().never();
    api.expect_close_work().never();
    let backend = native_backend(api);

    let work = Work::with_environment(&backend.new_environment(), |_| {}).unwrap();
    assert!(matches!(work.submit(), Err(Error::Io(_))));
}

#[test]
fn threadpool_test_backend_environment_default() {
    let env = CallbackEnvironment::new();
    assert!(env.flags().is_empty());
    assert!(env.cleanup_group().is_none());
    assert!(env.finalizer().is_none());
}
