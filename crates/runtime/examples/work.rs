//! work

use compat_runtime::{
    backend, work, CallbackEnvironment, CleanupGroup, Threadpool, ThreadpoolOptions, WaitPending,
    Work,
};
use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    thread,
    time::{Duration, Instant},
};
use tracing::info;
use tracing_subscriber::{filter::LevelFilter, fmt, layer::SubscriberExt, prelude::*};

#[tokio::main]
async fn main() -> compat_runtime::Result<()> {
    // Setup logging
    let stdout = fmt::layer()
        .compact()
        .with_ansi(true)
        .with_level(true)
        .with_file(false)
        .with_line_number(false)
        .with_target(true);
    tracing_subscriber::registry()
        .with(stdout)
        .with(LevelFilter::DEBUG)
        .init();

    // Print welcome message
    info!(backend = %backend::global().kind(), "Starting work demo");

    // A oneshot on the default threadpool
    let answer = work::once(|_| 6 * 7)?.future().await;
    info!(answer, "oneshot resolved");

    // A private pool capped at 4 workers running 200 sleepy callbacks
    let pool = Threadpool::with_options(ThreadpoolOptions {
        name: String::from("demo"),
        max_threads: 4,
        ..Default::default()
    })?;
    let group = CleanupGroup::new()?;
    let finalized = Arc::new(AtomicUsize::new(0));
    let env = {
        let finalized = Arc::clone(&finalized);
        pool.new_environment()
            .with_cleanup_group(&group)
            .with_finalizer(move || {
                finalized.fetch_add(1, Ordering::Relaxed);
            })
    };
    let ran = Arc::new(AtomicUsize::new(0));
    let sleepy = Work::with_context(Some(&env), Arc::clone(&ran), |_, ran| {
        thread::sleep(Duration::from_millis(5));
        ran.fetch_add(1, Ordering::Relaxed);
    })?;

    let start = Instant::now();
    for _ in 0..200 {
        sleepy.submit()?;
    }
    sleepy.wait(WaitPending::Wait)?;
    info!(ran = ran.load(Ordering::Relaxed), elapsed = ?start.elapsed(), "work complete");

    // Queue more, then cancel whatever has not started
    for _ in 0..200 {
        sleepy.submit()?;
    }
    thread::sleep(Duration::from_millis(20));
    group.close(WaitPending::Cancel);
    info!(
        ran = ran.load(Ordering::Relaxed),
        finalized = finalized.load(Ordering::Relaxed),
        "cleanup group closed"
    );

    // Fire and forget on the default pool
    let done = Arc::new(AtomicUsize::new(0));
    {
        let done = Arc::clone(&done);
        work::try_submit_callback(Some(&CallbackEnvironment::new()), move |_| {
            done.fetch_add(1, Ordering::Relaxed);
        })?;
    }

    // Print exit message
    drop(sleepy);
    pool.close();
    info!("all done");
    Ok(())
}
