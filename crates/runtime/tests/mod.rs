//! test

mod native;

use compat_runtime::backend::{self, Backend};
use std::sync::OnceLock;
use tracing_subscriber::{filter::LevelFilter, fmt, prelude::*, EnvFilter};

/// Install a test subscriber once. `RUST_LOG` overrides the default level
pub fn logging() {
    static INIT: OnceLock<()> = OnceLock::new();
    INIT.get_or_init(|| {
        let filter = EnvFilter::builder()
            .with_default_directive(LevelFilter::WARN.into())
            .from_env_lossy();
        let _ = tracing_subscriber::registry()
            .with(fmt::layer().with_test_writer())
            .with(filter)
            .try_init();
    });
}

/// Force the process wide backend to the portable threadpool for tests using default objects
pub fn portable() -> &'static Backend {
    logging();
    let _ = backend::init(Backend::portable());
    backend::global()
}
