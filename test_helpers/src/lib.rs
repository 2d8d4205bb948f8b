//! Shared helpers for tests across the workspace.
#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

use observability_deps::tracing::info;
use parking_lot::Once;
use tempfile::{NamedTempFile, TempDir};

#[cfg(feature = "future_timeout")]
pub mod timeout;

/// A test helper function for asserting floating point numbers are within the
/// machine epsilon because strict comparison of floating point numbers is
/// incorrect
pub fn approximately_equal(f1: f64, f2: f64) -> bool {
    (f1 - f2).abs() < f64::EPSILON
}

/// Return a temporary directory that is deleted when the guard drops.
pub fn tmp_dir() -> std::io::Result<TempDir> {
    let _ = dotenvy::dotenv();

    let root = std::env::var_os("TEST_LARGO_DB_DIR").unwrap_or_else(|| "/tmp".into());

    Ok(tempfile::Builder::new()
        .prefix("largo")
        .tempdir_in(root)?)
}

/// Return a temporary file that is deleted when the guard drops.
pub fn tmp_file() -> std::io::Result<NamedTempFile> {
    let _ = dotenvy::dotenv();

    let root = std::env::var_os("TEST_LARGO_DB_DIR").unwrap_or_else(|| "/tmp".into());

    Ok(tempfile::Builder::new()
        .prefix("largo")
        .tempfile_in(root)?)
}

/// Start logging for tests if the `RUST_LOG` environment variable is set.
///
/// Safe to call in every test; the subscriber is installed once per process.
pub fn maybe_start_logging() {
    let _ = dotenvy::dotenv();

    if std::env::var("RUST_LOG").is_ok() {
        start_logging()
    }
}

static LOG_SETUP: Once = Once::new();

/// Enables debug logging regardless of the value of `RUST_LOG`, useful while
/// working on an individual test.
pub fn start_logging() {
    // ensure the global has been initialized
    LOG_SETUP.call_once(|| {
        // honor any global logging configuration
        let subscriber = tracing_subscriber::FmtSubscriber::builder()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("debug")),
            )
            .with_test_writer()
            .finish();

        tracing::subscriber::set_global_default(subscriber)
            .expect("setting tracing default failed");

        tracing_log::LogTracer::init().expect("tracing log init failed");

        info!("logging initialized for test");
    })
}
