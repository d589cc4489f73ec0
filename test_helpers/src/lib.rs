#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

use std::{env, sync::Once};
pub use tempfile;

pub mod timeout;

pub type Error = Box<dyn std::error::Error + Send + Sync + 'static>;
pub type Result<T = (), E = Error> = std::result::Result<T, E>;

/// Return a temporary directory that is deleted when the object is dropped.
pub fn tmp_dir() -> Result<tempfile::TempDir> {
    let root = env::temp_dir();

    Ok(tempfile::Builder::new()
        .prefix("ringmesh")
        .tempdir_in(root)?)
}

/// Writes the specified string to a new temporary file, returning the handle
/// to the (deleted-on-drop) file.
pub fn make_temp_file<C: AsRef<[u8]>>(contents: C) -> tempfile::NamedTempFile {
    let file = tempfile::Builder::new()
        .prefix("ringmesh")
        .tempfile_in(env::temp_dir())
        .expect("creating temp file");

    std::fs::write(&file, contents).expect("writing data to temp file");
    file
}

static LOG_SETUP: Once = Once::new();

/// Enables debug logging regardless of the value of the RUST_LOG environment
/// variable. If RUST_LOG isn't specified, defaults to "debug".
pub fn start_logging() {
    // ensure the global has been initialized
    LOG_SETUP.call_once(|| {
        // honor any existing RUST_LOG level
        if std::env::var("RUST_LOG").is_err() {
            std::env::set_var("RUST_LOG", "debug");
        }
        // Configure the logger to write to stderr and install it
        let output_stream = std::io::stderr;

        use observability_deps::tracing_subscriber::{self, prelude::*, EnvFilter};

        tracing_subscriber::registry()
            .with(EnvFilter::from_default_env())
            .with(tracing_subscriber::fmt::layer().with_writer(output_stream))
            .init();
    })
}

/// Enables debug logging if the RUST_LOG environment variable is set. Does
/// nothing if RUST_LOG is not set. If logging has already been enabled, does
/// nothing.
pub fn maybe_start_logging() {
    if std::env::var("RUST_LOG").is_ok() {
        start_logging()
    }
}

#[macro_export]
/// A macro to assert that one string is contained within another with a nice
/// error message if it is not.
///
/// Both arguments must be convertable into Strings (`Into<String>`).
macro_rules! assert_contains {
    ($ACTUAL: expr, $EXPECTED: expr) => {
        let actual_value: String = $ACTUAL.into();
        let expected_value: String = $EXPECTED.into();
        assert!(
            actual_value.contains(&expected_value),
            "Can not find expected in actual.\n\nExpected:\n{}\n\nActual:\n{}",
            expected_value,
            actual_value
        );
    };
}

