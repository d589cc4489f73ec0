//! This crate exists to add a level of indirection between the tracing
//! dependencies and the rest of the workspace, so the observability stack can
//! be upgraded (or swapped out) in exactly one place.
//!
//! Rather than depending on `tracing` directly, workspace crates write
//! `use observability_deps::tracing::{debug, info, warn};`.

#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(missing_docs)]

pub use tracing;
pub use tracing_subscriber;
