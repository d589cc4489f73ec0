//! Building blocks for clap-based frontends of the membership subsystem.
//!
//! Each service binary embeds the blocks it needs with `#[clap(flatten)]`
//! and converts them into the corresponding library configs. The library
//! crates stay clap-free; this crate owns the flag and env-var surface.

#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    missing_docs,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

pub mod memberlist;
pub mod ring;
pub mod store;
