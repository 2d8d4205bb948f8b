//! Observability ecosystem dependencies, to ensure consistent versions and
//! unified updates across the workspace.
#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_copy_implementations,
    missing_debug_implementations,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

// Export tracing publicly so that consumers do not have to have a direct
// dependency on the tracing crate (and to pin a single version).
pub use tracing;
