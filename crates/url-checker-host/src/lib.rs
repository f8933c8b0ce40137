//! System-interface shims for the url-checker guest.
//!
//! The guest module is built against WASI preview 1 and expects its imports
//! to be satisfied before `_initialize` runs. It never relies on them for the
//! predicates themselves, so each engine gets the cheapest shim it supports:
//!
//! - [`linker`]: a real WASI preview 1 context registered on a wasmtime linker
//! - [`stubs`]: per-import stub functions defined on a wasmi linker
//! - [`logging`]: routes whatever the guest writes to stdout/stderr into `tracing`

pub mod linker;
pub mod logging;
pub mod stubs;

pub use linker::{build_wasi_ctx, register_wasi};
pub use logging::GuestStream;
pub use stubs::{WASI_MODULE, define_wasi_stubs};
