//! Host/guest bridge for the url-checker WebAssembly guest.
//!
//! This crate drives a guest module that exports two URL predicates:
//! - [`Checker`]: one bootstrapped guest instance answering predicate calls
//! - [`SharedChecker`]: a checker shared between threads
//! - [`GuestEngine`] / [`GuestInstance`]: the engine-neutral capability
//!   interface, implemented by the wasmtime and wasmi backends
//! - [`ModuleArtifact`]: the guest's WebAssembly bytes
//! - [`MemoryBridge`] / [`LeaseGuard`]: scoped guest memory allocations
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                    ModuleArtifact                       │
//! │  (Embedded singleton or loaded from file, read-only)    │
//! └─────────────────────────────────────────────────────────┘
//!                            │ create_engine
//!                            ▼
//! ┌─────────────────────────────────────────────────────────┐
//! │            Arc<dyn GuestEngine>                         │
//! │  (Compiled once, shared, thread-safe)                   │
//! │  - WasmtimeEngine: WASI preview 1, Cranelift            │
//! │  - WasmiEngine: interpreter, stubbed WASI imports       │
//! └─────────────────────────────────────────────────────────┘
//!                            │ instantiate + _initialize
//!                            ▼
//! ┌─────────────────────────────────────────────────────────┐
//! │          Checker (Box<dyn GuestInstance>)               │
//! │  (One store, one linear memory, one call at a time)     │
//! │  - Resolved exports                                     │
//! │  - Fuel and memory limits                               │
//! │  - Poisoned after a failed guest call                   │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! # Protocol
//!
//! Each predicate call encodes the URL (UTF-8, NUL-terminated by default),
//! asks the guest to `allocate` room for it, writes it into linear memory,
//! calls the predicate with the address, decodes the single `i32` result and
//! `deallocate`s the address.

pub mod artifact;
pub mod bridge;
pub mod checker;
pub mod contract;
pub mod engine;
pub mod shared;
pub mod store;
pub mod wasmi_engine;
pub mod wasmtime_engine;

#[cfg(test)]
mod testing;

pub use artifact::{ArtifactSource, ModuleArtifact};
pub use bridge::{LeaseGuard, MemoryBridge};
pub use checker::Checker;
pub use contract::{GuestAddress, GuestValue, Predicate};
pub use engine::{GuestEngine, GuestInstance, create_engine};
pub use shared::SharedChecker;
pub use wasmi_engine::WasmiEngine;
pub use wasmtime_engine::WasmtimeEngine;
