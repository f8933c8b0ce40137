//! Engine-neutral capability interface.
//!
//! The checker never talks to a concrete WebAssembly engine. Each backend
//! implements two traits:
//!
//! - [`GuestEngine`]: owns the compiled artifact and creates instances. Shared
//!   across instances, thread-safe.
//! - [`GuestInstance`]: one live guest with its own store, memory and resolved
//!   exports. Used by one caller at a time.
//!
//! [`create_engine`] is the only place that knows which backends exist.

use std::sync::Arc;

use tracing::info;

use url_checker_common::{CheckerError, EngineConfig, EngineKind, ExecutionConfig};

use crate::artifact::ModuleArtifact;
use crate::contract::{GuestAddress, GuestValue, Predicate};
use crate::wasmi_engine::WasmiEngine;
use crate::wasmtime_engine::WasmtimeEngine;

/// A compiled guest artifact that can be instantiated.
pub trait GuestEngine: Send + Sync {
    /// Which engine this is.
    fn kind(&self) -> EngineKind;

    /// Hash of the artifact this engine compiled.
    fn content_hash(&self) -> &str;

    /// Create a fully bootstrapped instance.
    ///
    /// Builds a fresh store, registers the system-interface shim, instantiates
    /// the module, resolves every export in the contract and runs
    /// `_initialize` once. Anything built before a failure is dropped before
    /// the error is returned.
    ///
    /// # Errors
    ///
    /// Returns [`CheckerError::BootstrapFailed`] or
    /// [`CheckerError::ExportNotFound`].
    fn instantiate(&self, config: &ExecutionConfig)
    -> Result<Box<dyn GuestInstance>, CheckerError>;
}

/// One live guest instance.
///
/// Every method is a blocking call into the engine. Implementations are not
/// reentrant; callers serialise access through `&mut self`.
pub trait GuestInstance: Send {
    /// Call the guest `allocate(length)` export.
    fn allocate(&mut self, length: u32) -> Result<GuestAddress, CheckerError>;

    /// Call the guest `deallocate(pointer)` export.
    fn deallocate(&mut self, pointer: GuestAddress) -> Result<(), CheckerError>;

    /// Copy `bytes` into linear memory at `pointer`.
    ///
    /// Must fail with [`CheckerError::OutOfMemory`] rather than grow memory or
    /// panic when the range is out of bounds.
    fn write_memory(&mut self, pointer: GuestAddress, bytes: &[u8]) -> Result<(), CheckerError>;

    /// Copy `length` bytes out of linear memory at `pointer`.
    fn read_memory(&self, pointer: GuestAddress, length: u32) -> Result<Vec<u8>, CheckerError>;

    /// Current size of linear memory in bytes.
    fn memory_size(&self) -> usize;

    /// Call a predicate export with `pointer` and return its raw results.
    fn call_predicate(
        &mut self,
        predicate: Predicate,
        pointer: GuestAddress,
    ) -> Result<Vec<GuestValue>, CheckerError>;
}

/// Compile `artifact` with the engine selected by `config.kind`.
///
/// # Errors
///
/// Returns [`CheckerError::BootstrapFailed`] at the `Engine` or `Compile`
/// stage, or at the `Shim` stage if the system-interface shim cannot be
/// registered.
pub fn create_engine(
    artifact: &ModuleArtifact,
    config: &EngineConfig,
) -> Result<Arc<dyn GuestEngine>, CheckerError> {
    let engine: Arc<dyn GuestEngine> = match config.kind {
        EngineKind::Wasmtime => Arc::new(WasmtimeEngine::new(artifact, config)?),
        EngineKind::Wasmi => Arc::new(WasmiEngine::new(artifact, config)?),
    };

    info!(
        engine = %engine.kind(),
        content_hash = %engine.content_hash(),
        "Guest engine ready"
    );

    Ok(engine)
}
