//! Wasmi backend.
//!
//! The lower-level backend: an interpreter with no system interface of its
//! own. Every `wasi_snapshot_preview1` import the guest declares is bound to
//! a host stub before instantiation, and export calls go through untyped
//! value slices.

use std::time::Instant;

use tracing::{debug, info, instrument};
use wasmi::core::ValType;
use wasmi::{
    Config, Engine, Extern, Func, Instance, Linker, Memory, Module, Store, StoreLimits,
    StoreLimitsBuilder, TypedFunc, Val,
};

use url_checker_common::{BootstrapStage, CheckerError, EngineConfig, EngineKind, ExecutionConfig};
use url_checker_host::define_wasi_stubs;

use crate::artifact::ModuleArtifact;
use crate::contract::{
    ALLOCATE, ALLOCATE_SHAPE, DEALLOCATE, DEALLOCATE_SHAPE, FuncShape, GuestAddress, GuestValue,
    INITIALIZE_SHAPE, IS_CAN_BE_MODIFIED_SHAPE, IS_VALID_SHAPE, MEMORY, Predicate, WasmType,
};
use crate::engine::{GuestEngine, GuestInstance};

/// Store data for one wasmi guest instance.
struct WasmiContext {
    limits: StoreLimits,
}

/// Wasmi engine with the guest artifact parsed and its stubs linked.
pub struct WasmiEngine {
    engine: Engine,
    module: Module,
    linker: Linker<WasmiContext>,
    content_hash: String,
    stub_count: usize,
}

impl WasmiEngine {
    /// Create the engine, parse `artifact` and bind its WASI imports to stubs.
    ///
    /// # Errors
    ///
    /// Returns [`CheckerError::BootstrapFailed`] at the `Compile` stage if the
    /// artifact is rejected, or at the `Shim` stage if a stub cannot be
    /// defined.
    #[instrument(skip_all, fields(content_hash = %artifact.content_hash()))]
    pub fn new(artifact: &ModuleArtifact, _config: &EngineConfig) -> Result<Self, CheckerError> {
        let mut wasmi_config = Config::default();
        wasmi_config.consume_fuel(true);

        let engine = Engine::new(&wasmi_config);

        let start = Instant::now();
        let module = Module::new(&engine, artifact.bytes()).map_err(|e| {
            CheckerError::bootstrap(
                BootstrapStage::Compile,
                format!("Core module validation failed: {e}"),
            )
        })?;

        info!(
            duration_ms = start.elapsed().as_millis(),
            "Guest module parsed"
        );

        let mut linker = Linker::new(&engine);
        let stub_count = define_wasi_stubs(&mut linker, &module)?;

        Ok(Self {
            engine,
            module,
            linker,
            content_hash: artifact.content_hash().to_string(),
            stub_count,
        })
    }

    /// Number of system-interface imports bound to host stubs.
    pub fn stub_count(&self) -> usize {
        self.stub_count
    }
}

impl GuestEngine for WasmiEngine {
    fn kind(&self) -> EngineKind {
        EngineKind::Wasmi
    }

    fn content_hash(&self) -> &str {
        &self.content_hash
    }

    #[instrument(skip_all, fields(engine = "wasmi"))]
    fn instantiate(
        &self,
        config: &ExecutionConfig,
    ) -> Result<Box<dyn GuestInstance>, CheckerError> {
        let limits = StoreLimitsBuilder::new()
            .memory_size(config.max_memory_bytes())
            .instances(1)
            .build();
        let mut store = Store::new(&self.engine, WasmiContext { limits });
        store.limiter(|ctx| &mut ctx.limits);

        let fuel_per_call = if config.fuel_metering {
            config.max_fuel
        } else {
            u64::MAX
        };
        store.set_fuel(fuel_per_call).map_err(|e| {
            CheckerError::bootstrap(BootstrapStage::Instantiate, format!("Failed to set fuel: {e}"))
        })?;

        let instance = self
            .linker
            .instantiate(&mut store, &self.module)
            .and_then(|pre| pre.start(&mut store))
            .map_err(|e| {
                CheckerError::bootstrap(
                    BootstrapStage::Instantiate,
                    format!("Instantiation failed: {e}"),
                )
            })?;

        debug!("Module instantiated, resolving exports");

        let exports = WasmiExports::resolve(&instance, &store)?;

        let mut guest = WasmiInstance {
            store,
            exports,
            fuel_per_call,
        };

        guest.refuel(INITIALIZE_SHAPE.name).map_err(|e| {
            CheckerError::bootstrap(BootstrapStage::Initialize, e.to_string())
        })?;
        guest
            .exports
            .initialize
            .call(&mut guest.store, ())
            .map_err(|e| CheckerError::bootstrap(BootstrapStage::Initialize, describe_error(&e)))?;

        debug!(memory_bytes = guest.memory_size(), "Guest initialized");

        Ok(Box::new(guest))
    }
}

impl std::fmt::Debug for WasmiEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WasmiEngine")
            .field("content_hash", &self.content_hash)
            .field("stub_count", &self.stub_count)
            .finish_non_exhaustive()
    }
}

struct WasmiExports {
    memory: Memory,
    initialize: TypedFunc<(), ()>,
    allocate: TypedFunc<i32, i32>,
    deallocate: TypedFunc<i32, ()>,
    is_valid: Func,
    is_can_be_modified: Func,
}

impl WasmiExports {
    // Wasmi only supports 32-bit memories here; the i32 allocator shapes
    // reject guests built for another pointer width.
    fn resolve(instance: &Instance, store: &Store<WasmiContext>) -> Result<Self, CheckerError> {
        let memory = match instance.get_export(store, MEMORY) {
            Some(Extern::Memory(memory)) => memory,
            Some(other) => {
                return Err(CheckerError::signature_mismatch(
                    MEMORY,
                    format!("expected memory, found {}", extern_kind(&other)),
                ));
            }
            None => return Err(CheckerError::export_missing(MEMORY)),
        };

        let initialize = resolve_func(instance, store, &INITIALIZE_SHAPE)?;
        let allocate = resolve_func(instance, store, &ALLOCATE_SHAPE)?;
        let deallocate = resolve_func(instance, store, &DEALLOCATE_SHAPE)?;

        Ok(Self {
            memory,
            initialize: typed(initialize, store, &INITIALIZE_SHAPE)?,
            allocate: typed(allocate, store, &ALLOCATE_SHAPE)?,
            deallocate: typed(deallocate, store, &DEALLOCATE_SHAPE)?,
            is_valid: resolve_func(instance, store, &IS_VALID_SHAPE)?,
            is_can_be_modified: resolve_func(instance, store, &IS_CAN_BE_MODIFIED_SHAPE)?,
        })
    }

    fn predicate(&self, predicate: Predicate) -> Func {
        match predicate {
            Predicate::IsValid => self.is_valid,
            Predicate::IsCanBeModified => self.is_can_be_modified,
        }
    }
}

fn resolve_func(
    instance: &Instance,
    store: &Store<WasmiContext>,
    shape: &FuncShape,
) -> Result<Func, CheckerError> {
    let func = match instance.get_export(store, shape.name) {
        Some(Extern::Func(func)) => func,
        Some(other) => {
            return Err(CheckerError::signature_mismatch(
                shape.name,
                format!("expected function, found {}", extern_kind(&other)),
            ));
        }
        None => return Err(CheckerError::export_missing(shape.name)),
    };

    let ty = func.ty(store);
    let params: Vec<WasmType> = ty.params().iter().map(wasm_type).collect();
    let results: Vec<WasmType> = ty.results().iter().map(wasm_type).collect();
    shape.check(&params, &results)?;

    Ok(func)
}

fn typed<P, R>(
    func: Func,
    store: &Store<WasmiContext>,
    shape: &FuncShape,
) -> Result<TypedFunc<P, R>, CheckerError>
where
    P: wasmi::WasmParams,
    R: wasmi::WasmResults,
{
    func.typed::<P, R>(store)
        .map_err(|e| CheckerError::signature_mismatch(shape.name, e))
}

fn wasm_type(ty: &ValType) -> WasmType {
    match ty {
        ValType::I32 => WasmType::I32,
        ValType::I64 => WasmType::I64,
        ValType::F32 => WasmType::F32,
        ValType::F64 => WasmType::F64,
        _ => WasmType::Other,
    }
}

fn guest_value(value: &Val) -> GuestValue {
    match value {
        Val::I32(v) => GuestValue::I32(*v),
        Val::I64(v) => GuestValue::I64(*v),
        Val::F32(_) => GuestValue::Other(WasmType::F32),
        Val::F64(_) => GuestValue::Other(WasmType::F64),
        _ => GuestValue::Other(WasmType::Other),
    }
}

fn extern_kind(export: &Extern) -> &'static str {
    match export {
        Extern::Func(_) => "function",
        Extern::Memory(_) => "memory",
        Extern::Global(_) => "global",
        Extern::Table(_) => "table",
    }
}

fn describe_error(error: &wasmi::Error) -> String {
    match error.as_trap_code() {
        Some(wasmi::core::TrapCode::OutOfFuel) => "out of fuel".to_string(),
        Some(code) => format!("trap: {code}"),
        None => error.to_string(),
    }
}

/// One live wasmi guest.
struct WasmiInstance {
    store: Store<WasmiContext>,
    exports: WasmiExports,
    fuel_per_call: u64,
}

impl WasmiInstance {
    fn refuel(&mut self, export: &str) -> Result<(), CheckerError> {
        self.store
            .set_fuel(self.fuel_per_call)
            .map_err(|e| CheckerError::guest_call(export, format!("Failed to set fuel: {e}")))
    }
}

impl GuestInstance for WasmiInstance {
    fn allocate(&mut self, length: u32) -> Result<GuestAddress, CheckerError> {
        self.refuel(ALLOCATE)?;
        let raw = self
            .exports
            .allocate
            .call(&mut self.store, GuestAddress::new(length).as_i32())
            .map_err(|e| CheckerError::guest_call(ALLOCATE, describe_error(&e)))?;
        Ok(GuestAddress::from_i32(raw))
    }

    fn deallocate(&mut self, pointer: GuestAddress) -> Result<(), CheckerError> {
        self.refuel(DEALLOCATE)?;
        self.exports
            .deallocate
            .call(&mut self.store, pointer.as_i32())
            .map_err(|e| CheckerError::guest_call(DEALLOCATE, describe_error(&e)))
    }

    fn write_memory(&mut self, pointer: GuestAddress, bytes: &[u8]) -> Result<(), CheckerError> {
        let memory = self.exports.memory;
        memory
            .write(&mut self.store, pointer.offset(), bytes)
            .map_err(|_| CheckerError::OutOfMemory {
                pointer: pointer.get(),
                length: bytes.len(),
                memory_size: memory.data(&self.store).len(),
            })
    }

    fn read_memory(&self, pointer: GuestAddress, length: u32) -> Result<Vec<u8>, CheckerError> {
        let memory = self.exports.memory;
        let mut buffer = vec![0u8; length as usize];
        memory
            .read(&self.store, pointer.offset(), &mut buffer)
            .map_err(|_| CheckerError::OutOfMemory {
                pointer: pointer.get(),
                length: buffer.len(),
                memory_size: memory.data(&self.store).len(),
            })?;
        Ok(buffer)
    }

    fn memory_size(&self) -> usize {
        self.exports.memory.data(&self.store).len()
    }

    fn call_predicate(
        &mut self,
        predicate: Predicate,
        pointer: GuestAddress,
    ) -> Result<Vec<GuestValue>, CheckerError> {
        let func = self.exports.predicate(predicate);
        self.refuel(predicate.export_name())?;

        let result_count = func.ty(&self.store).results().len();
        let mut results = vec![Val::I32(0); result_count];
        func.call(
            &mut self.store,
            &[Val::I32(pointer.as_i32())],
            &mut results,
        )
        .map_err(|e| CheckerError::guest_call(predicate.export_name(), describe_error(&e)))?;

        Ok(results.iter().map(guest_value).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn artifact(wat: &str) -> ModuleArtifact {
        ModuleArtifact::from_bytes(wat::parse_str(wat).unwrap()).unwrap()
    }

    #[test]
    fn test_engine_creation() {
        let engine = WasmiEngine::new(&artifact("(module)"), &EngineConfig::default()).unwrap();

        assert_eq!(engine.kind(), EngineKind::Wasmi);
        assert_eq!(engine.stub_count(), 0);
    }

    #[test]
    fn test_wasi_imports_are_stubbed() {
        let module = artifact(
            r#"(module
                (import "wasi_snapshot_preview1" "fd_write"
                    (func (param i32 i32 i32 i32) (result i32)))
                (import "wasi_snapshot_preview1" "proc_exit" (func (param i32))))"#,
        );
        let engine = WasmiEngine::new(&module, &EngineConfig::default()).unwrap();

        assert_eq!(engine.stub_count(), 2);
    }

    #[test]
    fn test_unknown_import_fails_instantiation() {
        let module = artifact(r#"(module (import "env" "host_fn" (func)))"#);
        let engine = WasmiEngine::new(&module, &EngineConfig::default()).unwrap();

        let result = engine.instantiate(&ExecutionConfig::default());
        assert!(matches!(
            result,
            Err(CheckerError::BootstrapFailed {
                stage: BootstrapStage::Instantiate,
                ..
            })
        ));
    }

    #[test]
    fn test_memory_export_of_wrong_kind() {
        let module = artifact(r#"(module (func (export "memory")))"#);
        let engine = WasmiEngine::new(&module, &EngineConfig::default()).unwrap();

        let Err(CheckerError::ExportNotFound { name, reason }) =
            engine.instantiate(&ExecutionConfig::default())
        else {
            panic!("expected ExportNotFound");
        };
        assert_eq!(name, "memory");
        assert_eq!(reason, "signature mismatch: expected memory, found function");
    }

    #[test]
    fn test_wasm_type_mapping() {
        assert_eq!(wasm_type(&ValType::I64), WasmType::I64);
        assert_eq!(wasm_type(&ValType::FuncRef), WasmType::Other);
    }
}
