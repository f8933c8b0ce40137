//! Wasmtime backend.
//!
//! The POSIX-environment flavoured backend: the guest's startup imports are
//! served by a real WASI preview 1 context, code is compiled ahead of time by
//! Cranelift, and the store enforces fuel and memory limits.
//!
//! The engine is configured synchronously: every protocol step is a blocking
//! call that returns before the next one starts.

use std::time::Instant;

use tracing::{debug, info, instrument};
use wasmtime::{
    Config, Engine, Extern, Func, Instance, InstanceAllocationStrategy, Linker, Memory, Module,
    OptLevel, PoolingAllocationConfig, Store, Trap, TypedFunc, Val, ValType,
};

use url_checker_common::{
    BootstrapStage, CheckerError, CompileOptLevel, EngineConfig, EngineKind, ExecutionConfig,
};
use url_checker_host::register_wasi;

use crate::artifact::ModuleArtifact;
use crate::contract::{
    ALLOCATE, ALLOCATE_SHAPE, DEALLOCATE, DEALLOCATE_SHAPE, FuncShape, GuestAddress, GuestValue,
    INITIALIZE_SHAPE, IS_CAN_BE_MODIFIED_SHAPE, IS_VALID_SHAPE, MEMORY, Predicate, WasmType,
};
use crate::engine::{GuestEngine, GuestInstance};
use crate::store::{GuestContext, create_store, refuel};

/// Wasmtime engine with the guest artifact compiled.
///
/// Thread-safe; every instance created from it shares the compiled code and
/// the linker, nothing else.
pub struct WasmtimeEngine {
    engine: Engine,
    module: Module,
    linker: Linker<GuestContext>,
    content_hash: String,
    config: EngineConfig,
}

impl WasmtimeEngine {
    /// Create the engine, compile `artifact` and prepare the WASI linker.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The Wasmtime configuration is invalid
    /// - The pooling allocator cannot be initialized
    /// - The artifact fails to compile
    /// - WASI registration fails
    #[instrument(skip_all, fields(content_hash = %artifact.content_hash()))]
    pub fn new(artifact: &ModuleArtifact, config: &EngineConfig) -> Result<Self, CheckerError> {
        let mut wasmtime_config = Config::new();

        // Always meter; unmetered stores are simply given a full tank
        wasmtime_config.consume_fuel(true);

        wasmtime_config.cranelift_opt_level(match config.cranelift_opt_level {
            CompileOptLevel::None => OptLevel::None,
            CompileOptLevel::Speed => OptLevel::Speed,
            CompileOptLevel::SpeedAndSize => OptLevel::SpeedAndSize,
        });

        if config.pooling_allocator {
            let pooling_config = Self::create_pooling_config(config);

            wasmtime_config
                .allocation_strategy(InstanceAllocationStrategy::Pooling(pooling_config));

            info!(
                max_instances = config.max_instances,
                instance_memory_mb = config.instance_memory_mb,
                "Pooling allocator enabled"
            );
        }

        let engine = Engine::new(&wasmtime_config).map_err(|e| {
            CheckerError::bootstrap(
                BootstrapStage::Engine,
                format!("Failed to create Wasmtime engine: {e}"),
            )
        })?;

        let start = Instant::now();
        let module = Module::new(&engine, artifact.bytes()).map_err(|e| {
            CheckerError::bootstrap(
                BootstrapStage::Compile,
                format!("Core module compilation failed: {e}"),
            )
        })?;

        info!(
            duration_ms = start.elapsed().as_millis(),
            "Guest module compiled"
        );

        let mut linker = Linker::new(&engine);
        register_wasi(&mut linker, GuestContext::wasi)?;

        Ok(Self {
            engine,
            module,
            linker,
            content_hash: artifact.content_hash().to_string(),
            config: config.clone(),
        })
    }

    /// Create pooling allocation configuration.
    fn create_pooling_config(config: &EngineConfig) -> PoolingAllocationConfig {
        let mut pooling = PoolingAllocationConfig::default();

        pooling.total_core_instances(config.max_instances);
        pooling.total_memories(config.max_instances);
        pooling.total_tables(config.max_instances);

        let max_memory_bytes = (config.instance_memory_mb as usize) * 1024 * 1024;
        pooling.max_memory_size(max_memory_bytes);

        pooling
    }

    /// Check if the pooling allocator is enabled.
    pub fn is_pooling_enabled(&self) -> bool {
        self.config.pooling_allocator
    }
}

impl GuestEngine for WasmtimeEngine {
    fn kind(&self) -> EngineKind {
        EngineKind::Wasmtime
    }

    fn content_hash(&self) -> &str {
        &self.content_hash
    }

    #[instrument(skip_all, fields(engine = "wasmtime"))]
    fn instantiate(
        &self,
        config: &ExecutionConfig,
    ) -> Result<Box<dyn GuestInstance>, CheckerError> {
        let mut store = create_store(&self.engine, config)?;

        let instance = self
            .linker
            .instantiate(&mut store, &self.module)
            .map_err(|e| {
                CheckerError::bootstrap(
                    BootstrapStage::Instantiate,
                    format!("Instantiation failed: {e}"),
                )
            })?;

        debug!("Module instantiated, resolving exports");

        let exports = WasmtimeExports::resolve(&instance, &mut store)?;

        debug!("Exports resolved, running initializer");

        refuel(&mut store).map_err(|e| {
            CheckerError::bootstrap(BootstrapStage::Initialize, format!("Failed to set fuel: {e}"))
        })?;
        exports
            .initialize
            .call(&mut store, ())
            .map_err(|e| CheckerError::bootstrap(BootstrapStage::Initialize, describe_error(&e)))?;

        debug!(
            memory_bytes = exports.memory.data_size(&store),
            "Guest initialized"
        );

        Ok(Box::new(WasmtimeInstance { store, exports }))
    }
}

impl std::fmt::Debug for WasmtimeEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WasmtimeEngine")
            .field("content_hash", &self.content_hash)
            .field("pooling_allocator", &self.config.pooling_allocator)
            .field("cranelift_opt_level", &self.config.cranelift_opt_level)
            .finish_non_exhaustive()
    }
}

/// Export handles resolved once per instance.
struct WasmtimeExports {
    memory: Memory,
    initialize: TypedFunc<(), ()>,
    allocate: TypedFunc<i32, i32>,
    deallocate: TypedFunc<i32, ()>,
    is_valid: Func,
    is_can_be_modified: Func,
}

impl WasmtimeExports {
    /// Resolve every export in the contract, all or nothing.
    fn resolve(
        instance: &Instance,
        store: &mut Store<GuestContext>,
    ) -> Result<Self, CheckerError> {
        let memory = resolve_memory(instance, store)?;

        let initialize = resolve_func(instance, store, &INITIALIZE_SHAPE)?;
        let allocate = resolve_func(instance, store, &ALLOCATE_SHAPE)?;
        let deallocate = resolve_func(instance, store, &DEALLOCATE_SHAPE)?;
        let is_valid = resolve_func(instance, store, &IS_VALID_SHAPE)?;
        let is_can_be_modified = resolve_func(instance, store, &IS_CAN_BE_MODIFIED_SHAPE)?;

        Ok(Self {
            memory,
            initialize: typed(initialize, store, &INITIALIZE_SHAPE)?,
            allocate: typed(allocate, store, &ALLOCATE_SHAPE)?,
            deallocate: typed(deallocate, store, &DEALLOCATE_SHAPE)?,
            is_valid,
            is_can_be_modified,
        })
    }

    fn predicate(&self, predicate: Predicate) -> Func {
        match predicate {
            Predicate::IsValid => self.is_valid,
            Predicate::IsCanBeModified => self.is_can_be_modified,
        }
    }
}

fn resolve_memory(
    instance: &Instance,
    store: &mut Store<GuestContext>,
) -> Result<Memory, CheckerError> {
    match instance.get_export(&mut *store, MEMORY) {
        Some(Extern::Memory(memory)) => {
            if memory.ty(&*store).is_64() {
                return Err(CheckerError::signature_mismatch(
                    MEMORY,
                    "expected 32-bit memory, found 64-bit memory",
                ));
            }
            Ok(memory)
        }
        Some(other) => Err(CheckerError::signature_mismatch(
            MEMORY,
            format!("expected memory, found {}", extern_kind(&other)),
        )),
        None => Err(CheckerError::export_missing(MEMORY)),
    }
}

fn resolve_func(
    instance: &Instance,
    store: &mut Store<GuestContext>,
    shape: &FuncShape,
) -> Result<Func, CheckerError> {
    let func = match instance.get_export(&mut *store, shape.name) {
        Some(Extern::Func(func)) => func,
        Some(other) => {
            return Err(CheckerError::signature_mismatch(
                shape.name,
                format!("expected function, found {}", extern_kind(&other)),
            ));
        }
        None => return Err(CheckerError::export_missing(shape.name)),
    };

    let ty = func.ty(&*store);
    let params: Vec<WasmType> = ty.params().map(|t| wasm_type(&t)).collect();
    let results: Vec<WasmType> = ty.results().map(|t| wasm_type(&t)).collect();
    shape.check(&params, &results)?;

    Ok(func)
}

fn typed<P, R>(
    func: Func,
    store: &Store<GuestContext>,
    shape: &FuncShape,
) -> Result<TypedFunc<P, R>, CheckerError>
where
    P: wasmtime::WasmParams,
    R: wasmtime::WasmResults,
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
        _ => "other extern",
    }
}

/// Human-readable description of a call error.
fn describe_error(error: &wasmtime::Error) -> String {
    if is_out_of_fuel(error) {
        return "out of fuel".to_string();
    }
    match error.downcast_ref::<Trap>() {
        Some(trap) => format!("trap: {trap}"),
        None => error.to_string(),
    }
}

/// Check if an error is due to fuel exhaustion.
fn is_out_of_fuel(error: &wasmtime::Error) -> bool {
    error
        .downcast_ref::<Trap>()
        .is_some_and(|trap| *trap == Trap::OutOfFuel)
}

/// One live wasmtime guest.
struct WasmtimeInstance {
    store: Store<GuestContext>,
    exports: WasmtimeExports,
}

impl WasmtimeInstance {
    fn refuel(&mut self, export: &str) -> Result<(), CheckerError> {
        refuel(&mut self.store)
            .map_err(|e| CheckerError::guest_call(export, format!("Failed to set fuel: {e}")))
    }
}

impl GuestInstance for WasmtimeInstance {
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
                memory_size: memory.data_size(&self.store),
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
                memory_size: memory.data_size(&self.store),
            })?;
        Ok(buffer)
    }

    fn memory_size(&self) -> usize {
        self.exports.memory.data_size(&self.store)
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
