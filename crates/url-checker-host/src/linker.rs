//! WASI preview 1 registration for wasmtime linkers.
//!
//! The wasmtime backend gives the guest a real, capability-less WASI context:
//! no preopened directories, no environment, no arguments. Standard output and
//! error are only inherited when explicitly requested.

use tracing::debug;
use url_checker_common::{BootstrapStage, CheckerError};
use wasmtime::Linker;
use wasmtime_wasi::WasiCtxBuilder;
use wasmtime_wasi::preview1::{self, WasiP1Ctx};

/// Build the WASI context handed to one guest instance.
///
/// # Arguments
///
/// * `inherit_stdio` - Forward guest stdout/stderr to the host process
pub fn build_wasi_ctx(inherit_stdio: bool) -> WasiP1Ctx {
    let mut builder = WasiCtxBuilder::new();
    if inherit_stdio {
        builder.inherit_stdout().inherit_stderr();
    }
    builder.build_p1()
}

/// Register every `wasi_snapshot_preview1` function on a core module linker.
///
/// `get` projects the store data onto its WASI context.
///
/// # Errors
///
/// Returns [`CheckerError::BootstrapFailed`] at the `Shim` stage if
/// registration fails.
pub fn register_wasi<T: Send + 'static>(
    linker: &mut Linker<T>,
    get: fn(&mut T) -> &mut WasiP1Ctx,
) -> Result<(), CheckerError> {
    preview1::add_to_linker_sync(linker, get).map_err(|e| {
        CheckerError::bootstrap(
            BootstrapStage::Shim,
            format!("Failed to register WASI preview 1: {e}"),
        )
    })?;

    debug!("WASI preview 1 registered on linker");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use wasmtime::{Engine, Module, Store};

    fn identity(ctx: &mut WasiP1Ctx) -> &mut WasiP1Ctx {
        ctx
    }

    #[test]
    fn test_register_wasi() {
        let engine = Engine::default();
        let mut linker: Linker<WasiP1Ctx> = Linker::new(&engine);

        let result = register_wasi(&mut linker, identity);
        assert!(result.is_ok());
    }

    #[test]
    fn test_wasi_import_resolves() {
        let wat = r#"
            (module
                (import "wasi_snapshot_preview1" "environ_sizes_get"
                    (func $environ_sizes_get (param i32 i32) (result i32)))
                (memory (export "memory") 1)
                (func (export "probe") (result i32)
                    (call $environ_sizes_get (i32.const 0) (i32.const 4))
                )
            )
        "#;

        let engine = Engine::default();
        let mut linker: Linker<WasiP1Ctx> = Linker::new(&engine);
        register_wasi(&mut linker, identity).unwrap();

        let module = Module::new(&engine, wat).unwrap();
        let mut store = Store::new(&engine, build_wasi_ctx(false));
        let instance = linker.instantiate(&mut store, &module).unwrap();

        let probe = instance
            .get_typed_func::<(), i32>(&mut store, "probe")
            .unwrap();
        // Empty environment: success with zero entries
        assert_eq!(probe.call(&mut store, ()).unwrap(), 0);
    }
}
