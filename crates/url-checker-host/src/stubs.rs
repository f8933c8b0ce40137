//! Stub system-interface shim for wasmi linkers.
//!
//! wasmi has no WASI implementation of its own. The guest only touches WASI
//! while starting up, so every `wasi_snapshot_preview1` function it imports is
//! defined here with the smallest behavior that lets startup succeed:
//!
//! - argument and environment queries report empty lists
//! - clocks report the host's wall-clock time
//! - `random_get` fills the buffer with zeros
//! - `fd_write` to stdout/stderr is logged and reported as fully written
//! - `proc_exit` traps
//! - everything else returns `ERRNO_NOSYS`
//!
//! Imports from any other module are left undefined, so instantiation fails
//! for guests that need more than WASI.

use std::time::{SystemTime, UNIX_EPOCH};

use tracing::debug;
use url_checker_common::{BootstrapStage, CheckerError};
use wasmi::{Caller, Error, Extern, ExternType, Linker, Memory, Module, Val};

use crate::logging::GuestStream;

/// Import module name of WASI preview 1.
pub const WASI_MODULE: &str = "wasi_snapshot_preview1";

/// WASI `errno` for success.
pub const ERRNO_SUCCESS: i32 = 0;

/// WASI `errno` for a bad file descriptor.
pub const ERRNO_BADF: i32 = 8;

/// WASI `errno` for a memory access fault.
pub const ERRNO_FAULT: i32 = 21;

/// WASI `errno` for an unsupported function.
pub const ERRNO_NOSYS: i32 = 52;

/// Behavior of one stubbed WASI function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WasiStub {
    /// `args_sizes_get` / `environ_sizes_get`: write two zero counts.
    EmptySizes,
    /// `args_get` / `environ_get`: nothing to copy.
    EmptyList,
    /// `clock_time_get`: write the current time in nanoseconds.
    ClockTime,
    /// `random_get`: zero-fill the buffer.
    Random,
    /// `fd_write`: log stdout/stderr output.
    FdWrite,
    /// `proc_exit`: trap with the exit code.
    ProcExit,
    /// Anything else.
    NoSys,
}

impl WasiStub {
    fn for_name(name: &str) -> Self {
        match name {
            "args_sizes_get" | "environ_sizes_get" => WasiStub::EmptySizes,
            "args_get" | "environ_get" => WasiStub::EmptyList,
            "clock_time_get" => WasiStub::ClockTime,
            "random_get" => WasiStub::Random,
            "fd_write" => WasiStub::FdWrite,
            "proc_exit" => WasiStub::ProcExit,
            _ => WasiStub::NoSys,
        }
    }

    fn invoke<T>(self, caller: &mut Caller<'_, T>, params: &[Val]) -> Result<i32, Error> {
        let errno = match self {
            WasiStub::EmptySizes => {
                let (Some(count_ptr), Some(size_ptr)) = (param_i32(params, 0), param_i32(params, 1))
                else {
                    return Ok(ERRNO_FAULT);
                };
                if write_bytes(caller, count_ptr, &0u32.to_le_bytes())
                    && write_bytes(caller, size_ptr, &0u32.to_le_bytes())
                {
                    ERRNO_SUCCESS
                } else {
                    ERRNO_FAULT
                }
            }
            WasiStub::EmptyList => ERRNO_SUCCESS,
            WasiStub::ClockTime => {
                let Some(out_ptr) = param_i32(params, 2) else {
                    return Ok(ERRNO_FAULT);
                };
                let nanos = SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .map_or(0, |d| u64::try_from(d.as_nanos()).unwrap_or(u64::MAX));
                if write_bytes(caller, out_ptr, &nanos.to_le_bytes()) {
                    ERRNO_SUCCESS
                } else {
                    ERRNO_FAULT
                }
            }
            WasiStub::Random => {
                let (Some(buf), Some(len)) = (param_i32(params, 0), param_i32(params, 1)) else {
                    return Ok(ERRNO_FAULT);
                };
                let Ok(len) = usize::try_from(len) else {
                    return Ok(ERRNO_FAULT);
                };
                if write_bytes(caller, buf, &vec![0u8; len]) {
                    ERRNO_SUCCESS
                } else {
                    ERRNO_FAULT
                }
            }
            WasiStub::FdWrite => fd_write(caller, params),
            WasiStub::ProcExit => {
                let code = param_i32(params, 0).unwrap_or(-1);
                return Err(Error::new(format!("guest called proc_exit({code})")));
            }
            WasiStub::NoSys => ERRNO_NOSYS,
        };
        Ok(errno)
    }
}

/// Define a stub for every WASI function `module` imports.
///
/// Returns the number of stubs defined.
///
/// # Errors
///
/// Returns [`CheckerError::BootstrapFailed`] at the `Shim` stage if a stub
/// cannot be defined (e.g. a duplicate definition on the linker).
pub fn define_wasi_stubs<T: 'static>(
    linker: &mut Linker<T>,
    module: &Module,
) -> Result<usize, CheckerError> {
    let mut defined = 0;

    for import in module.imports() {
        if import.module() != WASI_MODULE {
            continue;
        }
        let ExternType::Func(func_type) = import.ty() else {
            continue;
        };

        let name = import.name();
        let stub = WasiStub::for_name(name);
        linker
            .func_new(
                WASI_MODULE,
                name,
                func_type.clone(),
                move |mut caller: Caller<'_, T>, params: &[Val], results: &mut [Val]| {
                    let errno = stub.invoke(&mut caller, params)?;
                    if let Some(slot) = results.first_mut() {
                        *slot = Val::I32(errno);
                    }
                    Ok(())
                },
            )
            .map_err(|e| {
                CheckerError::bootstrap(
                    BootstrapStage::Shim,
                    format!("Failed to define WASI stub '{name}': {e}"),
                )
            })?;

        debug!(import = name, stub = ?stub, "WASI stub defined");
        defined += 1;
    }

    Ok(defined)
}

fn param_i32(params: &[Val], index: usize) -> Option<i32> {
    params.get(index).and_then(Val::i32)
}

fn guest_memory<T>(caller: &Caller<'_, T>) -> Option<Memory> {
    caller.get_export("memory").and_then(Extern::into_memory)
}

fn write_bytes<T>(caller: &mut Caller<'_, T>, pointer: i32, bytes: &[u8]) -> bool {
    let (Some(memory), Ok(offset)) = (guest_memory(caller), usize::try_from(pointer)) else {
        return false;
    };
    memory.write(&mut *caller, offset, bytes).is_ok()
}

fn read_bytes<T>(caller: &Caller<'_, T>, memory: Memory, pointer: u32, length: u32) -> Option<Vec<u8>> {
    let mut buffer = vec![0u8; usize::try_from(length).ok()?];
    let offset = usize::try_from(pointer).ok()?;
    memory.read(caller, offset, &mut buffer).ok()?;
    Some(buffer)
}

/// `fd_write(fd, iovs, iovs_len, nwritten) -> errno`.
fn fd_write<T>(caller: &mut Caller<'_, T>, params: &[Val]) -> i32 {
    let (Some(fd), Some(iovs), Some(iovs_len), Some(nwritten)) = (
        param_i32(params, 0),
        param_i32(params, 1),
        param_i32(params, 2),
        param_i32(params, 3),
    ) else {
        return ERRNO_FAULT;
    };
    let Some(stream) = GuestStream::from_fd(fd) else {
        return ERRNO_BADF;
    };
    let Some(memory) = guest_memory(caller) else {
        return ERRNO_FAULT;
    };

    #[allow(clippy::cast_sign_loss)]
    let (iovs, iovs_len) = (iovs as u32, iovs_len as u32);

    let mut output = Vec::new();
    for index in 0..iovs_len {
        // Each iovec is { buf: u32, buf_len: u32 }
        let Some(entry) = index
            .checked_mul(8)
            .and_then(|o| iovs.checked_add(o))
            .and_then(|at| read_bytes(caller, memory, at, 8))
        else {
            return ERRNO_FAULT;
        };
        let buf = u32::from_le_bytes([entry[0], entry[1], entry[2], entry[3]]);
        let buf_len = u32::from_le_bytes([entry[4], entry[5], entry[6], entry[7]]);
        let Some(bytes) = read_bytes(caller, memory, buf, buf_len) else {
            return ERRNO_FAULT;
        };
        output.extend_from_slice(&bytes);
    }

    stream.log(&output);

    let Ok(written) = u32::try_from(output.len()) else {
        return ERRNO_FAULT;
    };
    if write_bytes(caller, nwritten, &written.to_le_bytes()) {
        ERRNO_SUCCESS
    } else {
        ERRNO_FAULT
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wasmi::{Engine, Store};

    const PROBE_WAT: &str = r#"
        (module
            (import "wasi_snapshot_preview1" "environ_sizes_get"
                (func $environ_sizes_get (param i32 i32) (result i32)))
            (import "wasi_snapshot_preview1" "sched_yield"
                (func $sched_yield (result i32)))
            (import "wasi_snapshot_preview1" "fd_write"
                (func $fd_write (param i32 i32 i32 i32) (result i32)))
            (import "wasi_snapshot_preview1" "proc_exit"
                (func $proc_exit (param i32)))
            (memory (export "memory") 1)
            ;; iovec at 16 -> "hello\n" at 32
            (data (i32.const 16) "\20\00\00\00\06\00\00\00")
            (data (i32.const 32) "hello\n")

            (func (export "sizes") (result i32)
                (i32.store (i32.const 0) (i32.const 99))
                (call $environ_sizes_get (i32.const 0) (i32.const 4))
            )
            (func (export "count") (result i32)
                (i32.load (i32.const 0))
            )
            (func (export "yield") (result i32)
                (call $sched_yield)
            )
            (func (export "write") (result i32)
                (call $fd_write (i32.const 1) (i32.const 16) (i32.const 1) (i32.const 8))
                drop
                (i32.load (i32.const 8))
            )
            (func (export "write_badf") (result i32)
                (call $fd_write (i32.const 7) (i32.const 16) (i32.const 1) (i32.const 8))
            )
            (func (export "exit")
                (call $proc_exit (i32.const 3))
            )
        )
    "#;

    fn instantiate(wat: &str) -> (Store<()>, wasmi::Instance, usize) {
        let engine = Engine::default();
        let wasm = wat::parse_str(wat).unwrap();
        let module = Module::new(&engine, &wasm[..]).unwrap();
        let mut linker = Linker::<()>::new(&engine);
        let defined = define_wasi_stubs(&mut linker, &module).unwrap();
        let mut store = Store::new(&engine, ());
        let instance = linker
            .instantiate(&mut store, &module)
            .unwrap()
            .start(&mut store)
            .unwrap();
        (store, instance, defined)
    }

    fn call_i32(store: &mut Store<()>, instance: &wasmi::Instance, name: &str) -> i32 {
        instance
            .get_typed_func::<(), i32>(&*store, name)
            .unwrap()
            .call(store, ())
            .unwrap()
    }

    #[test]
    fn test_stub_for_name() {
        assert_eq!(WasiStub::for_name("environ_sizes_get"), WasiStub::EmptySizes);
        assert_eq!(WasiStub::for_name("args_get"), WasiStub::EmptyList);
        assert_eq!(WasiStub::for_name("proc_exit"), WasiStub::ProcExit);
        assert_eq!(WasiStub::for_name("path_open"), WasiStub::NoSys);
    }

    #[test]
    fn test_defines_every_wasi_import() {
        let (_, _, defined) = instantiate(PROBE_WAT);
        assert_eq!(defined, 4);
    }

    #[test]
    fn test_empty_sizes_writes_zero() {
        let (mut store, instance, _) = instantiate(PROBE_WAT);

        assert_eq!(call_i32(&mut store, &instance, "sizes"), ERRNO_SUCCESS);
        assert_eq!(call_i32(&mut store, &instance, "count"), 0);
    }

    #[test]
    fn test_unsupported_returns_nosys() {
        let (mut store, instance, _) = instantiate(PROBE_WAT);
        assert_eq!(call_i32(&mut store, &instance, "yield"), ERRNO_NOSYS);
    }

    #[test]
    fn test_fd_write_reports_bytes_written() {
        let (mut store, instance, _) = instantiate(PROBE_WAT);
        assert_eq!(call_i32(&mut store, &instance, "write"), 6);
        assert_eq!(call_i32(&mut store, &instance, "write_badf"), ERRNO_BADF);
    }

    #[test]
    fn test_proc_exit_traps() {
        let (mut store, instance, _) = instantiate(PROBE_WAT);
        let exit = instance.get_typed_func::<(), ()>(&store, "exit").unwrap();
        assert!(exit.call(&mut store, ()).is_err());
    }

    #[test]
    fn test_non_wasi_import_left_undefined() {
        let wat = r#"
            (module
                (import "env" "log" (func (param i32)))
            )
        "#;
        let engine = Engine::default();
        let wasm = wat::parse_str(wat).unwrap();
        let module = Module::new(&engine, &wasm[..]).unwrap();
        let mut linker = Linker::<()>::new(&engine);

        assert_eq!(define_wasi_stubs(&mut linker, &module).unwrap(), 0);

        let mut store = Store::new(&engine, ());
        assert!(linker.instantiate(&mut store, &module).is_err());
    }
}
