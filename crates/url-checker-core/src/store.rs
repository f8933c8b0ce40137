//! Per-instance wasmtime store management.
//!
//! This module provides:
//! - [`GuestContext`]: store data for one wasmtime guest instance
//! - [`create_store`]: a store with memory limits and fuel applied
//! - fuel helpers used before every guest call

use wasmtime::{Engine, Store, StoreLimits, StoreLimitsBuilder};
use wasmtime_wasi::preview1::WasiP1Ctx;

use url_checker_common::{BootstrapStage, CheckerError, ExecutionConfig};
use url_checker_host::build_wasi_ctx;

/// Store data for one wasmtime guest instance.
///
/// Host functions reach it through [`wasmtime::Caller`].
pub struct GuestContext {
    /// WASI preview 1 context for the guest's startup imports.
    wasi: WasiP1Ctx,

    /// Linear memory and table limits.
    limits: StoreLimits,

    /// Fuel granted per guest call, when metering is enabled.
    fuel_per_call: Option<u64>,
}

impl GuestContext {
    /// Create a context for `config`.
    pub fn new(config: &ExecutionConfig) -> Self {
        let limits = StoreLimitsBuilder::new()
            .memory_size(config.max_memory_bytes())
            .instances(1)
            .build();

        Self {
            wasi: build_wasi_ctx(config.inherit_stdio),
            limits,
            fuel_per_call: config.fuel_metering.then_some(config.max_fuel),
        }
    }

    /// Fuel granted per guest call, if metering is enabled.
    pub fn fuel_per_call(&self) -> Option<u64> {
        self.fuel_per_call
    }

    /// Project onto the WASI context (for linker registration).
    pub fn wasi(ctx: &mut Self) -> &mut WasiP1Ctx {
        &mut ctx.wasi
    }
}

/// Create a new wasmtime store for one guest instance.
///
/// # Errors
///
/// Returns an error if fuel cannot be set on the store.
pub fn create_store(
    engine: &Engine,
    config: &ExecutionConfig,
) -> Result<Store<GuestContext>, CheckerError> {
    let mut store = Store::new(engine, GuestContext::new(config));
    store.limiter(|ctx| &mut ctx.limits);

    refuel(&mut store).map_err(|e| {
        CheckerError::bootstrap(BootstrapStage::Instantiate, format!("Failed to set fuel: {e}"))
    })?;

    Ok(store)
}

/// Reset the store's fuel before a guest call.
///
/// The engine always consumes fuel; without metering the tank is simply
/// filled to the top.
pub fn refuel(store: &mut Store<GuestContext>) -> wasmtime::Result<()> {
    let fuel = store.data().fuel_per_call.unwrap_or(u64::MAX);
    store.set_fuel(fuel)
}

/// Get remaining fuel from a store.
pub fn get_remaining_fuel(store: &Store<GuestContext>) -> Option<u64> {
    store.get_fuel().ok()
}
