//! The guest export contract.
//!
//! Every guest artifact the checker can drive exposes the same export surface:
//!
//! | Export               | Shape (wasm32)   |
//! |----------------------|------------------|
//! | `_initialize`        | `() -> ()`       |
//! | `memory`             | 32-bit memory    |
//! | `allocate`           | `(i32) -> i32`   |
//! | `deallocate`         | `(i32) -> ()`    |
//! | `is_valid`           | `(i32) -> i32`   |
//! | `is_can_be_modified` | `(i32) -> i32`   |
//!
//! Addresses are always 32-bit. Both engine backends check their resolved
//! exports against the shapes declared here, so a guest built for another
//! pointer width is rejected at bootstrap instead of having its addresses
//! truncated.

use std::fmt;

use url_checker_common::{CheckerError, WireEncoding};

/// Name of the one-time startup export.
pub const INITIALIZE: &str = "_initialize";

/// Name of the linear memory export.
pub const MEMORY: &str = "memory";

/// Name of the guest allocator export.
pub const ALLOCATE: &str = "allocate";

/// Name of the guest deallocator export.
pub const DEALLOCATE: &str = "deallocate";

/// Name of the validity predicate export.
pub const IS_VALID: &str = "is_valid";

/// Name of the modifiability predicate export.
pub const IS_CAN_BE_MODIFIED: &str = "is_can_be_modified";

/// Engine-neutral WebAssembly value type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WasmType {
    I32,
    I64,
    F32,
    F64,
    /// Vector and reference types.
    Other,
}

impl fmt::Display for WasmType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WasmType::I32 => "i32",
            WasmType::I64 => "i64",
            WasmType::F32 => "f32",
            WasmType::F64 => "f64",
            WasmType::Other => "ref/v128",
        };
        f.write_str(name)
    }
}

/// Expected signature of a function export.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FuncShape {
    /// Export name.
    pub name: &'static str,
    /// Parameter types.
    pub params: &'static [WasmType],
    /// Result types.
    pub results: &'static [WasmType],
}

impl FuncShape {
    /// Check a resolved function's signature against this shape.
    ///
    /// # Errors
    ///
    /// Returns [`CheckerError::ExportNotFound`] with a signature mismatch
    /// reason if the types differ.
    pub fn check(&self, params: &[WasmType], results: &[WasmType]) -> Result<(), CheckerError> {
        if params == self.params && results == self.results {
            return Ok(());
        }
        Err(CheckerError::signature_mismatch(
            self.name,
            format!(
                "expected {}, found {}",
                self,
                DisplaySignature { params, results }
            ),
        ))
    }
}

impl fmt::Display for FuncShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        DisplaySignature {
            params: self.params,
            results: self.results,
        }
        .fmt(f)
    }
}

struct DisplaySignature<'a> {
    params: &'a [WasmType],
    results: &'a [WasmType],
}

impl fmt::Display for DisplaySignature<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let join = |types: &[WasmType]| {
            types
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(", ")
        };
        write!(f, "({})", join(self.params))?;
        match self.results {
            [] => f.write_str(" -> ()"),
            [single] => write!(f, " -> {single}"),
            many => write!(f, " -> ({})", join(many)),
        }
    }
}

pub const INITIALIZE_SHAPE: FuncShape = FuncShape {
    name: INITIALIZE,
    params: &[],
    results: &[],
};

pub const ALLOCATE_SHAPE: FuncShape = FuncShape {
    name: ALLOCATE,
    params: &[WasmType::I32],
    results: &[WasmType::I32],
};

pub const DEALLOCATE_SHAPE: FuncShape = FuncShape {
    name: DEALLOCATE,
    params: &[WasmType::I32],
    results: &[],
};

pub const IS_VALID_SHAPE: FuncShape = FuncShape {
    name: IS_VALID,
    params: &[WasmType::I32],
    results: &[WasmType::I32],
};

pub const IS_CAN_BE_MODIFIED_SHAPE: FuncShape = FuncShape {
    name: IS_CAN_BE_MODIFIED,
    params: &[WasmType::I32],
    results: &[WasmType::I32],
};

/// One of the two guest predicates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Predicate {
    /// `is_valid`: the guest's URL model can be initialised from the input.
    IsValid,
    /// `is_can_be_modified`: round-tripping the query items changes the input.
    IsCanBeModified,
}

impl Predicate {
    /// Export name of the predicate.
    pub fn export_name(self) -> &'static str {
        self.shape().name
    }

    /// Expected signature of the predicate.
    pub fn shape(self) -> &'static FuncShape {
        match self {
            Predicate::IsValid => &IS_VALID_SHAPE,
            Predicate::IsCanBeModified => &IS_CAN_BE_MODIFIED_SHAPE,
        }
    }
}

impl fmt::Display for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.export_name())
    }
}

/// An address in 32-bit guest linear memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GuestAddress(u32);

impl GuestAddress {
    /// Wrap a raw address.
    pub const fn new(address: u32) -> Self {
        Self(address)
    }

    /// Reinterpret the bits of a wasm `i32` as an address.
    #[allow(clippy::cast_sign_loss)]
    pub const fn from_i32(raw: i32) -> Self {
        Self(raw as u32)
    }

    /// The address as a wasm `i32` argument (same bits).
    #[allow(clippy::cast_possible_wrap)]
    pub const fn as_i32(self) -> i32 {
        self.0 as i32
    }

    /// `true` for address 0, which a failed guest `malloc` returns.
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// The address as an unsigned offset.
    pub const fn get(self) -> u32 {
        self.0
    }

    /// The address as a host slice offset.
    pub fn offset(self) -> usize {
        usize::try_from(self.0).unwrap_or(usize::MAX)
    }
}

impl fmt::Display for GuestAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// A value returned by a guest call, independent of the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuestValue {
    I32(i32),
    I64(i64),
    /// Any other type; only its type is retained.
    Other(WasmType),
}

impl GuestValue {
    fn type_of(self) -> WasmType {
        match self {
            GuestValue::I32(_) => WasmType::I32,
            GuestValue::I64(_) => WasmType::I64,
            GuestValue::Other(ty) => ty,
        }
    }
}

/// Lay out `input` for the guest according to `encoding`.
///
/// Returns `None` when the input cannot be represented: a NUL-terminated
/// string must not contain NUL itself.
pub fn encode(input: &str, encoding: WireEncoding) -> Option<Vec<u8>> {
    match encoding {
        WireEncoding::NulTerminated => {
            if input.as_bytes().contains(&0) {
                return None;
            }
            let mut bytes = Vec::with_capacity(input.len() + 1);
            bytes.extend_from_slice(input.as_bytes());
            bytes.push(0);
            Some(bytes)
        }
        WireEncoding::Raw => Some(input.as_bytes().to_vec()),
    }
}

/// Decode a predicate's results: exactly one `i32`, non-zero meaning `true`.
///
/// # Errors
///
/// Returns [`CheckerError::UnexpectedResultShape`] for zero results, more
/// than one result, or a result that is not an `i32`.
pub fn decode_bool(predicate: Predicate, results: &[GuestValue]) -> Result<bool, CheckerError> {
    match results {
        [GuestValue::I32(value)] => Ok(*value != 0),
        [] => Err(CheckerError::result_shape(
            predicate.export_name(),
            "no results returned",
        )),
        [other] => Err(CheckerError::result_shape(
            predicate.export_name(),
            format!("expected i32, got {}", other.type_of()),
        )),
        many => Err(CheckerError::result_shape(
            predicate.export_name(),
            format!("expected 1 result, got {}", many.len()),
        )),
    }
}
