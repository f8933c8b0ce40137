//! The guest module artifact.
//!
//! This module provides [`ModuleArtifact`], the immutable WebAssembly bytes the
//! checker runs. An artifact is validated once when loaded and never written
//! afterwards; engines compile it, instances never touch it.
//!
//! # Sources
//!
//! - **Embedded**: bytes baked into the binary with the `embedded-guest`
//!   feature, loaded lazily into a process-wide singleton
//! - **File**: a `.wasm` file named in configuration
//! - **Bytes**: in-memory bytes (tests, callers with their own loading)

use std::borrow::Cow;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use tracing::{debug, instrument};

use url_checker_common::{BootstrapStage, CheckerError};

#[cfg(feature = "embedded-guest")]
static EMBEDDED_WASM: &[u8] = include_bytes!(concat!(
    env!("CARGO_MANIFEST_DIR"),
    "/guest/checker.wasm"
));

#[cfg(not(feature = "embedded-guest"))]
static EMBEDDED_WASM: &[u8] = &[];

static EMBEDDED: LazyLock<Result<ModuleArtifact, String>> = LazyLock::new(|| {
    if EMBEDDED_WASM.is_empty() {
        return Err("no guest artifact embedded (build with the `embedded-guest` feature)".into());
    }
    ModuleArtifact::new(Cow::Borrowed(EMBEDDED_WASM), ArtifactSource::Embedded)
        .map_err(|e| e.to_string())
});

/// Where an artifact's bytes came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArtifactSource {
    /// Compiled into the binary.
    Embedded,
    /// Read from a file.
    File(PathBuf),
    /// Supplied as bytes.
    Bytes,
}

/// Immutable guest module bytes.
///
/// # Thread Safety
///
/// `ModuleArtifact` is read-only after construction and can be shared freely.
#[derive(Clone)]
pub struct ModuleArtifact {
    /// The raw WebAssembly bytes.
    bytes: Cow<'static, [u8]>,

    /// Hash of the bytes, for logs and cache keys.
    content_hash: String,

    /// Where the bytes came from.
    source: ArtifactSource,
}

impl ModuleArtifact {
    /// The artifact embedded at build time.
    ///
    /// The first call validates the bytes; later calls return the same
    /// instance.
    ///
    /// # Errors
    ///
    /// Returns [`CheckerError::BootstrapFailed`] at the `Artifact` stage if
    /// nothing was embedded or the embedded bytes are not WebAssembly.
    pub fn embedded() -> Result<&'static ModuleArtifact, CheckerError> {
        EMBEDDED
            .as_ref()
            .map_err(|reason| CheckerError::bootstrap(BootstrapStage::Artifact, reason.clone()))
    }

    /// Wrap in-memory WebAssembly bytes.
    ///
    /// # Errors
    ///
    /// Returns [`CheckerError::BootstrapFailed`] at the `Artifact` stage if
    /// the bytes do not start with a WebAssembly header.
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Result<Self, CheckerError> {
        Self::new(Cow::Owned(bytes.into()), ArtifactSource::Bytes)
    }

    /// Read a `.wasm` file.
    ///
    /// # Errors
    ///
    /// Returns [`CheckerError::BootstrapFailed`] at the `Artifact` stage if
    /// the file cannot be read or is not WebAssembly.
    #[instrument(skip_all, fields(path = %path.as_ref().display()))]
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, CheckerError> {
        let path = path.as_ref();
        let bytes = std::fs::read(path).map_err(|e| {
            CheckerError::bootstrap(
                BootstrapStage::Artifact,
                format!("Failed to read guest artifact {}: {e}", path.display()),
            )
        })?;

        Self::new(Cow::Owned(bytes), ArtifactSource::File(path.to_path_buf()))
    }

    fn new(bytes: Cow<'static, [u8]>, source: ArtifactSource) -> Result<Self, CheckerError> {
        Self::validate_wasm_header(&bytes)?;

        let content_hash = compute_hash(&bytes);

        debug!(
            content_hash = %content_hash,
            bytes_len = bytes.len(),
            source = ?source,
            "Guest artifact loaded"
        );

        Ok(Self {
            bytes,
            content_hash,
            source,
        })
    }

    /// The raw WebAssembly bytes.
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Hash of the raw bytes.
    pub fn content_hash(&self) -> &str {
        &self.content_hash
    }

    /// Where the bytes came from.
    pub fn source(&self) -> &ArtifactSource {
        &self.source
    }

    /// Validate WebAssembly header (magic number and core module version).
    fn validate_wasm_header(bytes: &[u8]) -> Result<(), CheckerError> {
        if bytes.len() < 8 {
            return Err(CheckerError::bootstrap(
                BootstrapStage::Artifact,
                "Invalid Wasm: file too small",
            ));
        }

        // Check magic number: \0asm
        if &bytes[0..4] != b"\0asm" {
            return Err(CheckerError::bootstrap(
                BootstrapStage::Artifact,
                "Invalid Wasm: bad magic number",
            ));
        }

        // Components use a different version/layer word
        if bytes[4..8] != [0x01, 0x00, 0x00, 0x00] {
            return Err(CheckerError::bootstrap(
                BootstrapStage::Artifact,
                "Invalid Wasm: not a core module (version 1)",
            ));
        }

        Ok(())
    }
}

impl std::fmt::Debug for ModuleArtifact {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleArtifact")
            .field("content_hash", &self.content_hash)
            .field("source", &self.source)
            .field("bytes_len", &self.bytes.len())
            .finish_non_exhaustive()
    }
}

/// Compute a hash of the given bytes.
fn compute_hash(bytes: &[u8]) -> String {
    let mut hasher = DefaultHasher::new();
    bytes.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}

#[cfg(test)]
mod tests {
    use super::*;

    // Minimal valid Wasm module (empty module)
    const MINIMAL_WASM: &[u8] = &[
        0x00, 0x61, 0x73, 0x6d, // magic: \0asm
        0x01, 0x00, 0x00, 0x00, // version: 1
    ];

    #[test]
    fn test_validate_wasm_header_valid() {
        assert!(ModuleArtifact::validate_wasm_header(MINIMAL_WASM).is_ok());
    }

    #[test]
    fn test_validate_wasm_header_too_small() {
        let result = ModuleArtifact::validate_wasm_header(&[0x00, 0x61]);
        assert!(matches!(
            result,
            Err(CheckerError::BootstrapFailed {
                stage: BootstrapStage::Artifact,
                ..
            })
        ));
    }

    #[test]
    fn test_validate_wasm_header_bad_magic() {
        let bad_wasm = &[0x00, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00];
        assert!(ModuleArtifact::validate_wasm_header(bad_wasm).is_err());
    }

    #[test]
    fn test_validate_wasm_header_component() {
        let component = &[0x00, 0x61, 0x73, 0x6d, 0x0d, 0x00, 0x01, 0x00];
        assert!(ModuleArtifact::validate_wasm_header(component).is_err());
    }

    #[test]
    fn test_compute_hash() {
        let hash1 = compute_hash(b"hello");
        let hash2 = compute_hash(b"hello");
        let hash3 = compute_hash(b"world");

        assert_eq!(hash1, hash2);
        assert_ne!(hash1, hash3);
        assert_eq!(hash1.len(), 16); // 64-bit hex
    }

    #[test]
    fn test_from_bytes() {
        let artifact = ModuleArtifact::from_bytes(MINIMAL_WASM).unwrap();
        assert_eq!(artifact.bytes(), MINIMAL_WASM);
        assert_eq!(artifact.source(), &ArtifactSource::Bytes);
        assert_eq!(artifact.content_hash(), compute_hash(MINIMAL_WASM));
    }

    #[test]
    fn test_from_missing_file() {
        let result = ModuleArtifact::from_file("/nonexistent/checker.wasm");
        assert!(matches!(
            result,
            Err(CheckerError::BootstrapFailed {
                stage: BootstrapStage::Artifact,
                ..
            })
        ));
    }

    #[cfg(not(feature = "embedded-guest"))]
    #[test]
    fn test_embedded_absent_without_feature() {
        assert!(ModuleArtifact::embedded().is_err());
        // Second access hits the same singleton
        assert!(ModuleArtifact::embedded().is_err());
    }

    #[cfg(feature = "embedded-guest")]
    #[test]
    fn test_embedded_is_singleton() {
        let first = ModuleArtifact::embedded().unwrap();
        let second = ModuleArtifact::embedded().unwrap();
        assert!(std::ptr::eq(first, second));
        assert_eq!(first.source(), &ArtifactSource::Embedded);
    }

    #[test]
    fn test_artifact_debug() {
        let artifact = ModuleArtifact::from_bytes(MINIMAL_WASM).unwrap();
        let debug_str = format!("{artifact:?}");
        assert!(debug_str.contains("ModuleArtifact"));
        assert!(debug_str.contains("content_hash"));
    }
}
