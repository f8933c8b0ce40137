//! The invocation facade.
//!
//! A [`Checker`] owns one bootstrapped guest instance and turns each
//! predicate call into the full protocol: encode, lease, write, call,
//! decode, release.
//!
//! # Failure model
//!
//! Any failing step short-circuits and is returned as-is; nothing is
//! retried. A [`CheckerError::GuestCallFailed`] additionally poisons the
//! checker: a trapped guest may have left its heap half-updated, so every
//! later call returns [`CheckerError::InstancePoisoned`] without entering
//! the guest. Discard the checker and build a new one.

use std::borrow::Cow;
use std::sync::Arc;

use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use url_checker_common::{CheckerConfig, CheckerError, EngineKind, ExecutionConfig, WireEncoding};

use crate::artifact::ModuleArtifact;
use crate::bridge::MemoryBridge;
use crate::contract::{Predicate, decode_bool, encode};
use crate::engine::{GuestEngine, GuestInstance, create_engine};

/// One guest instance ready to answer predicate calls.
///
/// Predicate calls take `&mut self`, so one call is in flight per checker.
/// A checker is `Send`; share it across threads with
/// [`SharedChecker`](crate::SharedChecker).
pub struct Checker {
    // Declared before `engine` so the instance is dropped first
    instance: Box<dyn GuestInstance>,
    engine: Option<Arc<dyn GuestEngine>>,
    encoding: WireEncoding,
    instance_id: Uuid,
    poisoned: bool,
}

impl Checker {
    /// Bootstrap a new instance from `engine`.
    ///
    /// Anything built before a failure is dropped before the error is
    /// returned.
    ///
    /// # Errors
    ///
    /// Returns [`CheckerError::BootstrapFailed`] or
    /// [`CheckerError::ExportNotFound`].
    #[instrument(skip_all, fields(engine = %engine.kind(), content_hash = %engine.content_hash()))]
    pub fn new(
        engine: Arc<dyn GuestEngine>,
        config: &ExecutionConfig,
    ) -> Result<Self, CheckerError> {
        let instance = engine.instantiate(config)?;

        let checker = Self {
            instance,
            engine: Some(engine),
            encoding: WireEncoding::default(),
            instance_id: Uuid::new_v4(),
            poisoned: false,
        };

        info!(instance_id = %checker.instance_id, "Checker ready");
        Ok(checker)
    }

    /// Load the configured artifact, build the configured engine and
    /// bootstrap one instance.
    ///
    /// The artifact is read from `config.guest.path` when set, otherwise the
    /// embedded artifact is used.
    pub fn from_config(config: &CheckerConfig) -> Result<Self, CheckerError> {
        let artifact = match &config.guest.path {
            Some(path) => Cow::Owned(ModuleArtifact::from_file(path)?),
            None => Cow::Borrowed(ModuleArtifact::embedded()?),
        };

        let engine = create_engine(&artifact, &config.engine)?;

        Ok(Self::new(engine, &config.execution)?.with_encoding(config.guest.encoding))
    }

    /// Wrap an already bootstrapped instance from any backend.
    pub fn from_instance(instance: Box<dyn GuestInstance>) -> Self {
        Self {
            instance,
            engine: None,
            encoding: WireEncoding::default(),
            instance_id: Uuid::new_v4(),
            poisoned: false,
        }
    }

    /// Use `encoding` for every subsequent call.
    #[must_use]
    pub fn with_encoding(mut self, encoding: WireEncoding) -> Self {
        self.encoding = encoding;
        self
    }

    pub fn encoding(&self) -> WireEncoding {
        self.encoding
    }

    /// Unique ID of this checker's instance, as recorded in logs.
    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    /// The engine this checker's instance came from, if known.
    pub fn engine(&self) -> Option<&Arc<dyn GuestEngine>> {
        self.engine.as_ref()
    }

    /// The guest instance, for inspecting its memory.
    pub fn instance(&self) -> &dyn GuestInstance {
        self.instance.as_ref()
    }

    pub fn engine_kind(&self) -> Option<EngineKind> {
        self.engine.as_ref().map(|engine| engine.kind())
    }

    /// Returns `true` once a guest call has failed.
    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    /// Can the guest's URL model be initialised from `url`?
    pub fn check_validity(&mut self, url: &str) -> Result<bool, CheckerError> {
        self.check(Predicate::IsValid, url)
    }

    /// Would round-tripping `url`'s query items change it?
    pub fn check_modifiability(&mut self, url: &str) -> Result<bool, CheckerError> {
        self.check(Predicate::IsCanBeModified, url)
    }

    /// Run `predicate` on `url`.
    ///
    /// With NUL-terminated encoding an input containing a NUL byte is
    /// answered `false` without entering the guest.
    ///
    /// # Errors
    ///
    /// Returns [`CheckerError::InstancePoisoned`] after an earlier guest call
    /// failure, otherwise the error of the first protocol step that failed.
    /// An error means the answer is unknown, never `false`.
    #[instrument(
        skip(self, url),
        fields(instance_id = %self.instance_id, url_len = url.len())
    )]
    pub fn check(&mut self, predicate: Predicate, url: &str) -> Result<bool, CheckerError> {
        if self.poisoned {
            return Err(CheckerError::InstancePoisoned);
        }

        let Some(bytes) = encode(url, self.encoding) else {
            debug!("Input contains NUL, answering false");
            return Ok(false);
        };

        let result = self.invoke(predicate, &bytes);

        if let Err(e @ CheckerError::GuestCallFailed { .. }) = &result {
            self.poisoned = true;
            warn!(error = %e, "Guest call failed, instance poisoned");
        }

        result
    }

    fn invoke(&mut self, predicate: Predicate, bytes: &[u8]) -> Result<bool, CheckerError> {
        let length = u32::try_from(bytes.len()).map_err(|_| CheckerError::OutOfMemory {
            pointer: 0,
            length: bytes.len(),
            memory_size: self.instance.memory_size(),
        })?;

        let mut lease = MemoryBridge::new(self.instance.as_mut()).lease(length)?;
        lease.write(bytes)?;
        let results = lease.call(predicate)?;
        let answer = decode_bool(predicate, &results)?;
        lease.release()?;

        debug!(answer, "Predicate answered");
        Ok(answer)
    }

    /// Release the instance.
    ///
    /// The engine is released with it unless another handle still refers to
    /// it.
    pub fn close(self) {
        info!(
            instance_id = %self.instance_id,
            poisoned = self.poisoned,
            "Checker closed"
        );
    }
}

impl std::fmt::Debug for Checker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Checker")
            .field("instance_id", &self.instance_id)
            .field("engine", &self.engine_kind())
            .field("encoding", &self.encoding)
            .field("poisoned", &self.poisoned)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contract::GuestValue;
    use crate::testing::{Fault, MockHandle, MockInstance};

    fn mock_checker() -> (Checker, MockHandle) {
        let (instance, handle) = MockInstance::new();
        (Checker::from_instance(Box::new(instance)), handle)
    }

    #[test]
    fn test_input_is_nul_terminated() {
        let (mut checker, handle) = mock_checker();

        assert!(checker.check_validity("https://a.example").unwrap());

        let state = handle.state();
        assert_eq!(state.last_input, b"https://a.example\0");
        assert_eq!(state.predicate_calls, 1);
        assert_eq!(state.live, 0);
    }

    #[test]
    fn test_raw_encoding_sends_bytes_as_is() {
        let (checker, handle) = mock_checker();
        let mut checker = checker.with_encoding(WireEncoding::Raw);

        checker.check_modifiability("a=1").unwrap();
        assert_eq!(handle.state().last_input, b"a=1");
    }

    #[test]
    fn test_interior_nul_answers_false_without_guest_call() {
        let (mut checker, handle) = mock_checker();

        assert!(!checker.check_validity("https://a.example/\0x").unwrap());

        let state = handle.state();
        assert_eq!(state.allocations, 0);
        assert_eq!(state.predicate_calls, 0);
    }

    #[test]
    fn test_zero_result_is_false() {
        let (mut checker, handle) = mock_checker();
        handle.state().results = vec![GuestValue::I32(0)];

        assert!(!checker.check_validity("x").unwrap());
    }

    #[test]
    fn test_result_shape_errors_do_not_poison() {
        let (mut checker, handle) = mock_checker();
        handle.state().results = vec![];

        assert!(matches!(
            checker.check_validity("x"),
            Err(CheckerError::UnexpectedResultShape { .. })
        ));
        assert!(!checker.is_poisoned());

        handle.state().results = vec![GuestValue::I32(1)];
        assert!(checker.check_validity("x").unwrap());
    }

    #[test]
    fn test_guest_call_failure_poisons() {
        let (mut checker, handle) = mock_checker();
        handle.state().fault = Some(Fault::Call);

        assert!(matches!(
            checker.check_validity("x"),
            Err(CheckerError::GuestCallFailed { .. })
        ));
        assert!(checker.is_poisoned());

        handle.state().fault = None;
        assert!(matches!(
            checker.check_modifiability("x"),
            Err(CheckerError::InstancePoisoned)
        ));

        let state = handle.state();
        assert_eq!(state.predicate_calls, 1);
        assert_eq!(state.live, 0);
    }

    #[test]
    fn test_allocations_balance_across_mixed_outcomes() {
        let (mut checker, handle) = mock_checker();

        let plan = [
            (None, vec![GuestValue::I32(1)]),
            (Some(Fault::Write), vec![GuestValue::I32(1)]),
            (None, vec![GuestValue::I64(1)]),
            (None, vec![GuestValue::I32(0)]),
            (Some(Fault::Write), vec![GuestValue::I32(0)]),
            (None, vec![GuestValue::I32(1), GuestValue::I32(1)]),
            (None, vec![GuestValue::I32(1)]),
            (Some(Fault::Call), vec![GuestValue::I32(1)]),
            (None, vec![GuestValue::I32(1)]),
        ];

        for (fault, results) in plan {
            {
                let mut state = handle.state();
                state.fault = fault;
                state.results = results;
            }
            let _ = checker.check_validity("https://a.example/?q=1");
        }

        let state = handle.state();
        assert_eq!(state.allocations, 8);
        assert_eq!(state.allocations, state.deallocations);
        assert_eq!(state.live, 0);
    }

    #[test]
    fn test_null_allocation_is_out_of_memory() {
        let (mut checker, handle) = mock_checker();
        handle.state().next_pointer = 0;

        assert!(matches!(
            checker.check_validity("https://a.example"),
            Err(CheckerError::OutOfMemory { pointer: 0, .. })
        ));
        assert!(!checker.is_poisoned());

        let state = handle.state();
        assert_eq!(state.writes, 0);
        assert_eq!(state.predicate_calls, 0);
    }

    #[test]
    fn test_release_failure_is_surfaced() {
        let (mut checker, handle) = mock_checker();
        handle.state().fault = Some(Fault::Deallocate);

        assert!(matches!(
            checker.check_validity("x"),
            Err(CheckerError::GuestCallFailed { export, .. }) if export == "deallocate"
        ));
        assert_eq!(handle.state().deallocations, 1);
    }

    #[test]
    fn test_from_config_without_artifact() {
        let config = CheckerConfig::default();

        #[cfg(not(feature = "embedded-guest"))]
        assert!(matches!(
            Checker::from_config(&config),
            Err(CheckerError::BootstrapFailed { .. })
        ));
        #[cfg(feature = "embedded-guest")]
        assert!(Checker::from_config(&config).is_ok());
    }

    #[test]
    fn test_debug_and_close() {
        let (checker, _handle) = mock_checker();

        let debug_str = format!("{checker:?}");
        assert!(debug_str.contains("Checker"));
        assert!(debug_str.contains("instance_id"));
        assert_eq!(checker.engine_kind(), None);

        checker.close();
    }
}
