//! A checker shared between threads.

use std::sync::Arc;

use parking_lot::Mutex;

use url_checker_common::CheckerError;

use crate::checker::Checker;
use crate::contract::Predicate;

/// A [`Checker`] behind a mutex.
///
/// Clones refer to the same guest instance; calls are serialised by the
/// lock. For parallel checks build one [`Checker`] per thread from a shared
/// engine instead.
#[derive(Clone)]
pub struct SharedChecker {
    inner: Arc<Mutex<Checker>>,
}

impl SharedChecker {
    pub fn new(checker: Checker) -> Self {
        Self {
            inner: Arc::new(Mutex::new(checker)),
        }
    }

    pub fn check_validity(&self, url: &str) -> Result<bool, CheckerError> {
        self.inner.lock().check_validity(url)
    }

    pub fn check_modifiability(&self, url: &str) -> Result<bool, CheckerError> {
        self.inner.lock().check_modifiability(url)
    }

    pub fn check(&self, predicate: Predicate, url: &str) -> Result<bool, CheckerError> {
        self.inner.lock().check(predicate, url)
    }

    pub fn is_poisoned(&self) -> bool {
        self.inner.lock().is_poisoned()
    }

    /// Close the checker if this is the last handle.
    ///
    /// # Errors
    ///
    /// Returns the handle back if other clones are still alive.
    pub fn close(self) -> Result<(), Self> {
        match Arc::try_unwrap(self.inner) {
            Ok(mutex) => {
                mutex.into_inner().close();
                Ok(())
            }
            Err(inner) => Err(Self { inner }),
        }
    }
}

impl std::fmt::Debug for SharedChecker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedChecker")
            .field("handles", &Arc::strong_count(&self.inner))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockInstance;

    #[test]
    fn test_calls_from_many_threads() {
        let (instance, handle) = MockInstance::new();
        let shared = SharedChecker::new(Checker::from_instance(Box::new(instance)));

        std::thread::scope(|scope| {
            for _ in 0..4 {
                let shared = shared.clone();
                scope.spawn(move || {
                    for _ in 0..25 {
                        assert!(shared.check_validity("https://a.example").unwrap());
                    }
                });
            }
        });

        let state = handle.state();
        assert_eq!(state.predicate_calls, 100);
        assert_eq!(state.live, 0);
    }

    #[test]
    fn test_close_requires_last_handle() {
        let (instance, _handle) = MockInstance::new();
        let shared = SharedChecker::new(Checker::from_instance(Box::new(instance)));
        let other = shared.clone();

        let shared = shared.close().unwrap_err();
        drop(other);
        assert!(shared.close().is_ok());
    }
}
