//! Guest memory leases.
//!
//! Every predicate call moves its input through one lease:
//!
//! 1. [`MemoryBridge::lease`] calls the guest `allocate(length)`
//! 2. [`LeaseGuard::write`] copies the encoded input to the leased address
//! 3. [`LeaseGuard::call`] hands the address to a predicate export
//! 4. [`LeaseGuard::release`] calls the guest `deallocate(pointer)`
//!
//! A guard dropped before step 4 still deallocates, so every successful
//! `allocate` is paired with exactly one `deallocate` attempt.

use tracing::{debug, warn};

use url_checker_common::CheckerError;

use crate::contract::{GuestAddress, GuestValue, Predicate};
use crate::engine::GuestInstance;

/// Largest lease the guest allocator can be asked for (its length is an `i32`).
const MAX_LEASE: u32 = i32::MAX as u32;

/// Entry point for leasing guest memory from one instance.
pub struct MemoryBridge<'a> {
    instance: &'a mut dyn GuestInstance,
}

impl<'a> MemoryBridge<'a> {
    pub fn new(instance: &'a mut dyn GuestInstance) -> Self {
        Self { instance }
    }

    /// Ask the guest for `length` bytes.
    ///
    /// # Errors
    ///
    /// Returns [`CheckerError::GuestCallFailed`] if `allocate` traps, or
    /// [`CheckerError::OutOfMemory`] if `length` cannot be expressed to the
    /// guest allocator or the allocator hands back a null pointer.
    pub fn lease(self, length: u32) -> Result<LeaseGuard<'a>, CheckerError> {
        if length > MAX_LEASE {
            return Err(CheckerError::OutOfMemory {
                pointer: 0,
                length: length as usize,
                memory_size: self.instance.memory_size(),
            });
        }

        let pointer = self.instance.allocate(length)?;

        // Nothing was allocated, so there is nothing to deallocate
        if pointer.is_null() && length > 0 {
            return Err(CheckerError::OutOfMemory {
                pointer: 0,
                length: length as usize,
                memory_size: self.instance.memory_size(),
            });
        }
        debug!(%pointer, length, "Guest memory leased");

        Ok(LeaseGuard {
            instance: self.instance,
            pointer,
            length,
            released: false,
        })
    }
}

/// A live guest allocation.
///
/// Deallocated by [`release`](Self::release) or, failing that, on drop.
pub struct LeaseGuard<'a> {
    instance: &'a mut dyn GuestInstance,
    pointer: GuestAddress,
    length: u32,
    released: bool,
}

impl LeaseGuard<'_> {
    /// Guest address of the allocation.
    pub fn pointer(&self) -> GuestAddress {
        self.pointer
    }

    /// Leased length in bytes.
    pub fn length(&self) -> u32 {
        self.length
    }

    /// Copy `bytes` to the start of the lease.
    ///
    /// # Errors
    ///
    /// Returns [`CheckerError::OutOfMemory`] if `bytes` is longer than the
    /// lease (memory is not touched) or runs past guest memory.
    pub fn write(&mut self, bytes: &[u8]) -> Result<(), CheckerError> {
        if bytes.len() > self.length as usize {
            return Err(CheckerError::OutOfMemory {
                pointer: self.pointer.get(),
                length: bytes.len(),
                memory_size: self.length as usize,
            });
        }

        self.instance.write_memory(self.pointer, bytes)?;
        debug!(pointer = %self.pointer, bytes = bytes.len(), "Input written");
        Ok(())
    }

    /// Call `predicate` with the leased address.
    pub fn call(&mut self, predicate: Predicate) -> Result<Vec<GuestValue>, CheckerError> {
        debug!(pointer = %self.pointer, %predicate, "Calling predicate");
        self.instance.call_predicate(predicate, self.pointer)
    }

    /// Deallocate the lease and surface any failure.
    pub fn release(mut self) -> Result<(), CheckerError> {
        self.released = true;
        self.instance.deallocate(self.pointer)?;
        debug!(pointer = %self.pointer, "Guest memory released");
        Ok(())
    }
}

impl Drop for LeaseGuard<'_> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        // Never mask the error that caused the early exit
        match self.instance.deallocate(self.pointer) {
            Ok(()) => debug!(pointer = %self.pointer, "Guest memory released on unwind"),
            Err(e) => warn!(
                pointer = %self.pointer,
                error = %e,
                "Failed to release guest memory; ignoring"
            ),
        }
    }
}
