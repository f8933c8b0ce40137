//! In-memory [`GuestInstance`] double with call counters and fault injection.

use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};

use url_checker_common::CheckerError;

use crate::contract::{GuestAddress, GuestValue, Predicate};
use crate::engine::GuestInstance;

/// Which guest operation should fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    Allocate,
    Write,
    Call,
    Deallocate,
}

#[derive(Debug)]
pub struct MockState {
    pub allocations: usize,
    pub deallocations: usize,
    pub writes: usize,
    pub predicate_calls: usize,
    /// Outstanding allocations.
    pub live: i64,
    pub next_pointer: u32,
    pub fault: Option<Fault>,
    pub results: Vec<GuestValue>,
    pub last_input: Vec<u8>,
    memory: Vec<u8>,
}

/// Shared view of a [`MockInstance`] that outlives the checker owning it.
#[derive(Clone)]
pub struct MockHandle(Arc<Mutex<MockState>>);

impl MockHandle {
    pub fn state(&self) -> MutexGuard<'_, MockState> {
        self.0.lock()
    }
}

pub struct MockInstance {
    state: Arc<Mutex<MockState>>,
}

impl MockInstance {
    pub const MEMORY_SIZE: u32 = 4096;

    pub fn new() -> (Self, MockHandle) {
        let state = Arc::new(Mutex::new(MockState {
            allocations: 0,
            deallocations: 0,
            writes: 0,
            predicate_calls: 0,
            live: 0,
            next_pointer: 16,
            fault: None,
            results: vec![GuestValue::I32(1)],
            last_input: Vec::new(),
            memory: vec![0; Self::MEMORY_SIZE as usize],
        }));
        (
            Self {
                state: Arc::clone(&state),
            },
            MockHandle(state),
        )
    }

    fn injected(fault: Fault, state: &MockState, export: &str) -> Result<(), CheckerError> {
        if state.fault == Some(fault) {
            return Err(CheckerError::guest_call(export, "injected trap"));
        }
        Ok(())
    }
}

impl GuestInstance for MockInstance {
    fn allocate(&mut self, length: u32) -> Result<GuestAddress, CheckerError> {
        let mut state = self.state.lock();
        Self::injected(Fault::Allocate, &state, "allocate")?;

        let pointer = state.next_pointer;
        state.next_pointer = pointer.saturating_add(length.max(1));
        state.allocations += 1;
        state.live += 1;
        Ok(GuestAddress::new(pointer))
    }

    fn deallocate(&mut self, _pointer: GuestAddress) -> Result<(), CheckerError> {
        let mut state = self.state.lock();
        state.deallocations += 1;
        Self::injected(Fault::Deallocate, &state, "deallocate")?;
        state.live -= 1;
        Ok(())
    }

    fn write_memory(&mut self, pointer: GuestAddress, bytes: &[u8]) -> Result<(), CheckerError> {
        let mut state = self.state.lock();
        let memory_size = state.memory.len();
        let out_of_memory = CheckerError::OutOfMemory {
            pointer: pointer.get(),
            length: bytes.len(),
            memory_size,
        };
        if state.fault == Some(Fault::Write) {
            return Err(out_of_memory);
        }

        let start = pointer.offset();
        let Some(end) = start.checked_add(bytes.len()).filter(|end| *end <= memory_size) else {
            return Err(out_of_memory);
        };
        state.memory[start..end].copy_from_slice(bytes);
        state.last_input = bytes.to_vec();
        state.writes += 1;
        Ok(())
    }

    fn read_memory(&self, pointer: GuestAddress, length: u32) -> Result<Vec<u8>, CheckerError> {
        let state = self.state.lock();
        let start = pointer.offset();
        let end = start + length as usize;
        state
            .memory
            .get(start..end)
            .map(<[u8]>::to_vec)
            .ok_or(CheckerError::OutOfMemory {
                pointer: pointer.get(),
                length: length as usize,
                memory_size: state.memory.len(),
            })
    }

    fn memory_size(&self) -> usize {
        self.state.lock().memory.len()
    }

    fn call_predicate(
        &mut self,
        predicate: Predicate,
        _pointer: GuestAddress,
    ) -> Result<Vec<GuestValue>, CheckerError> {
        let mut state = self.state.lock();
        state.predicate_calls += 1;
        Self::injected(Fault::Call, &state, predicate.export_name())?;
        Ok(state.results.clone())
    }
}
