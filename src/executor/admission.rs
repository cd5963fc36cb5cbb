//! Concurrency admission control.
//!
//! A fixed pool of slots bounds how many executions may be in flight at
//! once. A slot is reserved before the execution record exists and released
//! exactly once when the record reaches a terminal state; the release is
//! tied to a guard so no exit path can leak a slot.

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::error::SubmitError;

/// Bounded counter of in-flight executions.
pub struct AdmissionController {
    slots: Arc<Semaphore>,
    limit: usize,
}

/// A reserved slot. Dropping it releases the slot, once.
#[derive(Debug)]
pub struct AdmissionPermit {
    _permit: OwnedSemaphorePermit,
}

impl AdmissionController {
    pub fn new(limit: usize) -> Self {
        let limit = limit.max(1);
        Self {
            slots: Arc::new(Semaphore::new(limit)),
            limit,
        }
    }

    /// Atomically reserve a slot, or reject with the current occupancy.
    pub fn reserve(&self) -> Result<AdmissionPermit, SubmitError> {
        match Arc::clone(&self.slots).try_acquire_owned() {
            Ok(permit) => Ok(AdmissionPermit { _permit: permit }),
            Err(_) => Err(SubmitError::Overloaded {
                current: self.in_flight(),
                limit: self.limit,
            }),
        }
    }

    /// Number of currently reserved slots.
    pub fn in_flight(&self) -> usize {
        self.limit - self.slots.available_permits()
    }

    pub fn limit(&self) -> usize {
        self.limit
    }
}
