//! Admission gate bounding the number of simultaneously active sessions
//!
//! The gate is a counting semaphore whose capacity is fixed at startup.
//! Acquiring hands out an [`AdmissionToken`]; the token is returned to the
//! gate when it is dropped, so every exit path of a session (including early
//! returns and panics) releases exactly one token.

use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tracing::debug;

/// Fixed-capacity gate for concurrent agent sessions
#[derive(Debug, Clone)]
pub struct AdmissionGate {
    semaphore: Arc<Semaphore>,
    capacity: usize,
}

/// One admitted session's share of the gate
///
/// Released back to the gate on drop.
#[derive(Debug)]
pub struct AdmissionToken {
    _permit: OwnedSemaphorePermit,
}

impl AdmissionGate {
    /// Create a gate with `capacity` tokens
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.min(Semaphore::MAX_PERMITS);
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    /// Take one token without waiting
    ///
    /// Returns `None` immediately, with no side effects, when the ceiling is
    /// reached.
    pub fn try_acquire(&self) -> Option<AdmissionToken> {
        match self.semaphore.clone().try_acquire_owned() {
            Ok(permit) => Some(AdmissionToken { _permit: permit }),
            Err(TryAcquireError::NoPermits) => {
                debug!(capacity = self.capacity, "Admission gate at capacity");
                None
            }
            Err(TryAcquireError::Closed) => None,
        }
    }

    /// Total number of tokens
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Tokens currently available
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Tokens currently held by sessions
    pub fn in_use(&self) -> usize {
        self.capacity - self.available()
    }
}
