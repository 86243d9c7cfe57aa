//! Capture attempt generations.
//!
//! Every retry bumps a shared counter. Work started under an older
//! generation carries its token along, and its result is dropped on arrival
//! if the counter has moved on.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, Default)]
pub struct Attempts {
    current: Arc<AtomicU64>,
}

impl Attempts {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a new attempt, invalidating every outstanding token.
    pub fn begin(&self) -> AttemptToken {
        let generation = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::debug!(generation, "attempt started");
        AttemptToken {
            generation,
            current: Arc::clone(&self.current),
        }
    }

    pub fn current(&self) -> u64 {
        self.current.load(Ordering::SeqCst)
    }
}

/// Proof that work belongs to a given attempt.
#[derive(Debug, Clone)]
pub struct AttemptToken {
    generation: u64,
    current: Arc<AtomicU64>,
}

impl AttemptToken {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_current(&self) -> bool {
        self.current.load(Ordering::SeqCst) == self.generation
    }
}
