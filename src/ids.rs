//! Identifier generation
//!
//! Components never mint ids on their own; an [`IdGenerator`] is injected so
//! tests can use predictable, monotonic ids.

use std::sync::atomic::{AtomicU64, Ordering};
use uuid::Uuid;

/// Source of unique identifiers
pub trait IdGenerator: Send + Sync {
    /// Produce a new id, e.g. `inc-4f2c…` or `inc-000001`
    fn next_id(&self, prefix: &str) -> String;
}

/// Random v4 UUID ids (production default)
#[derive(Debug, Default, Clone, Copy)]
pub struct UuidIds;

impl IdGenerator for UuidIds {
    fn next_id(&self, prefix: &str) -> String {
        format!("{}-{}", prefix, Uuid::new_v4().simple())
    }
}

/// Monotonic counter ids, shared across prefixes
#[derive(Debug, Default)]
pub struct SequentialIds {
    counter: AtomicU64,
}

impl SequentialIds {
    pub fn new() -> Self {
        Self::default()
    }
}

impl IdGenerator for SequentialIds {
    fn next_id(&self, prefix: &str) -> String {
        let n = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        format!("{}-{:06}", prefix, n)
    }
}
