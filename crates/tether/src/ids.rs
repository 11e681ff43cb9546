//! Identifier generation for connections and hubs.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

pub const CONNECTION_KIND: &str = "conn";
pub const HUB_KIND: &str = "hub";

/// Produces human-readable, process-unique identifiers such as `conn-7`.
///
/// Clones share the same counter, so one generator constructed at startup and
/// handed to every constructor never repeats an id.
#[derive(Debug, Clone, Default)]
pub struct IdGenerator {
    counter: Arc<AtomicU64>,
}

impl IdGenerator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Next identifier for the given kind, e.g. `next("conn")` -> `conn-1`.
    #[must_use]
    pub fn next(&self, kind: &str) -> String {
        let n = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
        format!("{kind}-{n}")
    }

    #[must_use]
    pub fn issued(&self) -> u64 {
        self.counter.load(Ordering::Relaxed)
    }
}
