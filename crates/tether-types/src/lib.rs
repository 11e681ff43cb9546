//! Message schema shared by the tether demo server and client.
//!
//! The two sides play a ping-pong counting game: each peer decodes a
//! [`CounterMessage`], increments it and sends it back.

use serde::{Deserialize, Serialize};

/// The single message exchanged by the counter demo
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CounterMessage {
    pub count: u64,
}

impl CounterMessage {
    #[must_use]
    pub fn new(count: u64) -> Self {
        Self { count }
    }

    /// The message that answers this one.
    #[must_use]
    pub fn incremented(self) -> Self {
        Self {
            count: self.count.saturating_add(1),
        }
    }

    /// Whether a session counting up to `max` is finished.
    #[must_use]
    pub fn reached(&self, max: u64) -> bool {
        self.count >= max
    }
}
