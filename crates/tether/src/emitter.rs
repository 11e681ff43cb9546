//! Minimal typed event emitter.
//!
//! Handlers run in registration order. Each emission iterates over a snapshot
//! taken when it starts, so a handler may register or remove handlers (including
//! itself) while running; such changes apply from the next emission on.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use uuid::Uuid;

type Handler<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct Slot<T> {
    id: Uuid,
    handler: Handler<T>,
}

type Slots<T> = Mutex<Vec<Slot<T>>>;

pub struct Emitter<T> {
    slots: Arc<Slots<T>>,
}

impl<T> Emitter<T> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            slots: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Register a handler. Dropping the returned [`Subscription`] keeps the
    /// handler installed; call [`Subscription::off`] to remove it.
    pub fn on<F>(&self, handler: F) -> Subscription<T>
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let id = Uuid::new_v4();
        lock(&self.slots).push(Slot {
            id,
            handler: Arc::new(handler),
        });
        Subscription {
            id,
            slots: Arc::downgrade(&self.slots),
        }
    }

    pub fn emit(&self, event: &T) {
        let snapshot: Vec<Handler<T>> = lock(&self.slots)
            .iter()
            .map(|slot| Arc::clone(&slot.handler))
            .collect();

        for handler in snapshot {
            handler(event);
        }
    }

    pub fn clear(&self) {
        lock(&self.slots).clear();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        lock(&self.slots).len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Default for Emitter<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for Emitter<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Emitter")
            .field("handlers", &self.len())
            .finish()
    }
}

/// Removal token for a registered handler
pub struct Subscription<T> {
    id: Uuid,
    slots: Weak<Slots<T>>,
}

impl<T> Subscription<T> {
    #[must_use]
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Remove the handler. Returns false if it was already gone (cleared, or
    /// the emitter was dropped).
    pub fn off(self) -> bool {
        let Some(slots) = self.slots.upgrade() else {
            return false;
        };
        let mut slots = lock(&slots);
        let before = slots.len();
        slots.retain(|slot| slot.id != self.id);
        slots.len() != before
    }
}

fn lock<T>(slots: &Slots<T>) -> MutexGuard<'_, Vec<Slot<T>>> {
    slots.lock().unwrap_or_else(PoisonError::into_inner)
}
