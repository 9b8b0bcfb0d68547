//! Cached results with explicit dirty tracking.

use std::cell::Cell;

/// Observable cache state of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheState {
    /// Not bound to a state; reads fail.
    Unbound,
    /// Bound; the next read recomputes.
    Dirty,
    /// Bound; the next read returns the cached result.
    Valid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Unbound,
    Dirty,
    /// `revision` is the state revision the value was computed at.
    Valid { value: bool, revision: u64 },
}

/// A cached boolean stamped with the state revision it was computed at.
///
/// A stamp that no longer matches the state's revision counts as dirty, so a
/// read after any mutation recomputes even if no invalidation message has
/// arrived yet (e.g. inside a batch, or while a notification round is still
/// walking sibling listeners).
#[derive(Debug)]
pub(crate) struct Cache {
    slot: Cell<Slot>,
}

impl Cache {
    pub(crate) fn unbound() -> Self {
        Self {
            slot: Cell::new(Slot::Unbound),
        }
    }

    pub(crate) fn bind(&self) {
        self.slot.set(Slot::Dirty);
    }

    pub(crate) fn unbind(&self) {
        self.slot.set(Slot::Unbound);
    }

    pub(crate) fn invalidate(&self) {
        if self.slot.get() != Slot::Unbound {
            self.slot.set(Slot::Dirty);
        }
    }

    /// The cached value, if it is valid at `revision`.
    pub(crate) fn get(&self, revision: u64) -> Option<bool> {
        match self.slot.get() {
            Slot::Valid {
                value,
                revision: stamp,
            } if stamp == revision => Some(value),
            _ => None,
        }
    }

    pub(crate) fn store(&self, value: bool, revision: u64) {
        if self.slot.get() != Slot::Unbound {
            self.slot.set(Slot::Valid { value, revision });
        }
    }

    pub(crate) fn state(&self, revision: Option<u64>) -> CacheState {
        match self.slot.get() {
            Slot::Unbound => CacheState::Unbound,
            Slot::Dirty => CacheState::Dirty,
            Slot::Valid { revision: stamp, .. } if Some(stamp) == revision => CacheState::Valid,
            Slot::Valid { .. } => CacheState::Dirty,
        }
    }
}
