//! Batch scopes for deferring state notifications.

use super::State;

/// RAII guard that defers [`State`] notifications until it is dropped.
///
/// Scopes nest; only the outermost one flushes, and it flushes at most once.
#[must_use = "the batch ends when the scope is dropped"]
pub struct BatchScope {
    state: State,
}

impl BatchScope {
    pub(super) fn enter(state: State) -> Self {
        let depth = state.inner.batch_depth.get();
        if depth == 0 {
            state.inner.pending.set(false);
        }
        state.inner.batch_depth.set(depth + 1);
        Self { state }
    }
}

impl Drop for BatchScope {
    fn drop(&mut self) {
        let inner = &self.state.inner;
        let depth = inner.batch_depth.get().saturating_sub(1);
        inner.batch_depth.set(depth);

        if depth == 0 && inner.pending.replace(false) {
            tracing::trace!(revision = inner.revision.get(), "flushing batch");
            self.state.flush(inner.revision.get());
        }
    }
}

impl std::fmt::Debug for BatchScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchScope")
            .field("depth", &self.state.inner.batch_depth.get())
            .finish()
    }
}
