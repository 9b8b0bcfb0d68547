//! The capability set shared by every reactive node.
//!
//! The engine has a closed set of node kinds ([`NodeKind`]). Each one owns its
//! listener set, holds at most one [`Binding`] to a [`State`], and exposes the
//! same lifecycle through [`ReactiveNode`].
//!
//! # Change propagation
//!
//! A state mutation reaches a node through two routes: the node's own state
//! subscription and, for aggregates, the pulses of its children. Both routes
//! invalidate (idempotently). Only the first one to arrive for a given state
//! revision pushes to listeners; [`PushGate`] drops the rest. Structural
//! changes (adding a quality, replacing a card) carry no revision and always
//! push.

mod cache;

pub use cache::CacheState;
pub(crate) use cache::Cache;

use std::cell::{Cell, RefCell};

use quality_rules::{State, Subscription, WeakState};

use crate::error::{ReactiveError, Result};

/// The kinds of reactive node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeKind {
    Expression,
    QualitySet,
    Card,
    Deck,
}

impl NodeKind {
    pub fn name(&self) -> &'static str {
        match self {
            NodeKind::Expression => "ReactiveExpression",
            NodeKind::QualitySet => "ReactiveQualitySet",
            NodeKind::Card => "ReactiveCard",
            NodeKind::Deck => "ReactiveDeck",
        }
    }
}

impl std::fmt::Display for NodeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Lifecycle shared by every reactive node.
pub trait ReactiveNode {
    fn kind(&self) -> NodeKind;

    /// Bind to `state`, releasing any previous binding first.
    ///
    /// Fails with [`ReactiveError::Disposed`] once the node was disposed.
    fn bind_to_state(&self, state: &State) -> Result<()>;

    /// Release the state binding and forget cached results. Idempotent.
    fn unbind(&self);

    /// Whether the node currently holds a binding.
    fn is_bound(&self) -> bool;

    /// Mark cached results stale. Idempotent.
    fn invalidate(&self);

    /// Push the current value to listeners. Does nothing while unbound.
    fn notify(&self);

    /// Unbind, dispose owned children and drop every listener.
    fn dispose(&self);

    fn is_disposed(&self) -> bool;

    fn listener_count(&self) -> usize;

    fn clear_listeners(&self);
}

/// A node's link to the state it observes.
///
/// The state is held weakly; the subscription (if any) is released when the
/// binding is dropped.
pub(crate) struct Binding {
    state: WeakState,
    _subscription: Option<Subscription>,
}

impl Binding {
    /// A binding that listens to the state.
    pub(crate) fn observing(state: &State, subscription: Subscription) -> Self {
        Self {
            state: state.downgrade(),
            _subscription: Some(subscription),
        }
    }

    /// A binding that only remembers the state; change events arrive through
    /// a child node instead.
    pub(crate) fn passive(state: &State) -> Self {
        Self {
            state: state.downgrade(),
            _subscription: None,
        }
    }

    pub(crate) fn state(&self, kind: NodeKind) -> Result<State> {
        self.state.upgrade().ok_or(ReactiveError::StateDropped(kind))
    }
}

/// Resolve the state behind a node's binding slot.
pub(crate) fn bound_state(slot: &RefCell<Option<Binding>>, kind: NodeKind) -> Result<State> {
    slot.borrow()
        .as_ref()
        .ok_or(ReactiveError::Unbound(kind))?
        .state(kind)
}

/// Take the binding out of its slot and release it outside the borrow.
pub(crate) fn release(slot: &RefCell<Option<Binding>>) -> bool {
    let binding = slot.borrow_mut().take();
    let was_bound = binding.is_some();
    drop(binding);
    was_bound
}

/// Payload passed between nodes: a freshly computed result and the state
/// revision that caused it (`None` for structural changes).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Pulse {
    pub(crate) value: bool,
    pub(crate) revision: Option<u64>,
}

/// Collapses the pushes a single state revision causes into one.
#[derive(Debug, Default)]
pub(crate) struct PushGate {
    last: Cell<Option<u64>>,
}

impl PushGate {
    /// Whether a push caused by `revision` should go out.
    pub(crate) fn admit(&self, revision: Option<u64>) -> bool {
        let Some(revision) = revision else {
            return true;
        };
        if self.last.get().is_some_and(|last| last >= revision) {
            return false;
        }
        self.last.set(Some(revision));
        true
    }

    /// Forget seen revisions (revisions are per state).
    pub(crate) fn reset(&self) {
        self.last.set(None);
    }
}
