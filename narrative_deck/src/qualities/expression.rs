//! Reactive expressions - one cached quality bound to a state.

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

use quality_rules::{Expression, ListenerSet, State, Subscription};

use crate::error::{ReactiveError, Result};
use crate::node::{self, Binding, Cache, CacheState, NodeKind, Pulse, PushGate, ReactiveNode};

struct ExpressionNode {
    expression: RefCell<Expression>,
    binding: RefCell<Option<Binding>>,
    cache: Cache,
    gate: PushGate,
    listeners: ListenerSet<Pulse>,
    disposed: Cell<bool>,
}

/// A single quality whose result is cached and kept current while bound.
///
/// Cloning creates a new handle to the **same** node.
#[derive(Clone)]
pub struct ReactiveExpression {
    node: Rc<ExpressionNode>,
}

impl ReactiveExpression {
    /// Create an unbound expression.
    pub fn new(condition: impl Into<String>) -> Self {
        Self {
            node: Rc::new(ExpressionNode {
                expression: RefCell::new(Expression::new(condition)),
                binding: RefCell::new(None),
                cache: Cache::unbound(),
                gate: PushGate::default(),
                listeners: ListenerSet::new("ReactiveExpression"),
                disposed: Cell::new(false),
            }),
        }
    }

    /// Create an expression already bound to `state`.
    pub fn bound(condition: impl Into<String>, state: &State) -> Self {
        let expression = Self::new(condition);
        expression.attach_to(state);
        expression
    }

    /// The condition text.
    pub fn condition(&self) -> String {
        self.node.expression.borrow().source().to_string()
    }

    /// Current result against the bound state.
    ///
    /// Recomputes only if the cache is dirty. Fails if the expression is not
    /// bound.
    pub fn result(&self) -> Result<bool> {
        let state = node::bound_state(&self.node.binding, NodeKind::Expression)?;
        let revision = state.revision();

        if let Some(value) = self.node.cache.get(revision) {
            return Ok(value);
        }

        let value = self.node.expression.borrow().check(&state);
        self.node.cache.store(value, revision);
        Ok(value)
    }

    /// One-shot check against any state, ignoring binding and cache.
    pub fn check(&self, state: &State) -> bool {
        self.node.expression.borrow().check(state)
    }

    /// Replace the condition, invalidate and notify.
    pub fn change(&self, condition: impl Into<String>) {
        self.node.expression.borrow_mut().change(condition);
        self.invalidate();
        self.push(None);
    }

    /// Register a listener for result changes.
    #[must_use = "dropping the subscription unregisters the listener"]
    pub fn subscribe(&self, listener: impl Fn(bool) + 'static) -> Subscription {
        self.node.listeners.subscribe(move |pulse: &Pulse| listener(pulse.value))
    }

    pub(crate) fn subscribe_pulse(&self, listener: impl Fn(&Pulse) + 'static) -> Subscription {
        self.node.listeners.subscribe(listener)
    }

    pub fn cache_state(&self) -> CacheState {
        let revision = node::bound_state(&self.node.binding, NodeKind::Expression)
            .ok()
            .map(|state| state.revision());
        self.node.cache.state(revision)
    }

    /// Whether two handles point at the same node.
    pub fn ptr_eq(&self, other: &ReactiveExpression) -> bool {
        Rc::ptr_eq(&self.node, &other.node)
    }

    pub(crate) fn attach_to(&self, state: &State) {
        self.unbind();

        let weak: Weak<ExpressionNode> = Rc::downgrade(&self.node);
        let subscription = state.subscribe(move |state| {
            if let Some(node) = weak.upgrade() {
                ReactiveExpression { node }.on_state_change(state.revision());
            }
        });

        *self.node.binding.borrow_mut() = Some(Binding::observing(state, subscription));
        self.node.cache.bind();
        self.node.gate.reset();
    }

    fn on_state_change(&self, revision: u64) {
        self.invalidate();
        if self.node.gate.admit(Some(revision)) {
            self.push(Some(revision));
        }
    }

    fn push(&self, revision: Option<u64>) {
        if self.node.listeners.is_empty() || !self.is_bound() {
            return;
        }
        match self.result() {
            Ok(value) => self.node.listeners.notify(&Pulse { value, revision }),
            Err(err) => tracing::debug!("skipping expression notification: {}", err),
        }
    }
}

impl ReactiveNode for ReactiveExpression {
    fn kind(&self) -> NodeKind {
        NodeKind::Expression
    }

    fn bind_to_state(&self, state: &State) -> Result<()> {
        if self.is_disposed() {
            return Err(ReactiveError::Disposed(NodeKind::Expression));
        }
        self.attach_to(state);
        Ok(())
    }

    fn unbind(&self) {
        node::release(&self.node.binding);
        self.node.cache.unbind();
    }

    fn is_bound(&self) -> bool {
        self.node.binding.borrow().is_some()
    }

    fn invalidate(&self) {
        self.node.cache.invalidate();
    }

    fn notify(&self) {
        self.push(None);
    }

    fn dispose(&self) {
        self.unbind();
        self.node.listeners.clear();
        self.node.disposed.set(true);
    }

    fn is_disposed(&self) -> bool {
        self.node.disposed.get()
    }

    fn listener_count(&self) -> usize {
        self.node.listeners.len()
    }

    fn clear_listeners(&self) {
        self.node.listeners.clear();
    }
}

impl std::fmt::Debug for ReactiveExpression {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReactiveExpression")
            .field("condition", &self.condition())
            .field("cache", &self.cache_state())
            .field("listeners", &self.node.listeners.len())
            .finish()
    }
}
