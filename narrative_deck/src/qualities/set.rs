//! Reactive quality sets - unique qualities combined with logical AND.

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

use quality_rules::{ListenerSet, State, Subscription};

use super::ReactiveExpression;
use crate::error::{ReactiveError, Result};
use crate::node::{self, Binding, Cache, CacheState, NodeKind, Pulse, PushGate, ReactiveNode};

/// A member expression and the subscription forwarding its changes.
struct Member {
    expression: ReactiveExpression,
    _forward: Subscription,
}

struct QualitySetNode {
    members: RefCell<Vec<Member>>,
    binding: RefCell<Option<Binding>>,
    cache: Cache,
    gate: PushGate,
    listeners: ListenerSet<Pulse>,
    disposed: Cell<bool>,
}

/// An ordered set of unique qualities, keyed by condition text.
///
/// `result` is the AND over all members and `true` for an empty set.
///
/// Cloning creates a new handle to the **same** set.
#[derive(Clone)]
pub struct ReactiveQualitySet {
    node: Rc<QualitySetNode>,
}

impl ReactiveQualitySet {
    /// Create an empty set, bound to `state` if one is given.
    pub fn new(state: Option<&State>) -> Self {
        let set = Self {
            node: Rc::new(QualitySetNode {
                members: RefCell::new(Vec::new()),
                binding: RefCell::new(None),
                cache: Cache::unbound(),
                gate: PushGate::default(),
                listeners: ListenerSet::new("ReactiveQualitySet"),
                disposed: Cell::new(false),
            }),
        };
        if let Some(state) = state {
            set.attach(state);
        }
        set
    }

    /// Create a set from condition strings. Duplicates are ignored.
    pub fn with_conditions<S: Into<String>>(
        conditions: impl IntoIterator<Item = S>,
        state: Option<&State>,
    ) -> Self {
        let set = Self::new(state);
        for condition in conditions {
            set.insert(condition.into());
        }
        set
    }

    /// Add a quality.
    ///
    /// Returns `Ok(false)` if an identical condition is already present.
    pub fn add(&self, condition: impl Into<String>) -> Result<bool> {
        if self.is_disposed() {
            return Err(ReactiveError::Disposed(NodeKind::QualitySet));
        }
        let added = self.insert(condition.into());
        if added {
            self.invalidate();
            self.push(None);
        }
        Ok(added)
    }

    /// Whether a quality with this condition text is present.
    pub fn has(&self, condition: &str) -> bool {
        self.node
            .members
            .borrow()
            .iter()
            .any(|member| member.expression.condition() == condition)
    }

    /// Remove a quality, disposing its expression.
    ///
    /// Returns `false` if no such quality was present.
    pub fn remove(&self, condition: &str) -> bool {
        let removed = {
            let mut members = self.node.members.borrow_mut();
            members
                .iter()
                .position(|member| member.expression.condition() == condition)
                .map(|index| members.remove(index))
        };

        let Some(member) = removed else {
            return false;
        };
        member.expression.dispose();
        drop(member);

        self.invalidate();
        self.push(None);
        true
    }

    /// Number of qualities.
    pub fn size(&self) -> usize {
        self.node.members.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.node.members.borrow().is_empty()
    }

    /// Condition texts, in insertion order.
    pub fn conditions(&self) -> Vec<String> {
        self.node
            .members
            .borrow()
            .iter()
            .map(|member| member.expression.condition())
            .collect()
    }

    /// Handles to the member expressions, in insertion order.
    pub fn expressions(&self) -> Vec<ReactiveExpression> {
        self.node
            .members
            .borrow()
            .iter()
            .map(|member| member.expression.clone())
            .collect()
    }

    /// AND over all members against the bound state.
    pub fn result(&self) -> Result<bool> {
        let state = node::bound_state(&self.node.binding, NodeKind::QualitySet)?;
        let revision = state.revision();

        if let Some(value) = self.node.cache.get(revision) {
            return Ok(value);
        }

        let mut value = true;
        for expression in self.expressions() {
            if !expression.result()? {
                value = false;
                break;
            }
        }

        self.node.cache.store(value, revision);
        Ok(value)
    }

    /// One-shot AND over every member's check against `state`.
    pub fn check(&self, state: &State) -> bool {
        self.expressions()
            .iter()
            .all(|expression| expression.check(state))
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
        let revision = node::bound_state(&self.node.binding, NodeKind::QualitySet)
            .ok()
            .map(|state| state.revision());
        self.node.cache.state(revision)
    }

    /// Whether two handles point at the same set.
    pub fn ptr_eq(&self, other: &ReactiveQualitySet) -> bool {
        Rc::ptr_eq(&self.node, &other.node)
    }

    /// Append a member without notifying. Returns `false` for duplicates.
    fn insert(&self, condition: String) -> bool {
        if self.has(&condition) {
            return false;
        }

        let expression = ReactiveExpression::new(condition);
        if let Ok(state) = node::bound_state(&self.node.binding, NodeKind::QualitySet) {
            expression.attach_to(&state);
        }

        let weak: Weak<QualitySetNode> = Rc::downgrade(&self.node);
        let forward = expression.subscribe_pulse(move |pulse| {
            if let Some(node) = weak.upgrade() {
                ReactiveQualitySet { node }.on_member_change(pulse.revision);
            }
        });

        self.node.members.borrow_mut().push(Member {
            expression,
            _forward: forward,
        });
        true
    }

    fn attach(&self, state: &State) {
        self.unbind();

        // Caches are stamped with the state revision, so a member read before
        // its own listener has run still recomputes. Subscription order does
        // not matter.
        for expression in self.expressions() {
            expression.attach_to(state);
        }

        let weak: Weak<QualitySetNode> = Rc::downgrade(&self.node);
        let subscription = state.subscribe(move |state| {
            if let Some(node) = weak.upgrade() {
                ReactiveQualitySet { node }.on_state_change(state.revision());
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

    fn on_member_change(&self, revision: Option<u64>) {
        self.invalidate();
        if self.node.gate.admit(revision) {
            self.push(revision);
        }
    }

    fn push(&self, revision: Option<u64>) {
        if self.node.listeners.is_empty() || !self.is_bound() {
            return;
        }
        match self.result() {
            Ok(value) => self.node.listeners.notify(&Pulse { value, revision }),
            Err(err) => tracing::debug!("skipping quality set notification: {}", err),
        }
    }
}

impl ReactiveNode for ReactiveQualitySet {
    fn kind(&self) -> NodeKind {
        NodeKind::QualitySet
    }

    fn bind_to_state(&self, state: &State) -> Result<()> {
        if self.is_disposed() {
            return Err(ReactiveError::Disposed(NodeKind::QualitySet));
        }
        self.attach(state);
        Ok(())
    }

    fn unbind(&self) {
        node::release(&self.node.binding);
        for expression in self.expressions() {
            expression.unbind();
        }
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
        let members = std::mem::take(&mut *self.node.members.borrow_mut());
        for member in &members {
            member.expression.dispose();
        }
        drop(members);
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

impl std::fmt::Debug for ReactiveQualitySet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReactiveQualitySet")
            .field("conditions", &self.conditions())
            .field("cache", &self.cache_state())
            .field("listeners", &self.node.listeners.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counter(set: &ReactiveQualitySet) -> (Rc<Cell<u32>>, Subscription) {
        let count = Rc::new(Cell::new(0));
        let c = Rc::clone(&count);
        let sub = set.subscribe(move |_| c.set(c.get() + 1));
        (count, sub)
    }

    #[test]
    fn test_add_is_idempotent() {
        let set = ReactiveQualitySet::new(None);

        assert_eq!(set.add("$gold >= 5"), Ok(true));
        assert_eq!(set.add("$gold >= 5"), Ok(false));

        assert_eq!(set.size(), 1);
        assert!(set.has("$gold >= 5"));
    }

    #[test]
    fn test_empty_set_is_true() {
        let state = State::new();
        let set = ReactiveQualitySet::new(Some(&state));
        assert_eq!(set.result(), Ok(true));
    }

    #[test]
    fn test_and_semantics() {
        let state = State::new();
        state.set("gold", 10);
        state.set("level", 1);

        let set = ReactiveQualitySet::with_conditions(["$gold >= 5"], Some(&state));
        assert_eq!(set.result(), Ok(true));

        set.add("$level > 3").unwrap();
        assert_eq!(set.result(), Ok(false));

        state.set("level", 4);
        assert_eq!(set.result(), Ok(true));
    }

    #[test]
    fn test_unbound_result_fails() {
        let set = ReactiveQualitySet::with_conditions(["$a == 1"], None);
        assert_eq!(set.result(), Err(ReactiveError::Unbound(NodeKind::QualitySet)));
        assert_eq!(set.cache_state(), CacheState::Unbound);
    }

    #[test]
    fn test_members_follow_binding() {
        let state = State::new();
        let set = ReactiveQualitySet::with_conditions(["$a == 1", "$b == 1"], None);
        assert!(set.expressions().iter().all(|e| !e.is_bound()));

        set.bind_to_state(&state).unwrap();
        assert!(set.expressions().iter().all(|e| e.is_bound()));

        // A member added while bound is bound too.
        set.add("$c == 1").unwrap();
        assert!(set.expressions()[2].is_bound());

        set.unbind();
        assert!(set.expressions().iter().all(|e| !e.is_bound()));
        assert_eq!(state.listener_count(), 0);
    }

    #[test]
    fn test_single_mutation_notifies_once() {
        let state = State::new();
        let set = ReactiveQualitySet::with_conditions(
            ["$score >= 100", "$level >= 2", "$hasKey == true"],
            Some(&state),
        );
        let seen = Rc::new(RefCell::new(Vec::new()));
        let log = Rc::clone(&seen);
        let _sub = set.subscribe(move |value| log.borrow_mut().push(value));

        state.set("score", 150);
        assert_eq!(*seen.borrow(), vec![false]);

        state.batch(|| {
            state.set("level", 3);
            state.set("hasKey", true);
        });
        assert_eq!(*seen.borrow(), vec![false, true]);
    }

    #[test]
    fn test_pushed_value_is_fresh_for_every_member() {
        let state = State::new();
        state.set("x", 0);
        let set = ReactiveQualitySet::with_conditions(["$x >= 0", "$x < 5"], Some(&state));
        assert_eq!(set.result(), Ok(true));

        let seen = Rc::new(RefCell::new(Vec::new()));
        let log = Rc::clone(&seen);
        let _sub = set.subscribe(move |value| log.borrow_mut().push(value));

        // The first member's pulse arrives before the second member has
        // heard about the change.
        state.set("x", 7);

        assert_eq!(*seen.borrow(), vec![false]);
        assert_eq!(set.result(), Ok(false));
    }

    #[test]
    fn test_result_is_fresh_regardless_of_subscription_order() {
        let state = State::new();
        state.set("x", 0);
        let slot: Rc<RefCell<Option<ReactiveQualitySet>>> = Rc::new(RefCell::new(None));

        // Registered before the set or any member hears about the state.
        let seen = Rc::new(RefCell::new(Vec::new()));
        let (log, reader) = (Rc::clone(&seen), Rc::clone(&slot));
        let _early = state.subscribe(move |_| {
            if let Some(set) = reader.borrow().as_ref() {
                log.borrow_mut().push(set.result());
            }
        });

        let set = ReactiveQualitySet::new(Some(&state));
        set.add("$x < 5").unwrap();
        assert_eq!(set.result(), Ok(true));
        *slot.borrow_mut() = Some(set.clone());

        state.set("x", 7);

        assert_eq!(*seen.borrow(), vec![Ok(false)]);
    }

    #[test]
    fn test_add_and_remove_notify() {
        let state = State::new();
        state.set("a", 1);
        let set = ReactiveQualitySet::new(Some(&state));
        let (count, _sub) = counter(&set);

        set.add("$a == 2").unwrap();
        assert_eq!(count.get(), 1);
        assert_eq!(set.result(), Ok(false));

        assert!(set.remove("$a == 2"));
        assert_eq!(count.get(), 2);
        assert_eq!(set.result(), Ok(true));

        assert!(!set.remove("$a == 2"));
        assert_eq!(count.get(), 2);
    }

    #[test]
    fn test_remove_disposes_member() {
        let state = State::new();
        let set = ReactiveQualitySet::with_conditions(["$a == 1"], Some(&state));
        let member = set.expressions().remove(0);
        assert_eq!(state.listener_count(), 2);

        set.remove("$a == 1");

        assert!(member.is_disposed());
        assert_eq!(state.listener_count(), 1);
    }

    #[test]
    fn test_member_change_invalidates() {
        let state = State::new();
        state.set("a", 2);
        let set = ReactiveQualitySet::with_conditions(["$a == 1"], Some(&state));
        assert_eq!(set.result(), Ok(false));

        set.expressions()[0].change("$a == 2");

        assert_eq!(set.result(), Ok(true));
    }

    #[test]
    fn test_check() {
        let state = State::new();
        state.set("wisdom", 4);
        state.set("courage", 1);
        let set = ReactiveQualitySet::with_conditions(["$wisdom >= 3", "$courage >= 3"], None);

        assert!(!set.check(&state));
        set.remove("$courage >= 3");
        assert!(set.check(&state));
        assert!(ReactiveQualitySet::new(None).check(&state));
    }

    #[test]
    fn test_faulty_member_is_false() {
        let state = State::new();
        let set = ReactiveQualitySet::with_conditions(["$ok == null", "$broken >="], Some(&state));
        assert_eq!(set.result(), Ok(false));
    }

    #[test]
    fn test_rebind() {
        let first = State::new();
        first.set("a", 1);
        let second = State::new();

        let set = ReactiveQualitySet::with_conditions(["$a == 1"], Some(&first));
        assert_eq!(set.result(), Ok(true));

        set.bind_to_state(&second).unwrap();

        assert_eq!(set.result(), Ok(false));
        assert_eq!(first.listener_count(), 0);
        assert_eq!(second.listener_count(), 2);
    }

    #[test]
    fn test_dispose() {
        let state = State::new();
        let set = ReactiveQualitySet::with_conditions(["$a == 1", "$b == 1"], Some(&state));
        let members = set.expressions();
        let (count, _sub) = counter(&set);

        set.dispose();
        state.set("a", 1);

        assert_eq!(count.get(), 0);
        assert_eq!(set.size(), 0);
        assert_eq!(state.listener_count(), 0);
        assert!(members.iter().all(|m| m.is_disposed()));
        assert_eq!(set.result(), Err(ReactiveError::Unbound(NodeKind::QualitySet)));
        assert_eq!(set.add("$c == 1"), Err(ReactiveError::Disposed(NodeKind::QualitySet)));
    }
}
