//! Reactive cards - narrative content gated by a quality set.

use serde::{Deserialize, Serialize};
use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};
use uuid::Uuid;

use quality_rules::{ListenerSet, State, Subscription};

use crate::error::{ReactiveError, Result};
use crate::node::{self, Binding, CacheState, NodeKind, Pulse, PushGate, ReactiveNode};
use crate::qualities::ReactiveQualitySet;

/// Identity of a card, fixed for its whole lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CardHash(pub Uuid);

impl CardHash {
    /// Create a new random card hash.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create a card hash from a specific UUID.
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl Default for CardHash {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for CardHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The card's quality set and the subscription forwarding its changes.
struct Qualities {
    set: ReactiveQualitySet,
    _forward: Subscription,
}

struct CardNode {
    hash: CardHash,
    content: RefCell<String>,
    qualities: RefCell<Qualities>,
    binding: RefCell<Option<Binding>>,
    gate: PushGate,
    listeners: ListenerSet<Pulse>,
    disposed: Cell<bool>,
}

/// A piece of content that is available while all its qualities hold.
///
/// Cloning creates a new handle to the **same** card.
#[derive(Clone)]
pub struct ReactiveCard {
    node: Rc<CardNode>,
}

impl ReactiveCard {
    /// Create a card with a fresh hash, bound to `state` if one is given.
    pub fn new<S: Into<String>>(
        content: impl Into<String>,
        qualities: impl IntoIterator<Item = S>,
        state: Option<&State>,
    ) -> Self {
        Self::with_hash(CardHash::new(), content, qualities, state)
    }

    /// Create a card with a given hash, e.g. a replacement for a card already
    /// in a deck (see [`ReactiveDeck::update_card`](crate::ReactiveDeck::update_card)).
    pub fn with_hash<S: Into<String>>(
        hash: CardHash,
        content: impl Into<String>,
        qualities: impl IntoIterator<Item = S>,
        state: Option<&State>,
    ) -> Self {
        let set = ReactiveQualitySet::with_conditions(qualities, None);

        let node = Rc::new_cyclic(|weak: &Weak<CardNode>| CardNode {
            hash,
            content: RefCell::new(content.into()),
            qualities: RefCell::new(Qualities {
                _forward: Self::forward(&set, weak.clone()),
                set,
            }),
            binding: RefCell::new(None),
            gate: PushGate::default(),
            listeners: ListenerSet::new("ReactiveCard"),
            disposed: Cell::new(false),
        });

        let card = Self { node };
        if let Some(state) = state {
            card.attach_to(state);
        }
        card
    }

    /// Identity of this card. Never changes.
    pub fn hash(&self) -> CardHash {
        self.node.hash
    }

    pub fn content(&self) -> String {
        self.node.content.borrow().clone()
    }

    /// Replace the content. Content does not affect availability, so no
    /// listener is notified.
    pub fn set_content(&self, content: impl Into<String>) {
        *self.node.content.borrow_mut() = content.into();
    }

    /// Handle to the card's current quality set.
    pub fn qualities(&self) -> ReactiveQualitySet {
        self.node.qualities.borrow().set.clone()
    }

    /// Replace the whole quality set.
    ///
    /// The previous set is disposed; the new one is bound to the card's state
    /// and forwards its changes to this card's listeners.
    pub fn set_qualities<S: Into<String>>(
        &self,
        conditions: impl IntoIterator<Item = S>,
    ) -> Result<()> {
        self.ensure_live()?;

        let set = ReactiveQualitySet::with_conditions(conditions, None);
        if let Ok(state) = node::bound_state(&self.node.binding, NodeKind::Card) {
            set.bind_to_state(&state)?;
        }

        let forward = Self::forward(&set, Rc::downgrade(&self.node));
        let previous = std::mem::replace(
            &mut *self.node.qualities.borrow_mut(),
            Qualities {
                set,
                _forward: forward,
            },
        );
        previous.set.dispose();
        drop(previous);

        self.push(None);
        Ok(())
    }

    /// Add a quality. Returns `Ok(false)` if it was already present.
    pub fn add_quality(&self, condition: impl Into<String>) -> Result<bool> {
        self.ensure_live()?;
        self.qualities().add(condition)
    }

    /// Remove a quality. Returns `Ok(false)` if it was not present.
    pub fn remove_quality(&self, condition: &str) -> Result<bool> {
        self.ensure_live()?;
        Ok(self.qualities().remove(condition))
    }

    /// Whether the card is available in its bound state.
    pub fn available(&self) -> Result<bool> {
        node::bound_state(&self.node.binding, NodeKind::Card)?;
        self.qualities().result()
    }

    /// One-shot availability check against any state.
    pub fn is_available(&self, state: &State) -> bool {
        self.qualities().check(state)
    }

    /// Register a listener for availability changes.
    #[must_use = "dropping the subscription unregisters the listener"]
    pub fn subscribe(&self, listener: impl Fn(bool) + 'static) -> Subscription {
        self.node.listeners.subscribe(move |pulse: &Pulse| listener(pulse.value))
    }

    pub(crate) fn subscribe_pulse(&self, listener: impl Fn(&Pulse) + 'static) -> Subscription {
        self.node.listeners.subscribe(listener)
    }

    /// Cache state of the availability result.
    pub fn cache_state(&self) -> CacheState {
        if !self.is_bound() {
            return CacheState::Unbound;
        }
        self.qualities().cache_state()
    }

    /// Whether two handles point at the same card object.
    pub fn ptr_eq(&self, other: &ReactiveCard) -> bool {
        Rc::ptr_eq(&self.node, &other.node)
    }

    fn ensure_live(&self) -> Result<()> {
        if self.is_disposed() {
            return Err(ReactiveError::Disposed(NodeKind::Card));
        }
        Ok(())
    }

    fn forward(set: &ReactiveQualitySet, card: Weak<CardNode>) -> Subscription {
        set.subscribe_pulse(move |pulse| {
            if let Some(node) = card.upgrade() {
                ReactiveCard { node }.on_qualities_change(pulse.revision);
            }
        })
    }

    fn attach_to(&self, state: &State) {
        self.unbind();
        // The quality set only fails to bind once disposed, which only
        // happens together with the card.
        if let Err(err) = self.qualities().bind_to_state(state) {
            tracing::debug!(hash = %self.node.hash, "quality set not bound: {}", err);
            return;
        }
        *self.node.binding.borrow_mut() = Some(Binding::passive(state));
        self.node.gate.reset();
        tracing::debug!(hash = %self.node.hash, "card bound to state");
    }

    fn on_qualities_change(&self, revision: Option<u64>) {
        if self.node.gate.admit(revision) {
            self.push(revision);
        }
    }

    fn push(&self, revision: Option<u64>) {
        if self.node.listeners.is_empty() || !self.is_bound() {
            return;
        }
        match self.available() {
            Ok(value) => self.node.listeners.notify(&Pulse { value, revision }),
            Err(err) => tracing::debug!("skipping card notification: {}", err),
        }
    }
}

impl ReactiveNode for ReactiveCard {
    fn kind(&self) -> NodeKind {
        NodeKind::Card
    }

    fn bind_to_state(&self, state: &State) -> Result<()> {
        self.ensure_live()?;
        self.attach_to(state);
        Ok(())
    }

    fn unbind(&self) {
        if node::release(&self.node.binding) {
            tracing::debug!(hash = %self.node.hash, "card unbound");
        }
        self.qualities().unbind();
    }

    fn is_bound(&self) -> bool {
        self.node.binding.borrow().is_some()
    }

    /// Availability is cached by the quality set; invalidating the card
    /// invalidates that cache.
    fn invalidate(&self) {
        self.qualities().invalidate();
    }

    fn notify(&self) {
        self.push(None);
    }

    fn dispose(&self) {
        self.unbind();
        self.qualities().dispose();
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

impl std::fmt::Debug for ReactiveCard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReactiveCard")
            .field("hash", &self.node.hash)
            .field("content", &*self.node.content.borrow())
            .field("qualities", &self.qualities().conditions())
            .field("bound", &self.is_bound())
            .finish()
    }
}
