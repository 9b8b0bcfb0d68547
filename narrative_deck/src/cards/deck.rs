//! Reactive decks - ordered card collections sharing one state.

use rand::Rng;
use rand_chacha::ChaCha8Rng;
use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

use quality_rules::{ListenerSet, State, Subscription};

use super::ReactiveCard;
use crate::config::DeckConfig;
use crate::error::{ReactiveError, Result};
use crate::node::{self, Binding, NodeKind, PushGate, ReactiveNode};

/// A member card and the subscription forwarding its changes.
struct DeckEntry {
    card: ReactiveCard,
    _forward: Subscription,
}

struct DeckNode {
    entries: RefCell<Vec<DeckEntry>>,
    binding: RefCell<Option<Binding>>,
    rng: RefCell<ChaCha8Rng>,
    gate: PushGate,
    listeners: ListenerSet<[ReactiveCard]>,
    disposed: Cell<bool>,
}

/// An ordered collection of cards bound to one state.
///
/// Listeners receive the currently available cards whenever the state, the
/// collection or a member card's qualities change.
///
/// Cloning creates a new handle to the **same** deck.
#[derive(Clone)]
pub struct ReactiveDeck {
    node: Rc<DeckNode>,
}

impl ReactiveDeck {
    /// Create a deck with the default configuration.
    pub fn new(cards: impl IntoIterator<Item = ReactiveCard>, state: Option<&State>) -> Self {
        Self::with_config(&DeckConfig::default(), cards, state)
    }

    /// Create a deck, binding every card to `state` if one is given.
    pub fn with_config(
        config: &DeckConfig,
        cards: impl IntoIterator<Item = ReactiveCard>,
        state: Option<&State>,
    ) -> Self {
        let deck = Self {
            node: Rc::new(DeckNode {
                entries: RefCell::new(Vec::new()),
                binding: RefCell::new(None),
                rng: RefCell::new(config.rng()),
                gate: PushGate::default(),
                listeners: ListenerSet::new("ReactiveDeck"),
                disposed: Cell::new(false),
            }),
        };

        let entries: Vec<DeckEntry> = cards.into_iter().map(|card| deck.entry(card)).collect();
        *deck.node.entries.borrow_mut() = entries;

        if let Some(state) = state {
            deck.attach(state);
        }
        deck
    }

    /// Handles to every card, in deck order.
    pub fn cards(&self) -> Vec<ReactiveCard> {
        self.node
            .entries
            .borrow()
            .iter()
            .map(|entry| entry.card.clone())
            .collect()
    }

    /// Replace every card.
    ///
    /// The previous cards are unbound (not disposed) and the new ones bound to
    /// the deck's state. Listeners are notified once.
    pub fn set_cards(&self, cards: impl IntoIterator<Item = ReactiveCard>) {
        let previous = std::mem::take(&mut *self.node.entries.borrow_mut());
        for entry in &previous {
            entry.card.unbind();
        }
        drop(previous);

        let entries: Vec<DeckEntry> = cards.into_iter().map(|card| self.entry(card)).collect();
        if let Ok(state) = self.state() {
            for entry in &entries {
                Self::bind_card(&entry.card, &state);
            }
        }
        tracing::debug!(cards = entries.len(), "deck cards replaced");
        *self.node.entries.borrow_mut() = entries;

        self.push();
    }

    /// The bound state.
    pub fn state(&self) -> Result<State> {
        node::bound_state(&self.node.binding, NodeKind::Deck)
    }

    /// Rebind to `state` and notify.
    pub fn set_state(&self, state: &State) -> Result<()> {
        self.bind_to_state(state)?;
        self.push();
        Ok(())
    }

    /// Card at `index`, or `None` when out of range.
    pub fn get_card(&self, index: usize) -> Option<ReactiveCard> {
        self.node
            .entries
            .borrow()
            .get(index)
            .map(|entry| entry.card.clone())
    }

    /// Number of cards.
    pub fn size(&self) -> usize {
        self.node.entries.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.node.entries.borrow().is_empty()
    }

    /// Append a card, binding it to the deck's state.
    pub fn add_card(&self, card: ReactiveCard) -> Result<()> {
        self.ensure_live()?;
        if card.is_disposed() {
            return Err(ReactiveError::Disposed(NodeKind::Card));
        }

        if let Ok(state) = self.state() {
            card.bind_to_state(&state)?;
        }
        tracing::debug!(hash = %card.hash(), "card added to deck");

        let entry = self.entry(card);
        self.node.entries.borrow_mut().push(entry);
        self.push();
        Ok(())
    }

    /// Remove every entry that is this exact card object and unbind it.
    ///
    /// Returns `false` if the card was not in the deck.
    pub fn remove_card(&self, card: &ReactiveCard) -> bool {
        let removed: Vec<DeckEntry> = {
            let mut entries = self.node.entries.borrow_mut();
            let (removed, kept): (Vec<DeckEntry>, Vec<DeckEntry>) =
                std::mem::take(&mut *entries)
                    .into_iter()
                    .partition(|entry| entry.card.ptr_eq(card));
            *entries = kept;
            removed
        };

        if removed.is_empty() {
            return false;
        }
        card.unbind();
        drop(removed);

        tracing::debug!(hash = %card.hash(), "card removed from deck");
        self.push();
        true
    }

    /// Replace the first card sharing `card`'s hash, in place.
    ///
    /// The old card is unbound and the replacement bound to the deck's state.
    /// Returns `Ok(false)` without notifying when no card matches.
    pub fn update_card(&self, card: ReactiveCard) -> Result<bool> {
        self.ensure_live()?;
        if card.is_disposed() {
            return Err(ReactiveError::Disposed(NodeKind::Card));
        }

        let hash = card.hash();
        let Some(index) = self
            .node
            .entries
            .borrow()
            .iter()
            .position(|entry| entry.card.hash() == hash)
        else {
            return Ok(false);
        };

        let entry = self.entry(card.clone());
        let previous = std::mem::replace(&mut self.node.entries.borrow_mut()[index], entry);
        previous.card.unbind();
        drop(previous);

        if let Ok(state) = self.state() {
            card.bind_to_state(&state)?;
        }
        tracing::debug!(%hash, index, "card updated in deck");

        self.push();
        Ok(true)
    }

    /// Shuffle the cards in place (Fisher-Yates) and notify.
    pub fn shuffle(&self) {
        {
            let mut entries = self.node.entries.borrow_mut();
            let mut rng = self.node.rng.borrow_mut();
            for i in (1..entries.len()).rev() {
                let j = rng.gen_range(0..=i);
                entries.swap(i, j);
            }
        }
        self.push();
    }

    /// Cards available in the bound state, in deck order.
    pub fn available_cards(&self) -> Result<Vec<ReactiveCard>> {
        let state = self.state()?;

        let mut available = Vec::new();
        for card in self.cards() {
            if card.is_disposed() {
                continue;
            }
            let is_available = match card.available() {
                Ok(is_available) => is_available,
                Err(err) => {
                    tracing::warn!(hash = %card.hash(), "checking unbound card against deck state: {}", err);
                    card.is_available(&state)
                }
            };
            if is_available {
                available.push(card);
            }
        }
        Ok(available)
    }

    /// A uniformly random available card. The card stays in the deck.
    pub fn draw(&self) -> Result<Option<ReactiveCard>> {
        let available = self.available_cards()?;
        Ok(self.pick(available))
    }

    /// Cards available in `state`, ignoring the deck's binding.
    pub fn get_available_cards(&self, state: &State) -> Vec<ReactiveCard> {
        self.cards()
            .into_iter()
            .filter(|card| card.is_available(state))
            .collect()
    }

    /// A uniformly random card available in `state`.
    pub fn draw_from_state(&self, state: &State) -> Option<ReactiveCard> {
        let available = self.get_available_cards(state);
        self.pick(available)
    }

    /// Whether `card` is available in the deck's state.
    pub fn is_card_available(&self, card: &ReactiveCard) -> Result<bool> {
        let state = self.state()?;
        Ok(card.is_available(&state))
    }

    /// Register a listener receiving the available cards on every change.
    #[must_use = "dropping the subscription unregisters the listener"]
    pub fn subscribe(&self, listener: impl Fn(&[ReactiveCard]) + 'static) -> Subscription {
        self.node.listeners.subscribe(listener)
    }

    /// Whether two handles point at the same deck.
    pub fn ptr_eq(&self, other: &ReactiveDeck) -> bool {
        Rc::ptr_eq(&self.node, &other.node)
    }

    fn ensure_live(&self) -> Result<()> {
        if self.is_disposed() {
            return Err(ReactiveError::Disposed(NodeKind::Deck));
        }
        Ok(())
    }

    fn pick(&self, mut cards: Vec<ReactiveCard>) -> Option<ReactiveCard> {
        if cards.is_empty() {
            return None;
        }
        let index = self.node.rng.borrow_mut().gen_range(0..cards.len());
        Some(cards.swap_remove(index))
    }

    fn entry(&self, card: ReactiveCard) -> DeckEntry {
        let weak: Weak<DeckNode> = Rc::downgrade(&self.node);
        let forward = card.subscribe_pulse(move |pulse| {
            if let Some(node) = weak.upgrade() {
                ReactiveDeck { node }.on_card_change(pulse.revision);
            }
        });
        DeckEntry {
            card,
            _forward: forward,
        }
    }

    fn bind_card(card: &ReactiveCard, state: &State) {
        if let Err(err) = card.bind_to_state(state) {
            tracing::warn!(hash = %card.hash(), "card skipped while binding deck: {}", err);
        }
    }

    fn attach(&self, state: &State) {
        self.unbind();

        // Cards subscribe before the deck so their results are current when
        // the deck's own handler runs.
        let cards = self.cards();
        for card in &cards {
            Self::bind_card(card, state);
        }

        let weak: Weak<DeckNode> = Rc::downgrade(&self.node);
        let subscription = state.subscribe(move |state| {
            if let Some(node) = weak.upgrade() {
                ReactiveDeck { node }.on_state_change(state.revision());
            }
        });

        *self.node.binding.borrow_mut() = Some(Binding::observing(state, subscription));
        self.node.gate.reset();
        tracing::debug!(cards = cards.len(), "deck bound to state");
    }

    fn on_state_change(&self, revision: u64) {
        if self.node.gate.admit(Some(revision)) {
            self.push();
        }
    }

    fn on_card_change(&self, revision: Option<u64>) {
        if self.node.gate.admit(revision) {
            self.push();
        }
    }

    fn push(&self) {
        if self.node.listeners.is_empty() || !self.is_bound() {
            return;
        }
        match self.available_cards() {
            Ok(cards) => self.node.listeners.notify(cards.as_slice()),
            Err(err) => tracing::debug!("skipping deck notification: {}", err),
        }
    }
}

impl ReactiveNode for ReactiveDeck {
    fn kind(&self) -> NodeKind {
        NodeKind::Deck
    }

    fn bind_to_state(&self, state: &State) -> Result<()> {
        self.ensure_live()?;
        self.attach(state);
        Ok(())
    }

    fn unbind(&self) {
        if node::release(&self.node.binding) {
            tracing::debug!("deck unbound");
        }
        for card in self.cards() {
            card.unbind();
        }
    }

    fn is_bound(&self) -> bool {
        self.node.binding.borrow().is_some()
    }

    fn invalidate(&self) {
        for card in self.cards() {
            card.invalidate();
        }
    }

    fn notify(&self) {
        self.push();
    }

    fn dispose(&self) {
        self.unbind();
        let entries = std::mem::take(&mut *self.node.entries.borrow_mut());
        for entry in &entries {
            entry.card.dispose();
        }
        drop(entries);
        self.node.listeners.clear();
        self.node.disposed.set(true);
        tracing::debug!("deck disposed");
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

impl std::fmt::Debug for ReactiveDeck {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReactiveDeck")
            .field("cards", &self.size())
            .field("bound", &self.is_bound())
            .field("listeners", &self.node.listeners.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn card(content: &str, condition: &str) -> ReactiveCard {
        ReactiveCard::new(content, [condition], None)
    }

    fn contents(cards: &[ReactiveCard]) -> Vec<String> {
        cards.iter().map(ReactiveCard::content).collect()
    }

    fn recorder(deck: &ReactiveDeck) -> (Rc<RefCell<Vec<Vec<String>>>>, Subscription) {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let log = Rc::clone(&seen);
        let sub = deck.subscribe(move |cards| log.borrow_mut().push(contents(cards)));
        (seen, sub)
    }

    fn forest_deck(state: &State) -> ReactiveDeck {
        ReactiveDeck::with_config(
            &DeckConfig::seeded(11),
            [
                card("forest", "$location == \"forest\""),
                card("town", "$location == \"town\""),
                card("rich", "$gold >= 100"),
            ],
            Some(state),
        )
    }

    #[test]
    fn test_new_binds_cards() {
        let state = State::new();
        let deck = forest_deck(&state);

        assert!(deck.is_bound());
        assert_eq!(deck.size(), 3);
        assert!(deck.cards().iter().all(|card| card.is_bound()));
    }

    #[test]
    fn test_unbound_deck() {
        let deck = ReactiveDeck::new([card("a", "$a == 1")], None);

        assert!(!deck.is_bound());
        assert!(!deck.cards()[0].is_bound());
        assert_eq!(deck.state().unwrap_err(), ReactiveError::Unbound(NodeKind::Deck));
        assert_eq!(
            deck.available_cards().unwrap_err(),
            ReactiveError::Unbound(NodeKind::Deck)
        );
        assert!(deck.draw().is_err());
        assert!(deck.is_card_available(&deck.cards()[0]).is_err());
    }

    #[test]
    fn test_available_cards_follow_state() {
        let state = State::new();
        let deck = forest_deck(&state);
        assert!(deck.available_cards().unwrap().is_empty());

        state.set("location", "forest");
        assert_eq!(contents(&deck.available_cards().unwrap()), vec!["forest"]);

        state.set("gold", 150);
        assert_eq!(
            contents(&deck.available_cards().unwrap()),
            vec!["forest", "rich"]
        );
    }

    #[test]
    fn test_state_change_notifies_once() {
        let state = State::new();
        let deck = forest_deck(&state);
        let (seen, _sub) = recorder(&deck);

        state.set("location", "town");

        assert_eq!(*seen.borrow(), vec![vec!["town".to_string()]]);
    }

    #[test]
    fn test_empty_deck_still_notifies_on_state_change() {
        let state = State::new();
        let deck = ReactiveDeck::new(Vec::new(), Some(&state));
        let (seen, _sub) = recorder(&deck);

        state.set("x", 1);

        assert_eq!(seen.borrow().len(), 1);
    }

    #[test]
    fn test_add_card() {
        let state = State::new();
        state.set("gold", 5);
        let deck = ReactiveDeck::new(Vec::new(), Some(&state));
        let (seen, _sub) = recorder(&deck);

        let shop = card("shop", "$gold > 1");
        deck.add_card(shop.clone()).unwrap();

        assert!(shop.is_bound());
        assert_eq!(deck.size(), 1);
        assert_eq!(*seen.borrow(), vec![vec!["shop".to_string()]]);
    }

    #[test]
    fn test_add_disposed_card_fails() {
        let deck = ReactiveDeck::new(Vec::new(), None);
        let stale = card("stale", "$a == 1");
        stale.dispose();

        assert_eq!(
            deck.add_card(stale),
            Err(ReactiveError::Disposed(NodeKind::Card))
        );
        assert_eq!(deck.size(), 0);
    }

    #[test]
    fn test_remove_card() {
        let state = State::new();
        let deck = forest_deck(&state);
        let town = deck.get_card(1).unwrap();
        let (seen, _sub) = recorder(&deck);

        assert!(deck.remove_card(&town));

        assert_eq!(deck.size(), 2);
        assert!(!town.is_bound());
        assert!(!town.is_disposed());
        assert_eq!(seen.borrow().len(), 1);

        assert!(!deck.remove_card(&town));
        assert_eq!(seen.borrow().len(), 1);
    }

    #[test]
    fn test_remove_card_removes_every_entry() {
        let state = State::new();
        let twice = card("twice", "$a == 1");
        let deck = ReactiveDeck::new(
            [twice.clone(), card("other", "$b == 1"), twice.clone()],
            Some(&state),
        );

        assert!(deck.remove_card(&twice));
        assert_eq!(contents(&deck.cards()), vec!["other"]);
    }

    #[test]
    fn test_removed_card_no_longer_notifies_deck() {
        let state = State::new();
        let deck = forest_deck(&state);
        let forest = deck.get_card(0).unwrap();
        deck.remove_card(&forest);
        let (seen, _sub) = recorder(&deck);

        forest.set_qualities(["$anything == 1"]).unwrap();

        assert!(seen.borrow().is_empty());
    }

    #[test]
    #[tracing_test::traced_test]
    fn test_card_shared_with_another_deck_survives_removal_there() {
        let state = State::new();
        let shared = card("shared", "$a == 1");
        let first = ReactiveDeck::new([shared.clone()], Some(&state));
        let second = ReactiveDeck::new([shared.clone()], Some(&state));
        let (seen, _sub) = recorder(&first);

        second.remove_card(&shared);
        assert!(!shared.is_bound());
        state.set("a", 1);

        assert_eq!(*seen.borrow(), vec![vec!["shared".to_string()]]);
        assert_eq!(contents(&first.available_cards().unwrap()), vec!["shared"]);
        assert!(logs_contain("checking unbound card against deck state"));
    }

    #[test]
    fn test_update_card_by_hash() {
        let state = State::new();
        state.set("location", "town");
        let deck = forest_deck(&state);
        let old = deck.get_card(0).unwrap();
        let (seen, _sub) = recorder(&deck);

        let replacement = ReactiveCard::with_hash(
            old.hash(),
            "forest at night",
            ["$location == \"town\""],
            None,
        );
        assert_eq!(deck.update_card(replacement.clone()), Ok(true));

        assert_eq!(deck.size(), 3);
        assert!(deck.get_card(0).unwrap().ptr_eq(&replacement));
        assert!(replacement.is_bound());
        assert!(!old.is_bound());
        assert!(!old.is_disposed());
        assert_eq!(
            *seen.borrow(),
            vec![vec!["forest at night".to_string(), "town".to_string()]]
        );
    }

    #[test]
    fn test_update_unknown_card_is_silent() {
        let state = State::new();
        let deck = forest_deck(&state);
        let (seen, _sub) = recorder(&deck);

        assert_eq!(deck.update_card(card("stranger", "$a == 1")), Ok(false));

        assert_eq!(deck.size(), 3);
        assert!(seen.borrow().is_empty());
    }

    #[test]
    fn test_update_card_with_itself() {
        let state = State::new();
        state.set("gold", 100);
        let deck = forest_deck(&state);
        let rich = deck.get_card(2).unwrap();

        assert_eq!(deck.update_card(rich.clone()), Ok(true));

        assert!(rich.is_bound());
        assert_eq!(contents(&deck.available_cards().unwrap()), vec!["rich"]);
    }

    #[test]
    fn test_set_cards_notifies_once() {
        let state = State::new();
        state.set("a", 1);
        let deck = forest_deck(&state);
        let old = deck.cards();
        let (seen, _sub) = recorder(&deck);

        deck.set_cards([card("one", "$a == 1"), card("two", "$a == 2")]);

        assert_eq!(*seen.borrow(), vec![vec!["one".to_string()]]);
        assert!(old.iter().all(|card| !card.is_bound()));
        assert!(deck.cards().iter().all(|card| card.is_bound()));
    }

    #[test]
    fn test_get_card_out_of_range() {
        let deck = ReactiveDeck::new([card("a", "$a == 1")], None);
        assert!(deck.get_card(0).is_some());
        assert!(deck.get_card(1).is_none());
    }

    #[test]
    fn test_shuffle_is_seeded_and_notifies() {
        let state = State::new();
        let build = || {
            ReactiveDeck::with_config(
                &DeckConfig::seeded(3),
                (0..10).map(|i| card(&i.to_string(), "$a == 1")),
                Some(&state),
            )
        };
        let first = build();
        let second = build();
        let (seen, _sub) = recorder(&first);

        first.shuffle();
        second.shuffle();

        let mut order = contents(&first.cards());
        assert_eq!(order, contents(&second.cards()));
        assert_eq!(seen.borrow().len(), 1);

        order.sort_by_key(|c| c.parse::<u32>().unwrap_or_default());
        let expected: Vec<String> = (0..10).map(|i| i.to_string()).collect();
        assert_eq!(order, expected);
    }

    #[test]
    fn test_shuffle_unbound_is_silent() {
        let deck = ReactiveDeck::new([card("a", "$a == 1"), card("b", "$a == 1")], None);
        let (seen, _sub) = recorder(&deck);

        deck.shuffle();

        assert!(seen.borrow().is_empty());
    }

    #[test]
    fn test_draw() {
        let state = State::new();
        let deck = forest_deck(&state);
        assert!(deck.draw().unwrap().is_none());

        state.set("location", "forest");
        let drawn = deck.draw().unwrap().unwrap();

        assert_eq!(drawn.content(), "forest");
        assert_eq!(deck.size(), 3);
    }

    #[test]
    fn test_foreign_state_queries() {
        let state = State::new();
        let deck = forest_deck(&state);
        let foreign = State::new();
        foreign.set("gold", 500);

        assert_eq!(contents(&deck.get_available_cards(&foreign)), vec!["rich"]);
        assert_eq!(deck.draw_from_state(&foreign).unwrap().content(), "rich");
        assert!(deck.available_cards().unwrap().is_empty());
    }

    #[test]
    fn test_is_card_available() {
        let state = State::new();
        state.set("gold", 100);
        let deck = forest_deck(&state);

        assert_eq!(deck.is_card_available(&deck.cards()[2]), Ok(true));
        assert_eq!(deck.is_card_available(&deck.cards()[0]), Ok(false));
    }

    #[test]
    fn test_card_quality_edit_notifies_deck() {
        let state = State::new();
        let deck = forest_deck(&state);
        let (seen, _sub) = recorder(&deck);

        deck.get_card(1).unwrap().set_qualities(Vec::<String>::new()).unwrap();

        assert_eq!(*seen.borrow(), vec![vec!["town".to_string()]]);
    }

    #[test]
    fn test_set_state_rebinds_and_notifies() {
        let first = State::new();
        let deck = forest_deck(&first);
        let second = State::new();
        second.set("location", "forest");
        let (seen, _sub) = recorder(&deck);

        deck.set_state(&second).unwrap();

        assert!(deck.state().unwrap().ptr_eq(&second));
        assert_eq!(first.listener_count(), 0);
        assert_eq!(*seen.borrow(), vec![vec!["forest".to_string()]]);

        first.set("location", "town");
        assert_eq!(seen.borrow().len(), 1);
    }

    #[test]
    fn test_unbind_stops_propagation() {
        let state = State::new();
        let deck = forest_deck(&state);
        let (seen, _sub) = recorder(&deck);

        deck.unbind();
        state.set("location", "forest");

        assert!(seen.borrow().is_empty());
        assert_eq!(state.listener_count(), 0);
        assert!(deck.available_cards().unwrap_err().is_binding_error());
    }

    #[test]
    fn test_dispose() {
        let state = State::new();
        let deck = forest_deck(&state);
        let cards = deck.cards();
        let _sub = deck.subscribe(|_| {});

        deck.dispose();

        assert!(deck.is_disposed());
        assert_eq!(deck.size(), 0);
        assert_eq!(deck.listener_count(), 0);
        assert_eq!(state.listener_count(), 0);
        assert!(cards.iter().all(|card| card.is_disposed()));
        assert_eq!(
            deck.bind_to_state(&state),
            Err(ReactiveError::Disposed(NodeKind::Deck))
        );
    }

    #[test]
    fn test_externally_disposed_card_is_skipped() {
        let state = State::new();
        state.set("a", 1);
        let doomed = card("doomed", "$a == 1");
        let deck = ReactiveDeck::new(
            [doomed.clone(), card("kept", "$a == 1")],
            Some(&state),
        );

        doomed.dispose();

        assert_eq!(contents(&deck.available_cards().unwrap()), vec!["kept"]);
        deck.bind_to_state(&state).unwrap();
        assert_eq!(deck.size(), 2);
    }
}
