//! # Narrative Deck
//!
//! The reactive half of the storylet engine. Cards are pieces of narrative
//! content gated by qualities (conditions over a shared [`State`]); a deck
//! keeps the subset of currently available cards live as the state changes.
//!
//! ## Core Components
//!
//! - **node**: the [`ReactiveNode`] capability set, cache states and bindings
//! - **qualities**: [`ReactiveExpression`] and [`ReactiveQualitySet`]
//! - **cards**: [`ReactiveCard`] and [`ReactiveDeck`]
//! - **config**: [`DeckConfig`], loadable from TOML
//! - **error**: [`ReactiveError`] and [`ConfigError`]
//!
//! ## Design Philosophy
//!
//! - **Push invalidation, pull evaluation**: a state change marks caches
//!   dirty; results are recomputed on the next read, or right away when a
//!   listener needs the new value
//! - **One notification per change**: a single mutation (or a whole batch)
//!   reaches each listener at most once
//! - **Explicit lifecycle**: nodes bind to a state, unbind, and are disposed;
//!   reading an unbound node is an error, never a stale value
//!
//! ## Example
//!
//! ```
//! use narrative_deck::{ReactiveCard, ReactiveDeck, State};
//!
//! let state = State::new();
//! let deck = ReactiveDeck::new(
//!     [
//!         ReactiveCard::new("A wolf howls.", ["$location == \"forest\""], None),
//!         ReactiveCard::new("The market bustles.", ["$location == \"town\""], None),
//!     ],
//!     Some(&state),
//! );
//!
//! state.set("location", "forest");
//! let available = deck.available_cards().unwrap();
//! assert_eq!(available.len(), 1);
//! assert_eq!(available[0].content(), "A wolf howls.");
//! ```

pub mod cards;
pub mod config;
pub mod error;
pub mod node;
pub mod qualities;

pub use cards::*;
pub use config::*;
pub use error::{ConfigError, ReactiveError};
pub use node::{CacheState, NodeKind, ReactiveNode};
pub use qualities::*;

pub use quality_rules::{BatchScope, Expression, State, Subscription, Value, WeakState};
