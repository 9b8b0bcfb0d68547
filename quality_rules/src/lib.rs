//! # Quality Rules
//!
//! The leaf crate of the storylet engine. It holds the shared, observable
//! state and the quality conditions evaluated against it, and knows nothing
//! about cards, decks or caching.
//!
//! ## Core Components
//!
//! - **state**: the key/value store, its change notifications and batching
//! - **expression**: quality conditions and their grammar
//! - **listeners**: per-emitter listener registries and subscription guards
//! - **value**: the dynamically-typed values stored in state

pub mod expression;
pub mod listeners;
pub mod state;
pub mod value;

pub use expression::*;
pub use listeners::*;
pub use state::*;
pub use value::*;
