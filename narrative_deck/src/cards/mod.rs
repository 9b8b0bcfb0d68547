//! Cards and decks.
//!
//! - **ReactiveCard**: content with a stable hash, available while its qualities hold
//! - **ReactiveDeck**: an ordered card collection bound to one state, with
//!   random draws over the available cards

mod card;
mod deck;

pub use card::*;
pub use deck::*;
