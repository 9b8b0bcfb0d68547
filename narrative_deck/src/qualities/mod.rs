//! Qualities - reactive conditions over the shared state.
//!
//! - **ReactiveExpression**: one condition, cached and kept current while bound
//! - **ReactiveQualitySet**: unique conditions combined with logical AND

mod expression;
mod set;

pub use expression::*;
pub use set::*;
