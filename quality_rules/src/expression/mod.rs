//! Expressions - single quality conditions checked against a [`State`].
//!
//! An [`Expression`] is the evaluation boundary of the engine: compilation or
//! evaluation faults never escape [`Expression::check`]. They are logged and
//! the quality is treated as unmet.

mod parser;

pub use parser::{Comparison, Condition, ConditionError, MAX_NESTING};

use crate::state::State;
use crate::value::Value;

/// A quality condition such as `$gold >= 15 && $class == "wizard"`.
#[derive(Debug, Clone, PartialEq)]
pub struct Expression {
    source: String,
    compiled: Result<Condition, ConditionError>,
}

impl Expression {
    /// Create an expression from condition text.
    pub fn new(source: impl Into<String>) -> Self {
        let source = source.into();
        let compiled = Condition::parse(&source);
        Self { source, compiled }
    }

    /// The condition text.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Replace the condition text.
    pub fn change(&mut self, source: impl Into<String>) {
        *self = Self::new(source);
    }

    /// Whether the condition text parses.
    pub fn is_valid(&self) -> bool {
        self.compiled.is_ok()
    }

    /// The compilation error, if any.
    pub fn error(&self) -> Option<&ConditionError> {
        self.compiled.as_ref().err()
    }

    /// Evaluate with a custom variable resolver.
    pub fn evaluate(
        &self,
        resolve: impl Fn(&str) -> Option<Value>,
    ) -> Result<bool, ConditionError> {
        let condition = self.compiled.as_ref().map_err(Clone::clone)?;
        Ok(condition.evaluate(&resolve).is_truthy())
    }

    /// Check the condition against a state.
    ///
    /// Faults are logged and reported as `false`.
    pub fn check(&self, state: &State) -> bool {
        match self.evaluate(|name| state.get(name)) {
            Ok(result) => result,
            Err(err) => {
                tracing::warn!(condition = %self.source, "expression check failed: {}", err);
                false
            }
        }
    }
}

impl std::fmt::Display for Expression {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    #[test]
    fn test_check_against_state() {
        let state = State::new();
        state.set("playerHealth", 40);
        state.set("location", "forest");

        assert!(Expression::new("$playerHealth < 50").check(&state));
        assert!(Expression::new("$location == \"forest\"").check(&state));
        assert!(!Expression::new("$playerHealth < 50 && $location == \"cave\"").check(&state));
    }

    #[test]
    fn test_change() {
        let state = State::new();
        state.set("turn", 1);

        let mut expression = Expression::new("invalid");
        assert!(!expression.is_valid());

        expression.change("$turn == 1");
        assert!(expression.is_valid());
        assert_eq!(expression.source(), "$turn == 1");
        assert!(expression.check(&state));
    }

    #[test]
    #[traced_test]
    fn test_fault_becomes_false() {
        let state = State::new();
        let expression = Expression::new("$gold >=");

        assert!(!expression.check(&state));
        assert_eq!(expression.error(), Some(&ConditionError::UnexpectedEnd));
        assert!(logs_contain("expression check failed"));
    }

    #[test]
    #[traced_test]
    fn test_deeply_nested_condition_is_unmet() {
        let state = State::new();
        state.set("a", true);
        let expression = Expression::new(format!("{}$a", "!".repeat(1_000_000)));

        assert!(!expression.check(&state));
        assert_eq!(
            expression.error(),
            Some(&ConditionError::TooDeep { limit: MAX_NESTING })
        );
        assert!(logs_contain("nests deeper than"));
    }

    #[test]
    fn test_evaluate_with_resolver() {
        let expression = Expression::new("$mana > 20");
        let result = expression.evaluate(|name| (name == "mana").then(|| Value::from(25)));
        assert_eq!(result, Ok(true));
    }
}
