//! Error types for the reactive engine.

use thiserror::Error;

use crate::node::NodeKind;

/// Errors raised by reactive nodes.
///
/// These are programmer errors: reading a computed property of a node that is
/// not bound, or using a node after it was disposed. They are never swallowed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ReactiveError {
    #[error("{0} must be bound to a state")]
    Unbound(NodeKind),

    #[error("{0} is bound to a state that no longer exists")]
    StateDropped(NodeKind),

    #[error("{0} has been disposed")]
    Disposed(NodeKind),
}

impl ReactiveError {
    /// Whether this is a binding error (as opposed to a contract violation).
    pub fn is_binding_error(&self) -> bool {
        matches!(self, ReactiveError::Unbound(_) | ReactiveError::StateDropped(_))
    }

    /// The node kind that raised the error.
    pub fn kind(&self) -> NodeKind {
        match self {
            ReactiveError::Unbound(kind)
            | ReactiveError::StateDropped(kind)
            | ReactiveError::Disposed(kind) => *kind,
        }
    }
}

pub type Result<T> = std::result::Result<T, ReactiveError>;

/// Errors loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid deck configuration: {0}")]
    Toml(#[from] toml::de::Error),
}
