//! Routing error types.

use thiserror::Error;

/// Errors returned by rule CRUD. Routing itself never fails.
#[derive(Debug, Error)]
pub enum RoutingError {
    #[error("invalid routing rule: {0}")]
    InvalidRule(String),

    #[error("routing rule not found: {0}")]
    RuleNotFound(String),

    #[error("state store error: {0}")]
    State(#[from] runnergrid_state::StateError),
}

pub type RoutingResult<T> = Result<T, RoutingError>;
