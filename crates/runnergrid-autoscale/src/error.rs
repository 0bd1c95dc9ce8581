//! Autoscaler error types.

use thiserror::Error;

/// Errors from policy and history operations. Evaluations never fail.
#[derive(Debug, Error)]
pub enum AutoscaleError {
    #[error("invalid scaling policy: {0}")]
    InvalidPolicy(String),

    #[error("scaling policy not found: {0}")]
    PolicyNotFound(String),

    #[error("state store error: {0}")]
    State(#[from] runnergrid_state::StateError),
}

pub type AutoscaleResult<T> = Result<T, AutoscaleError>;
