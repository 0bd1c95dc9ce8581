//! Reporter error types.

use thiserror::Error;

/// Errors surfaced to callers of the report operations. Upstream delivery
/// failures never appear here; they become failed reports and events.
#[derive(Debug, Error)]
pub enum ReportError {
    #[error("invalid report: {0}")]
    InvalidReport(String),

    #[error("state store error: {0}")]
    State(#[from] runnergrid_state::StateError),
}

pub type ReportResult<T> = Result<T, ReportError>;
