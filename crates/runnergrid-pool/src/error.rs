//! Pool and assignment error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PoolError {
    /// No ready runner among the decision's candidates. Not retried here.
    #[error("no ready runner for job {job_id} in pool {repository}: {reason}")]
    CapacityExhausted {
        job_id: String,
        repository: String,
        reason: String,
    },

    #[error("job {0} is already assigned")]
    AlreadyAssigned(String),

    #[error("job {0} is not assigned")]
    JobNotAssigned(String),

    #[error("runner {runner_id} not tracked in pool {repository}")]
    RunnerNotFound {
        repository: String,
        runner_id: String,
    },

    #[error("state store error: {0}")]
    State(#[from] runnergrid_state::StateError),
}

pub type PoolResult<T> = Result<T, PoolError>;
