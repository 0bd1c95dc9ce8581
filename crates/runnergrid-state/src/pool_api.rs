//! Runner pool collaborator interface.

use async_trait::async_trait;

use crate::types::{Pool, PoolMetrics, Runner, RunnerStatus};

/// Access to per-repository runner pools.
///
/// Routing reads active runners, assignment flips runner status, and the
/// autoscaler reads metrics and issues scale actions through this trait.
#[async_trait]
pub trait RunnerPool: Send + Sync {
    /// Fetch a repository's pool, creating it with default bounds on first use.
    async fn get_or_create_pool(&self, repository: &str) -> anyhow::Result<Pool>;

    /// Runners that are not offline, in registration order.
    async fn active_runners(&self, repository: &str) -> anyhow::Result<Vec<Runner>>;

    async fn pool_metrics(&self, repository: &str) -> anyhow::Result<PoolMetrics>;

    /// Add up to `count` runners without exceeding the pool maximum.
    /// Returns the number actually added.
    async fn scale_up(&self, repository: &str, count: u32) -> anyhow::Result<u32>;

    /// Remove up to `count` idle runners, newest first, without going below
    /// `floor` or the pool minimum, whichever is higher. Returns the number
    /// removed.
    async fn scale_down(&self, repository: &str, count: u32, floor: u32) -> anyhow::Result<u32>;

    async fn set_runner_status(
        &self,
        repository: &str,
        runner_id: &str,
        status: RunnerStatus,
    ) -> anyhow::Result<()>;

    /// Tear down a runner. Returns true if it existed.
    async fn remove_runner(&self, repository: &str, runner_id: &str) -> anyhow::Result<bool>;

    /// Whether a runner's container is still running.
    async fn runner_alive(&self, repository: &str, runner_id: &str) -> anyhow::Result<bool>;
}
