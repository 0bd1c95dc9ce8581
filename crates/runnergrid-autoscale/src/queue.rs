//! Queue statistics — how much work is waiting per repository.

use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use serde::Serialize;

use runnergrid_state::{JobState, StateStore};

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct QueueStats {
    pub queue_depth: u32,
    /// Mean time the currently queued jobs have been waiting.
    pub average_wait_time_secs: f64,
    pub active_jobs: u32,
}

/// Source of queue statistics for the autoscaler.
#[async_trait]
pub trait QueueStatsSource: Send + Sync {
    async fn queue_stats(&self, repository: &str) -> anyhow::Result<QueueStats>;
}

/// Queue statistics derived from persisted job records.
pub struct StoreQueueStats {
    state: StateStore,
}

impl StoreQueueStats {
    pub fn new(state: StateStore) -> Self {
        Self { state }
    }
}

#[async_trait]
impl QueueStatsSource for StoreQueueStats {
    async fn queue_stats(&self, repository: &str) -> anyhow::Result<QueueStats> {
        let jobs = self.state.list_jobs_for_repository(repository)?;
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();

        let mut stats = QueueStats::default();
        let mut total_wait = 0u64;
        for job in &jobs {
            match job.state {
                JobState::Queued => {
                    stats.queue_depth += 1;
                    total_wait += now.saturating_sub(job.queued_at);
                }
                JobState::Running => stats.active_jobs += 1,
                JobState::Completed => {}
            }
        }
        if stats.queue_depth > 0 {
            stats.average_wait_time_secs = total_wait as f64 / f64::from(stats.queue_depth);
        }
        Ok(stats)
    }
}
