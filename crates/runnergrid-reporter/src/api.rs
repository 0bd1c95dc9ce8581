//! Upstream check-run API contract and request bodies.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;

use runnergrid_state::{Annotation, CheckStatus, Conclusion, JobStatus};

/// The upstream status API.
#[async_trait]
pub trait CheckRunApi: Send + Sync {
    /// Create a check run and return its id.
    async fn create_check_run(&self, repository: &str, request: &CreateCheckRun) -> anyhow::Result<u64>;

    async fn update_check_run(
        &self,
        repository: &str,
        check_run_id: u64,
        request: &UpdateCheckRun,
    ) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct CheckRunOutput {
    pub title: String,
    pub summary: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub annotations: Vec<Annotation>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct CreateCheckRun {
    pub name: String,
    pub head_sha: String,
    pub external_id: String,
    pub status: CheckStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conclusion: Option<Conclusion>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<CheckRunOutput>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct UpdateCheckRun {
    pub status: CheckStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conclusion: Option<Conclusion>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<CheckRunOutput>,
}

impl CreateCheckRun {
    pub fn from_status(check_name: &str, status: &JobStatus) -> Self {
        Self {
            name: format!("{check_name} / {}", status.name),
            head_sha: status.head_sha.clone(),
            external_id: status.job_id.clone(),
            status: status.status,
            started_at: status.started_at.and_then(rfc3339),
            completed_at: completed_at(status),
            conclusion: conclusion(status),
            output: output(status),
        }
    }
}

impl UpdateCheckRun {
    pub fn from_status(status: &JobStatus) -> Self {
        Self {
            status: status.status,
            completed_at: completed_at(status),
            conclusion: conclusion(status),
            output: output(status),
        }
    }
}

/// Conclusion and completion time are only valid on completed runs.
fn conclusion(status: &JobStatus) -> Option<Conclusion> {
    (status.status == CheckStatus::Completed)
        .then_some(status.conclusion)
        .flatten()
}

fn completed_at(status: &JobStatus) -> Option<String> {
    (status.status == CheckStatus::Completed)
        .then_some(status.completed_at)
        .flatten()
        .and_then(rfc3339)
}

fn output(status: &JobStatus) -> Option<CheckRunOutput> {
    status.output.as_ref().map(|o| CheckRunOutput {
        title: o.title.clone(),
        summary: o.summary.clone(),
        text: o.text.clone(),
        annotations: status.annotations.clone(),
    })
}

fn rfc3339(epoch_secs: u64) -> Option<String> {
    let secs = i64::try_from(epoch_secs).ok()?;
    DateTime::<Utc>::from_timestamp(secs, 0).map(|t| t.to_rfc3339_opts(SecondsFormat::Secs, true))
}
