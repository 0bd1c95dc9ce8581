//! Domain types for the runnergrid state store.
//!
//! These types describe jobs, routing rules, runner pools, scaling
//! policies, metric snapshots and upstream job statuses. All types are
//! serializable to/from JSON for storage in redb tables.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// Repository key in `owner/name` form. One pool exists per repository.
pub type RepositoryKey = String;

/// Unique identifier for a job.
pub type JobId = String;

/// Unique identifier for a runner.
pub type RunnerId = String;

/// Policy key used when a repository has no policy of its own.
pub const DEFAULT_POLICY_KEY: &str = "*";

// ── Jobs ──────────────────────────────────────────────────────────

/// An incoming CI job waiting to be routed. Immutable once created.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobRequest {
    pub id: JobId,
    pub repository: RepositoryKey,
    pub workflow: String,
    /// Branch or ref the job runs against.
    #[serde(rename = "ref")]
    pub git_ref: String,
    pub labels: BTreeSet<String>,
    #[serde(default)]
    pub priority: i32,
}

/// Persisted job record, the source of queue statistics.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobRecord {
    pub id: JobId,
    pub repository: RepositoryKey,
    pub state: JobState,
    pub queued_at: u64,
    pub started_at: Option<u64>,
    pub completed_at: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Running,
    Completed,
}

// ── Routing ───────────────────────────────────────────────────────

/// A prioritized condition → target mapping.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RoutingRule {
    pub id: String,
    pub name: String,
    /// Higher priority rules are evaluated first.
    pub priority: i32,
    /// Insertion order, breaks priority ties.
    pub sequence: u64,
    pub conditions: RuleConditions,
    pub targets: RuleTargets,
    pub enabled: bool,
    pub created_at: u64,
    pub updated_at: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RuleConditions {
    /// Exact repository, or a pattern with one leading or trailing `*`.
    #[serde(default)]
    pub repository: Option<String>,
    #[serde(default)]
    pub branch: Option<String>,
    /// Labels the job must carry.
    #[serde(default)]
    pub labels: BTreeSet<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RuleTargets {
    /// Labels a runner must carry to be a target.
    #[serde(default)]
    pub runner_labels: BTreeSet<String>,
    /// Route to this repository's pool instead of the job's own.
    #[serde(default)]
    pub pool_override: Option<RepositoryKey>,
}

// ── Pools and runners ─────────────────────────────────────────────

/// The set of runners serving one repository.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Pool {
    pub repository: RepositoryKey,
    pub min_runners: u32,
    pub max_runners: u32,
    pub current_runners: u32,
    pub scale_increment: u32,
    pub scale_threshold: f64,
    /// Labels given to runners provisioned for this pool.
    pub runner_labels: BTreeSet<String>,
    pub created_at: u64,
    pub updated_at: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Runner {
    pub id: RunnerId,
    /// Owning pool.
    pub repository: RepositoryKey,
    pub labels: BTreeSet<String>,
    pub status: RunnerStatus,
    /// Unix millis, strictly increasing within a pool.
    pub registered_at: u64,
    pub updated_at: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunnerStatus {
    Idle,
    Busy,
    Offline,
}

/// Point-in-time capacity figures for one pool.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct PoolMetrics {
    pub total_runners: u32,
    pub active_runners: u32,
    pub idle_runners: u32,
    /// active / total, 0.0 for an empty pool.
    pub utilization: f64,
}

// ── Scaling ───────────────────────────────────────────────────────

/// Per-repository (or `*` default) scaling policy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScalingPolicy {
    pub repository: RepositoryKey,
    pub min_runners: u32,
    pub max_runners: u32,
    pub scale_up_threshold: f64,
    pub scale_down_threshold: f64,
    pub scale_increment: u32,
    pub cooldown_period_secs: u64,
    pub updated_at: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ScalingAction {
    ScaleUp,
    ScaleDown,
    Maintain,
}

impl std::fmt::Display for ScalingAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            ScalingAction::ScaleUp => "scale-up",
            ScalingAction::ScaleDown => "scale-down",
            ScalingAction::Maintain => "maintain",
        })
    }
}

/// One autoscaler evaluation, as kept in the history ring buffer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetricSnapshot {
    /// Unix timestamp in milliseconds.
    pub timestamp_ms: u64,
    pub repository: RepositoryKey,
    /// 0.0–1.0
    pub utilization: f64,
    pub queue_depth: u32,
    pub average_wait_time_secs: f64,
    pub runner_count: u32,
    pub active_jobs: u32,
    pub decision: ScalingAction,
    pub reason: String,
}

// ── Status reporting ──────────────────────────────────────────────

/// Upstream-visible status of one job, mutated in place as it progresses.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobStatus {
    pub job_id: JobId,
    pub repository: RepositoryKey,
    pub head_sha: String,
    pub run_id: u64,
    /// Job name, used in rendered output.
    pub name: String,
    /// Set once the upstream check run exists; switches create → update.
    pub check_run_id: Option<u64>,
    pub status: CheckStatus,
    pub conclusion: Option<Conclusion>,
    pub started_at: Option<u64>,
    pub completed_at: Option<u64>,
    pub output: Option<CheckOutput>,
    /// Tail of the job log, rendered after the step summary.
    #[serde(default)]
    pub logs: Option<String>,
    #[serde(default)]
    pub annotations: Vec<Annotation>,
    /// Ordered by step number, one entry per number.
    #[serde(default)]
    pub steps: Vec<StepStatus>,
    pub updated_at: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckStatus {
    Queued,
    InProgress,
    Completed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Conclusion {
    Success,
    Failure,
    Cancelled,
    Skipped,
    TimedOut,
    ActionRequired,
    Neutral,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CheckOutput {
    pub title: String,
    pub summary: String,
    #[serde(default)]
    pub text: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Annotation {
    pub path: String,
    pub start_line: u32,
    pub end_line: u32,
    /// "notice", "warning" or "failure".
    pub annotation_level: String,
    pub message: String,
    #[serde(default)]
    pub title: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepStatus {
    pub number: u32,
    pub name: String,
    pub status: CheckStatus,
    pub conclusion: Option<Conclusion>,
    pub started_at: Option<u64>,
    pub completed_at: Option<u64>,
}

/// A status whose upstream delivery exhausted its retries.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FailedReport {
    pub status: JobStatus,
    pub error: String,
    pub attempts: u32,
    pub failed_at: u64,
}

/// The upstream check run created for a job.
///
/// Kept after completion so late or repeated reports update the same run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CheckRunRecord {
    pub job_id: JobId,
    pub check_run_id: u64,
    /// Set once a `completed` status was acknowledged upstream.
    pub completed: bool,
    pub updated_at: u64,
}

impl JobRecord {
    /// Build the composite key for the jobs table.
    pub fn table_key(&self) -> String {
        job_key(&self.repository, &self.id)
    }
}

impl Runner {
    /// Build the composite key for the runners table.
    pub fn table_key(&self) -> String {
        runner_key(&self.repository, &self.id)
    }
}

impl MetricSnapshot {
    /// Build the composite key for the metrics table.
    pub fn table_key(&self) -> String {
        format!("{}:{:020}", self.repository, self.timestamp_ms)
    }
}

/// `{repository}:{runner_id}`
pub fn runner_key(repository: &str, runner_id: &str) -> String {
    format!("{repository}:{runner_id}")
}

/// `{repository}:{job_id}`
pub fn job_key(repository: &str, job_id: &str) -> String {
    format!("{repository}:{job_id}")
}
