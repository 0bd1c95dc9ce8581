//! redb table definitions for the runnergrid state store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized domain types).
//! Composite keys follow the pattern `{repository}:{child_id}` so related
//! records can be collected with a prefix scan.

use redb::TableDefinition;

/// Every table stores JSON documents under string keys.
pub type JsonTable = TableDefinition<'static, &'static str, &'static [u8]>;

/// Routing rules keyed by rule id.
pub const ROUTING_RULES: JsonTable = TableDefinition::new("routing_rules");

/// Scaling policies keyed by repository (or `*`).
pub const SCALING_POLICIES: JsonTable = TableDefinition::new("scaling_policies");

/// Pools keyed by repository.
pub const POOLS: JsonTable = TableDefinition::new("pools");

/// Runners keyed by `{repository}:{runner_id}`.
pub const RUNNERS: JsonTable = TableDefinition::new("runners");

/// Job records keyed by `{repository}:{job_id}`.
pub const JOBS: JsonTable = TableDefinition::new("jobs");

/// Reporter queue entries keyed by job id.
pub const JOB_STATUSES: JsonTable = TableDefinition::new("job_statuses");

/// Created check runs keyed by job id.
pub const CHECK_RUNS: JsonTable = TableDefinition::new("check_runs");

/// Exhausted status deliveries keyed by job id.
pub const FAILED_REPORTS: JsonTable = TableDefinition::new("failed_reports");

/// Exported metric snapshots keyed by `{repository}:{timestamp_ms}`.
pub const METRICS: JsonTable = TableDefinition::new("metrics");

pub(crate) const ALL_TABLES: [JsonTable; 9] = [
    ROUTING_RULES,
    SCALING_POLICIES,
    POOLS,
    RUNNERS,
    JOBS,
    JOB_STATUSES,
    CHECK_RUNS,
    FAILED_REPORTS,
    METRICS,
];
