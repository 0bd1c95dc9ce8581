//! StateStore — redb-backed state persistence for runnergrid.
//!
//! Provides typed CRUD operations over rules, policies, pools, runners,
//! jobs, reporter queue entries and metric snapshots. All values are
//! JSON-serialized into redb's `&[u8]` value columns. The store supports
//! both on-disk and in-memory backends (the latter for testing).

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable, TableHandle};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

fn storage(table: JsonTable) -> impl Fn(redb::Error) -> StateError {
    move |e| StateError::Storage {
        table: table.name().to_string(),
        message: e.to_string(),
    }
}

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(|e| StateError::Open(e.to_string()))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(|e| StateError::Open(e.to_string()))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(|e| StateError::Open(e.to_string()))?;
        for table in ALL_TABLES {
            txn.open_table(table).map_err(|e| storage(table)(e.into()))?;
        }
        txn.commit().map_err(|e| StateError::Open(e.to_string()))?;
        Ok(())
    }

    // ── JSON documents ─────────────────────────────────────────────

    fn put_json<T: Serialize>(&self, table: JsonTable, key: &str, value: &T) -> StateResult<()> {
        let bytes = serde_json::to_vec(value).map_err(|e| StateError::Encode {
            table: table.name().to_string(),
            key: key.to_string(),
            message: e.to_string(),
        })?;
        let err = storage(table);
        let txn = self.db.begin_write().map_err(|e| err(e.into()))?;
        {
            let mut t = txn.open_table(table).map_err(|e| err(e.into()))?;
            t.insert(key, bytes.as_slice()).map_err(|e| err(e.into()))?;
        }
        txn.commit().map_err(|e| err(e.into()))
    }

    fn decode<T: DeserializeOwned>(table: JsonTable, key: &str, bytes: &[u8]) -> StateResult<T> {
        serde_json::from_slice(bytes).map_err(|e| StateError::Corrupt {
            table: table.name().to_string(),
            key: key.to_string(),
            message: e.to_string(),
        })
    }

    fn get_json<T: DeserializeOwned>(&self, table: JsonTable, key: &str) -> StateResult<Option<T>> {
        let err = storage(table);
        let txn = self.db.begin_read().map_err(|e| err(e.into()))?;
        let t = txn.open_table(table).map_err(|e| err(e.into()))?;
        let Some(guard) = t.get(key).map_err(|e| err(e.into()))? else {
            return Ok(None);
        };
        Self::decode(table, key, guard.value()).map(Some)
    }

    /// Documents in key order, optionally only those whose key starts with `prefix`.
    fn list_json<T: DeserializeOwned>(
        &self,
        table: JsonTable,
        prefix: Option<&str>,
    ) -> StateResult<Vec<T>> {
        let err = storage(table);
        let txn = self.db.begin_read().map_err(|e| err(e.into()))?;
        let t = txn.open_table(table).map_err(|e| err(e.into()))?;
        let range = match prefix {
            Some(p) => t.range(p..),
            None => t.range::<&str>(..),
        }
        .map_err(|e| err(e.into()))?;

        let mut docs = Vec::new();
        for entry in range {
            let (key, value) = entry.map_err(|e| err(e.into()))?;
            let key = key.value();
            if prefix.is_some_and(|p| !key.starts_with(p)) {
                break;
            }
            docs.push(Self::decode(table, key, value.value())?);
        }
        Ok(docs)
    }

    fn remove(&self, table: JsonTable, key: &str) -> StateResult<bool> {
        let err = storage(table);
        let txn = self.db.begin_write().map_err(|e| err(e.into()))?;
        let existed = {
            let mut t = txn.open_table(table).map_err(|e| err(e.into()))?;
            let old = t.remove(key).map_err(|e| err(e.into()))?;
            old.is_some()
        };
        txn.commit().map_err(|e| err(e.into()))?;
        Ok(existed)
    }

    // ── Routing rules ──────────────────────────────────────────────

    /// Insert or update a routing rule.
    pub fn put_rule(&self, rule: &RoutingRule) -> StateResult<()> {
        self.put_json(ROUTING_RULES, &rule.id, rule)?;
        debug!(rule_id = %rule.id, "routing rule stored");
        Ok(())
    }

    pub fn get_rule(&self, id: &str) -> StateResult<Option<RoutingRule>> {
        self.get_json(ROUTING_RULES, id)
    }

    /// List all rules, ordered by insertion sequence.
    pub fn list_rules(&self) -> StateResult<Vec<RoutingRule>> {
        let mut rules: Vec<RoutingRule> = self.list_json(ROUTING_RULES, None)?;
        rules.sort_by_key(|r| r.sequence);
        Ok(rules)
    }

    /// Next free insertion sequence number.
    pub fn next_rule_sequence(&self) -> StateResult<u64> {
        let rules: Vec<RoutingRule> = self.list_json(ROUTING_RULES, None)?;
        Ok(rules.iter().map(|r| r.sequence + 1).max().unwrap_or(0))
    }

    /// Delete a rule by id. Returns true if it existed.
    pub fn delete_rule(&self, id: &str) -> StateResult<bool> {
        let existed = self.remove(ROUTING_RULES, id)?;
        debug!(rule_id = %id, existed, "routing rule deleted");
        Ok(existed)
    }

    // ── Scaling policies ───────────────────────────────────────────

    pub fn put_policy(&self, policy: &ScalingPolicy) -> StateResult<()> {
        self.put_json(SCALING_POLICIES, &policy.repository, policy)?;
        debug!(repository = %policy.repository, "scaling policy stored");
        Ok(())
    }

    pub fn get_policy(&self, repository: &str) -> StateResult<Option<ScalingPolicy>> {
        self.get_json(SCALING_POLICIES, repository)
    }

    pub fn list_policies(&self) -> StateResult<Vec<ScalingPolicy>> {
        self.list_json(SCALING_POLICIES, None)
    }

    pub fn delete_policy(&self, repository: &str) -> StateResult<bool> {
        self.remove(SCALING_POLICIES, repository)
    }

    // ── Pools ──────────────────────────────────────────────────────

    pub fn put_pool(&self, pool: &Pool) -> StateResult<()> {
        self.put_json(POOLS, &pool.repository, pool)
    }

    pub fn get_pool(&self, repository: &str) -> StateResult<Option<Pool>> {
        self.get_json(POOLS, repository)
    }

    pub fn list_pools(&self) -> StateResult<Vec<Pool>> {
        self.list_json(POOLS, None)
    }

    // ── Runners ────────────────────────────────────────────────────

    /// Insert or update a runner.
    pub fn put_runner(&self, runner: &Runner) -> StateResult<()> {
        self.put_json(RUNNERS, &runner.table_key(), runner)
    }

    pub fn get_runner(&self, repository: &str, runner_id: &str) -> StateResult<Option<Runner>> {
        self.get_json(RUNNERS, &runner_key(repository, runner_id))
    }

    /// All runners of a pool (any status), in registration order.
    pub fn list_runners_for_pool(&self, repository: &str) -> StateResult<Vec<Runner>> {
        let prefix = format!("{repository}:");
        let mut runners: Vec<Runner> = self.list_json(RUNNERS, Some(&prefix))?;
        runners.sort_by(|a, b| a.registered_at.cmp(&b.registered_at).then(a.id.cmp(&b.id)));
        Ok(runners)
    }

    pub fn delete_runner(&self, repository: &str, runner_id: &str) -> StateResult<bool> {
        self.remove(RUNNERS, &runner_key(repository, runner_id))
    }

    // ── Jobs ───────────────────────────────────────────────────────

    pub fn put_job(&self, job: &JobRecord) -> StateResult<()> {
        self.put_json(JOBS, &job.table_key(), job)
    }

    pub fn get_job(&self, repository: &str, id: &str) -> StateResult<Option<JobRecord>> {
        self.get_json(JOBS, &job_key(repository, id))
    }

    /// Job records of one repository, read by key prefix.
    pub fn list_jobs_for_repository(&self, repository: &str) -> StateResult<Vec<JobRecord>> {
        let prefix = format!("{repository}:");
        self.list_json(JOBS, Some(&prefix))
    }

    pub fn delete_job(&self, repository: &str, id: &str) -> StateResult<bool> {
        self.remove(JOBS, &job_key(repository, id))
    }

    // ── Reporter queue ─────────────────────────────────────────────

    /// Persist a queued job status (upsert by job id).
    pub fn put_job_status(&self, status: &JobStatus) -> StateResult<()> {
        self.put_json(JOB_STATUSES, &status.job_id, status)
    }

    pub fn get_job_status(&self, job_id: &str) -> StateResult<Option<JobStatus>> {
        self.get_json(JOB_STATUSES, job_id)
    }

    /// Every status not yet acknowledged upstream.
    pub fn list_job_statuses(&self) -> StateResult<Vec<JobStatus>> {
        self.list_json(JOB_STATUSES, None)
    }

    pub fn delete_job_status(&self, job_id: &str) -> StateResult<bool> {
        self.remove(JOB_STATUSES, job_id)
    }

    /// Record the upstream check run created for a job.
    pub fn put_check_run(&self, record: &CheckRunRecord) -> StateResult<()> {
        self.put_json(CHECK_RUNS, &record.job_id, record)?;
        debug!(
            job_id = %record.job_id,
            check_run_id = record.check_run_id,
            completed = record.completed,
            "check run stored"
        );
        Ok(())
    }

    pub fn get_check_run(&self, job_id: &str) -> StateResult<Option<CheckRunRecord>> {
        self.get_json(CHECK_RUNS, job_id)
    }

    pub fn delete_check_run(&self, job_id: &str) -> StateResult<bool> {
        self.remove(CHECK_RUNS, job_id)
    }

    /// Drop completed check runs last touched before `before` (epoch
    /// seconds). Returns how many were removed.
    pub fn prune_check_runs(&self, before: u64) -> StateResult<usize> {
        let records: Vec<CheckRunRecord> = self.list_json(CHECK_RUNS, None)?;
        let mut pruned = 0;
        for record in records.iter().filter(|r| r.completed && r.updated_at < before) {
            if self.remove(CHECK_RUNS, &record.job_id)? {
                pruned += 1;
            }
        }
        if pruned > 0 {
            debug!(pruned, "completed check runs pruned");
        }
        Ok(pruned)
    }

    pub fn put_failed_report(&self, report: &FailedReport) -> StateResult<()> {
        self.put_json(FAILED_REPORTS, &report.status.job_id, report)
    }

    pub fn get_failed_report(&self, job_id: &str) -> StateResult<Option<FailedReport>> {
        self.get_json(FAILED_REPORTS, job_id)
    }

    pub fn list_failed_reports(&self) -> StateResult<Vec<FailedReport>> {
        self.list_json(FAILED_REPORTS, None)
    }

    pub fn delete_failed_report(&self, job_id: &str) -> StateResult<bool> {
        self.remove(FAILED_REPORTS, job_id)
    }

    // ── Metrics ────────────────────────────────────────────────────

    /// Append an exported metric snapshot.
    pub fn put_metric_snapshot(&self, snapshot: &MetricSnapshot) -> StateResult<()> {
        self.put_json(METRICS, &snapshot.table_key(), snapshot)
    }

    /// Exported snapshots for a repository, oldest first, at most `limit`.
    pub fn list_metric_snapshots(
        &self,
        repository: &str,
        limit: usize,
    ) -> StateResult<Vec<MetricSnapshot>> {
        let prefix = format!("{repository}:");
        let mut snapshots: Vec<MetricSnapshot> = self.list_json(METRICS, Some(&prefix))?;
        snapshots.truncate(limit);
        Ok(snapshots)
    }
}
