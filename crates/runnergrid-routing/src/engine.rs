//! Routing engine — evaluates rules against jobs and resolves target runners.

use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use runnergrid_state::{JobRequest, RoutingRule, Runner, RunnerPool, StateStore};

use crate::error::{RoutingError, RoutingResult};
use crate::rules::{self, RuleDefinition, RuleUpdate};

/// How a decision's runner list was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionKind {
    /// A rule matched and at least one runner carries its target labels.
    MatchedRule,
    /// No rule matched; runners sharing a label with the job were selected.
    DefaultRouting,
    /// The label filter came up empty, so every pool runner was returned.
    FallbackToAll,
    /// The resolved pool has no active runners.
    NoRunners,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MatchedRule {
    pub id: String,
    pub name: String,
    pub priority: i32,
}

/// Outcome of routing one job. Not persisted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RoutingDecision {
    pub job_id: String,
    /// Repository whose pool the runners belong to.
    pub pool: String,
    /// `None` means default routing.
    pub matched_rule: Option<MatchedRule>,
    /// Candidates in pool registration order.
    pub runners: Vec<Runner>,
    pub kind: DecisionKind,
    pub reason: String,
}

impl RoutingDecision {
    pub fn has_capacity(&self) -> bool {
        !self.runners.is_empty()
    }
}

/// Result of dry-running one rule against a sample job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RuleTestResult {
    pub matched: bool,
    /// Runners that satisfy the rule's target labels (before any fallback).
    pub target_count: usize,
    pub reason: String,
}

/// Maps jobs to runners using persisted routing rules.
pub struct RoutingEngine {
    state: StateStore,
    pools: Arc<dyn RunnerPool>,
    /// Serializes rule writes so sequence numbers stay unique.
    write_lock: Mutex<()>,
}

impl RoutingEngine {
    pub fn new(state: StateStore, pools: Arc<dyn RunnerPool>) -> Self {
        Self {
            state,
            pools,
            write_lock: Mutex::new(()),
        }
    }

    // ── Rule CRUD ──────────────────────────────────────────────────

    /// Validate and persist a new rule. It is evaluated after existing
    /// rules of the same priority.
    pub fn create_routing_rule(&self, definition: RuleDefinition) -> RoutingResult<RoutingRule> {
        rules::validate(&definition.name, &definition.conditions, &definition.targets)?;

        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        let now = epoch_secs();
        let rule = RoutingRule {
            id: uuid::Uuid::new_v4().to_string(),
            name: definition.name,
            priority: definition.priority,
            sequence: self.state.next_rule_sequence()?,
            conditions: definition.conditions,
            targets: definition.targets,
            enabled: definition.enabled,
            created_at: now,
            updated_at: now,
        };
        self.state.put_rule(&rule)?;
        info!(rule_id = %rule.id, name = %rule.name, priority = rule.priority, "routing rule created");
        Ok(rule)
    }

    /// Apply a partial update. The rule keeps its insertion position.
    pub fn update_routing_rule(&self, id: &str, update: RuleUpdate) -> RoutingResult<RoutingRule> {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut rule = self
            .state
            .get_rule(id)?
            .ok_or_else(|| RoutingError::RuleNotFound(id.to_string()))?;

        if let Some(name) = update.name {
            rule.name = name;
        }
        if let Some(priority) = update.priority {
            rule.priority = priority;
        }
        if let Some(conditions) = update.conditions {
            rule.conditions = conditions;
        }
        if let Some(targets) = update.targets {
            rule.targets = targets;
        }
        if let Some(enabled) = update.enabled {
            rule.enabled = enabled;
        }
        rules::validate(&rule.name, &rule.conditions, &rule.targets)?;

        rule.updated_at = epoch_secs();
        self.state.put_rule(&rule)?;
        info!(rule_id = %rule.id, "routing rule updated");
        Ok(rule)
    }

    pub fn delete_routing_rule(&self, id: &str) -> RoutingResult<()> {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        if !self.state.delete_rule(id)? {
            return Err(RoutingError::RuleNotFound(id.to_string()));
        }
        info!(rule_id = %id, "routing rule deleted");
        Ok(())
    }

    pub fn get_routing_rule(&self, id: &str) -> RoutingResult<Option<RoutingRule>> {
        Ok(self.state.get_rule(id)?)
    }

    /// All rules in evaluation order: priority descending, then insertion order.
    pub fn list_routing_rules(&self) -> RoutingResult<Vec<RoutingRule>> {
        let mut all = self.state.list_rules()?;
        // `list_rules` is sequence-ordered and `sort_by` is stable.
        all.sort_by(|a, b| b.priority.cmp(&a.priority));
        Ok(all)
    }

    // ── Routing ────────────────────────────────────────────────────

    /// Route a job to candidate runners. Never fails; see [`DecisionKind`].
    pub async fn route_job(&self, job: &JobRequest) -> RoutingDecision {
        let ordered = match self.list_routing_rules() {
            Ok(all) => all,
            Err(e) => {
                warn!(job_id = %job.id, error = %e, "failed to load routing rules, using default routing");
                Vec::new()
            }
        };

        for rule in ordered.iter().filter(|r| r.enabled) {
            match rules::check_conditions(&rule.conditions, job) {
                Ok(()) => return self.route_with_rule(rule, job).await,
                Err(mismatch) => {
                    debug!(job_id = %job.id, rule = %rule.name, %mismatch, "rule skipped");
                }
            }
        }

        self.default_route(job).await
    }

    async fn route_with_rule(&self, rule: &RoutingRule, job: &JobRequest) -> RoutingDecision {
        let pool = rule
            .targets
            .pool_override
            .clone()
            .unwrap_or_else(|| job.repository.clone());
        let runners = self.load_runners(&pool).await;
        let matched = Some(MatchedRule {
            id: rule.id.clone(),
            name: rule.name.clone(),
            priority: rule.priority,
        });

        let (runners, kind, reason) = if runners.is_empty() {
            (
                runners,
                DecisionKind::NoRunners,
                format!("rule '{}' matched but pool '{pool}' has no active runners", rule.name),
            )
        } else {
            let targets: Vec<Runner> = rules::runners_with_labels(&runners, &rule.targets.runner_labels)
                .into_iter()
                .cloned()
                .collect();
            if targets.is_empty() {
                // Possibly a misconfigured rule; keep the job schedulable.
                warn!(
                    job_id = %job.id,
                    rule = %rule.name,
                    %pool,
                    "no runner carries the rule's target labels, falling back to whole pool"
                );
                let reason = format!(
                    "rule '{}' matched but no runner carries [{}]; falling back to all {} runner(s) in '{pool}'",
                    rule.name,
                    join(&rule.targets.runner_labels),
                    runners.len()
                );
                (runners, DecisionKind::FallbackToAll, reason)
            } else {
                let reason = format!(
                    "matched rule '{}' (priority {}): {} runner(s) in '{pool}'",
                    rule.name,
                    rule.priority,
                    targets.len()
                );
                (targets, DecisionKind::MatchedRule, reason)
            }
        };

        debug!(job_id = %job.id, %pool, ?kind, candidates = runners.len(), "job routed by rule");
        RoutingDecision {
            job_id: job.id.clone(),
            pool,
            matched_rule: matched,
            runners,
            kind,
            reason,
        }
    }

    async fn default_route(&self, job: &JobRequest) -> RoutingDecision {
        let pool = job.repository.clone();
        let runners = self.load_runners(&pool).await;

        let (runners, kind, reason) = if runners.is_empty() {
            (
                runners,
                DecisionKind::NoRunners,
                format!("default routing: pool '{pool}' has no active runners"),
            )
        } else {
            let shared: Vec<Runner> = rules::runners_sharing_labels(&runners, &job.labels)
                .into_iter()
                .cloned()
                .collect();
            if shared.is_empty() {
                let reason = format!(
                    "default routing: no runner shares the job's labels; falling back to all {} runner(s) in '{pool}'",
                    runners.len()
                );
                warn!(job_id = %job.id, %pool, "no runner shares the job's labels, falling back to whole pool");
                (runners, DecisionKind::FallbackToAll, reason)
            } else {
                let reason = format!(
                    "default routing: {} runner(s) in '{pool}' share the job's labels",
                    shared.len()
                );
                (shared, DecisionKind::DefaultRouting, reason)
            }
        };

        debug!(job_id = %job.id, %pool, ?kind, candidates = runners.len(), "job routed by default");
        RoutingDecision {
            job_id: job.id.clone(),
            pool,
            matched_rule: None,
            runners,
            kind,
            reason,
        }
    }

    /// Active runners of a pool, creating the pool on first reference.
    /// Lookup failures are logged and read as an empty pool.
    async fn load_runners(&self, repository: &str) -> Vec<Runner> {
        if let Err(e) = self.pools.get_or_create_pool(repository).await {
            warn!(%repository, error = %e, "failed to get or create pool");
            return Vec::new();
        }
        match self.pools.active_runners(repository).await {
            Ok(runners) => runners,
            Err(e) => {
                warn!(%repository, error = %e, "failed to list active runners");
                Vec::new()
            }
        }
    }

    // ── Dry run ────────────────────────────────────────────────────

    /// Evaluate one rule in isolation against a sample job.
    pub async fn test_routing_rule(
        &self,
        definition: &RuleDefinition,
        sample_job: &JobRequest,
    ) -> RuleTestResult {
        if let Err(e) = rules::validate(&definition.name, &definition.conditions, &definition.targets) {
            return RuleTestResult {
                matched: false,
                target_count: 0,
                reason: e.to_string(),
            };
        }

        if let Err(mismatch) = rules::check_conditions(&definition.conditions, sample_job) {
            return RuleTestResult {
                matched: false,
                target_count: 0,
                reason: format!("rule does not match: {mismatch}"),
            };
        }

        let pool = definition
            .targets
            .pool_override
            .as_deref()
            .unwrap_or(&sample_job.repository);
        // Read-only: a dry run never creates or warms a pool.
        let runners = match self.pools.active_runners(pool).await {
            Ok(runners) => runners,
            Err(e) => {
                warn!(repository = %pool, error = %e, "failed to list active runners for dry run");
                Vec::new()
            }
        };
        let target_count = rules::runners_with_labels(&runners, &definition.targets.runner_labels).len();

        let mut reason = if runners.is_empty() {
            format!("rule matches but pool '{pool}' has no active runners")
        } else if target_count == 0 {
            format!(
                "rule matches but no runner carries [{}]; routing would fall back to all {} runner(s)",
                join(&definition.targets.runner_labels),
                runners.len()
            )
        } else {
            format!("rule matches {target_count} of {} runner(s) in '{pool}'", runners.len())
        };
        if !definition.enabled {
            reason.push_str(" (rule is disabled and would be skipped)");
        }

        RuleTestResult {
            matched: true,
            target_count,
            reason,
        }
    }
}

fn join(labels: &std::collections::BTreeSet<String>) -> String {
    labels.iter().map(String::as_str).collect::<Vec<_>>().join(", ")
}

fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{BTreeSet, HashMap};

    use async_trait::async_trait;
    use runnergrid_state::{
        Pool, PoolMetrics, RuleConditions, RuleTargets, RunnerStatus,
    };

    /// Fixed runner lists per repository.
    struct StaticPools {
        runners: HashMap<String, Vec<Runner>>,
        created: std::sync::Mutex<Vec<String>>,
    }

    #[async_trait]
    impl RunnerPool for StaticPools {
        async fn get_or_create_pool(&self, repository: &str) -> anyhow::Result<Pool> {
            self.created.lock().unwrap().push(repository.to_string());
            Ok(Pool {
                repository: repository.to_string(),
                min_runners: 0,
                max_runners: 10,
                current_runners: self.runners.get(repository).map_or(0, |r| r.len() as u32),
                scale_increment: 1,
                scale_threshold: 0.8,
                runner_labels: BTreeSet::new(),
                created_at: 0,
                updated_at: 0,
            })
        }

        async fn active_runners(&self, repository: &str) -> anyhow::Result<Vec<Runner>> {
            if repository == "broken/pool" {
                anyhow::bail!("pool store unavailable");
            }
            Ok(self.runners.get(repository).cloned().unwrap_or_default())
        }

        async fn pool_metrics(&self, _repository: &str) -> anyhow::Result<PoolMetrics> {
            Ok(PoolMetrics::default())
        }

        async fn scale_up(&self, _repository: &str, _count: u32) -> anyhow::Result<u32> {
            Ok(0)
        }

        async fn scale_down(&self, _repository: &str, _count: u32, _floor: u32) -> anyhow::Result<u32> {
            Ok(0)
        }

        async fn set_runner_status(&self, _: &str, _: &str, _: RunnerStatus) -> anyhow::Result<()> {
            Ok(())
        }

        async fn remove_runner(&self, _: &str, _: &str) -> anyhow::Result<bool> {
            Ok(false)
        }

        async fn runner_alive(&self, _: &str, _: &str) -> anyhow::Result<bool> {
            Ok(true)
        }
    }

    fn labels(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    fn runner(repository: &str, id: &str, runner_labels: &[&str]) -> Runner {
        Runner {
            id: id.to_string(),
            repository: repository.to_string(),
            labels: labels(runner_labels),
            status: RunnerStatus::Idle,
            registered_at: 1,
            updated_at: 1,
        }
    }

    fn job(repository: &str, job_labels: &[&str]) -> JobRequest {
        JobRequest {
            id: "job-1".to_string(),
            repository: repository.to_string(),
            workflow: "ci".to_string(),
            git_ref: "main".to_string(),
            labels: labels(job_labels),
            priority: 0,
        }
    }

    fn engine(pools: Vec<(&str, Vec<Runner>)>) -> RoutingEngine {
        engine_with_pools(pools).0
    }

    fn engine_with_pools(pools: Vec<(&str, Vec<Runner>)>) -> (RoutingEngine, Arc<StaticPools>) {
        let runners = pools
            .into_iter()
            .map(|(repo, rs)| (repo.to_string(), rs))
            .collect();
        let pools = Arc::new(StaticPools {
            runners,
            created: std::sync::Mutex::new(Vec::new()),
        });
        let engine = RoutingEngine::new(StateStore::open_in_memory().unwrap(), pools.clone());
        (engine, pools)
    }

    fn definition(name: &str, priority: i32, cond_labels: &[&str], runner_labels: &[&str]) -> RuleDefinition {
        RuleDefinition {
            name: name.to_string(),
            priority,
            conditions: RuleConditions {
                repository: None,
                branch: None,
                labels: labels(cond_labels),
            },
            targets: RuleTargets {
                runner_labels: labels(runner_labels),
                pool_override: None,
            },
            enabled: true,
        }
    }

    fn gpu_pool() -> Vec<Runner> {
        vec![
            runner("acme/api", "gpu-1", &["gpu-enabled", "linux"]),
            runner("acme/api", "cpu-1", &["linux"]),
        ]
    }

    #[tokio::test]
    async fn gpu_rule_selects_gpu_runner() {
        let engine = engine(vec![("acme/api", gpu_pool())]);
        let rule = engine
            .create_routing_rule(definition("gpu jobs", 10, &["gpu"], &["gpu-enabled"]))
            .unwrap();

        let decision = engine.route_job(&job("acme/api", &["gpu", "linux"])).await;

        assert_eq!(decision.kind, DecisionKind::MatchedRule);
        assert_eq!(decision.matched_rule.unwrap().id, rule.id);
        assert_eq!(decision.runners.len(), 1);
        assert_eq!(decision.runners[0].id, "gpu-1");
    }

    #[tokio::test]
    async fn highest_priority_rule_wins() {
        let engine = engine(vec![("acme/api", gpu_pool())]);
        engine
            .create_routing_rule(definition("low", 1, &["linux"], &["linux"]))
            .unwrap();
        engine
            .create_routing_rule(definition("high", 50, &["linux"], &["gpu-enabled"]))
            .unwrap();

        let decision = engine.route_job(&job("acme/api", &["linux"])).await;
        assert_eq!(decision.matched_rule.unwrap().name, "high");
        assert_eq!(decision.runners[0].id, "gpu-1");
    }

    #[tokio::test]
    async fn equal_priority_keeps_insertion_order() {
        let engine = engine(vec![("acme/api", gpu_pool())]);
        engine
            .create_routing_rule(definition("first", 5, &["linux"], &["linux"]))
            .unwrap();
        engine
            .create_routing_rule(definition("second", 5, &["linux"], &["gpu-enabled"]))
            .unwrap();

        let decision = engine.route_job(&job("acme/api", &["linux"])).await;
        assert_eq!(decision.matched_rule.unwrap().name, "first");

        let order: Vec<String> = engine
            .list_routing_rules()
            .unwrap()
            .into_iter()
            .map(|r| r.name)
            .collect();
        assert_eq!(order, vec!["first", "second"]);
    }

    #[tokio::test]
    async fn disabled_rules_are_skipped() {
        let engine = engine(vec![("acme/api", gpu_pool())]);
        let rule = engine
            .create_routing_rule(definition("gpu", 10, &["gpu"], &["gpu-enabled"]))
            .unwrap();
        engine
            .update_routing_rule(
                &rule.id,
                RuleUpdate {
                    enabled: Some(false),
                    ..RuleUpdate::default()
                },
            )
            .unwrap();

        let decision = engine.route_job(&job("acme/api", &["gpu"])).await;
        assert!(decision.matched_rule.is_none());
    }

    #[tokio::test]
    async fn rule_with_no_matching_runner_falls_back_to_pool() {
        let engine = engine(vec![("acme/api", gpu_pool())]);
        engine
            .create_routing_rule(definition("arm", 10, &[], &["arm64"]))
            .unwrap();

        let decision = engine.route_job(&job("acme/api", &["linux"])).await;
        assert_eq!(decision.kind, DecisionKind::FallbackToAll);
        assert!(decision.matched_rule.is_some());
        assert_eq!(decision.runners.len(), 2);
        assert!(decision.reason.contains("falling back"));
    }

    #[tokio::test]
    async fn default_routing_filters_by_shared_labels() {
        let engine = engine(vec![("acme/api", gpu_pool())]);
        let decision = engine.route_job(&job("acme/api", &["gpu-enabled"])).await;

        assert_eq!(decision.kind, DecisionKind::DefaultRouting);
        assert!(decision.matched_rule.is_none());
        assert_eq!(decision.runners.len(), 1);
        assert!(decision.reason.starts_with("default routing"));
    }

    #[tokio::test]
    async fn disjoint_labels_fall_back_to_whole_pool() {
        let engine = engine(vec![("acme/api", gpu_pool())]);
        let decision = engine.route_job(&job("acme/api", &["windows"])).await;

        assert_eq!(decision.kind, DecisionKind::FallbackToAll);
        assert_eq!(decision.runners.len(), 2);
    }

    #[tokio::test]
    async fn empty_pool_yields_empty_decision() {
        let engine = engine(vec![]);
        let decision = engine.route_job(&job("acme/empty", &["linux"])).await;

        assert_eq!(decision.kind, DecisionKind::NoRunners);
        assert!(!decision.has_capacity());
        assert!(decision.reason.contains("no active runners"));
    }

    #[tokio::test]
    async fn pool_errors_do_not_escape() {
        let engine = engine(vec![]);
        let decision = engine.route_job(&job("broken/pool", &["linux"])).await;
        assert_eq!(decision.kind, DecisionKind::NoRunners);
    }

    #[tokio::test]
    async fn pool_override_routes_to_other_pool() {
        let engine = engine(vec![
            ("acme/api", gpu_pool()),
            ("acme/gpu-farm", vec![runner("acme/gpu-farm", "farm-1", &["gpu-enabled"])]),
        ]);
        let mut def = definition("farm", 10, &["gpu"], &["gpu-enabled"]);
        def.targets.pool_override = Some("acme/gpu-farm".to_string());
        engine.create_routing_rule(def).unwrap();

        let decision = engine.route_job(&job("acme/api", &["gpu"])).await;
        assert_eq!(decision.pool, "acme/gpu-farm");
        assert_eq!(decision.runners[0].id, "farm-1");
    }

    #[tokio::test]
    async fn repository_and_branch_conditions() {
        let engine = engine(vec![("acme/api", gpu_pool())]);
        let mut def = definition("release", 10, &[], &["gpu-enabled"]);
        def.conditions.repository = Some("acme/*".to_string());
        def.conditions.branch = Some("release".to_string());
        engine.create_routing_rule(def).unwrap();

        // Branch differs: default routing.
        let decision = engine.route_job(&job("acme/api", &["linux"])).await;
        assert!(decision.matched_rule.is_none());

        let mut release_job = job("acme/api", &["linux"]);
        release_job.git_ref = "release".to_string();
        let decision = engine.route_job(&release_job).await;
        assert_eq!(decision.matched_rule.unwrap().name, "release");
    }

    #[test]
    fn create_rejects_invalid_pattern() {
        let engine = engine(vec![]);
        let mut def = definition("bad", 1, &[], &[]);
        def.conditions.repository = Some("acme/*/api".to_string());

        let result = engine.create_routing_rule(def);
        assert!(matches!(result, Err(RoutingError::InvalidRule(_))));
        assert!(engine.list_routing_rules().unwrap().is_empty());
    }

    #[test]
    fn update_and_delete_missing_rule() {
        let engine = engine(vec![]);
        assert!(matches!(
            engine.update_routing_rule("nope", RuleUpdate::default()),
            Err(RoutingError::RuleNotFound(_))
        ));
        assert!(matches!(
            engine.delete_routing_rule("nope"),
            Err(RoutingError::RuleNotFound(_))
        ));
    }

    #[test]
    fn update_keeps_sequence_and_validates() {
        let engine = engine(vec![]);
        let rule = engine
            .create_routing_rule(definition("r", 1, &[], &[]))
            .unwrap();

        let updated = engine
            .update_routing_rule(
                &rule.id,
                RuleUpdate {
                    priority: Some(99),
                    ..RuleUpdate::default()
                },
            )
            .unwrap();
        assert_eq!(updated.priority, 99);
        assert_eq!(updated.sequence, rule.sequence);

        let bad = engine.update_routing_rule(
            &rule.id,
            RuleUpdate {
                name: Some(String::new()),
                ..RuleUpdate::default()
            },
        );
        assert!(matches!(bad, Err(RoutingError::InvalidRule(_))));

        engine.delete_routing_rule(&rule.id).unwrap();
        assert!(engine.get_routing_rule(&rule.id).unwrap().is_none());
    }

    #[tokio::test]
    async fn dry_run_reports_match_and_targets() {
        let engine = engine(vec![("acme/api", gpu_pool())]);
        let def = definition("gpu", 10, &["gpu"], &["gpu-enabled"]);

        let hit = engine.test_routing_rule(&def, &job("acme/api", &["gpu"])).await;
        assert!(hit.matched);
        assert_eq!(hit.target_count, 1);

        let miss = engine.test_routing_rule(&def, &job("acme/api", &["linux"])).await;
        assert!(!miss.matched);
        assert!(miss.reason.contains("gpu"));

        let no_targets = definition("arm", 10, &[], &["arm64"]);
        let fallback = engine.test_routing_rule(&no_targets, &job("acme/api", &[])).await;
        assert!(fallback.matched);
        assert_eq!(fallback.target_count, 0);
        assert!(fallback.reason.contains("fall back"));

        // Nothing is persisted by a dry run.
        assert!(engine.list_routing_rules().unwrap().is_empty());
    }

    #[tokio::test]
    async fn dry_run_never_creates_a_pool() {
        let (engine, pools) = engine_with_pools(vec![("acme/api", gpu_pool())]);
        let mut def = definition("elsewhere", 10, &[], &["gpu-enabled"]);
        def.targets.pool_override = Some("acme/fresh".to_string());

        let result = engine.test_routing_rule(&def, &job("acme/api", &[])).await;
        assert!(result.matched);
        assert_eq!(result.target_count, 0);
        assert!(result.reason.contains("no active runners"));

        engine.test_routing_rule(&definition("gpu", 1, &[], &["gpu-enabled"]), &job("acme/api", &[])).await;
        assert!(pools.created.lock().unwrap().is_empty());

        // Real routing still creates on first reference.
        engine.route_job(&job("acme/api", &[])).await;
        assert_eq!(*pools.created.lock().unwrap(), vec!["acme/api".to_string()]);
    }

    #[tokio::test]
    async fn dry_run_reports_invalid_definition() {
        let engine = engine(vec![]);
        let mut def = definition("bad", 1, &[], &[]);
        def.conditions.repository = Some("a*b".to_string());
        let result = engine.test_routing_rule(&def, &job("acme/api", &[])).await;
        assert!(!result.matched);
        assert!(result.reason.starts_with("invalid routing rule"));
    }
}
