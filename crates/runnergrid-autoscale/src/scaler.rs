//! AutoScaler — policy-driven pool scaling.
//!
//! Per evaluation: resolve the repository's policy (own, then `*`, then
//! the configured default), read pool metrics and queue statistics,
//! decide scale-up / scale-down / maintain, and execute at most one
//! scale action if the repository is outside its cooldown window.
//! The cooldown restarts only when an action actually changed the pool.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::Serialize;
use tokio::sync::{Mutex, RwLock, broadcast, watch};
use tracing::{debug, error, info, warn};

use runnergrid_core::AutoscaleConfig;
use runnergrid_state::{
    DEFAULT_POLICY_KEY, MetricSnapshot, PoolMetrics, RunnerPool, ScalingAction, ScalingPolicy,
    StateStore,
};

use crate::error::{AutoscaleError, AutoscaleResult};
use crate::history::MetricsHistory;
use crate::policy::PolicySpec;
use crate::predict::{self, Prediction};
use crate::queue::{QueueStats, QueueStatsSource};

const EVENT_CAPACITY: usize = 128;

/// Tunables that are not part of any one policy.
#[derive(Debug, Clone)]
pub struct ScalerSettings {
    /// Queue depth strictly above this forces scale-up.
    pub high_queue_depth: u32,
    pub history_retention: Duration,
    pub history_capacity: usize,
    pub min_prediction_samples: usize,
    pub full_confidence_samples: usize,
    /// Used when neither the repository nor `*` has a stored policy.
    pub default_policy: PolicySpec,
}

impl Default for ScalerSettings {
    fn default() -> Self {
        Self::from(&AutoscaleConfig::default())
    }
}

impl From<&AutoscaleConfig> for ScalerSettings {
    fn from(config: &AutoscaleConfig) -> Self {
        Self {
            high_queue_depth: config.high_queue_depth,
            history_retention: config.history_retention(),
            history_capacity: config.history_capacity,
            min_prediction_samples: config.min_prediction_samples,
            full_confidence_samples: config.full_confidence_samples,
            default_policy: PolicySpec::from(&config.default_policy),
        }
    }
}

/// The outcome of one evaluation.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ScalingDecision {
    pub repository: String,
    pub action: ScalingAction,
    /// Runners requested (scale-up) or removed (scale-down).
    pub amount: u32,
    pub current_runners: u32,
    /// Expected runner count once the action lands.
    pub target_runners: u32,
    pub utilization: f64,
    pub queue_depth: u32,
    /// True when the pool was actually changed.
    pub executed: bool,
    pub reason: String,
    pub timestamp_ms: u64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ScalingEvent {
    Scaled(ScalingDecision),
    Failed {
        repository: String,
        action: ScalingAction,
        error: String,
    },
}

/// What the rules ask for before cooldown is considered.
struct Plan {
    action: ScalingAction,
    amount: u32,
    reason: String,
}

pub struct AutoScaler {
    state: StateStore,
    pools: Arc<dyn RunnerPool>,
    queue: Arc<dyn QueueStatsSource>,
    settings: ScalerSettings,
    /// repository → epoch seconds of the last executed action.
    cooldowns: Mutex<HashMap<String, u64>>,
    history: RwLock<MetricsHistory>,
    tracked: RwLock<BTreeSet<String>>,
    /// Serializes evaluations of the same repository.
    eval_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    events: broadcast::Sender<ScalingEvent>,
}

impl AutoScaler {
    pub fn new(
        state: StateStore,
        pools: Arc<dyn RunnerPool>,
        queue: Arc<dyn QueueStatsSource>,
        settings: ScalerSettings,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let history = MetricsHistory::new(settings.history_retention, settings.history_capacity);
        Self {
            state,
            pools,
            queue,
            settings,
            cooldowns: Mutex::new(HashMap::new()),
            history: RwLock::new(history),
            tracked: RwLock::new(BTreeSet::new()),
            eval_locks: Mutex::new(HashMap::new()),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ScalingEvent> {
        self.events.subscribe()
    }

    // ── Tracking ───────────────────────────────────────────────────

    /// Include a repository in the periodic loop. Returns false if already tracked.
    pub async fn track(&self, repository: &str) -> bool {
        let added = self.tracked.write().await.insert(repository.to_string());
        if added {
            debug!(%repository, "repository tracked for autoscaling");
        }
        added
    }

    pub async fn untrack(&self, repository: &str) -> bool {
        let removed = self.tracked.write().await.remove(repository);
        if removed {
            self.cooldowns.lock().await.remove(repository);
            self.history.write().await.forget(repository);
            debug!(%repository, "repository untracked");
        }
        removed
    }

    pub async fn tracked(&self) -> Vec<String> {
        self.tracked.read().await.iter().cloned().collect()
    }

    // ── Policies ───────────────────────────────────────────────────

    /// Create or replace a repository's policy (`*` sets the default).
    /// Takes effect on the next evaluation.
    pub fn set_policy(&self, repository: &str, spec: PolicySpec) -> AutoscaleResult<ScalingPolicy> {
        if repository.trim().is_empty() {
            return Err(AutoscaleError::InvalidPolicy("repository must not be empty".to_string()));
        }
        spec.validate()?;
        let policy = spec.into_policy(repository, epoch_secs());
        self.state.put_policy(&policy)?;
        info!(
            %repository,
            min = policy.min_runners,
            max = policy.max_runners,
            up = policy.scale_up_threshold,
            down = policy.scale_down_threshold,
            "scaling policy stored"
        );
        Ok(policy)
    }

    pub fn get_policy(&self, repository: &str) -> AutoscaleResult<Option<ScalingPolicy>> {
        Ok(self.state.get_policy(repository)?)
    }

    pub fn list_policies(&self) -> AutoscaleResult<Vec<ScalingPolicy>> {
        Ok(self.state.list_policies()?)
    }

    pub fn delete_policy(&self, repository: &str) -> AutoscaleResult<()> {
        if !self.state.delete_policy(repository)? {
            return Err(AutoscaleError::PolicyNotFound(repository.to_string()));
        }
        info!(%repository, "scaling policy deleted");
        Ok(())
    }

    /// The policy an evaluation of `repository` would use.
    pub fn effective_policy(&self, repository: &str) -> AutoscaleResult<ScalingPolicy> {
        if let Some(policy) = self.state.get_policy(repository)? {
            return Ok(policy);
        }
        if let Some(mut policy) = self.state.get_policy(DEFAULT_POLICY_KEY)? {
            policy.repository = repository.to_string();
            return Ok(policy);
        }
        Ok(self.settings.default_policy.clone().into_policy(repository, 0))
    }

    // ── Evaluation ─────────────────────────────────────────────────

    /// Evaluate one repository now. Always returns a decision; failures
    /// to read metrics come back as `maintain` with the error in `reason`.
    pub async fn evaluate_now(&self, repository: &str) -> ScalingDecision {
        match self.evaluate(repository).await {
            Ok(decision) => decision,
            Err(reason) => ScalingDecision {
                repository: repository.to_string(),
                action: ScalingAction::Maintain,
                amount: 0,
                current_runners: 0,
                target_runners: 0,
                utilization: 0.0,
                queue_depth: 0,
                executed: false,
                reason,
                timestamp_ms: epoch_millis(),
            },
        }
    }

    /// Evaluate every tracked repository once.
    pub async fn evaluate_all(&self) -> Vec<ScalingDecision> {
        let mut decisions = Vec::new();
        for repository in self.tracked().await {
            match self.evaluate(&repository).await {
                Ok(decision) => decisions.push(decision),
                Err(reason) => warn!(%repository, %reason, "evaluation skipped"),
            }
        }
        self.history.write().await.prune_all(epoch_millis());
        decisions
    }

    /// `Err` carries the reason the cycle was skipped; nothing is recorded then.
    async fn evaluate(&self, repository: &str) -> Result<ScalingDecision, String> {
        let lock = self
            .eval_locks
            .lock()
            .await
            .entry(repository.to_string())
            .or_default()
            .clone();
        let _guard = lock.lock().await;

        let policy = self
            .effective_policy(repository)
            .map_err(|e| format!("policy unavailable: {e}"))?;
        let metrics = self
            .pools
            .pool_metrics(repository)
            .await
            .map_err(|e| format!("pool metrics unavailable: {e}"))?;
        let queue = self
            .queue
            .queue_stats(repository)
            .await
            .map_err(|e| format!("queue statistics unavailable: {e}"))?;

        let plan = self.plan(&policy, &metrics, &queue);
        let current = metrics.total_runners;
        let now = epoch_secs();

        let mut decision = ScalingDecision {
            repository: repository.to_string(),
            action: plan.action,
            amount: plan.amount,
            current_runners: current,
            target_runners: current,
            utilization: metrics.utilization,
            queue_depth: queue.queue_depth,
            executed: false,
            reason: plan.reason,
            timestamp_ms: epoch_millis(),
        };

        if plan.action != ScalingAction::Maintain {
            let last_action = self.cooldowns.lock().await.get(repository).copied();
            if let Some(last) = last_action
                && now.saturating_sub(last) < policy.cooldown_period_secs
            {
                let remaining = policy.cooldown_period_secs - now.saturating_sub(last);
                decision.reason = format!(
                    "cooldown active ({remaining}s remaining); would {}: {}",
                    plan.action, decision.reason
                );
                decision.action = ScalingAction::Maintain;
                decision.amount = 0;
            } else {
                self.execute(&mut decision, policy.min_runners, now).await;
            }
        }

        self.record(&decision, &queue).await;
        debug!(
            %repository,
            action = %decision.action,
            amount = decision.amount,
            utilization = decision.utilization,
            queue_depth = decision.queue_depth,
            reason = %decision.reason,
            "scaling evaluated"
        );
        Ok(decision)
    }

    fn plan(&self, policy: &ScalingPolicy, metrics: &PoolMetrics, queue: &QueueStats) -> Plan {
        let count = metrics.total_runners;
        let utilization = metrics.utilization;
        let high_queue = queue.queue_depth > self.settings.high_queue_depth;

        if count < policy.min_runners {
            let amount = policy.min_runners - count;
            return Plan {
                action: ScalingAction::ScaleUp,
                amount,
                reason: format!("{count} runner(s) below minimum {}", policy.min_runners),
            };
        }

        if utilization >= policy.scale_up_threshold || high_queue {
            let trigger = if utilization >= policy.scale_up_threshold {
                format!(
                    "utilization {:.2} >= {:.2}",
                    utilization, policy.scale_up_threshold
                )
            } else {
                format!(
                    "queue depth {} > {}",
                    queue.queue_depth, self.settings.high_queue_depth
                )
            };
            if count >= policy.max_runners {
                return Plan {
                    action: ScalingAction::Maintain,
                    amount: 0,
                    reason: format!("{trigger} but already at max {}", policy.max_runners),
                };
            }
            let amount = policy.scale_increment.min(policy.max_runners - count);
            return Plan {
                action: ScalingAction::ScaleUp,
                amount,
                reason: trigger,
            };
        }

        if utilization <= policy.scale_down_threshold && queue.queue_depth == 0 {
            if count > policy.min_runners {
                return Plan {
                    action: ScalingAction::ScaleDown,
                    amount: policy.scale_increment.min(count - policy.min_runners),
                    reason: format!(
                        "utilization {:.2} <= {:.2} with empty queue",
                        utilization, policy.scale_down_threshold
                    ),
                };
            }
            return Plan {
                action: ScalingAction::Maintain,
                amount: 0,
                reason: format!("idle but already at min {}", policy.min_runners),
            };
        }

        Plan {
            action: ScalingAction::Maintain,
            amount: 0,
            reason: format!(
                "utilization {:.2} within {:.2}..{:.2}, queue depth {}",
                utilization, policy.scale_down_threshold, policy.scale_up_threshold, queue.queue_depth
            ),
        }
    }

    /// Apply a planned action. The pool enforces its own bounds on top of
    /// the policy's, so `amount` and `target_runners` are rewritten to what
    /// it actually did.
    async fn execute(&self, decision: &mut ScalingDecision, min_runners: u32, now: u64) {
        let repository = decision.repository.clone();
        let result = match decision.action {
            ScalingAction::ScaleUp => self.pools.scale_up(&repository, decision.amount).await,
            ScalingAction::ScaleDown => {
                self.pools
                    .scale_down(&repository, decision.amount, min_runners)
                    .await
            }
            ScalingAction::Maintain => return,
        };

        match result {
            Ok(0) => {
                decision.reason.push_str("; pool made no change");
                decision.target_runners = decision.current_runners;
            }
            Ok(changed) => {
                decision.executed = true;
                decision.target_runners = match decision.action {
                    ScalingAction::ScaleUp => decision.current_runners + changed,
                    _ => decision.current_runners.saturating_sub(changed),
                };
                decision.amount = changed;
                self.cooldowns.lock().await.insert(repository.clone(), now);
                info!(
                    %repository,
                    action = %decision.action,
                    from = decision.current_runners,
                    to = decision.target_runners,
                    reason = %decision.reason,
                    "pool scaled"
                );
                let _ = self.events.send(ScalingEvent::Scaled(decision.clone()));
            }
            Err(e) => {
                error!(%repository, action = %decision.action, error = %e, "scaling action failed");
                decision.reason = format!("{}; scaling failed: {e}", decision.reason);
                let _ = self.events.send(ScalingEvent::Failed {
                    repository,
                    action: decision.action,
                    error: e.to_string(),
                });
            }
        }
    }

    async fn record(&self, decision: &ScalingDecision, queue: &QueueStats) {
        let snapshot = MetricSnapshot {
            timestamp_ms: decision.timestamp_ms,
            repository: decision.repository.clone(),
            utilization: decision.utilization,
            queue_depth: queue.queue_depth,
            average_wait_time_secs: queue.average_wait_time_secs,
            runner_count: decision.current_runners,
            active_jobs: queue.active_jobs,
            decision: decision.action,
            reason: decision.reason.clone(),
        };
        self.history.write().await.record(snapshot);
    }

    // ── History and prediction ─────────────────────────────────────

    /// Recorded evaluations, oldest first.
    pub async fn history(&self, repository: &str, since_ms: Option<u64>, limit: Option<usize>) -> Vec<MetricSnapshot> {
        self.history.read().await.query(repository, since_ms, limit)
    }

    /// Copy a repository's in-memory history into the durable metrics table.
    pub async fn export_history(&self, repository: &str) -> AutoscaleResult<usize> {
        let snapshots = self.history.read().await.query(repository, None, None);
        for snapshot in &snapshots {
            self.state.put_metric_snapshot(snapshot)?;
        }
        info!(%repository, exported = snapshots.len(), "metric history exported");
        Ok(snapshots.len())
    }

    /// Forecast utilization and a runner count `horizon_minutes` ahead.
    pub async fn predict_scaling_needs(&self, repository: &str, horizon_minutes: f64) -> Prediction {
        let samples = self.history.read().await.query(repository, None, None);
        let policy = match self.effective_policy(repository) {
            Ok(policy) => policy,
            Err(e) => {
                warn!(%repository, error = %e, "policy unavailable for prediction");
                return Prediction::insufficient(repository, horizon_minutes, samples.len());
            }
        };
        predict::predict(
            repository,
            &samples,
            horizon_minutes,
            &policy,
            self.settings.min_prediction_samples,
            self.settings.full_confidence_samples,
        )
    }

    // ── Loop ───────────────────────────────────────────────────────

    /// Evaluate tracked repositories every `interval` until shutdown.
    pub async fn run(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(interval_secs = interval.as_secs(), "autoscaler started");

        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    let decisions = self.evaluate_all().await;
                    let executed = decisions.iter().filter(|d| d.executed).count();
                    if executed > 0 {
                        debug!(evaluated = decisions.len(), executed, "autoscaler cycle complete");
                    }
                }
                _ = shutdown.changed() => {
                    info!("autoscaler shutting down");
                    break;
                }
            }
        }
    }

    #[cfg(test)]
    pub(crate) async fn record_for_test(&self, snapshot: MetricSnapshot) {
        self.history.write().await.record(snapshot);
    }
}

fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
