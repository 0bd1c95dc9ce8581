//! Container assignment — binds jobs to ready runners and tracks liveness.
//!
//! Each pool's slots sit behind their own mutex, so assignment, release
//! and liveness checks for one pool never interleave while different
//! pools proceed independently. Runner status changes are mirrored to
//! the [`RunnerPool`] so pool metrics (and the autoscaler) see them.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use serde::Serialize;
use tokio::sync::{Mutex, RwLock, broadcast, watch};
use tracing::{debug, info, warn};

use runnergrid_core::AssignmentConfig;
use runnergrid_routing::RoutingDecision;
use runnergrid_state::{JobRequest, Runner, RunnerPool, RunnerStatus};

use crate::error::{PoolError, PoolResult};
use crate::health::{HealthLevel, HealthReport, HealthThresholds};

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotState {
    Ready,
    Assigned,
    Unhealthy,
}

/// A tracked runner.
#[derive(Debug, Clone)]
pub struct RunnerSlot {
    pub runner_id: String,
    pub labels: BTreeSet<String>,
    pub state: SlotState,
    pub job_id: Option<String>,
    pub assigned_at: Option<u64>,
    pub last_seen: Instant,
    /// Set when an assigned runner is reported unhealthy; release removes it.
    pub unhealthy_during_job: bool,
}

impl RunnerSlot {
    fn from_runner(runner: &Runner) -> Self {
        Self {
            runner_id: runner.id.clone(),
            labels: runner.labels.clone(),
            state: SlotState::Ready,
            job_id: None,
            assigned_at: None,
            last_seen: Instant::now(),
            unhealthy_during_job: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Assignment {
    pub job_id: String,
    pub repository: String,
    pub runner_id: String,
    pub assigned_at: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReleaseOutcome {
    /// The runner is ready for another job.
    Ready,
    /// The runner went unhealthy during the job and was removed.
    Removed,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AssignmentEvent {
    Assigned(Assignment),
    Released {
        job_id: String,
        repository: String,
        runner_id: String,
        outcome: ReleaseOutcome,
    },
    RunnerUnhealthy {
        repository: String,
        runner_id: String,
        job_id: Option<String>,
    },
    RunnerRecovered {
        repository: String,
        runner_id: String,
    },
    RunnerRemoved {
        repository: String,
        runner_id: String,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PoolStatistics {
    pub repository: String,
    pub total: u32,
    pub ready: u32,
    pub assigned: u32,
    pub unhealthy: u32,
    /// assigned / total, 0.0 for an empty pool.
    pub utilization: f64,
}

impl PoolStatistics {
    fn from_slots(repository: &str, slots: &[RunnerSlot]) -> Self {
        let mut stats = PoolStatistics {
            repository: repository.to_string(),
            ..PoolStatistics::default()
        };
        for slot in slots {
            stats.total += 1;
            match slot.state {
                SlotState::Ready => stats.ready += 1,
                SlotState::Assigned => stats.assigned += 1,
                SlotState::Unhealthy => stats.unhealthy += 1,
            }
        }
        stats.utilization = ratio(stats.assigned, stats.total);
        stats
    }

    fn usable(&self) -> u32 {
        self.ready + self.assigned
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AssignmentStatistics {
    pub total: u32,
    pub ready: u32,
    pub assigned: u32,
    pub unhealthy: u32,
    pub utilization: f64,
    /// Sorted by repository.
    pub pools: Vec<PoolStatistics>,
}

#[derive(Debug, Clone)]
struct Binding {
    repository: String,
    runner_id: String,
    assigned_at: u64,
}

type PoolSlots = Arc<Mutex<Vec<RunnerSlot>>>;

/// Job-to-runner binding across all pools.
pub struct ContainerAssignment {
    pools: Arc<dyn RunnerPool>,
    slots: RwLock<HashMap<String, PoolSlots>>,
    /// job id → bound runner. Locked before any pool's slots.
    bindings: Mutex<HashMap<String, Binding>>,
    thresholds: HealthThresholds,
    liveness_timeout: Duration,
    events: broadcast::Sender<AssignmentEvent>,
}

impl ContainerAssignment {
    pub fn new(pools: Arc<dyn RunnerPool>, config: &AssignmentConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            pools,
            slots: RwLock::new(HashMap::new()),
            bindings: Mutex::new(HashMap::new()),
            thresholds: HealthThresholds::from(config),
            liveness_timeout: config.liveness_timeout(),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AssignmentEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: AssignmentEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    async fn pool_slots(&self, repository: &str) -> PoolSlots {
        if let Some(slots) = self.slots.read().await.get(repository) {
            return slots.clone();
        }
        self.slots
            .write()
            .await
            .entry(repository.to_string())
            .or_default()
            .clone()
    }

    async fn existing_slots(&self, repository: &str) -> Option<PoolSlots> {
        self.slots.read().await.get(repository).cloned()
    }

    /// Reconcile a pool's slots with the store's active runners.
    ///
    /// New runners are tracked as ready; runners gone from the store are
    /// dropped unless they are bound to a job.
    pub async fn sync_pool(&self, repository: &str) -> PoolResult<()> {
        let runners = match self.pools.active_runners(repository).await {
            Ok(runners) => runners,
            Err(e) => {
                warn!(%repository, error = %e, "failed to load runners for sync");
                return Ok(());
            }
        };
        let slots = self.pool_slots(repository).await;
        let mut slots = slots.lock().await;

        let present: HashSet<&str> = runners.iter().map(|r| r.id.as_str()).collect();
        slots.retain(|s| {
            present.contains(s.runner_id.as_str())
                || s.state == SlotState::Assigned
                || s.state == SlotState::Unhealthy
        });
        merge_runners(&mut slots, &runners);
        debug!(%repository, tracked = slots.len(), "pool slots synced");
        Ok(())
    }

    /// Bind a job to the first ready candidate of a routing decision.
    pub async fn assign(&self, job: &JobRequest, decision: &RoutingDecision) -> PoolResult<Assignment> {
        let mut bindings = self.bindings.lock().await;
        if bindings.contains_key(&job.id) {
            return Err(PoolError::AlreadyAssigned(job.id.clone()));
        }

        let repository = decision.pool.clone();
        let pool = self.pool_slots(&repository).await;
        let mut slots = pool.lock().await;
        merge_runners(&mut slots, &decision.runners);

        let candidates: HashSet<&str> = decision.runners.iter().map(|r| r.id.as_str()).collect();
        let ready: Vec<String> = slots
            .iter()
            .filter(|s| s.state == SlotState::Ready && candidates.contains(s.runner_id.as_str()))
            .map(|s| s.runner_id.clone())
            .collect();

        // The pool record flips to busy while the slot lock is held, so a
        // concurrent scale-down either sees the runner busy or has already
        // removed it.
        let mut claimed = None;
        let mut gone = Vec::new();
        for runner_id in ready {
            match self
                .pools
                .set_runner_status(&repository, &runner_id, RunnerStatus::Busy)
                .await
            {
                Ok(()) => {
                    claimed = Some(runner_id);
                    break;
                }
                Err(e) => {
                    warn!(%repository, %runner_id, error = %e, "runner could not be claimed");
                    gone.push(runner_id);
                }
            }
        }
        if !gone.is_empty() {
            slots.retain(|s| !gone.contains(&s.runner_id));
        }

        let Some(slot) = claimed
            .as_deref()
            .and_then(|id| slots.iter_mut().find(|s| s.runner_id == id))
        else {
            let reason = if decision.runners.is_empty() {
                decision.reason.clone()
            } else {
                format!(
                    "all {} candidate runner(s) are assigned, unhealthy or gone",
                    decision.runners.len()
                )
            };
            warn!(job_id = %job.id, %repository, %reason, "capacity exhausted");
            return Err(PoolError::CapacityExhausted {
                job_id: job.id.clone(),
                repository,
                reason,
            });
        };

        let assigned_at = epoch_secs();
        slot.state = SlotState::Assigned;
        slot.job_id = Some(job.id.clone());
        slot.assigned_at = Some(assigned_at);
        slot.unhealthy_during_job = false;
        let runner_id = slot.runner_id.clone();
        drop(slots);

        bindings.insert(
            job.id.clone(),
            Binding {
                repository: repository.clone(),
                runner_id: runner_id.clone(),
                assigned_at,
            },
        );
        drop(bindings);

        let assignment = Assignment {
            job_id: job.id.clone(),
            repository,
            runner_id,
            assigned_at,
        };
        info!(
            job_id = %assignment.job_id,
            repository = %assignment.repository,
            runner_id = %assignment.runner_id,
            "job assigned"
        );
        self.emit(AssignmentEvent::Assigned(assignment.clone()));
        Ok(assignment)
    }

    /// Unbind a job. Its runner becomes ready again, or is removed if it
    /// was reported unhealthy while running the job.
    pub async fn release(&self, job_id: &str) -> PoolResult<ReleaseOutcome> {
        let mut bindings = self.bindings.lock().await;
        let binding = bindings
            .remove(job_id)
            .ok_or_else(|| PoolError::JobNotAssigned(job_id.to_string()))?;
        let Binding {
            repository,
            runner_id,
            ..
        } = binding;

        let outcome = match self.existing_slots(&repository).await {
            Some(pool) => {
                let mut slots = pool.lock().await;
                match slots.iter().position(|s| s.runner_id == runner_id) {
                    Some(idx) if slots[idx].unhealthy_during_job => {
                        slots.remove(idx);
                        ReleaseOutcome::Removed
                    }
                    Some(idx) => {
                        let slot = &mut slots[idx];
                        slot.state = SlotState::Ready;
                        slot.job_id = None;
                        slot.assigned_at = None;
                        slot.last_seen = Instant::now();
                        // Idle is written before another assign can claim the slot.
                        if let Err(e) = self
                            .pools
                            .set_runner_status(&repository, &runner_id, RunnerStatus::Idle)
                            .await
                        {
                            warn!(%repository, %runner_id, error = %e, "failed to mark released runner idle");
                        }
                        ReleaseOutcome::Ready
                    }
                    None => ReleaseOutcome::Removed,
                }
            }
            None => ReleaseOutcome::Removed,
        };
        drop(bindings);

        if outcome == ReleaseOutcome::Removed
            && let Err(e) = self.pools.remove_runner(&repository, &runner_id).await
        {
            warn!(%repository, %runner_id, error = %e, "failed to remove runner after release");
        }

        info!(%job_id, %repository, %runner_id, ?outcome, "job released");
        self.emit(AssignmentEvent::Released {
            job_id: job_id.to_string(),
            repository,
            runner_id,
            outcome,
        });
        Ok(outcome)
    }

    /// Current binding of a job, if any.
    pub async fn assignment_for(&self, job_id: &str) -> Option<Assignment> {
        self.bindings.lock().await.get(job_id).map(|b| Assignment {
            job_id: job_id.to_string(),
            repository: b.repository.clone(),
            runner_id: b.runner_id.clone(),
            assigned_at: b.assigned_at,
        })
    }

    /// Record a liveness signal from a runner.
    pub async fn heartbeat(&self, repository: &str, runner_id: &str) -> PoolResult<()> {
        let pool = self
            .existing_slots(repository)
            .await
            .ok_or_else(|| not_found(repository, runner_id))?;
        let mut slots = pool.lock().await;
        let slot = slots
            .iter_mut()
            .find(|s| s.runner_id == runner_id)
            .ok_or_else(|| not_found(repository, runner_id))?;
        slot.last_seen = Instant::now();
        Ok(())
    }

    /// A runner reported itself (or was observed) unhealthy.
    pub async fn report_unhealthy(&self, repository: &str, runner_id: &str) -> PoolResult<()> {
        let pool = self
            .existing_slots(repository)
            .await
            .ok_or_else(|| not_found(repository, runner_id))?;
        let mut slots = pool.lock().await;
        let slot = slots
            .iter_mut()
            .find(|s| s.runner_id == runner_id)
            .ok_or_else(|| not_found(repository, runner_id))?;
        let went_offline = mark_unhealthy(slot);
        let job_id = slot.job_id.clone();
        drop(slots);

        self.after_unhealthy(repository, runner_id, job_id, went_offline).await;
        Ok(())
    }

    /// Check runners silent for longer than the liveness timeout.
    ///
    /// Each silent runner's container is asked directly. A running container
    /// counts as a heartbeat. An exited idle runner is removed and the pool
    /// is topped back up; an exited busy runner is removed when its job is
    /// released. A runner the runtime cannot answer for is marked unhealthy.
    /// Returns the runners flagged or removed.
    pub async fn check_liveness(&self) -> Vec<(String, String)> {
        self.check_liveness_at(Instant::now()).await
    }

    pub async fn check_liveness_at(&self, now: Instant) -> Vec<(String, String)> {
        let pools: Vec<(String, PoolSlots)> = self
            .slots
            .read()
            .await
            .iter()
            .map(|(repo, slots)| (repo.clone(), slots.clone()))
            .collect();

        let mut flagged = Vec::new();
        for (repository, pool) in pools {
            let silent: Vec<String> = {
                let slots = pool.lock().await;
                slots
                    .iter()
                    .filter(|s| {
                        now.saturating_duration_since(s.last_seen) > self.liveness_timeout
                            && s.state != SlotState::Unhealthy
                            && !s.unhealthy_during_job
                    })
                    .map(|s| s.runner_id.clone())
                    .collect()
            };
            if silent.is_empty() {
                continue;
            }

            let mut removed_any = false;
            for runner_id in silent {
                let alive = self.pools.runner_alive(&repository, &runner_id).await;
                let mut slots = pool.lock().await;
                let Some(idx) = slots.iter().position(|s| s.runner_id == runner_id) else {
                    continue;
                };
                match alive {
                    Ok(true) => {
                        slots[idx].last_seen = now;
                    }
                    Ok(false) if slots[idx].state == SlotState::Ready => {
                        slots.remove(idx);
                        drop(slots);
                        warn!(%repository, %runner_id, "runner container exited");
                        if let Err(e) = self.pools.remove_runner(&repository, &runner_id).await {
                            warn!(%repository, %runner_id, error = %e, "failed to remove exited runner");
                        }
                        self.emit(AssignmentEvent::RunnerRemoved {
                            repository: repository.clone(),
                            runner_id: runner_id.clone(),
                        });
                        removed_any = true;
                        flagged.push((repository.clone(), runner_id));
                    }
                    outcome => {
                        if let Err(e) = &outcome {
                            warn!(%repository, %runner_id, error = %e, "runner liveness unknown");
                        }
                        let went_offline = mark_unhealthy(&mut slots[idx]);
                        let job_id = slots[idx].job_id.clone();
                        drop(slots);
                        warn!(%repository, %runner_id, "runner missed liveness check");
                        self.after_unhealthy(&repository, &runner_id, job_id, went_offline).await;
                        flagged.push((repository.clone(), runner_id));
                    }
                }
            }

            if removed_any {
                // Replacements provisioned by the pool become assignable.
                if let Err(e) = self.sync_pool(&repository).await {
                    warn!(%repository, error = %e, "pool sync after removal failed");
                }
            }
        }
        flagged
    }

    async fn after_unhealthy(&self, repository: &str, runner_id: &str, job_id: Option<String>, went_offline: bool) {
        if went_offline
            && let Err(e) = self
                .pools
                .set_runner_status(repository, runner_id, RunnerStatus::Offline)
                .await
        {
            warn!(%repository, %runner_id, error = %e, "failed to mark runner offline");
        }
        self.emit(AssignmentEvent::RunnerUnhealthy {
            repository: repository.to_string(),
            runner_id: runner_id.to_string(),
            job_id,
        });
    }

    /// Return an unhealthy runner to service. Returns false if it was healthy.
    pub async fn recover(&self, repository: &str, runner_id: &str) -> PoolResult<bool> {
        let pool = self
            .existing_slots(repository)
            .await
            .ok_or_else(|| not_found(repository, runner_id))?;
        let mut slots = pool.lock().await;
        let slot = slots
            .iter_mut()
            .find(|s| s.runner_id == runner_id)
            .ok_or_else(|| not_found(repository, runner_id))?;

        let back_online = match (slot.state, slot.unhealthy_during_job) {
            (SlotState::Unhealthy, _) => {
                slot.state = SlotState::Ready;
                true
            }
            (SlotState::Assigned, true) => {
                slot.unhealthy_during_job = false;
                false
            }
            _ => return Ok(false),
        };
        slot.last_seen = Instant::now();
        if back_online
            && let Err(e) = self
                .pools
                .set_runner_status(repository, runner_id, RunnerStatus::Idle)
                .await
        {
            warn!(%repository, %runner_id, error = %e, "failed to mark recovered runner idle");
        }
        drop(slots);

        info!(%repository, %runner_id, "runner recovered");
        self.emit(AssignmentEvent::RunnerRecovered {
            repository: repository.to_string(),
            runner_id: runner_id.to_string(),
        });
        Ok(true)
    }

    /// Stop tracking a runner and tear it down. A bound job loses its runner.
    pub async fn remove_runner(&self, repository: &str, runner_id: &str) -> PoolResult<()> {
        let mut bindings = self.bindings.lock().await;
        let pool = self
            .existing_slots(repository)
            .await
            .ok_or_else(|| not_found(repository, runner_id))?;
        let mut slots = pool.lock().await;
        let idx = slots
            .iter()
            .position(|s| s.runner_id == runner_id)
            .ok_or_else(|| not_found(repository, runner_id))?;
        let slot = slots.remove(idx);
        drop(slots);

        if let Some(job_id) = &slot.job_id {
            bindings.remove(job_id);
            warn!(%repository, %runner_id, %job_id, "removed runner was running a job");
        }
        drop(bindings);

        if let Err(e) = self.pools.remove_runner(repository, runner_id).await {
            warn!(%repository, %runner_id, error = %e, "failed to remove runner from pool");
        }
        info!(%repository, %runner_id, "runner removed from assignment");
        self.emit(AssignmentEvent::RunnerRemoved {
            repository: repository.to_string(),
            runner_id: runner_id.to_string(),
        });
        Ok(())
    }

    pub async fn pool_statistics(&self, repository: &str) -> Option<PoolStatistics> {
        let pool = self.existing_slots(repository).await?;
        let slots = pool.lock().await;
        Some(PoolStatistics::from_slots(repository, &slots))
    }

    /// State breakdown per pool and in total.
    pub async fn statistics(&self) -> AssignmentStatistics {
        let pools: Vec<(String, PoolSlots)> = self
            .slots
            .read()
            .await
            .iter()
            .map(|(repo, slots)| (repo.clone(), slots.clone()))
            .collect();

        let mut stats = AssignmentStatistics::default();
        for (repository, pool) in pools {
            let slots = pool.lock().await;
            let pool_stats = PoolStatistics::from_slots(&repository, &slots);
            stats.total += pool_stats.total;
            stats.ready += pool_stats.ready;
            stats.assigned += pool_stats.assigned;
            stats.unhealthy += pool_stats.unhealthy;
            stats.pools.push(pool_stats);
        }
        stats.pools.sort_by(|a, b| a.repository.cmp(&b.repository));
        stats.utilization = ratio(stats.assigned, stats.total);
        stats
    }

    pub async fn health(&self) -> HealthReport {
        let stats = self.statistics().await;
        let usable = stats.ready + stats.assigned;
        HealthReport {
            level: self.thresholds.classify(usable, stats.total),
            usable_ratio: if stats.total == 0 {
                1.0
            } else {
                ratio(usable, stats.total)
            },
            pools: stats
                .pools
                .iter()
                .map(|p| (p.repository.clone(), self.thresholds.classify(p.usable(), p.total)))
                .collect(),
        }
    }

    /// Run liveness checks until shutdown.
    pub async fn run(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(interval_secs = interval.as_secs(), "runner health checks started");

        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    let flagged = self.check_liveness().await;
                    let health = self.health().await;
                    if health.level != HealthLevel::Healthy {
                        warn!(level = %health.level, ratio = health.usable_ratio, "runner fleet not healthy");
                    } else if !flagged.is_empty() {
                        debug!(flagged = flagged.len(), "runners flagged unhealthy");
                    }
                }
                _ = shutdown.changed() => {
                    info!("runner health checks shutting down");
                    break;
                }
            }
        }
    }
}

/// Track decision runners the pool has not seen yet, keeping order.
fn merge_runners(slots: &mut Vec<RunnerSlot>, runners: &[Runner]) {
    for runner in runners {
        match slots.iter_mut().find(|s| s.runner_id == runner.id) {
            Some(slot) => slot.labels = runner.labels.clone(),
            None => slots.push(RunnerSlot::from_runner(runner)),
        }
    }
}

/// Flag a slot unhealthy. Returns true if it left service immediately.
fn mark_unhealthy(slot: &mut RunnerSlot) -> bool {
    match slot.state {
        SlotState::Assigned => {
            slot.unhealthy_during_job = true;
            false
        }
        SlotState::Ready | SlotState::Unhealthy => {
            slot.state = SlotState::Unhealthy;
            true
        }
    }
}

fn not_found(repository: &str, runner_id: &str) -> PoolError {
    PoolError::RunnerNotFound {
        repository: repository.to_string(),
        runner_id: runner_id.to_string(),
    }
}

fn ratio(part: u32, total: u32) -> f64 {
    if total == 0 {
        0.0
    } else {
        f64::from(part) / f64::from(total)
    }
}

fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
