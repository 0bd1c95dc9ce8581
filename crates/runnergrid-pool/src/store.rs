//! StatePool — the runner pool store backed by `StateStore`.
//!
//! Pools are created on first reference and warmed up to `min_runners`.
//! Every mutation keeps `min ≤ current_runners ≤ max`; explicit runner
//! removal tops the pool back up to its minimum.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::Context;
use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use runnergrid_core::PoolDefaultsConfig;
use runnergrid_state::{Pool, PoolMetrics, Runner, RunnerPool, RunnerStatus, StateStore};

use crate::runtime::ContainerRuntime;

/// Bounds and labels for pools created on first reference.
#[derive(Debug, Clone, PartialEq)]
pub struct PoolDefaults {
    pub min_runners: u32,
    pub max_runners: u32,
    pub scale_increment: u32,
    pub scale_threshold: f64,
    pub runner_labels: BTreeSet<String>,
}

impl Default for PoolDefaults {
    fn default() -> Self {
        Self::from(&PoolDefaultsConfig::default())
    }
}

impl From<&PoolDefaultsConfig> for PoolDefaults {
    fn from(config: &PoolDefaultsConfig) -> Self {
        Self {
            min_runners: config.min_runners,
            max_runners: config.max_runners,
            scale_increment: config.scale_increment.max(1),
            scale_threshold: config.scale_threshold,
            runner_labels: config.runner_labels.iter().cloned().collect(),
        }
    }
}

/// Persistent runner pools.
pub struct StatePool {
    state: StateStore,
    runtime: Arc<dyn ContainerRuntime>,
    defaults: PoolDefaults,
    /// Single writer for pool and runner records.
    write_lock: Mutex<()>,
}

impl StatePool {
    pub fn new(state: StateStore, runtime: Arc<dyn ContainerRuntime>, defaults: PoolDefaults) -> Self {
        Self {
            state,
            runtime,
            defaults,
            write_lock: Mutex::new(()),
        }
    }

    /// All pools known to the store.
    pub fn list_pools(&self) -> anyhow::Result<Vec<Pool>> {
        Ok(self.state.list_pools()?)
    }

    /// Change a pool's bounds. The runner count is brought back inside them.
    pub async fn set_bounds(&self, repository: &str, min_runners: u32, max_runners: u32) -> anyhow::Result<Pool> {
        if min_runners > max_runners {
            anyhow::bail!("min_runners ({min_runners}) exceeds max_runners ({max_runners})");
        }
        let _guard = self.write_lock.lock().await;
        let mut pool = self.load_or_create(repository).await?;
        pool.min_runners = min_runners;
        pool.max_runners = max_runners;
        pool.updated_at = epoch_secs();
        self.state.put_pool(&pool)?;

        if pool.current_runners < min_runners {
            let missing = min_runners - pool.current_runners;
            self.provision_locked(&mut pool, missing).await?;
        }
        if pool.current_runners > max_runners {
            let excess = pool.current_runners - max_runners;
            let removed = self.remove_idle_locked(&mut pool, excess, min_runners).await?;
            if removed < excess {
                warn!(%repository, excess, removed, "pool above max but remaining runners are busy");
            }
        }
        info!(%repository, min_runners, max_runners, "pool bounds updated");
        Ok(pool)
    }

    /// The pool record is written only once warm-up has started at least
    /// one runner (or none were needed), so a failed warm-up is retried on
    /// the next reference.
    async fn load_or_create(&self, repository: &str) -> anyhow::Result<Pool> {
        if let Some(pool) = self.state.get_pool(repository)? {
            return Ok(pool);
        }

        let now = epoch_secs();
        let mut pool = Pool {
            repository: repository.to_string(),
            min_runners: self.defaults.min_runners,
            max_runners: self.defaults.max_runners,
            current_runners: 0,
            scale_increment: self.defaults.scale_increment,
            scale_threshold: self.defaults.scale_threshold,
            runner_labels: self.defaults.runner_labels.clone(),
            created_at: now,
            updated_at: now,
        };
        let min = pool.min_runners;
        let warmed = self.provision_locked(&mut pool, min).await?;
        if warmed == 0 {
            self.state.put_pool(&pool)?;
        }
        info!(%repository, min, max = pool.max_runners, warmed, "pool created");
        Ok(pool)
    }

    /// Provision up to `count` runners, never above max. Caller holds the write lock.
    async fn provision_locked(&self, pool: &mut Pool, count: u32) -> anyhow::Result<u32> {
        let room = pool.max_runners.saturating_sub(pool.current_runners);
        let wanted = count.min(room);
        let mut last_registered = self
            .state
            .list_runners_for_pool(&pool.repository)?
            .last()
            .map_or(0, |r| r.registered_at);

        let mut added = 0;
        for _ in 0..wanted {
            let runner_id = match self.runtime.provision(&pool.repository, &pool.runner_labels).await {
                Ok(id) => id,
                Err(e) if added > 0 => {
                    warn!(repository = %pool.repository, added, error = %e, "provisioning stopped early");
                    break;
                }
                Err(e) => {
                    return Err(e).with_context(|| format!("failed to provision runner for {}", pool.repository));
                }
            };

            let registered_at = epoch_millis().max(last_registered + 1);
            last_registered = registered_at;
            let runner = Runner {
                id: runner_id,
                repository: pool.repository.clone(),
                labels: pool.runner_labels.clone(),
                status: RunnerStatus::Idle,
                registered_at,
                updated_at: epoch_secs(),
            };
            self.state.put_runner(&runner)?;
            debug!(repository = %pool.repository, runner_id = %runner.id, "runner registered");
            added += 1;
        }

        if added > 0 {
            pool.current_runners += added;
            pool.updated_at = epoch_secs();
            self.state.put_pool(pool)?;
        }
        Ok(added)
    }

    /// Remove up to `limit` idle runners, newest first, never below
    /// `floor` or the pool's own min.
    async fn remove_idle_locked(&self, pool: &mut Pool, limit: u32, floor: u32) -> anyhow::Result<u32> {
        let floor_room = pool
            .current_runners
            .saturating_sub(pool.min_runners.max(floor));
        let wanted = limit.min(floor_room);
        if wanted == 0 {
            return Ok(0);
        }

        let idle: Vec<Runner> = self
            .state
            .list_runners_for_pool(&pool.repository)?
            .into_iter()
            .rev()
            .filter(|r| r.status == RunnerStatus::Idle)
            .take(wanted as usize)
            .collect();

        let mut removed = 0;
        for runner in idle {
            if let Err(e) = self.runtime.terminate(&pool.repository, &runner.id).await {
                warn!(repository = %pool.repository, runner_id = %runner.id, error = %e, "failed to terminate runner");
                continue;
            }
            self.state.delete_runner(&pool.repository, &runner.id)?;
            removed += 1;
        }

        if removed > 0 {
            pool.current_runners -= removed;
            pool.updated_at = epoch_secs();
            self.state.put_pool(pool)?;
        }
        Ok(removed)
    }
}

#[async_trait]
impl RunnerPool for StatePool {
    async fn get_or_create_pool(&self, repository: &str) -> anyhow::Result<Pool> {
        let _guard = self.write_lock.lock().await;
        self.load_or_create(repository).await
    }

    async fn active_runners(&self, repository: &str) -> anyhow::Result<Vec<Runner>> {
        let runners = self.state.list_runners_for_pool(repository)?;
        Ok(runners
            .into_iter()
            .filter(|r| r.status != RunnerStatus::Offline)
            .collect())
    }

    async fn pool_metrics(&self, repository: &str) -> anyhow::Result<PoolMetrics> {
        let runners = self.active_runners(repository).await?;
        let total = runners.len() as u32;
        let active = runners.iter().filter(|r| r.status == RunnerStatus::Busy).count() as u32;
        let utilization = if total == 0 {
            0.0
        } else {
            f64::from(active) / f64::from(total)
        };
        Ok(PoolMetrics {
            total_runners: total,
            active_runners: active,
            idle_runners: total - active,
            utilization,
        })
    }

    async fn scale_up(&self, repository: &str, count: u32) -> anyhow::Result<u32> {
        let _guard = self.write_lock.lock().await;
        let mut pool = self.load_or_create(repository).await?;
        let added = self.provision_locked(&mut pool, count).await?;
        info!(%repository, requested = count, added, current = pool.current_runners, "pool scaled up");
        Ok(added)
    }

    async fn scale_down(&self, repository: &str, count: u32, floor: u32) -> anyhow::Result<u32> {
        let _guard = self.write_lock.lock().await;
        let mut pool = self.load_or_create(repository).await?;
        let removed = self.remove_idle_locked(&mut pool, count, floor).await?;
        info!(%repository, requested = count, floor, removed, current = pool.current_runners, "pool scaled down");
        Ok(removed)
    }

    async fn set_runner_status(
        &self,
        repository: &str,
        runner_id: &str,
        status: RunnerStatus,
    ) -> anyhow::Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut runner = self
            .state
            .get_runner(repository, runner_id)?
            .with_context(|| format!("runner {runner_id} not found in pool {repository}"))?;
        if runner.status != status {
            runner.status = status;
            runner.updated_at = epoch_secs();
            self.state.put_runner(&runner)?;
            debug!(%repository, %runner_id, ?status, "runner status updated");
        }
        Ok(())
    }

    async fn remove_runner(&self, repository: &str, runner_id: &str) -> anyhow::Result<bool> {
        let _guard = self.write_lock.lock().await;
        if self.state.get_runner(repository, runner_id)?.is_none() {
            return Ok(false);
        }
        if let Err(e) = self.runtime.terminate(repository, runner_id).await {
            warn!(%repository, %runner_id, error = %e, "failed to terminate runner, dropping record anyway");
        }
        self.state.delete_runner(repository, runner_id)?;

        let mut pool = self.load_or_create(repository).await?;
        pool.current_runners = pool.current_runners.saturating_sub(1);
        pool.updated_at = epoch_secs();
        self.state.put_pool(&pool)?;
        info!(%repository, %runner_id, "runner removed");

        if pool.current_runners < pool.min_runners {
            let missing = pool.min_runners - pool.current_runners;
            if let Err(e) = self.provision_locked(&mut pool, missing).await {
                warn!(%repository, error = %e, "failed to replace removed runner");
            }
        }
        Ok(true)
    }

    async fn runner_alive(&self, repository: &str, runner_id: &str) -> anyhow::Result<bool> {
        self.runtime
            .is_alive(repository, runner_id)
            .await
            .with_context(|| format!("liveness of runner {runner_id} in {repository} unknown"))
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
