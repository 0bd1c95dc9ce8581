//! Component wiring shared by the daemon and its integration tests.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::Context;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use runnergrid_autoscale::{AutoScaler, ScalerSettings, ScalingEvent, StoreQueueStats};
use runnergrid_core::GridConfig;
use runnergrid_pool::{
    Assignment, ContainerAssignment, ContainerRuntime, DryRunRuntime, PoolDefaults, PoolError,
    ReleaseOutcome, StatePool,
};
use runnergrid_reporter::{CheckRunApi, GitHubChecksClient, JobContext, ReporterSettings, StatusReporter};
use runnergrid_routing::{RoutingDecision, RoutingEngine};
use runnergrid_state::{CheckOutput, Conclusion, JobRecord, JobRequest, JobState, StateStore};

/// Outcome of handing a job to the grid.
#[derive(Debug, Clone)]
pub enum Dispatch {
    Assigned {
        decision: RoutingDecision,
        assignment: Assignment,
    },
    /// No ready runner; the job stays queued and counts toward queue depth.
    Queued { decision: RoutingDecision, reason: String },
}

/// Every runnergrid component over one state store.
pub struct Grid {
    pub config: GridConfig,
    pub state: StateStore,
    pub pools: Arc<StatePool>,
    pub routing: Arc<RoutingEngine>,
    pub assignment: Arc<ContainerAssignment>,
    pub autoscaler: Arc<AutoScaler>,
    pub reporter: Arc<StatusReporter>,
}

impl Grid {
    pub fn new(
        config: GridConfig,
        state: StateStore,
        runtime: Arc<dyn ContainerRuntime>,
        checks: Arc<dyn CheckRunApi>,
    ) -> Self {
        let pools = Arc::new(StatePool::new(
            state.clone(),
            runtime,
            PoolDefaults::from(&config.pool),
        ));
        let routing = Arc::new(RoutingEngine::new(state.clone(), pools.clone()));
        let assignment = Arc::new(ContainerAssignment::new(pools.clone(), &config.assignment));
        let autoscaler = Arc::new(AutoScaler::new(
            state.clone(),
            pools.clone(),
            Arc::new(StoreQueueStats::new(state.clone())),
            ScalerSettings::from(&config.autoscale),
        ));
        let reporter = Arc::new(StatusReporter::new(
            state.clone(),
            checks,
            ReporterSettings::from(&config.reporter),
        ));

        Self {
            config,
            state,
            pools,
            routing,
            assignment,
            autoscaler,
            reporter,
        }
    }

    /// Open the configured on-disk store with the dry-run runtime and the
    /// GitHub Checks client.
    pub fn open(config: GridConfig) -> anyhow::Result<Self> {
        if let Some(dir) = config.state.path.parent() {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("failed to create state directory {}", dir.display()))?;
        }
        let state = StateStore::open(&config.state.path)
            .with_context(|| format!("failed to open state store {}", config.state.path.display()))?;
        info!(path = ?config.state.path, "state store opened");

        let token = std::env::var(&config.github.token_env).ok().filter(|t| !t.is_empty());
        if token.is_none() {
            warn!(env = %config.github.token_env, "no GitHub token set, check runs will be sent unauthenticated");
        }
        let checks = GitHubChecksClient::new(&config.github.api_url, token, config.reporter.request_timeout())?;

        Ok(Self::new(config, state, Arc::new(DryRunRuntime::new()), Arc::new(checks)))
    }

    /// Record, route and assign a job. On assignment the upstream status
    /// moves to in progress.
    pub async fn dispatch(&self, job: &JobRequest, context: &JobContext) -> anyhow::Result<Dispatch> {
        let now = epoch_secs();
        let mut record = JobRecord {
            id: job.id.clone(),
            repository: job.repository.clone(),
            state: JobState::Queued,
            queued_at: now,
            started_at: None,
            completed_at: None,
        };
        self.state.put_job(&record)?;
        self.autoscaler.track(&job.repository).await;

        let decision = self.routing.route_job(job).await;
        match self.assignment.assign(job, &decision).await {
            Ok(assignment) => {
                record.state = JobState::Running;
                record.started_at = Some(now);
                self.state.put_job(&record)?;
                self.reporter.report_job_started(context).await?;
                Ok(Dispatch::Assigned { decision, assignment })
            }
            Err(PoolError::CapacityExhausted { reason, .. }) => {
                debug!(job_id = %job.id, %reason, "job left queued");
                Ok(Dispatch::Queued { decision, reason })
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Release a finished job's runner, drop its job record and report its
    /// conclusion.
    pub async fn complete(
        &self,
        context: &JobContext,
        conclusion: Conclusion,
        output: Option<CheckOutput>,
    ) -> anyhow::Result<ReleaseOutcome> {
        let outcome = self.assignment.release(&context.job_id).await?;

        // Queue statistics only read queued and running jobs.
        if !self.state.delete_job(&context.repository, &context.job_id)? {
            debug!(job_id = %context.job_id, "completed job had no record");
        }
        self.reporter
            .report_job_completed(context, conclusion, output, Vec::new())
            .await?;
        Ok(outcome)
    }

    /// Recover the reporter queue, then start every background loop.
    ///
    /// The autoscaler and health checks stop as soon as `shutdown` fires;
    /// the reporter drains its queue once more before returning.
    pub async fn start(self: &Arc<Self>, shutdown: watch::Receiver<bool>) -> anyhow::Result<Vec<JoinHandle<()>>> {
        let recovered = self.reporter.recover().await?;
        for pool in self.pools.list_pools()? {
            self.autoscaler.track(&pool.repository).await;
            self.assignment.sync_pool(&pool.repository).await?;
        }
        info!(
            recovered,
            tracked = self.autoscaler.tracked().await.len(),
            "grid state loaded"
        );

        let mut handles = Vec::new();

        let assignment = self.assignment.clone();
        let interval = self.config.assignment.health_check_interval();
        let rx = shutdown.clone();
        handles.push(tokio::spawn(async move {
            assignment.run(interval, rx).await;
        }));

        let autoscaler = self.autoscaler.clone();
        let interval = self.config.autoscale.interval();
        let rx = shutdown.clone();
        handles.push(tokio::spawn(async move {
            autoscaler.run(interval, rx).await;
        }));

        let reporter = self.reporter.clone();
        let rx = shutdown.clone();
        handles.push(tokio::spawn(async move {
            reporter.run(rx).await;
        }));

        // Runners added or removed by the autoscaler become assignable.
        let grid = self.clone();
        let mut events = self.autoscaler.subscribe();
        let mut rx = shutdown;
        handles.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = events.recv() => match event {
                        Ok(ScalingEvent::Scaled(decision)) if decision.executed => {
                            if let Err(e) = grid.assignment.sync_pool(&decision.repository).await {
                                warn!(repository = %decision.repository, error = %e, "pool sync failed");
                            }
                        }
                        Ok(_) => {}
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(skipped, "scaling events lagged");
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    },
                    _ = rx.changed() => break,
                }
            }
        }));

        Ok(handles)
    }
}

fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
