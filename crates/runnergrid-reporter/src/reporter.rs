//! StatusReporter — durable queue of job statuses awaiting upstream delivery.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use serde::Serialize;
use tokio::sync::{Mutex, Notify, broadcast, watch};
use tracing::{debug, error, info, warn};

use runnergrid_core::ReporterConfig;
use runnergrid_state::{
    Annotation, CheckOutput, CheckRunRecord, CheckStatus, Conclusion, FailedReport, JobStatus,
    StateStore, StepStatus,
};

use crate::api::{CheckRunApi, CreateCheckRun, UpdateCheckRun};
use crate::error::{ReportError, ReportResult};
use crate::render;

const EVENT_CAPACITY: usize = 256;
const PRUNE_EVERY: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone)]
pub struct ReporterSettings {
    pub flush_interval: Duration,
    /// Queue size that triggers an immediate flush.
    pub batch_size: usize,
    pub max_attempts: u32,
    pub retry_base_delay: Duration,
    pub request_timeout: Duration,
    pub check_name: String,
    /// Completed check-run ids older than this are forgotten.
    pub check_run_retention: Duration,
}

impl Default for ReporterSettings {
    fn default() -> Self {
        Self::from(&ReporterConfig::default())
    }
}

impl From<&ReporterConfig> for ReporterSettings {
    fn from(config: &ReporterConfig) -> Self {
        Self {
            flush_interval: config.flush_interval(),
            batch_size: config.batch_size.max(1),
            max_attempts: config.max_attempts.max(1),
            retry_base_delay: config.retry_base_delay(),
            request_timeout: config.request_timeout(),
            check_name: config.check_name.clone(),
            check_run_retention: config.check_run_retention(),
        }
    }
}

/// Identity of the job a report is about.
#[derive(Debug, Clone, PartialEq)]
pub struct JobContext {
    pub job_id: String,
    pub repository: String,
    pub head_sha: String,
    pub run_id: u64,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum StatusEvent {
    Delivered {
        job_id: String,
        check_run_id: u64,
        status: CheckStatus,
    },
    /// Retries are exhausted; the status is kept as a failed report.
    Failed {
        status: Box<JobStatus>,
        error: String,
        attempts: u32,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FlushSummary {
    pub delivered: usize,
    pub failed: usize,
    /// Entries still queued afterwards (including ones updated mid-flush).
    pub pending: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReporterHealth {
    pub queue_size: usize,
    pub failed_reports: usize,
    pub delivered_total: u64,
    pub last_flush_error: Option<String>,
}

struct QueueEntry {
    status: JobStatus,
    /// Bumped on every report so a flush can tell if it delivered the latest state.
    version: u64,
    /// In-progress state that completed before any check run was created.
    /// Sent as the create, then followed by the completed update.
    opening: Option<JobStatus>,
}

enum Delivery {
    Delivered(u64),
    Failed { error: String, attempts: u32 },
}

pub struct StatusReporter {
    state: StateStore,
    api: Arc<dyn CheckRunApi>,
    settings: ReporterSettings,
    queue: Mutex<HashMap<String, QueueEntry>>,
    /// One flush at a time.
    flush_lock: Mutex<()>,
    flush_now: Notify,
    events: broadcast::Sender<StatusEvent>,
    delivered_total: AtomicU64,
    last_flush_error: Mutex<Option<String>>,
}

impl StatusReporter {
    pub fn new(state: StateStore, api: Arc<dyn CheckRunApi>, settings: ReporterSettings) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            state,
            api,
            settings,
            queue: Mutex::new(HashMap::new()),
            flush_lock: Mutex::new(()),
            flush_now: Notify::new(),
            events,
            delivered_total: AtomicU64::new(0),
            last_flush_error: Mutex::new(None),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        self.events.subscribe()
    }

    /// Reload persisted, unacknowledged statuses into the queue.
    /// Call before [`run`](Self::run).
    pub async fn recover(&self) -> ReportResult<usize> {
        let persisted = self.state.list_job_statuses()?;
        let mut queue = self.queue.lock().await;
        let mut recovered = 0;
        for mut status in persisted {
            if status.check_run_id.is_none() {
                status.check_run_id = self.state.get_check_run(&status.job_id)?.map(|r| r.check_run_id);
            }
            debug!(job_id = %status.job_id, check_run_id = ?status.check_run_id, "status recovered");
            queue.insert(
                status.job_id.clone(),
                QueueEntry {
                    status,
                    version: 0,
                    opening: None,
                },
            );
            recovered += 1;
        }
        if recovered > 0 {
            info!(recovered, "status queue recovered");
        }
        Ok(recovered)
    }

    // ── Reports ────────────────────────────────────────────────────

    pub async fn report_job_started(&self, job: &JobContext) -> ReportResult<()> {
        self.upsert(job, |status, now| {
            if status.status != CheckStatus::Completed {
                status.status = CheckStatus::InProgress;
            }
            status.started_at.get_or_insert(now);
            if status.output.is_none() {
                status.output = Some(render::started_output(&status.name));
            }
        })
        .await
    }

    /// Record the final outcome. Without `output`, title and summary are
    /// generated from the conclusion.
    pub async fn report_job_completed(
        &self,
        job: &JobContext,
        conclusion: Conclusion,
        output: Option<CheckOutput>,
        annotations: Vec<Annotation>,
    ) -> ReportResult<()> {
        self.upsert(job, move |status, now| {
            status.status = CheckStatus::Completed;
            status.conclusion = Some(conclusion);
            status.started_at.get_or_insert(now);
            status.completed_at = Some(now);
            status.output = Some(output.unwrap_or_else(|| render::completed_output(&status.name, conclusion)));
            if !annotations.is_empty() {
                status.annotations = annotations;
            }
        })
        .await
    }

    /// Merge one step's state; steps are kept per number, latest wins.
    pub async fn report_step_status(&self, job: &JobContext, step: StepStatus) -> ReportResult<()> {
        self.upsert(job, move |status, now| {
            if status.status == CheckStatus::Queued {
                status.status = CheckStatus::InProgress;
                status.started_at.get_or_insert(now);
            }
            if status.output.is_none() {
                status.output = Some(render::started_output(&status.name));
            }
            render::merge_step(&mut status.steps, step);
        })
        .await
    }

    /// Replace the job's log tail.
    pub async fn report_logs(&self, job: &JobContext, logs: &str) -> ReportResult<()> {
        let tail = render::tail_chars(logs, render::MAX_TEXT_CHARS).to_string();
        self.upsert(job, move |status, _| {
            if status.output.is_none() {
                status.output = Some(render::started_output(&status.name));
            }
            status.logs = Some(tail);
        })
        .await
    }

    /// Apply `mutate` to the job's queued status (or a fresh one), persist
    /// it, then publish it to the in-memory queue.
    ///
    /// Once a completed status has been acknowledged upstream, only another
    /// completion is accepted for that job; anything else is dropped.
    async fn upsert<F>(&self, job: &JobContext, mutate: F) -> ReportResult<()>
    where
        F: FnOnce(&mut JobStatus, u64),
    {
        validate(job)?;
        let now = epoch_secs();

        let mut queue = self.queue.lock().await;
        let (mut status, version, mut opening, closed) = match queue.get(&job.job_id) {
            Some(entry) => (entry.status.clone(), entry.version + 1, entry.opening.clone(), false),
            None => {
                let (status, closed) = self.fresh_status(job, now)?;
                (status, 1, None, closed)
            }
        };
        let unsent_start = (opening.is_none()
            && status.check_run_id.is_none()
            && status.status == CheckStatus::InProgress)
            .then(|| status.clone());

        mutate(&mut status, now);
        if closed && status.status != CheckStatus::Completed {
            debug!(job_id = %status.job_id, "report after completion dropped");
            return Ok(());
        }
        if status.status == CheckStatus::Completed && unsent_start.is_some() {
            opening = unsent_start;
        }
        if let Some(output) = status.output.as_mut() {
            output.text = render::detail_text(&status.steps, status.logs.as_deref());
        }
        status.updated_at = now;

        self.state.put_job_status(&status)?;
        debug!(job_id = %status.job_id, status = ?status.status, version, "status queued");
        queue.insert(
            job.job_id.clone(),
            QueueEntry {
                status,
                version,
                opening,
            },
        );
        let size = queue.len();
        drop(queue);

        if size >= self.settings.batch_size {
            self.flush_now.notify_one();
        }
        Ok(())
    }

    /// A new status for a job with nothing queued. The flag is true when
    /// the job's check run was already delivered as completed.
    fn fresh_status(&self, job: &JobContext, now: u64) -> ReportResult<(JobStatus, bool)> {
        // A check run may exist from an earlier, already delivered report.
        let check_run = self.state.get_check_run(&job.job_id)?;
        let status = JobStatus {
            job_id: job.job_id.clone(),
            repository: job.repository.clone(),
            head_sha: job.head_sha.clone(),
            run_id: job.run_id,
            name: job.name.clone(),
            check_run_id: check_run.as_ref().map(|r| r.check_run_id),
            status: CheckStatus::Queued,
            conclusion: None,
            started_at: None,
            completed_at: None,
            output: None,
            logs: None,
            annotations: Vec::new(),
            steps: Vec::new(),
            updated_at: now,
        };
        Ok((status, check_run.is_some_and(|r| r.completed)))
    }

    // ── Delivery ───────────────────────────────────────────────────

    /// Deliver every queued status once, in batches.
    pub async fn flush(&self) -> FlushSummary {
        let _flush = self.flush_lock.lock().await;

        let mut pending: Vec<(JobStatus, Option<JobStatus>, u64)> = {
            let queue = self.queue.lock().await;
            queue
                .values()
                .map(|e| (e.status.clone(), e.opening.clone(), e.version))
                .collect()
        };
        pending.sort_by(|a, b| a.0.updated_at.cmp(&b.0.updated_at).then(a.0.job_id.cmp(&b.0.job_id)));

        let mut summary = FlushSummary::default();
        let mut last_error = None;
        for batch in pending.chunks(self.settings.batch_size) {
            for (status, opening, version) in batch {
                match self.deliver(status, opening.as_ref()).await {
                    Delivery::Delivered(check_run_id) => {
                        self.acknowledge(status, *version, check_run_id).await;
                        summary.delivered += 1;
                    }
                    Delivery::Failed { error, attempts } => {
                        self.fail(status, &error, attempts).await;
                        last_error = Some(error);
                        summary.failed += 1;
                    }
                }
            }
        }

        summary.pending = self.queue.lock().await.len();
        *self.last_flush_error.lock().await = last_error;
        if summary.delivered + summary.failed > 0 {
            debug!(
                delivered = summary.delivered,
                failed = summary.failed,
                pending = summary.pending,
                "status queue flushed"
            );
        }
        summary
    }

    async fn deliver(&self, status: &JobStatus, opening: Option<&JobStatus>) -> Delivery {
        let check_run_id = match status.check_run_id {
            Some(id) => id,
            None => {
                let id = match self.send(opening.unwrap_or(status), None).await {
                    Ok(id) => id,
                    Err(failed) => return failed,
                };
                if opening.is_none() {
                    return Delivery::Delivered(id);
                }
                id
            }
        };
        match self.send(status, Some(check_run_id)).await {
            Ok(id) => Delivery::Delivered(id),
            Err(failed) => failed,
        }
    }

    /// One create (no id yet) or update, retried with backoff.
    async fn send(&self, status: &JobStatus, check_run_id: Option<u64>) -> Result<u64, Delivery> {
        let mut last_error = String::new();

        for attempt in 1..=self.settings.max_attempts {
            let result = match check_run_id {
                None => self.create(status).await,
                Some(id) => self.update(status, id).await.map(|()| id),
            };

            match result {
                Ok(id) => return Ok(id),
                Err(e) => {
                    last_error = e.to_string();
                    warn!(
                        job_id = %status.job_id,
                        attempt,
                        max_attempts = self.settings.max_attempts,
                        error = %last_error,
                        "status delivery failed"
                    );
                    if attempt < self.settings.max_attempts {
                        tokio::time::sleep(self.backoff(attempt)).await;
                    }
                }
            }
        }

        Err(Delivery::Failed {
            error: last_error,
            attempts: self.settings.max_attempts,
        })
    }

    async fn create(&self, status: &JobStatus) -> anyhow::Result<u64> {
        let request = CreateCheckRun::from_status(&self.settings.check_name, status);
        let id = tokio::time::timeout(
            self.settings.request_timeout,
            self.api.create_check_run(&status.repository, &request),
        )
        .await
        .map_err(|_| anyhow::anyhow!("create check run timed out"))??;

        // Persist before anything else so a retry or restart updates instead.
        let record = CheckRunRecord {
            job_id: status.job_id.clone(),
            check_run_id: id,
            completed: false,
            updated_at: epoch_secs(),
        };
        if let Err(e) = self.state.put_check_run(&record) {
            error!(job_id = %status.job_id, check_run_id = id, error = %e, "failed to persist check run id");
        }
        let mut queue = self.queue.lock().await;
        if let Some(entry) = queue.get_mut(&status.job_id) {
            entry.status.check_run_id = Some(id);
            entry.opening = None;
            if let Err(e) = self.state.put_job_status(&entry.status) {
                error!(job_id = %status.job_id, error = %e, "failed to persist queued status");
            }
        }
        info!(job_id = %status.job_id, repository = %status.repository, check_run_id = id, "check run created");
        Ok(id)
    }

    async fn update(&self, status: &JobStatus, check_run_id: u64) -> anyhow::Result<()> {
        let request = UpdateCheckRun::from_status(status);
        tokio::time::timeout(
            self.settings.request_timeout,
            self.api.update_check_run(&status.repository, check_run_id, &request),
        )
        .await
        .map_err(|_| anyhow::anyhow!("update check run {check_run_id} timed out"))??;
        debug!(job_id = %status.job_id, check_run_id, status = ?status.status, "check run updated");
        Ok(())
    }

    fn backoff(&self, attempt: u32) -> Duration {
        self.settings
            .retry_base_delay
            .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)))
    }

    /// Drop the entry if nothing newer arrived while it was in flight.
    /// A delivered completion marks the check run closed.
    async fn acknowledge(&self, status: &JobStatus, version: u64, check_run_id: u64) {
        let mut queue = self.queue.lock().await;
        let current = queue.get(&status.job_id).map(|e| e.version);
        if current == Some(version) {
            queue.remove(&status.job_id);
            if let Err(e) = self.state.delete_job_status(&status.job_id) {
                error!(job_id = %status.job_id, error = %e, "failed to delete delivered status");
            }
        }
        if status.status == CheckStatus::Completed {
            let record = CheckRunRecord {
                job_id: status.job_id.clone(),
                check_run_id,
                completed: true,
                updated_at: epoch_secs(),
            };
            if let Err(e) = self.state.put_check_run(&record) {
                warn!(job_id = %status.job_id, error = %e, "failed to mark check run completed");
            }
        }
        drop(queue);

        self.delivered_total.fetch_add(1, Ordering::Relaxed);
        let _ = self.events.send(StatusEvent::Delivered {
            job_id: status.job_id.clone(),
            check_run_id,
            status: status.status,
        });
    }

    async fn fail(&self, status: &JobStatus, error: &str, attempts: u32) {
        let mut failed_status = status.clone();
        let mut queue = self.queue.lock().await;
        // Keep the newest state (and any check-run id obtained meanwhile).
        if let Some(entry) = queue.remove(&status.job_id) {
            failed_status = entry.status;
        }
        let report = FailedReport {
            status: failed_status.clone(),
            error: error.to_string(),
            attempts,
            failed_at: epoch_secs(),
        };
        if let Err(e) = self.state.put_failed_report(&report) {
            error!(job_id = %status.job_id, error = %e, "failed to persist failed report");
        }
        if let Err(e) = self.state.delete_job_status(&status.job_id) {
            error!(job_id = %status.job_id, error = %e, "failed to delete undeliverable status");
        }
        drop(queue);

        error!(
            job_id = %status.job_id,
            repository = %status.repository,
            attempts,
            %error,
            "status delivery exhausted retries"
        );
        let _ = self.events.send(StatusEvent::Failed {
            status: Box::new(failed_status),
            error: error.to_string(),
            attempts,
        });
    }

    // ── Failed reports ─────────────────────────────────────────────

    pub fn failed_reports(&self) -> ReportResult<Vec<FailedReport>> {
        Ok(self.state.list_failed_reports()?)
    }

    /// Move a failed report back into the queue. Returns false if none exists.
    pub async fn replay_failed(&self, job_id: &str) -> ReportResult<bool> {
        let Some(report) = self.state.get_failed_report(job_id)? else {
            return Ok(false);
        };
        let mut status = report.status;
        if status.check_run_id.is_none() {
            status.check_run_id = self.state.get_check_run(job_id)?.map(|r| r.check_run_id);
        }

        let mut queue = self.queue.lock().await;
        if queue.contains_key(job_id) {
            // A newer report already supersedes the failed one.
            drop(queue);
            self.state.delete_failed_report(job_id)?;
            return Ok(true);
        }
        self.state.put_job_status(&status)?;
        self.state.delete_failed_report(job_id)?;
        queue.insert(
            job_id.to_string(),
            QueueEntry {
                status,
                version: 1,
                opening: None,
            },
        );
        drop(queue);

        info!(%job_id, "failed report requeued");
        self.flush_now.notify_one();
        Ok(true)
    }

    /// Forget completed check runs older than the retention period.
    pub fn prune_check_runs(&self) -> ReportResult<usize> {
        let before = epoch_secs().saturating_sub(self.settings.check_run_retention.as_secs());
        Ok(self.state.prune_check_runs(before)?)
    }

    // ── Introspection ──────────────────────────────────────────────

    pub async fn queue_size(&self) -> usize {
        self.queue.lock().await.len()
    }

    pub async fn queued_status(&self, job_id: &str) -> Option<JobStatus> {
        self.queue.lock().await.get(job_id).map(|e| e.status.clone())
    }

    pub async fn health(&self) -> ReporterHealth {
        let failed_reports = match self.state.list_failed_reports() {
            Ok(reports) => reports.len(),
            Err(e) => {
                warn!(error = %e, "failed to count failed reports");
                0
            }
        };
        ReporterHealth {
            queue_size: self.queue_size().await,
            failed_reports,
            delivered_total: self.delivered_total.load(Ordering::Relaxed),
            last_flush_error: self.last_flush_error.lock().await.clone(),
        }
    }

    // ── Loop ───────────────────────────────────────────────────────

    /// Flush on the interval or when the batch fills, until shutdown.
    /// On shutdown the queue is drained once more.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_ms = self.settings.flush_interval.as_millis() as u64,
            batch_size = self.settings.batch_size,
            "status reporter started"
        );

        let mut last_prune = Instant::now();
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.settings.flush_interval) => {
                    self.flush().await;
                    if last_prune.elapsed() >= PRUNE_EVERY {
                        last_prune = Instant::now();
                        if let Err(e) = self.prune_check_runs() {
                            warn!(error = %e, "check run pruning failed");
                        }
                    }
                }
                _ = self.flush_now.notified() => {
                    self.flush().await;
                }
                _ = shutdown.changed() => {
                    let summary = self.flush().await;
                    info!(
                        delivered = summary.delivered,
                        failed = summary.failed,
                        pending = summary.pending,
                        "status reporter shutting down"
                    );
                    break;
                }
            }
        }
    }
}

fn validate(job: &JobContext) -> ReportResult<()> {
    if job.job_id.trim().is_empty() {
        return Err(ReportError::InvalidReport("job id must not be empty".to_string()));
    }
    if job.head_sha.trim().is_empty() {
        return Err(ReportError::InvalidReport(format!("job {} has no head sha", job.job_id)));
    }
    match job.repository.split_once('/') {
        Some((owner, name)) if !owner.is_empty() && !name.is_empty() => Ok(()),
        _ => Err(ReportError::InvalidReport(format!(
            "repository '{}' must be owner/name",
            job.repository
        ))),
    }
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
    use std::sync::Mutex as StdMutex;

    use async_trait::async_trait;

    #[derive(Debug, Clone, PartialEq)]
    enum Call {
        Create(String, CreateCheckRun),
        Update(String, u64, UpdateCheckRun),
    }

    /// Records calls; the first `failures` calls fail.
    #[derive(Default)]
    struct RecordingApi {
        calls: StdMutex<Vec<Call>>,
        failures: StdMutex<u32>,
        next_id: StdMutex<u64>,
    }

    impl RecordingApi {
        fn failing(failures: u32) -> Arc<Self> {
            Arc::new(Self {
                failures: StdMutex::new(failures),
                ..Self::default()
            })
        }

        fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().clone()
        }

        fn creates(&self) -> usize {
            self.calls().iter().filter(|c| matches!(c, Call::Create(..))).count()
        }

        fn should_fail(&self) -> bool {
            let mut failures = self.failures.lock().unwrap();
            if *failures > 0 {
                *failures -= 1;
                true
            } else {
                false
            }
        }
    }

    #[async_trait]
    impl CheckRunApi for RecordingApi {
        async fn create_check_run(&self, repository: &str, request: &CreateCheckRun) -> anyhow::Result<u64> {
            self.calls
                .lock()
                .unwrap()
                .push(Call::Create(repository.to_string(), request.clone()));
            if self.should_fail() {
                anyhow::bail!("502 Bad Gateway");
            }
            let mut next = self.next_id.lock().unwrap();
            *next += 1;
            Ok(100 + *next)
        }

        async fn update_check_run(
            &self,
            repository: &str,
            check_run_id: u64,
            request: &UpdateCheckRun,
        ) -> anyhow::Result<()> {
            self.calls
                .lock()
                .unwrap()
                .push(Call::Update(repository.to_string(), check_run_id, request.clone()));
            if self.should_fail() {
                anyhow::bail!("502 Bad Gateway");
            }
            Ok(())
        }
    }

    fn settings() -> ReporterSettings {
        ReporterSettings {
            flush_interval: Duration::from_millis(20),
            batch_size: 10,
            max_attempts: 3,
            retry_base_delay: Duration::from_millis(1),
            request_timeout: Duration::from_secs(1),
            check_name: "runnergrid".to_string(),
            check_run_retention: Duration::from_secs(3600),
        }
    }

    fn job(id: &str) -> JobContext {
        JobContext {
            job_id: id.to_string(),
            repository: "acme/api".to_string(),
            head_sha: "abc123".to_string(),
            run_id: 99,
            name: "build".to_string(),
        }
    }

    fn reporter(api: Arc<RecordingApi>) -> (StatusReporter, StateStore) {
        let state = StateStore::open_in_memory().unwrap();
        (StatusReporter::new(state.clone(), api, settings()), state)
    }

    #[tokio::test]
    async fn failure_report_creates_one_check_run() {
        let api = Arc::new(RecordingApi::default());
        let (reporter, state) = reporter(api.clone());

        reporter
            .report_job_completed(&job("x"), Conclusion::Failure, None, Vec::new())
            .await
            .unwrap();
        // Persisted before the call returned.
        assert!(state.get_job_status("x").unwrap().is_some());
        assert_eq!(reporter.queue_size().await, 1);

        let summary = reporter.flush().await;
        assert_eq!(summary.delivered, 1);

        let calls = api.calls();
        assert_eq!(calls.len(), 1);
        let Call::Create(repo, body) = &calls[0] else {
            panic!("expected a create call");
        };
        assert_eq!(repo, "acme/api");
        assert_eq!(body.conclusion, Some(Conclusion::Failure));
        assert!(body.output.as_ref().unwrap().title.contains("Failed"));

        assert_eq!(reporter.queue_size().await, 0);
        assert!(state.get_job_status("x").unwrap().is_none());
    }

    #[tokio::test]
    async fn entry_stays_queued_until_confirmed() {
        let api = RecordingApi::failing(1);
        let (reporter, state) = reporter(api.clone());

        reporter.report_job_started(&job("x")).await.unwrap();
        let summary = reporter.flush().await;

        // First attempt failed, the retry succeeded.
        assert_eq!(summary.delivered, 1);
        assert_eq!(api.creates(), 2);
        assert!(state.get_job_status("x").unwrap().is_none());
    }

    #[tokio::test]
    async fn started_then_completed_is_create_then_update() {
        let api = Arc::new(RecordingApi::default());
        let (reporter, state) = reporter(api.clone());

        reporter.report_job_started(&job("x")).await.unwrap();
        reporter.flush().await;
        assert_eq!(state.get_check_run("x").unwrap().unwrap().check_run_id, 101);

        reporter
            .report_job_completed(&job("x"), Conclusion::Success, None, Vec::new())
            .await
            .unwrap();
        reporter.flush().await;

        let calls = api.calls();
        assert_eq!(calls.len(), 2);
        assert!(matches!(&calls[0], Call::Create(_, b) if b.status == CheckStatus::InProgress));
        match &calls[1] {
            Call::Update(_, id, body) => {
                assert_eq!(*id, 101);
                assert_eq!(body.conclusion, Some(Conclusion::Success));
                assert_eq!(body.output.as_ref().unwrap().title, "Job Succeeded");
            }
            other => panic!("expected update, got {other:?}"),
        }
        // The mapping outlives completion, marked closed.
        let record = state.get_check_run("x").unwrap().unwrap();
        assert_eq!(record.check_run_id, 101);
        assert!(record.completed);
    }

    #[tokio::test]
    async fn started_and_completed_in_one_flush_shows_both_phases() {
        let api = Arc::new(RecordingApi::default());
        let (reporter, state) = reporter(api.clone());

        reporter.report_job_started(&job("x")).await.unwrap();
        reporter
            .report_job_completed(&job("x"), Conclusion::Success, None, Vec::new())
            .await
            .unwrap();
        let summary = reporter.flush().await;
        assert_eq!(summary.delivered, 1);

        let calls = api.calls();
        assert_eq!(calls.len(), 2);
        match &calls[0] {
            Call::Create(_, body) => {
                assert_eq!(body.status, CheckStatus::InProgress);
                assert_eq!(body.conclusion, None);
            }
            other => panic!("expected create, got {other:?}"),
        }
        match &calls[1] {
            Call::Update(_, 101, body) => {
                assert_eq!(body.status, CheckStatus::Completed);
                assert_eq!(body.conclusion, Some(Conclusion::Success));
            }
            other => panic!("expected update of 101, got {other:?}"),
        }
        assert!(state.get_check_run("x").unwrap().unwrap().completed);
        assert_eq!(reporter.queue_size().await, 0);
    }

    #[tokio::test]
    async fn late_step_after_completion_is_dropped() {
        let api = Arc::new(RecordingApi::default());
        let (reporter, state) = reporter(api.clone());

        reporter.report_job_started(&job("x")).await.unwrap();
        reporter.flush().await;
        reporter
            .report_job_completed(&job("x"), Conclusion::Success, None, Vec::new())
            .await
            .unwrap();
        reporter.flush().await;

        let late = StepStatus {
            number: 3,
            name: "upload".to_string(),
            status: CheckStatus::InProgress,
            conclusion: None,
            started_at: None,
            completed_at: None,
        };
        reporter.report_step_status(&job("x"), late).await.unwrap();
        reporter.report_logs(&job("x"), "trailing output").await.unwrap();
        assert_eq!(reporter.queue_size().await, 0);
        assert!(state.get_job_status("x").unwrap().is_none());

        reporter.flush().await;
        assert_eq!(api.creates(), 1);
        assert_eq!(api.calls().len(), 2);
    }

    #[tokio::test]
    async fn repeated_completion_updates_the_same_check_run() {
        let api = Arc::new(RecordingApi::default());
        let (reporter, _) = reporter(api.clone());

        reporter
            .report_job_completed(&job("x"), Conclusion::Failure, None, Vec::new())
            .await
            .unwrap();
        reporter.flush().await;
        reporter
            .report_job_completed(&job("x"), Conclusion::Success, None, Vec::new())
            .await
            .unwrap();
        reporter.flush().await;

        let calls = api.calls();
        assert_eq!(api.creates(), 1);
        match calls.last() {
            Some(Call::Update(_, 101, body)) => assert_eq!(body.conclusion, Some(Conclusion::Success)),
            other => panic!("expected update of 101, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn pruning_forgets_old_completed_check_runs() {
        let api = Arc::new(RecordingApi::default());
        let state = StateStore::open_in_memory().unwrap();
        let reporter = StatusReporter::new(
            state.clone(),
            api,
            ReporterSettings {
                check_run_retention: Duration::ZERO,
                ..settings()
            },
        );
        state
            .put_check_run(&CheckRunRecord {
                job_id: "old".to_string(),
                check_run_id: 7,
                completed: true,
                updated_at: 0,
            })
            .unwrap();
        state
            .put_check_run(&CheckRunRecord {
                job_id: "open".to_string(),
                check_run_id: 8,
                completed: false,
                updated_at: 0,
            })
            .unwrap();

        assert_eq!(reporter.prune_check_runs().unwrap(), 1);
        assert!(state.get_check_run("old").unwrap().is_none());
        assert!(state.get_check_run("open").unwrap().is_some());
    }

    #[tokio::test]
    async fn restart_after_create_does_not_create_again() {
        let api = Arc::new(RecordingApi::default());
        let state = StateStore::open_in_memory().unwrap();
        let first = StatusReporter::new(state.clone(), api.clone(), settings());
        first.report_job_started(&job("x")).await.unwrap();
        first.flush().await;
        first
            .report_job_completed(&job("x"), Conclusion::Cancelled, None, Vec::new())
            .await
            .unwrap();
        drop(first);

        // "Crash": a new reporter over the same store.
        let second = StatusReporter::new(state.clone(), api.clone(), settings());
        assert_eq!(second.recover().await.unwrap(), 1);
        assert_eq!(second.queued_status("x").await.unwrap().check_run_id, Some(101));
        second.flush().await;

        assert_eq!(api.creates(), 1);
        assert!(matches!(api.calls().last(), Some(Call::Update(_, 101, _))));
    }

    #[tokio::test]
    async fn exhausted_retries_become_failed_report() {
        let api = RecordingApi::failing(10);
        let (reporter, state) = reporter(api.clone());
        let mut events = reporter.subscribe();

        reporter.report_job_started(&job("x")).await.unwrap();
        let summary = reporter.flush().await;

        assert_eq!(summary.failed, 1);
        assert_eq!(api.calls().len(), 3);
        assert_eq!(reporter.queue_size().await, 0);
        assert!(state.get_job_status("x").unwrap().is_none());

        let failed = reporter.failed_reports().unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].attempts, 3);
        assert!(failed[0].error.contains("502"));

        match events.recv().await.unwrap() {
            StatusEvent::Failed { status, attempts, .. } => {
                assert_eq!(status.job_id, "x");
                assert_eq!(attempts, 3);
            }
            other => panic!("unexpected event {other:?}"),
        }

        let health = reporter.health().await;
        assert_eq!(health.failed_reports, 1);
        assert!(health.last_flush_error.is_some());
    }

    #[tokio::test]
    async fn replay_requeues_failed_report() {
        let api = RecordingApi::failing(3);
        let (reporter, _) = reporter(api.clone());

        reporter.report_job_started(&job("x")).await.unwrap();
        reporter.flush().await;
        assert!(reporter.replay_failed("x").await.unwrap());
        assert!(!reporter.replay_failed("x").await.unwrap());
        assert_eq!(reporter.queue_size().await, 1);

        let summary = reporter.flush().await;
        assert_eq!(summary.delivered, 1);
        assert!(reporter.failed_reports().unwrap().is_empty());
        assert_eq!(reporter.health().await.delivered_total, 1);
    }

    #[tokio::test]
    async fn steps_coalesce_and_render() {
        let api = Arc::new(RecordingApi::default());
        let (reporter, _) = reporter(api.clone());
        let step = |number, name: &str, conclusion| StepStatus {
            number,
            name: name.to_string(),
            status: CheckStatus::Completed,
            conclusion: Some(conclusion),
            started_at: None,
            completed_at: None,
        };

        reporter.report_step_status(&job("x"), step(2, "test", Conclusion::Failure)).await.unwrap();
        reporter.report_step_status(&job("x"), step(1, "checkout", Conclusion::Success)).await.unwrap();
        reporter.report_step_status(&job("x"), step(2, "test", Conclusion::Success)).await.unwrap();
        reporter.report_logs(&job("x"), "line 1\nline 2").await.unwrap();

        let status = reporter.queued_status("x").await.unwrap();
        assert_eq!(status.status, CheckStatus::InProgress);
        assert_eq!(status.steps.len(), 2);
        let text = status.output.unwrap().text.unwrap();
        assert!(text.contains("| 2 | test | completed | Succeeded |"));
        assert!(text.contains("line 2"));
        assert!(text.find("### Steps") < text.find("### Logs"));
    }

    #[tokio::test]
    async fn custom_output_and_annotations_are_kept() {
        let api = Arc::new(RecordingApi::default());
        let (reporter, _) = reporter(api.clone());
        let output = CheckOutput {
            title: "3 tests failed".to_string(),
            summary: "see annotations".to_string(),
            text: None,
        };
        let annotation = Annotation {
            path: "src/lib.rs".to_string(),
            start_line: 10,
            end_line: 10,
            annotation_level: "failure".to_string(),
            message: "assertion failed".to_string(),
            title: None,
        };

        reporter
            .report_job_completed(&job("x"), Conclusion::Failure, Some(output), vec![annotation])
            .await
            .unwrap();
        reporter.flush().await;

        let Call::Create(_, body) = &api.calls()[0] else {
            panic!("expected create");
        };
        let out = body.output.as_ref().unwrap();
        assert_eq!(out.title, "3 tests failed");
        assert_eq!(out.annotations.len(), 1);
    }

    #[tokio::test]
    async fn invalid_context_is_rejected() {
        let api = Arc::new(RecordingApi::default());
        let (reporter, _) = reporter(api);
        let mut bad = job("x");
        bad.repository = "no-slash".to_string();
        assert!(matches!(
            reporter.report_job_started(&bad).await,
            Err(ReportError::InvalidReport(_))
        ));
        assert_eq!(reporter.queue_size().await, 0);
    }

    #[tokio::test]
    async fn full_batch_triggers_flush_and_shutdown_drains() {
        let api = Arc::new(RecordingApi::default());
        let state = StateStore::open_in_memory().unwrap();
        let reporter = Arc::new(StatusReporter::new(
            state,
            api.clone(),
            ReporterSettings {
                flush_interval: Duration::from_secs(3600),
                batch_size: 2,
                ..settings()
            },
        ));
        let (tx, rx) = watch::channel(false);
        let handle = {
            let reporter = reporter.clone();
            tokio::spawn(async move { reporter.run(rx).await })
        };

        reporter.report_job_started(&job("a")).await.unwrap();
        reporter.report_job_started(&job("b")).await.unwrap();
        for _ in 0..50 {
            if api.creates() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(api.creates(), 2);

        reporter.report_job_started(&job("c")).await.unwrap();
        tx.send(true).unwrap();
        handle.await.unwrap();
        assert_eq!(api.creates(), 3);
        assert_eq!(reporter.queue_size().await, 0);
    }

    #[tokio::test]
    async fn on_disk_queue_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("reporter.redb");
        let api = Arc::new(RecordingApi::default());
        {
            let state = StateStore::open(&path).unwrap();
            let reporter = StatusReporter::new(state, api.clone(), settings());
            reporter.report_job_started(&job("x")).await.unwrap();
        }
        let state = StateStore::open(&path).unwrap();
        let reporter = StatusReporter::new(state, api.clone(), settings());
        assert_eq!(reporter.recover().await.unwrap(), 1);
        assert_eq!(reporter.flush().await.delivered, 1);
    }
}
