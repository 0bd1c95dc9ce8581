//! End-to-end flow: route → assign → report → release → autoscale.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;

use runnergrid_autoscale::PolicySpec;
use runnergrid_core::GridConfig;
use runnergrid_pool::{DryRunRuntime, ReleaseOutcome};
use runnergrid_reporter::{CheckRunApi, CreateCheckRun, JobContext, UpdateCheckRun};
use runnergrid_routing::{DecisionKind, RuleDefinition};
use runnergrid_state::*;
use runnergridd::{Dispatch, Grid};

const REPO: &str = "acme/api";

#[derive(Default)]
struct RecordingChecks {
    creates: Mutex<Vec<CreateCheckRun>>,
    updates: Mutex<Vec<(u64, UpdateCheckRun)>>,
}

#[async_trait]
impl CheckRunApi for RecordingChecks {
    async fn create_check_run(&self, _repository: &str, request: &CreateCheckRun) -> anyhow::Result<u64> {
        let mut creates = self.creates.lock().unwrap();
        creates.push(request.clone());
        Ok(creates.len() as u64)
    }

    async fn update_check_run(
        &self,
        _repository: &str,
        check_run_id: u64,
        request: &UpdateCheckRun,
    ) -> anyhow::Result<()> {
        self.updates.lock().unwrap().push((check_run_id, request.clone()));
        Ok(())
    }
}

fn config() -> GridConfig {
    let mut config = GridConfig::default();
    config.pool.min_runners = 1;
    config.pool.max_runners = 3;
    config.pool.scale_increment = 1;
    config.reporter.flush_interval = "1h".to_string();
    config
}

fn grid(checks: Arc<RecordingChecks>) -> Grid {
    let state = StateStore::open_in_memory().unwrap();
    Grid::new(config(), state, Arc::new(DryRunRuntime::new()), checks)
}

fn job(id: &str, labels: &[&str]) -> JobRequest {
    JobRequest {
        id: id.to_string(),
        repository: REPO.to_string(),
        workflow: "ci".to_string(),
        git_ref: "main".to_string(),
        labels: labels.iter().map(|l| l.to_string()).collect::<BTreeSet<_>>(),
        priority: 0,
    }
}

fn context(id: &str) -> JobContext {
    JobContext {
        job_id: id.to_string(),
        repository: REPO.to_string(),
        head_sha: "deadbeef".to_string(),
        run_id: 1,
        name: format!("build-{id}"),
    }
}

fn tight_policy() -> PolicySpec {
    PolicySpec {
        min_runners: 1,
        max_runners: 3,
        scale_up_threshold: 0.8,
        scale_down_threshold: 0.2,
        scale_increment: 1,
        cooldown_period_secs: 0,
    }
}

#[tokio::test]
async fn job_lifecycle_drives_pool_and_check_runs() {
    let checks = Arc::new(RecordingChecks::default());
    let grid = grid(checks.clone());
    grid.autoscaler.set_policy(REPO, tight_policy()).unwrap();

    // First job lands on the warmed-up runner.
    let first = grid.dispatch(&job("j1", &["linux"]), &context("j1")).await.unwrap();
    let Dispatch::Assigned { decision, assignment } = first else {
        panic!("expected j1 to be assigned");
    };
    assert_eq!(decision.kind, DecisionKind::DefaultRouting);
    assert_eq!(assignment.repository, REPO);

    // Second job finds no ready runner and stays queued.
    let second = grid.dispatch(&job("j2", &["linux"]), &context("j2")).await.unwrap();
    assert!(matches!(second, Dispatch::Queued { .. }));
    assert_eq!(grid.state.get_job(REPO, "j2").unwrap().unwrap().state, JobState::Queued);

    // Saturated pool with a queued job scales up.
    let up = grid.autoscaler.evaluate_now(REPO).await;
    assert_eq!(up.action, ScalingAction::ScaleUp);
    assert!(up.executed);
    assert_eq!(up.target_runners, 2);

    let retried = grid.dispatch(&job("j2", &["linux"]), &context("j2")).await.unwrap();
    let Dispatch::Assigned { assignment: second_assignment, .. } = retried else {
        panic!("expected j2 to be assigned after scale-up");
    };
    assert_ne!(second_assignment.runner_id, assignment.runner_id);

    let summary = grid.reporter.flush().await;
    assert_eq!(summary.delivered, 2);
    assert_eq!(checks.creates.lock().unwrap().len(), 2);

    // Both jobs finish; the first one failed.
    let released = grid.complete(&context("j1"), Conclusion::Failure, None).await.unwrap();
    assert_eq!(released, ReleaseOutcome::Ready);
    grid.complete(&context("j2"), Conclusion::Success, None).await.unwrap();
    assert!(grid.state.get_job(REPO, "j1").unwrap().is_none());
    assert!(grid.state.list_jobs_for_repository(REPO).unwrap().is_empty());

    grid.reporter.flush().await;
    {
        let creates = checks.creates.lock().unwrap();
        let updates = checks.updates.lock().unwrap();
        assert_eq!(creates.len(), 2, "completion must update, not create");
        assert_eq!(updates.len(), 2);
        let j1 = updates
            .iter()
            .find(|(id, _)| {
                let create = &creates[(*id - 1) as usize];
                create.external_id == "j1"
            })
            .map(|(_, u)| u.clone())
            .unwrap();
        assert_eq!(j1.conclusion, Some(Conclusion::Failure));
        assert_eq!(j1.output.unwrap().title, "Job Failed");
    }

    // Idle pool with an empty queue scales back down.
    let down = grid.autoscaler.evaluate_now(REPO).await;
    assert_eq!(down.action, ScalingAction::ScaleDown);
    assert!(down.executed);
    assert_eq!(grid.state.list_runners_for_pool(REPO).unwrap().len(), 1);
}

#[tokio::test]
async fn routing_rule_targets_labelled_runners() {
    let checks = Arc::new(RecordingChecks::default());
    let grid = grid(checks);

    let definition = RuleDefinition {
        name: "self-hosted pool".to_string(),
        priority: 10,
        conditions: RuleConditions {
            repository: Some("acme/*".to_string()),
            ..RuleConditions::default()
        },
        targets: RuleTargets {
            runner_labels: ["self-hosted".to_string()].into_iter().collect(),
            pool_override: None,
        },
        enabled: true,
    };

    // A dry run against an unknown pool leaves the store untouched.
    let dry_run = grid.routing.test_routing_rule(&definition, &job("sample", &[])).await;
    assert!(dry_run.matched);
    assert_eq!(dry_run.target_count, 0);
    assert!(grid.state.get_pool(REPO).unwrap().is_none());

    grid.pools.get_or_create_pool(REPO).await.unwrap();
    let dry_run = grid.routing.test_routing_rule(&definition, &job("sample", &[])).await;
    assert_eq!(dry_run.target_count, 1);

    let rule = grid.routing.create_routing_rule(definition).unwrap();
    let dispatched = grid.dispatch(&job("j1", &[]), &context("j1")).await.unwrap();
    let Dispatch::Assigned { decision, .. } = dispatched else {
        panic!("expected assignment through the rule");
    };
    assert_eq!(decision.kind, DecisionKind::MatchedRule);
    assert_eq!(decision.matched_rule.unwrap().id, rule.id);
}

#[tokio::test]
async fn policy_minimum_above_pool_minimum_holds_on_scale_down() {
    let checks = Arc::new(RecordingChecks::default());
    let mut config = config();
    config.pool.max_runners = 6;
    let grid = Grid::new(
        config,
        StateStore::open_in_memory().unwrap(),
        Arc::new(DryRunRuntime::new()),
        checks,
    );
    grid.pools.scale_up(REPO, 4).await.unwrap();
    assert_eq!(grid.pools.pool_metrics(REPO).await.unwrap().total_runners, 5);

    grid.autoscaler
        .set_policy(
            REPO,
            PolicySpec {
                min_runners: 4,
                max_runners: 6,
                scale_increment: 3,
                ..tight_policy()
            },
        )
        .unwrap();

    let down = grid.autoscaler.evaluate_now(REPO).await;
    assert_eq!(down.action, ScalingAction::ScaleDown);
    assert!(down.executed);
    assert_eq!((down.amount, down.target_runners), (1, 4));
    assert_eq!(grid.state.list_runners_for_pool(REPO).unwrap().len(), 4);

    let again = grid.autoscaler.evaluate_now(REPO).await;
    assert_eq!(again.action, ScalingAction::Maintain);
    assert_eq!(grid.state.list_runners_for_pool(REPO).unwrap().len(), 4);
}

#[tokio::test]
async fn shutdown_drains_reporter_queue() {
    let checks = Arc::new(RecordingChecks::default());
    let grid = Arc::new(grid(checks.clone()));
    let (tx, rx) = watch::channel(false);

    let handles = grid.start(rx).await.unwrap();
    grid.dispatch(&job("j1", &["linux"]), &context("j1")).await.unwrap();
    assert_eq!(grid.reporter.queue_size().await, 1);

    tx.send(true).unwrap();
    for handle in handles {
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }

    assert_eq!(grid.reporter.queue_size().await, 0);
    assert_eq!(checks.creates.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn restart_resumes_pending_reports() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config();
    config.state.path = dir.path().join("state").join("runnergrid.redb");
    let checks = Arc::new(RecordingChecks::default());

    std::fs::create_dir_all(dir.path().join("state")).unwrap();

    {
        let state = StateStore::open(&config.state.path).unwrap();
        let grid = Grid::new(config.clone(), state, Arc::new(DryRunRuntime::new()), checks.clone());
        grid.dispatch(&job("j1", &["linux"]), &context("j1")).await.unwrap();
    }

    let state = StateStore::open(&config.state.path).unwrap();
    let grid = Arc::new(Grid::new(config, state, Arc::new(DryRunRuntime::new()), checks.clone()));
    let (tx, rx) = watch::channel(false);
    let handles = grid.start(rx).await.unwrap();
    assert_eq!(grid.reporter.queue_size().await, 1);
    assert_eq!(grid.autoscaler.tracked().await, vec![REPO.to_string()]);

    tx.send(true).unwrap();
    for handle in handles {
        handle.await.unwrap();
    }
    assert_eq!(checks.creates.lock().unwrap().len(), 1);
}
