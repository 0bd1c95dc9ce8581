//! Container runtime interface and dry-run implementation.
//!
//! The concrete runtime (image pulls, container start/stop) lives outside
//! this workspace. [`DryRunRuntime`] stands in for it during development
//! and in tests.

use std::collections::{BTreeSet, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

use anyhow::Result;
use async_trait::async_trait;
use tracing::info;

/// Starts, stops and inspects runner containers.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Start a runner container for a pool and return its runner id.
    async fn provision(&self, repository: &str, labels: &BTreeSet<String>) -> Result<String>;

    /// Stop and remove a runner container.
    async fn terminate(&self, repository: &str, runner_id: &str) -> Result<()>;

    /// Whether the runner's container is still running.
    async fn is_alive(&self, repository: &str, runner_id: &str) -> Result<bool>;
}

/// Runtime that mints runner ids and logs instead of touching containers.
///
/// It remembers the runners it started in this process, so runners
/// restored from an earlier run report as exited.
pub struct DryRunRuntime {
    provisioned: AtomicU64,
    fail_provision: bool,
    unreachable: AtomicBool,
    running: Mutex<HashSet<String>>,
}

impl DryRunRuntime {
    pub fn new() -> Self {
        Self {
            provisioned: AtomicU64::new(0),
            fail_provision: false,
            unreachable: AtomicBool::new(false),
            running: Mutex::new(HashSet::new()),
        }
    }

    /// A runtime whose every `provision` call fails.
    pub fn failing() -> Self {
        Self {
            fail_provision: true,
            ..Self::new()
        }
    }

    /// Number of runners provisioned so far.
    pub fn provisioned(&self) -> u64 {
        self.provisioned.load(Ordering::SeqCst)
    }

    /// Simulate a runner container exiting on its own.
    pub fn exit(&self, runner_id: &str) -> bool {
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(runner_id)
    }

    /// Make liveness queries fail until reset.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }
}

impl Default for DryRunRuntime {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ContainerRuntime for DryRunRuntime {
    async fn provision(&self, repository: &str, labels: &BTreeSet<String>) -> Result<String> {
        if self.fail_provision {
            anyhow::bail!("dry-run runtime configured to fail provisioning");
        }
        self.provisioned.fetch_add(1, Ordering::SeqCst);
        let simple = uuid::Uuid::new_v4().simple().to_string();
        let runner_id = format!("runner-{}", &simple[..12]);
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(runner_id.clone());
        info!(%repository, %runner_id, ?labels, "[dry-run] provisioning runner");
        Ok(runner_id)
    }

    async fn terminate(&self, repository: &str, runner_id: &str) -> Result<()> {
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(runner_id);
        info!(%repository, %runner_id, "[dry-run] terminating runner");
        Ok(())
    }

    async fn is_alive(&self, _repository: &str, runner_id: &str) -> Result<bool> {
        if self.unreachable.load(Ordering::SeqCst) {
            anyhow::bail!("dry-run runtime unreachable");
        }
        Ok(self
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(runner_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn tracks_running_containers() {
        let runtime = DryRunRuntime::new();
        let id = runtime.provision("acme/api", &BTreeSet::new()).await.unwrap();
        assert!(runtime.is_alive("acme/api", &id).await.unwrap());

        assert!(runtime.exit(&id));
        assert!(!runtime.is_alive("acme/api", &id).await.unwrap());

        runtime.set_unreachable(true);
        assert!(runtime.is_alive("acme/api", &id).await.is_err());
    }
}
