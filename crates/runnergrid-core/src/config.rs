//! runnergrid.toml configuration parser.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::duration::parse_duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GridConfig {
    pub state: StateConfig,
    pub pool: PoolDefaultsConfig,
    pub assignment: AssignmentConfig,
    pub autoscale: AutoscaleConfig,
    pub reporter: ReporterConfig,
    pub github: GithubConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StateConfig {
    /// Path of the redb database file.
    pub path: PathBuf,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/var/lib/runnergrid/runnergrid.redb"),
        }
    }
}

/// Bounds and labels applied to pools created on first reference.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolDefaultsConfig {
    pub min_runners: u32,
    pub max_runners: u32,
    pub scale_increment: u32,
    pub scale_threshold: f64,
    pub runner_labels: Vec<String>,
}

impl Default for PoolDefaultsConfig {
    fn default() -> Self {
        Self {
            min_runners: 1,
            max_runners: 10,
            scale_increment: 2,
            scale_threshold: 0.8,
            runner_labels: vec!["self-hosted".to_string(), "linux".to_string()],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AssignmentConfig {
    pub health_check_interval: String,
    /// A runner silent for longer than this is marked unhealthy.
    pub liveness_timeout: String,
    /// (ready + assigned) / total at or above this ratio is healthy.
    pub healthy_ratio: f64,
    /// At or above this ratio (and below `healthy_ratio`) is degraded.
    pub degraded_ratio: f64,
}

impl Default for AssignmentConfig {
    fn default() -> Self {
        Self {
            health_check_interval: "15s".to_string(),
            liveness_timeout: "60s".to_string(),
            healthy_ratio: 0.8,
            degraded_ratio: 0.5,
        }
    }
}

impl AssignmentConfig {
    pub fn health_check_interval(&self) -> Duration {
        parse_duration(&self.health_check_interval).unwrap_or(Duration::from_secs(15))
    }

    pub fn liveness_timeout(&self) -> Duration {
        parse_duration(&self.liveness_timeout).unwrap_or(Duration::from_secs(60))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoscaleConfig {
    pub interval: String,
    /// Queue depth strictly above this triggers scale-up regardless of utilization.
    pub high_queue_depth: u32,
    pub history_retention: String,
    /// Hard cap on snapshots kept per repository.
    pub history_capacity: usize,
    pub min_prediction_samples: usize,
    /// Sample count at which prediction confidence stops growing.
    pub full_confidence_samples: usize,
    /// The `*` policy used when a repository has none of its own.
    pub default_policy: PolicyConfig,
}

impl Default for AutoscaleConfig {
    fn default() -> Self {
        Self {
            interval: "30s".to_string(),
            high_queue_depth: 5,
            history_retention: "1h".to_string(),
            history_capacity: 720,
            min_prediction_samples: 5,
            full_confidence_samples: 30,
            default_policy: PolicyConfig::default(),
        }
    }
}

impl AutoscaleConfig {
    pub fn interval(&self) -> Duration {
        parse_duration(&self.interval).unwrap_or(Duration::from_secs(30))
    }

    pub fn history_retention(&self) -> Duration {
        parse_duration(&self.history_retention).unwrap_or(Duration::from_secs(3600))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    pub min_runners: u32,
    pub max_runners: u32,
    pub scale_up_threshold: f64,
    pub scale_down_threshold: f64,
    pub scale_increment: u32,
    pub cooldown: String,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            min_runners: 1,
            max_runners: 10,
            scale_up_threshold: 0.8,
            scale_down_threshold: 0.2,
            scale_increment: 2,
            cooldown: "5m".to_string(),
        }
    }
}

impl PolicyConfig {
    pub fn cooldown_secs(&self) -> u64 {
        parse_duration(&self.cooldown)
            .unwrap_or(Duration::from_secs(300))
            .as_secs()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReporterConfig {
    pub flush_interval: String,
    /// Queue size that triggers an immediate flush.
    pub batch_size: usize,
    pub max_attempts: u32,
    pub retry_base_delay: String,
    pub request_timeout: String,
    /// Name shown on created check runs.
    pub check_name: String,
    /// How long a completed job's check-run id is kept for late reports.
    pub check_run_retention: String,
}

impl Default for ReporterConfig {
    fn default() -> Self {
        Self {
            flush_interval: "5s".to_string(),
            batch_size: 10,
            max_attempts: 3,
            retry_base_delay: "1s".to_string(),
            request_timeout: "10s".to_string(),
            check_name: "runnergrid".to_string(),
            check_run_retention: "168h".to_string(),
        }
    }
}

impl ReporterConfig {
    pub fn flush_interval(&self) -> Duration {
        parse_duration(&self.flush_interval).unwrap_or(Duration::from_secs(5))
    }

    pub fn retry_base_delay(&self) -> Duration {
        parse_duration(&self.retry_base_delay).unwrap_or(Duration::from_secs(1))
    }

    pub fn request_timeout(&self) -> Duration {
        parse_duration(&self.request_timeout).unwrap_or(Duration::from_secs(10))
    }

    pub fn check_run_retention(&self) -> Duration {
        parse_duration(&self.check_run_retention).unwrap_or(Duration::from_secs(168 * 3600))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GithubConfig {
    pub api_url: String,
    /// Environment variable holding the API token.
    pub token_env: String,
}

impl Default for GithubConfig {
    fn default() -> Self {
        Self {
            api_url: "https://api.github.com".to_string(),
            token_env: "GITHUB_TOKEN".to_string(),
        }
    }
}

impl GridConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: GridConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Reject combinations the components cannot run with.
    pub fn validate(&self) -> anyhow::Result<()> {
        let a = &self.assignment;
        if !(0.0..=1.0).contains(&a.degraded_ratio)
            || !(0.0..=1.0).contains(&a.healthy_ratio)
            || a.degraded_ratio > a.healthy_ratio
        {
            anyhow::bail!(
                "assignment ratios must satisfy 0 <= degraded_ratio ({}) <= healthy_ratio ({}) <= 1",
                a.degraded_ratio,
                a.healthy_ratio
            );
        }

        let p = &self.pool;
        if p.min_runners > p.max_runners {
            anyhow::bail!(
                "pool.min_runners ({}) exceeds pool.max_runners ({})",
                p.min_runners,
                p.max_runners
            );
        }

        let d = &self.autoscale.default_policy;
        if d.min_runners > d.max_runners {
            anyhow::bail!(
                "default policy min_runners ({}) exceeds max_runners ({})",
                d.min_runners,
                d.max_runners
            );
        }
        if d.scale_down_threshold >= d.scale_up_threshold {
            anyhow::bail!("default policy scale_down_threshold must be below scale_up_threshold");
        }

        if self.reporter.batch_size == 0 || self.reporter.max_attempts == 0 {
            anyhow::bail!("reporter.batch_size and reporter.max_attempts must be positive");
        }
        Ok(())
    }
}
