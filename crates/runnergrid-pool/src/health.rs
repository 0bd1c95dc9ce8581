//! Pool health classification.

use serde::Serialize;

use runnergrid_core::AssignmentConfig;

/// Health of a pool (or the whole fleet) from the share of usable runners.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthLevel {
    Healthy,
    Degraded,
    Unhealthy,
}

impl std::fmt::Display for HealthLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            HealthLevel::Healthy => "healthy",
            HealthLevel::Degraded => "degraded",
            HealthLevel::Unhealthy => "unhealthy",
        })
    }
}

/// Ratio cut-offs for (ready + assigned) / total.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HealthThresholds {
    pub healthy_ratio: f64,
    pub degraded_ratio: f64,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            healthy_ratio: 0.8,
            degraded_ratio: 0.5,
        }
    }
}

impl From<&AssignmentConfig> for HealthThresholds {
    fn from(config: &AssignmentConfig) -> Self {
        Self {
            healthy_ratio: config.healthy_ratio,
            degraded_ratio: config.degraded_ratio,
        }
    }
}

impl HealthThresholds {
    /// Classify a pool. An empty pool has nothing unhealthy in it.
    pub fn classify(&self, usable: u32, total: u32) -> HealthLevel {
        if total == 0 {
            return HealthLevel::Healthy;
        }
        let ratio = f64::from(usable) / f64::from(total);
        if ratio >= self.healthy_ratio {
            HealthLevel::Healthy
        } else if ratio >= self.degraded_ratio {
            HealthLevel::Degraded
        } else {
            HealthLevel::Unhealthy
        }
    }
}

/// Fleet-wide and per-pool health.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct HealthReport {
    pub level: HealthLevel,
    /// (ready + assigned) / total across every pool; 1.0 when empty.
    pub usable_ratio: f64,
    pub pools: Vec<(String, HealthLevel)>,
}
