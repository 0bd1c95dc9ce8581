//! Scaling policy definitions and validation.

use serde::{Deserialize, Serialize};

use runnergrid_core::PolicyConfig;
use runnergrid_state::ScalingPolicy;

use crate::error::{AutoscaleError, AutoscaleResult};

/// Caller-supplied policy body.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PolicySpec {
    pub min_runners: u32,
    pub max_runners: u32,
    pub scale_up_threshold: f64,
    pub scale_down_threshold: f64,
    pub scale_increment: u32,
    pub cooldown_period_secs: u64,
}

impl From<&PolicyConfig> for PolicySpec {
    fn from(config: &PolicyConfig) -> Self {
        Self {
            min_runners: config.min_runners,
            max_runners: config.max_runners,
            scale_up_threshold: config.scale_up_threshold,
            scale_down_threshold: config.scale_down_threshold,
            scale_increment: config.scale_increment,
            cooldown_period_secs: config.cooldown_secs(),
        }
    }
}

impl PolicySpec {
    pub fn validate(&self) -> AutoscaleResult<()> {
        if self.max_runners == 0 {
            return Err(invalid("max_runners must be at least 1"));
        }
        if self.min_runners > self.max_runners {
            return Err(invalid(format!(
                "min_runners ({}) exceeds max_runners ({})",
                self.min_runners, self.max_runners
            )));
        }
        if self.scale_increment == 0 {
            return Err(invalid("scale_increment must be at least 1"));
        }
        let unit = 0.0..=1.0;
        if !unit.contains(&self.scale_up_threshold) || !unit.contains(&self.scale_down_threshold) {
            return Err(invalid("thresholds must lie within 0.0..=1.0"));
        }
        if self.scale_down_threshold >= self.scale_up_threshold {
            return Err(invalid(format!(
                "scale_down_threshold ({}) must be below scale_up_threshold ({})",
                self.scale_down_threshold, self.scale_up_threshold
            )));
        }
        Ok(())
    }

    pub fn into_policy(self, repository: &str, updated_at: u64) -> ScalingPolicy {
        ScalingPolicy {
            repository: repository.to_string(),
            min_runners: self.min_runners,
            max_runners: self.max_runners,
            scale_up_threshold: self.scale_up_threshold,
            scale_down_threshold: self.scale_down_threshold,
            scale_increment: self.scale_increment,
            cooldown_period_secs: self.cooldown_period_secs,
            updated_at,
        }
    }
}

fn invalid(msg: impl Into<String>) -> AutoscaleError {
    AutoscaleError::InvalidPolicy(msg.into())
}
