//! runnergrid-autoscale — keeps each repository's pool sized to its load.
//!
//! The [`AutoScaler`] reads pool metrics and queue statistics, applies the
//! repository's [`ScalingPolicy`](runnergrid_state::ScalingPolicy) and
//! issues at most one scale action per evaluation. Executed actions start
//! a cooldown window; evaluations inside it record `maintain`.
//!
//! Every evaluation lands in a bounded in-memory history which also feeds
//! [`predict`], a least-squares trend over recent utilization.

pub mod error;
pub mod history;
pub mod policy;
pub mod predict;
pub mod queue;
pub mod scaler;

pub use error::{AutoscaleError, AutoscaleResult};
pub use history::MetricsHistory;
pub use policy::PolicySpec;
pub use predict::Prediction;
pub use queue::{QueueStats, QueueStatsSource, StoreQueueStats};
pub use scaler::{AutoScaler, ScalerSettings, ScalingDecision, ScalingEvent};
