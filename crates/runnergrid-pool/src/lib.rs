//! runnergrid-pool — runner pools and container assignment.
//!
//! [`StatePool`] implements the [`RunnerPool`](runnergrid_state::RunnerPool)
//! collaborator on top of the state store: pools are created lazily,
//! warmed up to their minimum, and resized through a [`ContainerRuntime`].
//!
//! [`ContainerAssignment`] binds jobs to ready runners picked from a
//! routing decision, tracks runner liveness, and classifies pool health
//! from the share of usable runners.

pub mod assignment;
pub mod error;
pub mod health;
pub mod runtime;
pub mod store;

pub use assignment::{
    Assignment, AssignmentEvent, AssignmentStatistics, ContainerAssignment, PoolStatistics,
    ReleaseOutcome, RunnerSlot, SlotState,
};
pub use error::{PoolError, PoolResult};
pub use health::{HealthLevel, HealthReport, HealthThresholds};
pub use runtime::{ContainerRuntime, DryRunRuntime};
pub use store::{PoolDefaults, StatePool};
