//! runnergrid-routing — maps incoming jobs to candidate runners.
//!
//! Rules are evaluated highest priority first (insertion order breaks
//! ties). The first rule whose conditions all hold selects the pool and
//! the runner-label subset; no match falls through to default routing.
//!
//! # Routing Algorithm
//!
//! ```text
//! for rule in enabled rules (priority desc, stable):
//!     if repo ~ pattern && branch == ref && rule.labels ⊆ job.labels:
//!         pool    = rule.pool_override or job.repository
//!         targets = pool runners carrying rule.runner_labels
//!         return targets, or every pool runner if targets is empty
//!
//! targets = pool runners sharing at least one label with the job
//! return targets, or every pool runner if targets is empty
//! ```
//!
//! Routing never fails: an empty pool yields an empty decision whose
//! reason says so, and the caller treats it as "no capacity".

pub mod engine;
pub mod error;
pub mod rules;

pub use engine::{DecisionKind, MatchedRule, RoutingDecision, RoutingEngine, RuleTestResult};
pub use error::{RoutingError, RoutingResult};
pub use rules::{RuleDefinition, RuleUpdate};
