//! Rule definitions, validation and condition matching.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use runnergrid_state::{JobRequest, RuleConditions, RuleTargets, Runner};

use crate::error::{RoutingError, RoutingResult};

/// Caller-supplied rule body for create and dry-run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RuleDefinition {
    pub name: String,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub conditions: RuleConditions,
    #[serde(default)]
    pub targets: RuleTargets,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

/// Partial update; `None` fields keep their current value.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RuleUpdate {
    pub name: Option<String>,
    pub priority: Option<i32>,
    pub conditions: Option<RuleConditions>,
    pub targets: Option<RuleTargets>,
    pub enabled: Option<bool>,
}

/// Check a rule body before it is persisted.
pub fn validate(
    name: &str,
    conditions: &RuleConditions,
    targets: &RuleTargets,
) -> RoutingResult<()> {
    if name.trim().is_empty() {
        return Err(RoutingError::InvalidRule("name must not be empty".to_string()));
    }
    if let Some(pattern) = &conditions.repository {
        validate_repository_pattern(pattern)?;
    }
    if conditions.branch.as_deref().is_some_and(|b| b.trim().is_empty()) {
        return Err(RoutingError::InvalidRule("branch must not be empty when set".to_string()));
    }
    validate_labels("conditions.labels", &conditions.labels)?;
    validate_labels("targets.runner_labels", &targets.runner_labels)?;
    if let Some(pool) = &targets.pool_override {
        validate_repository_key(pool)?;
    }
    Ok(())
}

/// A pattern is an exact repository, `*`, or has one `*` at either end.
pub fn validate_repository_pattern(pattern: &str) -> RoutingResult<()> {
    if pattern.is_empty() || pattern.chars().any(char::is_whitespace) {
        return Err(RoutingError::InvalidRule(format!(
            "repository pattern '{pattern}' must be non-empty and contain no whitespace"
        )));
    }
    let wildcards = pattern.matches('*').count();
    if wildcards > 1 {
        return Err(RoutingError::InvalidRule(format!(
            "repository pattern '{pattern}' may contain at most one '*'"
        )));
    }
    if wildcards == 1 && !(pattern.starts_with('*') || pattern.ends_with('*')) {
        return Err(RoutingError::InvalidRule(format!(
            "repository pattern '{pattern}' may only use '*' as a leading or trailing wildcard"
        )));
    }
    Ok(())
}

fn validate_repository_key(key: &str) -> RoutingResult<()> {
    let valid = match key.split_once('/') {
        Some((owner, name)) => {
            !owner.is_empty() && !name.is_empty() && !name.contains('/') && !key.contains('*')
        }
        None => false,
    };
    if valid {
        Ok(())
    } else {
        Err(RoutingError::InvalidRule(format!(
            "pool override '{key}' must be an owner/name repository"
        )))
    }
}

fn validate_labels(field: &str, labels: &BTreeSet<String>) -> RoutingResult<()> {
    if labels.iter().any(|l| l.trim().is_empty()) {
        return Err(RoutingError::InvalidRule(format!("{field} contains an empty label")));
    }
    Ok(())
}

/// Match a repository against a pattern with an optional leading or trailing `*`.
pub fn repository_matches(pattern: &str, repository: &str) -> bool {
    if pattern == "*" {
        true
    } else if let Some(suffix) = pattern.strip_prefix('*') {
        repository.ends_with(suffix)
    } else if let Some(prefix) = pattern.strip_suffix('*') {
        repository.starts_with(prefix)
    } else {
        pattern == repository
    }
}

/// Evaluate every condition against a job; the error names the first mismatch.
pub fn check_conditions(conditions: &RuleConditions, job: &JobRequest) -> Result<(), String> {
    if let Some(pattern) = &conditions.repository
        && !repository_matches(pattern, &job.repository)
    {
        return Err(format!(
            "repository '{}' does not match '{pattern}'",
            job.repository
        ));
    }
    if let Some(branch) = &conditions.branch
        && branch != &job.git_ref
    {
        return Err(format!("ref '{}' is not '{branch}'", job.git_ref));
    }
    let missing: Vec<&str> = conditions
        .labels
        .difference(&job.labels)
        .map(String::as_str)
        .collect();
    if !missing.is_empty() {
        return Err(format!("job lacks label(s) {}", missing.join(", ")));
    }
    Ok(())
}

/// Runners carrying every required label. An empty requirement keeps all.
pub fn runners_with_labels<'a>(runners: &'a [Runner], required: &BTreeSet<String>) -> Vec<&'a Runner> {
    runners
        .iter()
        .filter(|r| required.is_subset(&r.labels))
        .collect()
}

/// Runners sharing at least one label with the job.
pub fn runners_sharing_labels<'a>(runners: &'a [Runner], job_labels: &BTreeSet<String>) -> Vec<&'a Runner> {
    runners
        .iter()
        .filter(|r| !r.labels.is_disjoint(job_labels))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    fn job(repository: &str, git_ref: &str, job_labels: &[&str]) -> JobRequest {
        JobRequest {
            id: "job-1".to_string(),
            repository: repository.to_string(),
            workflow: "ci".to_string(),
            git_ref: git_ref.to_string(),
            labels: labels(job_labels),
            priority: 0,
        }
    }

    #[test]
    fn repository_pattern_forms() {
        assert!(repository_matches("acme/api", "acme/api"));
        assert!(!repository_matches("acme/api", "acme/api2"));
        assert!(repository_matches("*", "anything/else"));
        assert!(repository_matches("acme/*", "acme/web"));
        assert!(!repository_matches("acme/*", "other/web"));
        assert!(repository_matches("*/api", "acme/api"));
        assert!(repository_matches("*-service", "acme/billing-service"));
        assert!(!repository_matches("*/api", "acme/api-gateway"));
    }

    #[test]
    fn pattern_validation() {
        assert!(validate_repository_pattern("acme/api").is_ok());
        assert!(validate_repository_pattern("*").is_ok());
        assert!(validate_repository_pattern("acme/*").is_ok());
        assert!(validate_repository_pattern("*/api").is_ok());
        assert!(validate_repository_pattern("").is_err());
        assert!(validate_repository_pattern("acme/*/x").is_err());
        assert!(validate_repository_pattern("*acme*").is_err());
        assert!(validate_repository_pattern("acme api").is_err());
    }

    #[test]
    fn validate_rejects_bad_bodies() {
        let ok_targets = RuleTargets::default();
        assert!(validate(" ", &RuleConditions::default(), &ok_targets).is_err());

        let empty_branch = RuleConditions {
            branch: Some(String::new()),
            ..RuleConditions::default()
        };
        assert!(validate("r", &empty_branch, &ok_targets).is_err());

        let blank_label = RuleConditions {
            labels: labels(&[""]),
            ..RuleConditions::default()
        };
        assert!(validate("r", &blank_label, &ok_targets).is_err());

        let bad_override = RuleTargets {
            pool_override: Some("not-a-repo".to_string()),
            ..RuleTargets::default()
        };
        assert!(validate("r", &RuleConditions::default(), &bad_override).is_err());

        let good_override = RuleTargets {
            pool_override: Some("acme/gpu-pool".to_string()),
            ..RuleTargets::default()
        };
        assert!(validate("r", &RuleConditions::default(), &good_override).is_ok());
    }

    #[test]
    fn conditions_are_conjunctive() {
        let conditions = RuleConditions {
            repository: Some("acme/*".to_string()),
            branch: Some("main".to_string()),
            labels: labels(&["gpu"]),
        };

        assert!(check_conditions(&conditions, &job("acme/api", "main", &["gpu", "linux"])).is_ok());

        let err = check_conditions(&conditions, &job("other/api", "main", &["gpu"])).unwrap_err();
        assert!(err.contains("does not match"));

        let err = check_conditions(&conditions, &job("acme/api", "dev", &["gpu"])).unwrap_err();
        assert!(err.contains("ref 'dev'"));

        let err = check_conditions(&conditions, &job("acme/api", "main", &["linux"])).unwrap_err();
        assert!(err.contains("gpu"));
    }

    #[test]
    fn empty_conditions_match_everything() {
        assert!(check_conditions(&RuleConditions::default(), &job("x/y", "any", &[])).is_ok());
    }

    #[test]
    fn label_filters() {
        let runners = vec![
            Runner {
                id: "r1".to_string(),
                repository: "acme/api".to_string(),
                labels: labels(&["gpu-enabled", "linux"]),
                status: runnergrid_state::RunnerStatus::Idle,
                registered_at: 1,
                updated_at: 1,
            },
            Runner {
                id: "r2".to_string(),
                repository: "acme/api".to_string(),
                labels: labels(&["linux"]),
                status: runnergrid_state::RunnerStatus::Idle,
                registered_at: 2,
                updated_at: 2,
            },
        ];

        let gpu = runners_with_labels(&runners, &labels(&["gpu-enabled"]));
        assert_eq!(gpu.len(), 1);
        assert_eq!(gpu[0].id, "r1");
        assert_eq!(runners_with_labels(&runners, &BTreeSet::new()).len(), 2);

        assert_eq!(runners_sharing_labels(&runners, &labels(&["linux"])).len(), 2);
        assert!(runners_sharing_labels(&runners, &labels(&["macos"])).is_empty());
    }
}
