//! Validation plan construction.
//!
//! A plan is derived deterministically from the merged commits, their
//! changed files, the task's impact entries, and the configured check
//! rules. Plans are immutable after creation.

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::config::{CheckConfig, QualityGateConfig};
use crate::tracker::ImpactEntry;

/// Default per-check timeout when the config does not set one.
pub const DEFAULT_CHECK_TIMEOUT_MS: u64 = 5 * 60 * 1000;

/// A check selected into a plan, with its flags resolved.
#[derive(Debug, Clone, Serialize)]
pub struct PlannedCheck {
    pub id: String,
    pub command: String,
    pub required: bool,
    pub timeout_ms: u64,
    pub retry_on_failure: bool,
    pub max_reruns: u32,
}

impl PlannedCheck {
    fn from_config(id: &str, check: &CheckConfig, gates: &QualityGateConfig) -> Self {
        Self {
            id: id.to_string(),
            command: check.command.clone(),
            required: check.required,
            timeout_ms: check.timeout_ms.unwrap_or(DEFAULT_CHECK_TIMEOUT_MS),
            retry_on_failure: check.retry_on_failure,
            max_reruns: check.max_reruns.unwrap_or(gates.max_test_reruns),
        }
    }
}

/// Immutable selection of checks for a batch of merged commits.
#[derive(Debug, Clone, Serialize)]
pub struct ValidationPlan {
    pub plan_id: Uuid,
    pub task_ids: Vec<String>,
    /// Integration-side commit hashes covered by this plan.
    pub commits: Vec<String>,
    pub checks: Vec<PlannedCheck>,
    pub impact: Vec<ImpactEntry>,
    pub rationale: String,
    pub created_at: DateTime<Utc>,
}

/// Build a plan for newly merged commits.
///
/// Selection order: required checks first (config order), then `sanity`
/// when defined, then checks contributed by path rules. When no rule
/// matches and nothing is required, every configured check runs.
pub fn build_plan(
    gates: &QualityGateConfig,
    task_ids: Vec<String>,
    commits: Vec<String>,
    changed_files: &[String],
    impact: Vec<ImpactEntry>,
) -> ValidationPlan {
    fn select(
        selected: &mut Vec<PlannedCheck>,
        id: &str,
        gates: &QualityGateConfig,
    ) {
        if selected.iter().any(|c| c.id == id) {
            return;
        }
        if let Some(check) = gates.checks.get(id) {
            selected.push(PlannedCheck::from_config(id, check, gates));
        }
    }

    let mut selected: Vec<PlannedCheck> = Vec::new();

    for (id, check) in &gates.checks {
        if check.required {
            select(&mut selected, id, gates);
        }
    }
    if gates.checks.contains_key("sanity") {
        select(&mut selected, "sanity", gates);
    }

    let had_required = !selected.is_empty();

    // Every change path consults the rules; impact paths contribute too.
    let mut change_paths: Vec<&str> = changed_files.iter().map(String::as_str).collect();
    change_paths.extend(impact.iter().map(|e| e.path.as_str()));

    let mut rule_paths: Vec<String> = Vec::new();
    let mut any_rule_matched = false;
    for path in &change_paths {
        for (prefix, check_ids) in &gates.rules {
            if path.starts_with(prefix.as_str()) {
                any_rule_matched = true;
                if !rule_paths.iter().any(|p| p == path) {
                    rule_paths.push((*path).to_string());
                }
                for id in check_ids {
                    select(&mut selected, id, gates);
                }
            }
        }
    }

    if !any_rule_matched && !had_required {
        for id in gates.checks.keys() {
            select(&mut selected, id, gates);
        }
    }

    let rationale = format!(
        "checks: [{}]; contributing paths: [{}]",
        selected
            .iter()
            .map(|c| c.id.as_str())
            .collect::<Vec<_>>()
            .join(", "),
        rule_paths.join(", "),
    );

    ValidationPlan {
        plan_id: Uuid::new_v4(),
        task_ids,
        commits,
        checks: selected,
        impact,
        rationale,
        created_at: Utc::now(),
    }
}
