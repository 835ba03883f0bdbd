//! Auto-heal loop for failed validation plans.
//!
//! A temporary fix agent runs inside the validator workspace with the
//! failure context and tight boundaries. Its edits are committed as
//! `chore(quality-gate): fix <planId> attempt <n>`, the full check set is
//! re-run, and on success the fix commit is cherry-picked onto the
//! integration branch. A fix whose commit cannot be replayed onto
//! integration fails the attempt rather than silently passing.

use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use tracing::{info, warn};

use crate::agent::{Agent, StreamHooks};
use crate::events::{EventBus, EventPayload};
use crate::git::{CherryPick, GitDriver};
use crate::tracker::ImpactEntry;

use super::checks::log_tail;
use super::plan::ValidationPlan;

/// Lines of the failing check's log included in the fix prompt.
const FIX_LOG_TAIL_LINES: usize = 200;

pub struct FixDeps<'a> {
    pub validator: &'a GitDriver,
    pub integration: &'a GitDriver,
    pub agent: Arc<dyn Agent>,
    pub events: &'a EventBus,
}

/// Run the fix loop for a failed plan. Returns `true` when an attempt
/// healed the plan (checks pass and the fix commit is on integration).
///
/// The caller re-runs checks through `recheck`, so rerun/flaky semantics
/// stay in one place.
pub async fn run_fix_loop<F, Fut>(
    deps: &FixDeps<'_>,
    plan: &ValidationPlan,
    failed_check_id: &str,
    failure_reason: &str,
    failed_log: &Path,
    max_attempts: u32,
    mut recheck: F,
) -> Result<bool>
where
    F: FnMut(u32) -> Fut,
    Fut: std::future::Future<Output = Result<bool>>,
{
    for attempt in 1..=max_attempts {
        deps.events.emit(EventPayload::ValidationFixStarted {
            plan_id: plan.plan_id,
            attempt,
        });

        let prompt = fix_prompt(plan, failed_check_id, failure_reason, failed_log);
        let run = deps
            .agent
            .execute_task(&prompt, deps.validator.workdir(), &StreamHooks::none())
            .await;

        let fail = |reason: String| {
            warn!(plan_id = %plan.plan_id, attempt, reason = %reason, "validation fix attempt failed");
            deps.events.emit(EventPayload::ValidationFixFailed {
                plan_id: plan.plan_id,
                attempt,
                reason,
            });
        };

        let result = match run {
            Ok(result) => result,
            Err(e) => {
                fail(format!("fix agent run failed: {e:#}"));
                continue;
            }
        };

        if !result.completed {
            fail("fix agent did not signal completion".to_string());
            continue;
        }
        if deps.validator.status_porcelain()?.is_empty() {
            fail("fix agent left the workspace unchanged".to_string());
            continue;
        }

        deps.validator.add_all()?;
        deps.validator.commit(
            &format!("chore(quality-gate): fix {} attempt {attempt}", plan.plan_id),
            None,
        )?;
        let fix_commit = deps.validator.rev_parse("HEAD")?;

        let rechecked = recheck(attempt).await?;
        if !rechecked {
            fail("checks still failing after fix".to_string());
            continue;
        }

        match deps.integration.cherry_pick(&fix_commit) {
            Ok(CherryPick::Applied) => {}
            Ok(CherryPick::Empty) => {
                deps.integration.cherry_pick_skip()?;
            }
            Ok(CherryPick::Conflict) => {
                let _ = deps.integration.cherry_pick_abort();
                fail("fix commit conflicted on integration".to_string());
                continue;
            }
            Err(e) => {
                let _ = deps.integration.cherry_pick_abort();
                fail(format!("failed to replay fix commit onto integration: {e}"));
                continue;
            }
        }

        info!(
            plan_id = %plan.plan_id,
            attempt,
            commit = %fix_commit,
            "validation fix healed the plan"
        );
        deps.events.emit(EventPayload::ValidationFixSucceeded {
            plan_id: plan.plan_id,
            attempt,
            commit: fix_commit,
        });
        return Ok(true);
    }

    Ok(false)
}

fn fix_prompt(
    plan: &ValidationPlan,
    failed_check_id: &str,
    failure_reason: &str,
    failed_log: &Path,
) -> String {
    let impact = if plan.impact.is_empty() {
        "  (none declared)".to_string()
    } else {
        plan.impact
            .iter()
            .map(|e: &ImpactEntry| format!("  - {} ({}): {}", e.path, e.change, e.purpose))
            .collect::<Vec<_>>()
            .join("\n")
    };

    format!(
        "Validation plan {plan_id} failed.\n\
         Failed check: {failed_check_id}\n\
         Reason: {failure_reason}\n\n\
         Declared impact:\n{impact}\n\n\
         Check log tail:\n{tail}\n\n\
         Fix the failure with the smallest possible edit. Boundaries: do not \
         switch branches, do not run any version-control commands, do not \
         touch files unrelated to the failure. Leave your edits uncommitted \
         and stop when the check would pass.",
        plan_id = plan.plan_id,
        tail = log_tail(failed_log, FIX_LOG_TAIL_LINES),
    )
}
