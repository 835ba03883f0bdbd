//! Validation engine: plans, runs, and auto-heals check suites against the
//! integration head.
//!
//! A single consumer owns the validator workspace and processes plans
//! serially. The queue supports three modes: `per-merge` (FIFO),
//! `coalesce` (only the newest queued plan runs), and `batch-window`
//! (accumulate briefly, then drain).

pub mod checks;
pub mod fix;
pub mod plan;

use std::collections::VecDeque;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::agent::Agent;
use crate::config::{FallbackStrategy, QualityGateConfig, ValidationMode};
use crate::events::{EventBus, EventPayload, LogHub};
use crate::git::GitDriver;

pub use checks::CheckResult;
pub use plan::{PlannedCheck, ValidationPlan, build_plan};

/// Why a plan did not pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureDisposition {
    /// The plan's commits were reverted on integration.
    Reverted,
    /// The task is blocked; integration keeps the commits.
    Quarantined,
    /// The operator must resume the coordinator.
    PauseRequested,
    /// The validator workspace could not be prepared.
    Blocked,
}

/// Where validation outcomes are reported. The coordinator implements
/// this to drive mainline sync, task blocking, and pausing.
#[async_trait]
pub trait ValidationOutcomeSink: Send + Sync {
    async fn plan_passed(&self, plan: &ValidationPlan, flaky: bool);
    async fn plan_failed(&self, plan: &ValidationPlan, disposition: FailureDisposition);
}

/// Enqueue handle for the validation consumer.
#[derive(Clone)]
pub struct ValidationQueue {
    tx: mpsc::UnboundedSender<ValidationPlan>,
    in_flight: Arc<AtomicUsize>,
    events: EventBus,
    hub: Arc<LogHub>,
}

impl std::fmt::Debug for ValidationQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ValidationQueue")
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

impl ValidationQueue {
    /// Spawn the consumer and return the enqueue handle.
    pub fn spawn(
        engine: ValidationEngine,
        mode: ValidationMode,
        batch_window_ms: u64,
        cancel: CancellationToken,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let in_flight = Arc::new(AtomicUsize::new(0));
        let events = engine.events.clone();
        let hub = Arc::clone(&engine.hub);

        let handle = tokio::spawn(run_consumer(
            rx,
            engine,
            mode,
            batch_window_ms,
            Arc::clone(&in_flight),
            cancel,
        ));

        (
            Self {
                tx,
                in_flight,
                events,
                hub,
            },
            handle,
        )
    }

    /// Queue a plan: persist `plan.json`, emit the queued event, hand it to
    /// the consumer.
    pub fn enqueue(&self, plan: ValidationPlan) {
        if let Ok(dir) = self.hub.validation_dir(plan.plan_id) {
            match serde_json::to_string_pretty(&plan) {
                Ok(body) => {
                    if let Err(e) = std::fs::write(dir.join("plan.json"), body) {
                        warn!(plan_id = %plan.plan_id, error = %e, "failed to write plan.json");
                    }
                }
                Err(e) => warn!(plan_id = %plan.plan_id, error = %e, "failed to encode plan"),
            }
        }

        self.events.emit(EventPayload::ValidationQueued {
            plan_id: plan.plan_id,
            task_ids: plan.task_ids.clone(),
        });

        self.in_flight.fetch_add(1, Ordering::SeqCst);
        if self.tx.send(plan).is_err() {
            warn!("validation consumer is gone; plan dropped");
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
        }
    }

    /// Plans queued or running.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }
}

async fn run_consumer(
    mut rx: mpsc::UnboundedReceiver<ValidationPlan>,
    engine: ValidationEngine,
    mode: ValidationMode,
    batch_window_ms: u64,
    in_flight: Arc<AtomicUsize>,
    cancel: CancellationToken,
) {
    info!(mode = ?mode, "validation consumer started");
    loop {
        let first = tokio::select! {
            plan = rx.recv() => match plan {
                Some(plan) => plan,
                None => break,
            },
            () = cancel.cancelled() => break,
        };

        let mut buffer: VecDeque<ValidationPlan> = VecDeque::new();
        buffer.push_back(first);

        match mode {
            ValidationMode::PerMerge => {}
            ValidationMode::Coalesce => {
                while let Ok(newer) = rx.try_recv() {
                    // The newest plan evicts everything before it.
                    for evicted in buffer.drain(..) {
                        info!(plan_id = %evicted.plan_id, "plan evicted by newer plan");
                        in_flight.fetch_sub(1, Ordering::SeqCst);
                    }
                    buffer.push_back(newer);
                }
            }
            ValidationMode::BatchWindow => {
                tokio::time::sleep(std::time::Duration::from_millis(batch_window_ms)).await;
                while let Ok(more) = rx.try_recv() {
                    buffer.push_back(more);
                }
            }
        }

        while let Some(plan) = buffer.pop_front() {
            engine.run_plan(&plan).await;
            in_flight.fetch_sub(1, Ordering::SeqCst);
        }
    }
    info!("validation consumer stopped");
}

/// Runs plans against the validator workspace.
pub struct ValidationEngine {
    /// Driver bound to the validator workspace.
    pub validator: GitDriver,
    /// Driver bound to the merge workspace (integration branch); used to
    /// replay fix commits and apply the revert fallback.
    pub integration: GitDriver,
    pub integration_branch: String,
    pub gates: QualityGateConfig,
    pub events: EventBus,
    pub hub: Arc<LogHub>,
    pub fix_agent: Option<Arc<dyn Agent>>,
    pub sink: Arc<dyn ValidationOutcomeSink>,
}

impl ValidationEngine {
    /// Run one plan to a terminal outcome, reporting through the sink.
    pub async fn run_plan(&self, plan: &ValidationPlan) {
        if let Err(e) = self.run_plan_inner(plan).await {
            warn!(plan_id = %plan.plan_id, error = %e, "validation run failed");
            self.events.emit(EventPayload::ValidationBlocked {
                plan_id: plan.plan_id,
                reason: format!("{e:#}"),
            });
            self.sink
                .plan_failed(plan, FailureDisposition::Blocked)
                .await;
        }
    }

    async fn run_plan_inner(&self, plan: &ValidationPlan) -> Result<()> {
        let log_dir = self.hub.validation_dir(plan.plan_id)?;

        // 1. Pin the validator workspace to the integration head.
        let head = self
            .integration
            .rev_parse(&self.integration_branch)
            .context("failed to resolve integration head")?;
        if let Err(e) = self.validator.reset_hard(&head) {
            self.events.emit(EventPayload::ValidationBlocked {
                plan_id: plan.plan_id,
                reason: format!("validator reset failed: {e}"),
            });
            self.sink
                .plan_failed(plan, FailureDisposition::Blocked)
                .await;
            return Ok(());
        }
        if self.gates.clean_before_run {
            self.validator
                .clean_fdx()
                .context("validator clean failed")?;
        }

        self.events.emit(EventPayload::ValidationStarted {
            plan_id: plan.plan_id,
            checks: plan.checks.iter().map(|c| c.id.clone()).collect(),
        });

        // 2. Ordered check execution.
        let mut flaky = false;
        let mut results: Vec<CheckResult> = Vec::new();
        let mut failed: Option<(PlannedCheck, CheckResult)> = None;

        for check in &plan.checks {
            let (result, was_flaky) = self.run_with_reruns(plan, check, &log_dir, 0).await?;
            flaky |= was_flaky;
            let passed = result.passed();
            results.push(result.clone());
            if !passed {
                if check.required {
                    failed = Some((check.clone(), result));
                    break;
                }
                warn!(
                    plan_id = %plan.plan_id,
                    check_id = %check.id,
                    "optional check failed; continuing"
                );
            }
        }

        let Some((failed_check, failed_result)) = failed else {
            self.write_summary(plan, &log_dir, "passed", flaky, false, &results)?;
            self.events.emit(EventPayload::ValidationPassed {
                plan_id: plan.plan_id,
                flaky,
            });
            self.sink.plan_passed(plan, flaky).await;
            return Ok(());
        };

        let reason = format!(
            "required check {} failed (exit {:?})",
            failed_check.id, failed_result.exit_code
        );
        self.events.emit(EventPayload::ValidationFailed {
            plan_id: plan.plan_id,
            check_id: failed_check.id.clone(),
            reason: reason.clone(),
        });

        // 3. Auto-heal.
        let healed = match &self.fix_agent {
            Some(agent) if self.gates.max_fix_attempts > 0 => {
                let deps = fix::FixDeps {
                    validator: &self.validator,
                    integration: &self.integration,
                    agent: Arc::clone(agent),
                    events: &self.events,
                };
                fix::run_fix_loop(
                    &deps,
                    plan,
                    &failed_check.id,
                    &reason,
                    &failed_result.output_path,
                    self.gates.max_fix_attempts,
                    |attempt| self.recheck_all(plan, &log_dir, attempt),
                )
                .await?
            }
            _ => false,
        };

        if healed {
            self.write_summary(plan, &log_dir, "passed", flaky, true, &results)?;
            self.events.emit(EventPayload::ValidationPassed {
                plan_id: plan.plan_id,
                flaky,
            });
            self.sink.plan_passed(plan, flaky).await;
            return Ok(());
        }

        // 4. Fallback strategy.
        self.write_summary(plan, &log_dir, "failed", flaky, false, &results)?;
        match self.gates.fallback_strategy {
            FallbackStrategy::Revert => {
                for commit in plan.commits.iter().rev() {
                    if let Err(e) = self.integration.revert_no_edit(commit) {
                        warn!(commit = %commit, error = %e, "revert failed");
                    }
                }
                self.events.emit(EventPayload::ValidationReverted {
                    plan_id: plan.plan_id,
                    commits: plan.commits.clone(),
                });
                self.sink
                    .plan_failed(plan, FailureDisposition::Reverted)
                    .await;
            }
            FallbackStrategy::Quarantine => {
                self.sink
                    .plan_failed(plan, FailureDisposition::Quarantined)
                    .await;
            }
            FallbackStrategy::Pause => {
                self.sink
                    .plan_failed(plan, FailureDisposition::PauseRequested)
                    .await;
            }
        }
        Ok(())
    }

    /// Re-run the full check set after a fix attempt. Log files use a
    /// rerun offset so every invocation keeps a distinct file.
    async fn recheck_all(
        &self,
        plan: &ValidationPlan,
        log_dir: &Path,
        attempt: u32,
    ) -> Result<bool> {
        let offset = attempt * (1 + max_reruns_in(plan));
        for check in &plan.checks {
            let (result, _flaky) = self.run_with_reruns(plan, check, log_dir, offset).await?;
            if !result.passed() && check.required {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// One check with its rerun budget. Returns the final result and
    /// whether a rerun rescued it.
    async fn run_with_reruns(
        &self,
        plan: &ValidationPlan,
        check: &PlannedCheck,
        log_dir: &Path,
        offset: u32,
    ) -> Result<(CheckResult, bool)> {
        let run_one = |rerun: u32| {
            self.events.emit(EventPayload::ValidationCheckStarted {
                plan_id: plan.plan_id,
                check_id: check.id.clone(),
                rerun,
            });
            checks::run_check(check, self.validator.workdir(), log_dir, rerun)
        };

        let mut result = run_one(offset).await?;
        self.emit_check_finished(plan, &result);
        if result.passed() || !check.retry_on_failure {
            return Ok((result, false));
        }

        for i in 1..=check.max_reruns {
            let rerun = run_one(offset + i).await?;
            self.emit_check_finished(plan, &rerun);
            let rescued = rerun.passed();
            result = rerun;
            if rescued {
                return Ok((result, true));
            }
        }
        Ok((result, false))
    }

    fn emit_check_finished(&self, plan: &ValidationPlan, result: &CheckResult) {
        self.events.emit(EventPayload::ValidationCheckFinished {
            plan_id: plan.plan_id,
            check_id: result.check_id.clone(),
            exit_code: result.exit_code,
            duration_ms: result.duration_ms,
            rerun: result.rerun,
            passed: result.passed(),
        });
    }

    fn write_summary(
        &self,
        plan: &ValidationPlan,
        log_dir: &Path,
        status: &str,
        flaky: bool,
        healed: bool,
        results: &[CheckResult],
    ) -> Result<()> {
        let status = if status == "passed" && flaky {
            "flaky"
        } else {
            status
        };
        let summary = serde_json::json!({
            "planId": plan.plan_id,
            "status": status,
            "healed": healed,
            "checks": results,
            "finishedAt": Utc::now().to_rfc3339(),
        });
        let body = serde_json::to_string_pretty(&summary)?;
        std::fs::write(log_dir.join("summary.json"), body)
            .with_context(|| format!("failed to write summary for plan {}", plan.plan_id))?;
        Ok(())
    }
}

fn max_reruns_in(plan: &ValidationPlan) -> u32 {
    plan.checks.iter().map(|c| c.max_reruns).max().unwrap_or(0)
}
