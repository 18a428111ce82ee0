/// Repair Loop - bounded execute → classify → repair state machine
///
/// **States:** INIT → GRADING ⇄ REPAIRING → DONE
///
/// - INIT: resolve the suite once. Missing/Malformed → DONE (no grading)
/// - GRADING: AllPass → DONE(passed); NoTests → DONE(not verified)
/// - REPAIRING: on ExecutionError / AssertionFailure while budget remains,
///   ask the completion service for a revised candidate, then grade again
/// - Budget spent: the last repaired candidate gets exactly one more grading
///   pass and its outcome decides `passed`
///
/// Grading calls ≤ `test_loop + 1`, repair calls ≤ `test_loop`. A completion
/// service failure is the only error returned to the caller.

use crate::cancel::CancelFlag;
use crate::classifier::classify;
use crate::completion::{extract_code, CompletionService};
use crate::engine::ExecutionEngine;
use crate::feedback::{build_feedback, render_repair_prompt};
use crate::grader::Grader;
use crate::test_source::TestSource;
use anyhow::{Context, Result};
use chrono::Utc;
use reforge_common::config::RepairConfig;
use reforge_common::types::{
    GlobalFailure, LoopResult, Outcome, RepairAttempt, SuiteResolution, Termination,
};
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

/// One problem/solution pair to verify and, if needed, repair
#[derive(Debug, Clone, Default)]
pub struct RepairTask {
    pub problem: String,
    pub candidate: String,
    pub question_id: String,
    /// Fallback lookup key when no question id is known
    pub entry_point: String,
}

impl RepairTask {
    pub fn search_key(&self) -> &str {
        if self.question_id.is_empty() {
            &self.entry_point
        } else {
            &self.question_id
        }
    }
}

pub struct RepairLoop<E> {
    grader: Grader<E>,
    completion: Arc<dyn CompletionService>,
    tests: Arc<dyn TestSource>,
    config: RepairConfig,
}

impl<E: ExecutionEngine> RepairLoop<E> {
    pub fn new(
        grader: Grader<E>,
        completion: Arc<dyn CompletionService>,
        tests: Arc<dyn TestSource>,
        config: RepairConfig,
    ) -> Self {
        Self {
            grader,
            completion,
            tests,
            config,
        }
    }

    #[instrument(skip_all, fields(question_id = %task.search_key(), test_loop = self.config.test_loop))]
    pub async fn run(&self, task: &RepairTask, cancel: &CancelFlag) -> Result<LoopResult> {
        let run_id = Uuid::new_v4();
        let question_id = task.search_key().to_string();

        // INIT
        let suite = self.tests.resolve(&question_id).await;
        if let Some(reason) = suite.unavailable_reason() {
            warn!(reason = %reason, "Test suite unavailable; returning candidate unchanged");
            return Ok(LoopResult {
                run_id,
                question_id,
                passed: false,
                final_candidate: task.candidate.clone(),
                attempts: Vec::new(),
                termination: Termination::SuiteUnavailable {
                    detail: reason.to_string(),
                },
            });
        }

        let case_count = suite.suite().map_or(0, |s| s.len());
        info!(run_id = %run_id, cases = case_count, "Starting repair loop");

        let mut candidate = task.candidate.clone();
        let mut attempts: Vec<RepairAttempt> = Vec::new();
        let mut remaining = self.config.test_loop;
        let mut iteration: u32 = 0;

        let termination = loop {
            // GRADING. Every candidate gets an attempt; a grading stopped by
            // cancellation is recorded as such.
            let (outcome, cancelled) = self.grade(&candidate, &suite, cancel).await;
            attempts.push(RepairAttempt {
                iteration,
                candidate: candidate.clone(),
                outcome: outcome.clone(),
                graded_at: Utc::now(),
            });

            if cancelled {
                break Termination::Cancelled;
            }

            let outcome = match outcome {
                Outcome::AllPass => break Termination::Passed,
                Outcome::NoTests => {
                    warn!("Suite is empty; candidate cannot be verified");
                    break Termination::NoTests;
                }
                failing => failing,
            };

            if cancel.is_cancelled() {
                break Termination::Cancelled;
            }
            if remaining == 0 {
                break Termination::Exhausted;
            }

            // REPAIRING
            let Some(feedback) = build_feedback(&outcome) else {
                break Termination::Exhausted;
            };
            let prompt = render_repair_prompt(&task.problem, &candidate, &feedback);

            info!(
                iteration = iteration + 1,
                remaining,
                execution_error = matches!(outcome, Outcome::ExecutionError { .. }),
                "Requesting repair"
            );

            let response = self
                .completion
                .complete(&prompt)
                .await
                .with_context(|| format!("Completion service failed during repair iteration {}", iteration + 1))?;

            candidate = extract_code(&response);
            remaining -= 1;
            iteration += 1;
        };

        let passed = termination == Termination::Passed;
        info!(
            run_id = %run_id,
            passed,
            termination = ?termination,
            gradings = attempts.len(),
            repairs = iteration,
            "Repair loop finished"
        );

        Ok(LoopResult {
            run_id,
            question_id,
            passed,
            final_candidate: candidate,
            attempts,
            termination,
        })
    }

    /// Classified outcome, and whether grading was cut short by cancellation
    async fn grade(&self, candidate: &str, suite: &SuiteResolution, cancel: &CancelFlag) -> (Outcome, bool) {
        let result = self
            .grader
            .grade(candidate, suite, self.config.per_case_timeout(), cancel)
            .await;

        let cancelled = result.global_failure == Some(GlobalFailure::Cancelled);
        if cancelled {
            warn!(attempted = result.per_case_pass.len(), "Grading was cancelled");
        }

        (classify(&result), cancelled)
    }
}
