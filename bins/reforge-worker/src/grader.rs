/// Grader - runs a candidate against an ordered suite of stdio cases
///
/// **Responsibility:**
/// Coordinate an execution engine and the evaluator to produce a GradeResult.
///
/// **Architecture:**
/// 1. Prepare (compile / syntax-check) the candidate once via the engine
/// 2. Run each case in order, each under the hard per-case timeout
/// 3. Judge each output with the evaluator
///
/// **Short-circuit rules:**
/// - Compilation failure: no case is attempted
/// - Runtime fault or timeout on case n: case n is recorded as failed and the
///   remaining cases are skipped (absent, not padded)
/// - Wrong answer: recorded, grading continues
///
/// Candidate-side failures never surface as `Err`; everything is encoded in
/// the GradeResult and its tagged `global_failure`.

use crate::cancel::CancelFlag;
use crate::engine::ExecutionEngine;
use crate::evaluator::{self, CaseVerdict};
use reforge_common::types::{
    DiagnosticKey, GlobalFailure, GradeResult, Language, SuiteResolution,
};
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument, warn};

pub struct Grader<E> {
    engine: E,
    language: Language,
    compile_timeout: Duration,
}

/// Accumulates one grading run
struct GradeBuilder {
    start: Instant,
    per_case_pass: Vec<bool>,
    diagnostics: BTreeMap<DiagnosticKey, String>,
    global_failure: Option<GlobalFailure>,
}

impl GradeBuilder {
    fn new() -> Self {
        Self {
            start: Instant::now(),
            per_case_pass: Vec::new(),
            diagnostics: BTreeMap::new(),
            global_failure: None,
        }
    }

    fn fail_globally(mut self, failure: GlobalFailure, text: String) -> Self {
        self.global_failure = Some(failure);
        self.diagnostics.insert(DiagnosticKey::Global, text);
        self
    }

    fn finish(self) -> GradeResult {
        GradeResult {
            per_case_pass: self.per_case_pass,
            diagnostics: self.diagnostics,
            global_failure: self.global_failure,
            elapsed_ms: self.start.elapsed().as_millis() as u64,
        }
    }
}

impl<E: ExecutionEngine> Grader<E> {
    pub fn new(engine: E, language: Language, compile_timeout: Duration) -> Self {
        Self {
            engine,
            language,
            compile_timeout,
        }
    }

    /// Grade `candidate` against `suite`, bounding every case by `per_case_timeout`
    #[instrument(skip_all, fields(language = %self.language, source_size = candidate.len()))]
    pub async fn grade(
        &self,
        candidate: &str,
        suite: &SuiteResolution,
        per_case_timeout: Duration,
        cancel: &CancelFlag,
    ) -> GradeResult {
        let builder = GradeBuilder::new();

        let suite = match suite {
            SuiteResolution::Resolved(suite) => suite,
            unavailable => {
                let reason = unavailable.unavailable_reason().unwrap_or("test suite unavailable");
                warn!(reason = %reason, "Refusing to grade without a test suite");
                return builder
                    .fail_globally(GlobalFailure::SuiteUnavailable, reason.to_string())
                    .finish();
            }
        };

        if suite.is_empty() {
            debug!(question_id = %suite.question_id, "Suite is empty, nothing to grade");
            return builder.finish();
        }

        if cancel.is_cancelled() {
            return builder
                .fail_globally(GlobalFailure::Cancelled, "Grading cancelled before start".to_string())
                .finish();
        }

        let (program, compilation) = match self
            .engine
            .prepare(&self.language, candidate, self.compile_timeout)
            .await
        {
            Ok(prepared) => prepared,
            Err(e) => {
                warn!(error = %e, "Execution engine failed to prepare candidate");
                return builder
                    .fail_globally(GlobalFailure::Infrastructure, format!("Execution engine error: {:#}", e))
                    .finish();
            }
        };

        if !compilation.success {
            warn!(
                error_preview = compilation.stderr.lines().next().unwrap_or(""),
                "Compilation failed; no case attempted"
            );
            self.engine.release(program).await;
            return builder
                .fail_globally(
                    GlobalFailure::CompilationFailed,
                    format!("Compilation failed:\n{}", evaluator::excerpt(compilation.stderr.trim())),
                )
                .finish();
        }

        let mut builder = builder;
        for (case, test_case) in suite.numbered() {
            if cancel.is_cancelled() {
                warn!(case, total = suite.len(), "Grading cancelled between cases");
                builder = builder.fail_globally(
                    GlobalFailure::Cancelled,
                    format!("Grading cancelled before case {}", case),
                );
                break;
            }

            let output = match self.engine.run(&program, &test_case.input, per_case_timeout).await {
                Ok(output) => output,
                Err(e) => {
                    warn!(case, error = %e, "Execution engine failed while running case");
                    builder = builder.fail_globally(
                        GlobalFailure::Infrastructure,
                        format!("Execution engine error on case {}: {:#}", case, e),
                    );
                    break;
                }
            };

            let verdict = evaluator::evaluate_case(&output, test_case);
            builder.per_case_pass.push(verdict.is_pass());

            debug!(
                case,
                verdict = ?verdict,
                execution_ms = output.execution_time_ms,
                "Case graded"
            );

            if verdict.is_pass() {
                continue;
            }

            let description = evaluator::describe_failure(case, verdict, &output, test_case);
            builder
                .diagnostics
                .insert(DiagnosticKey::Case(case), description.clone());

            if verdict.is_fault() {
                let failure = match verdict {
                    CaseVerdict::TimeLimitExceeded => GlobalFailure::TimedOut { case },
                    _ => GlobalFailure::RuntimeFault { case },
                };
                warn!(
                    case,
                    skipped = suite.len() - case,
                    execution_ms = output.execution_time_ms,
                    "Candidate faulted; remaining cases skipped"
                );
                builder = builder.fail_globally(failure, description);
                break;
            }
        }

        self.engine.release(program).await;

        let result = builder.finish();
        info!(
            passed = result.passed_count(),
            attempted = result.per_case_pass.len(),
            total = suite.len(),
            global_failure = ?result.global_failure,
            elapsed_ms = result.elapsed_ms,
            "Grading completed"
        );
        result
    }
}
