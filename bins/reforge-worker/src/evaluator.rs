/// Case Evaluator - Language-Agnostic Verdict Logic
///
/// **Core Responsibility:**
/// Compare the raw output of one case execution against its expected output.
///
/// **Critical Properties:**
/// - Knows nothing about processes or Docker
/// - Knows nothing about language runtimes
/// - Pure function: (execution output, test case) → verdict
///
/// **Normalization Rules (Applied to All Languages):**
/// - Line endings: \r\n and \r become \n
/// - Trailing whitespace on every line: stripped
/// - Trailing blank lines: dropped
/// - Leading whitespace: significant
/// - Case sensitivity: YES (exact match required)
/// - Floating-point tolerance: NO

use reforge_common::types::TestCase;

/// Longest excerpt of program text carried into a diagnostic
const MAX_EXCERPT_CHARS: usize = 1_000;

/// Raw execution output for a single case
/// Produced by an ExecutionEngine, consumed by the evaluator and the grader
#[derive(Debug, Clone, Default)]
pub struct TestExecutionOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i64>,
    pub execution_time_ms: u64,
    pub timed_out: bool,
    pub runtime_error: bool,
}

/// Result of compiling or syntax-checking a candidate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompilationResult {
    pub success: bool,
    pub stderr: String,
}

impl CompilationResult {
    pub fn success() -> Self {
        Self {
            success: true,
            stderr: String::new(),
        }
    }

    pub fn failure(stderr: String) -> Self {
        Self {
            success: false,
            stderr,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaseVerdict {
    Passed,
    WrongAnswer,
    RuntimeError,
    TimeLimitExceeded,
}

impl CaseVerdict {
    pub fn is_pass(self) -> bool {
        self == CaseVerdict::Passed
    }

    /// Faults end the grading run; a wrong answer does not
    pub fn is_fault(self) -> bool {
        matches!(self, CaseVerdict::RuntimeError | CaseVerdict::TimeLimitExceeded)
    }
}

/// Normalize program output for comparison
pub fn normalize_output(output: &str) -> String {
    let unified = output.replace("\r\n", "\n").replace('\r', "\n");
    let lines: Vec<&str> = unified.lines().map(str::trim_end).collect();
    lines.join("\n").trim_end_matches('\n').to_string()
}

/// Evaluate a single case execution output
///
/// Priority:
/// 1. Timeouts (a killed run may also report a non-zero exit)
/// 2. Runtime errors
/// 3. Output comparison
pub fn evaluate_case(output: &TestExecutionOutput, test_case: &TestCase) -> CaseVerdict {
    if output.timed_out {
        CaseVerdict::TimeLimitExceeded
    } else if output.runtime_error {
        CaseVerdict::RuntimeError
    } else if normalize_output(&output.stdout) == normalize_output(&test_case.expected_output) {
        CaseVerdict::Passed
    } else {
        CaseVerdict::WrongAnswer
    }
}

/// Human-readable evidence for a failed case, used as its diagnostics entry
pub fn describe_failure(
    case: usize,
    verdict: CaseVerdict,
    output: &TestExecutionOutput,
    test_case: &TestCase,
) -> String {
    match verdict {
        CaseVerdict::Passed => format!("Case {}: passed", case),
        CaseVerdict::WrongAnswer => format!(
            "Case {}: wrong answer\nInput:\n{}\nExpected:\n{}\nGot:\n{}",
            case,
            excerpt(&test_case.input),
            excerpt(&normalize_output(&test_case.expected_output)),
            excerpt(&normalize_output(&output.stdout)),
        ),
        CaseVerdict::RuntimeError => {
            let exit = output
                .exit_code
                .map(|code| format!(" (exit code {})", code))
                .unwrap_or_default();
            format!(
                "Case {}: runtime error{}\nInput:\n{}\nStderr:\n{}",
                case,
                exit,
                excerpt(&test_case.input),
                excerpt(output.stderr.trim()),
            )
        }
        CaseVerdict::TimeLimitExceeded => format!(
            "Case {}: time limit exceeded after {}ms\nInput:\n{}",
            case,
            output.execution_time_ms,
            excerpt(&test_case.input),
        ),
    }
}

/// Cut text to a bounded excerpt on a char boundary
pub fn excerpt(text: &str) -> String {
    match text.char_indices().nth(MAX_EXCERPT_CHARS) {
        Some((idx, _)) => format!("{}... [truncated]", &text[..idx]),
        None => text.to_string(),
    }
}
