use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    Python,
    Java,
    Rust,
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Language::Python => write!(f, "python"),
            Language::Java => write!(f, "java"),
            Language::Rust => write!(f, "rust"),
        }
    }
}

impl FromStr for Language {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "python" | "python3" | "py" => Ok(Language::Python),
            "java" => Ok(Language::Java),
            "rust" | "rs" => Ok(Language::Rust),
            other => Err(format!(
                "Invalid language: {} (valid options: python, java, rust)",
                other
            )),
        }
    }
}

/// One stdio-style case. Identity is positional within its suite.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestCase {
    pub input: String,
    #[serde(alias = "output")]
    pub expected_output: String,
}

impl TestCase {
    pub fn new(input: impl Into<String>, expected_output: impl Into<String>) -> Self {
        Self {
            input: input.into(),
            expected_output: expected_output.into(),
        }
    }
}

/// Ordered cases for one problem identifier
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestSuite {
    pub question_id: String,
    pub cases: Vec<TestCase>,
}

impl TestSuite {
    pub fn new(question_id: impl Into<String>, cases: Vec<TestCase>) -> Self {
        Self {
            question_id: question_id.into(),
            cases,
        }
    }

    pub fn len(&self) -> usize {
        self.cases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cases.is_empty()
    }

    /// Iterate cases together with their 1-based case numbers
    pub fn numbered(&self) -> impl Iterator<Item = (usize, &TestCase)> {
        self.cases.iter().enumerate().map(|(idx, tc)| (idx + 1, tc))
    }
}

/// What a Test Source produced for an identifier.
///
/// `Missing` and `Malformed` are both unusable, but stay distinct from a
/// resolved-but-empty suite.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SuiteResolution {
    Resolved(TestSuite),
    Missing { reason: String },
    Malformed { reason: String },
}

impl SuiteResolution {
    pub fn suite(&self) -> Option<&TestSuite> {
        match self {
            SuiteResolution::Resolved(suite) => Some(suite),
            _ => None,
        }
    }

    pub fn unavailable_reason(&self) -> Option<&str> {
        match self {
            SuiteResolution::Resolved(_) => None,
            SuiteResolution::Missing { reason } | SuiteResolution::Malformed { reason } => {
                Some(reason)
            }
        }
    }
}

/// Key of a diagnostics entry: the whole run, or a 1-based case number
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum DiagnosticKey {
    Global,
    Case(usize),
}

impl fmt::Display for DiagnosticKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DiagnosticKey::Global => write!(f, "global"),
            DiagnosticKey::Case(n) => write!(f, "case:{}", n),
        }
    }
}

impl From<DiagnosticKey> for String {
    fn from(key: DiagnosticKey) -> Self {
        key.to_string()
    }
}

impl TryFrom<String> for DiagnosticKey {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        if value == "global" {
            return Ok(DiagnosticKey::Global);
        }
        value
            .strip_prefix("case:")
            .and_then(|n| n.parse().ok())
            .map(DiagnosticKey::Case)
            .ok_or_else(|| format!("invalid diagnostic key: {}", value))
    }
}

/// Why a grading run could not produce per-case signal for the whole suite
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GlobalFailure {
    /// Candidate failed to compile or parse; no case was attempted
    CompilationFailed,
    /// Candidate crashed or exited non-zero on this case
    RuntimeFault { case: usize },
    /// Candidate exceeded the per-case time bound on this case
    TimedOut { case: usize },
    /// The suite could not be resolved, nothing was run
    SuiteUnavailable,
    Cancelled,
    /// The execution engine itself failed (spawn error, Docker down)
    Infrastructure,
}

impl fmt::Display for GlobalFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GlobalFailure::CompilationFailed => write!(f, "compilation failed"),
            GlobalFailure::RuntimeFault { case } => write!(f, "runtime error on case {}", case),
            GlobalFailure::TimedOut { case } => write!(f, "time limit exceeded on case {}", case),
            GlobalFailure::SuiteUnavailable => write!(f, "test suite unavailable"),
            GlobalFailure::Cancelled => write!(f, "grading cancelled"),
            GlobalFailure::Infrastructure => write!(f, "execution infrastructure failure"),
        }
    }
}

/// Result of one grading run. Produced fresh per attempt, never mutated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GradeResult {
    pub per_case_pass: Vec<bool>,
    pub diagnostics: BTreeMap<DiagnosticKey, String>,
    pub global_failure: Option<GlobalFailure>,
    pub elapsed_ms: u64,
}

impl GradeResult {
    pub fn passed_count(&self) -> usize {
        self.per_case_pass.iter().filter(|p| **p).count()
    }

    /// 1-based numbers of the cases that were attempted and failed
    pub fn failing_cases(&self) -> Vec<usize> {
        self.per_case_pass
            .iter()
            .enumerate()
            .filter(|(_, passed)| !**passed)
            .map(|(idx, _)| idx + 1)
            .collect()
    }

    pub fn global_diagnostic(&self) -> Option<&str> {
        self.diagnostics.get(&DiagnosticKey::Global).map(String::as_str)
    }

    pub fn case_diagnostic(&self, case: usize) -> Option<&str> {
        self.diagnostics.get(&DiagnosticKey::Case(case)).map(String::as_str)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Outcome {
    AllPass,
    ExecutionError {
        detail: String,
    },
    AssertionFailure {
        failing_cases: Vec<usize>,
        detail: String,
    },
    /// Suite resolved but empty: cannot verify, never a pass
    NoTests,
}

impl Outcome {
    pub fn is_pass(&self) -> bool {
        matches!(self, Outcome::AllPass)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepairAttempt {
    /// 0 for the original candidate, n for the n-th repaired candidate
    pub iteration: u32,
    pub candidate: String,
    pub outcome: Outcome,
    pub graded_at: DateTime<Utc>,
}

/// How the loop reached DONE
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum Termination {
    Passed,
    /// Repair budget spent and the final grading still failed
    Exhausted,
    SuiteUnavailable { detail: String },
    NoTests,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoopResult {
    pub run_id: Uuid,
    pub question_id: String,
    pub passed: bool,
    pub final_candidate: String,
    pub attempts: Vec<RepairAttempt>,
    pub termination: Termination,
}

impl LoopResult {
    pub fn repair_count(&self) -> usize {
        self.attempts.iter().filter(|a| a.iteration > 0).count()
    }

    pub fn last_outcome(&self) -> Option<&Outcome> {
        self.attempts.last().map(|a| &a.outcome)
    }
}
