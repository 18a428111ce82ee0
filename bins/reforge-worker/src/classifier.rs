/// Outcome Classifier
///
/// Reduces a GradeResult to a single Outcome. Rules, in order:
/// 1. Tagged global failure → ExecutionError (a candidate that cannot run has
///    no meaningful per-case signal, even if earlier cases passed)
/// 2. Non-empty and all true → AllPass
/// 3. Empty → NoTests (a vacuous pass is not a pass)
/// 4. Otherwise → AssertionFailure with the failing case numbers

use reforge_common::types::{DiagnosticKey, GradeResult, Outcome};

pub fn classify(result: &GradeResult) -> Outcome {
    if let Some(failure) = result.global_failure {
        let mut detail = format!("Execution failed: {}", failure);
        let mut seen: Vec<&str> = Vec::new();
        // The faulting case is recorded under both its own key and the global key
        for text in result.diagnostics.values() {
            if seen.contains(&text.as_str()) {
                continue;
            }
            seen.push(text);
            detail.push_str("\n\n");
            detail.push_str(text);
        }
        return Outcome::ExecutionError { detail };
    }

    if result.per_case_pass.is_empty() {
        return Outcome::NoTests;
    }

    let failing_cases = result.failing_cases();
    if failing_cases.is_empty() {
        return Outcome::AllPass;
    }

    let detail = failing_cases
        .iter()
        .map(|case| {
            result
                .diagnostics
                .get(&DiagnosticKey::Case(*case))
                .cloned()
                .unwrap_or_else(|| format!("Case {}: wrong answer", case))
        })
        .collect::<Vec<_>>()
        .join("\n\n");

    Outcome::AssertionFailure {
        failing_cases,
        detail,
    }
}
