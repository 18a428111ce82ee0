// Repair prompt rendering. The narrative differs for a candidate that could
// not run at all and one that ran but printed the wrong answers.

use reforge_common::types::Outcome;

/// Feedback narrative for a failing outcome, `None` when there is nothing to repair
pub fn build_feedback(outcome: &Outcome) -> Option<String> {
    match outcome {
        Outcome::ExecutionError { detail } => Some(format!(
            "Execution status: executed unsuccessfully.\n\
             The program did not run to completion, so its output could not be compared.\n\
             Error:\n{}",
            detail
        )),
        Outcome::AssertionFailure { failing_cases, detail } => {
            let cases = failing_cases
                .iter()
                .map(|case| format!("case {}", case))
                .collect::<Vec<_>>()
                .join(", ");
            Some(format!(
                "Execution status: executed successfully.\n\
                 Test result: the output did not match the expected output on {}.\n\
                 Details:\n{}",
                cases, detail
            ))
        }
        Outcome::AllPass | Outcome::NoTests => None,
    }
}

/// Render `{problem, candidate, feedback}` into the single prompt sent to the
/// completion service
pub fn render_repair_prompt(problem: &str, candidate: &str, feedback: &str) -> String {
    format!(
        "You are given a programming problem and a solution that failed its public tests.\n\
         \n\
         ## Problem\n\
         {problem}\n\
         \n\
         ## Current solution\n\
         ```\n\
         {candidate}\n\
         ```\n\
         \n\
         ## Test feedback\n\
         {feedback}\n\
         \n\
         Reflect on why the solution failed, then rewrite the complete program. \
         It must read from standard input and write to standard output. \
         Return only the corrected program in a single fenced code block.\n",
        problem = problem.trim(),
        candidate = candidate.trim_end(),
        feedback = feedback.trim(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_execution_error_feedback() {
        let feedback = build_feedback(&Outcome::ExecutionError {
            detail: "Execution failed: time limit exceeded on case 1".to_string(),
        })
        .unwrap();

        assert!(feedback.contains("executed unsuccessfully"));
        assert!(feedback.contains("time limit exceeded on case 1"));
        assert!(!feedback.contains("did not match"));
    }

    #[test]
    fn test_assertion_feedback_names_failing_cases() {
        let feedback = build_feedback(&Outcome::AssertionFailure {
            failing_cases: vec![2, 4],
            detail: "Case 2: wrong answer".to_string(),
        })
        .unwrap();

        assert!(feedback.contains("executed successfully"));
        assert!(feedback.contains("case 2, case 4"));
        assert!(!feedback.contains("unsuccessfully"));
    }

    #[test]
    fn test_nothing_to_repair() {
        assert!(build_feedback(&Outcome::AllPass).is_none());
        assert!(build_feedback(&Outcome::NoTests).is_none());
    }

    #[test]
    fn test_prompt_carries_all_parts() {
        let prompt = render_repair_prompt("Sum two numbers.", "print(1)\n", "Execution status: executed successfully.");

        assert!(prompt.contains("## Problem\nSum two numbers."));
        assert!(prompt.contains("```\nprint(1)\n```"));
        assert!(prompt.contains("## Test feedback\nExecution status: executed successfully."));
    }
}
