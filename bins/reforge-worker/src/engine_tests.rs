/// Integration tests for the compile-once execution model
///
/// These tests verify against real engines that:
/// 1. Preparation succeeds and every case executes against the same program
/// 2. Compilation failures are reported as data, not errors
/// 3. Runtime errors and timeouts are detected and end grading
/// 4. Scratch directories / containers are cleaned up on release
///
/// Process tests use `sh` standing in for the python toolchain so they run
/// anywhere a POSIX shell exists. Docker tests are ignored by default.

#[cfg(test)]
mod compile_once_tests {
    use crate::cancel::CancelFlag;
    use crate::classifier::classify;
    use crate::config::{LanguageConfig, LanguageConfigManager};
    use crate::docker::DockerEngine;
    use crate::engine::{ExecutionEngine, ProcessEngine};
    use crate::evaluator::{evaluate_case, CaseVerdict};
    use crate::grader::Grader;
    use reforge_common::types::{
        GlobalFailure, Language, Outcome, SuiteResolution, TestCase, TestSuite,
    };
    use std::path::PathBuf;
    use std::time::Duration;

    const CASE_TIMEOUT: Duration = Duration::from_secs(5);
    const COMPILE_TIMEOUT: Duration = Duration::from_secs(10);

    const DOUBLER: &str = "read n\necho $((n * 2))\n";

    fn shell_languages() -> LanguageConfigManager {
        LanguageConfigManager::from_configs(vec![LanguageConfig {
            name: "python".to_string(),
            version: "posix".to_string(),
            image: "busybox:latest".to_string(),
            file_name: "main.sh".to_string(),
            compile_command: Some(vec!["sh".to_string(), "-n".to_string(), "main.sh".to_string()]),
            run_command: vec!["sh".to_string(), "main.sh".to_string()],
            memory_limit_mb: 64,
            cpu_limit: 0.5,
        }])
    }

    fn scratch_root() -> PathBuf {
        let root = std::env::temp_dir().join(format!("reforge-engine-tests-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&root).expect("Failed to create scratch root");
        root
    }

    fn doubling_suite() -> SuiteResolution {
        SuiteResolution::Resolved(TestSuite::new(
            "double",
            vec![
                TestCase::new("1\n", "2\n"),
                TestCase::new("2\n", "4\n"),
                TestCase::new("3\n", "6\n"),
            ],
        ))
    }

    /// Test: Successful preparation and execution of multiple cases
    #[tokio::test]
    async fn test_process_engine_runs_every_case() {
        let root = scratch_root();
        let engine = ProcessEngine::new(shell_languages()).with_scratch_root(&root);

        let (program, compilation) = engine
            .prepare(&Language::Python, DOUBLER, COMPILE_TIMEOUT)
            .await
            .expect("prepare failed");
        assert!(compilation.success, "Compilation should succeed: {}", compilation.stderr);

        for (input, expected) in [("5\n", "10"), ("21\n", "42")] {
            let output = engine.run(&program, input, CASE_TIMEOUT).await.expect("run failed");
            assert_eq!(output.stdout.trim(), expected);
            assert_eq!(output.exit_code, Some(0));
            assert!(!output.timed_out);
            assert!(!output.runtime_error);
        }

        engine.release(program).await;
        assert_eq!(std::fs::read_dir(&root).unwrap().count(), 0, "Scratch directory should be removed");
        std::fs::remove_dir_all(&root).unwrap();
    }

    /// Test: Syntax errors surface as a failed compilation
    #[tokio::test]
    async fn test_process_engine_compilation_error() {
        let engine = ProcessEngine::new(shell_languages());

        let (program, compilation) = engine
            .prepare(&Language::Python, "echo (\n", COMPILE_TIMEOUT)
            .await
            .expect("prepare failed");

        assert!(!compilation.success, "Compilation should fail");
        assert!(!compilation.stderr.is_empty(), "Compiler diagnostics should be captured");
        engine.release(program).await;
    }

    /// Test: A hanging program is killed at the timeout
    #[tokio::test]
    async fn test_process_engine_timeout() {
        let engine = ProcessEngine::new(shell_languages());
        let (program, _) = engine
            .prepare(&Language::Python, "exec sleep 5\n", COMPILE_TIMEOUT)
            .await
            .expect("prepare failed");

        let started = std::time::Instant::now();
        let output = engine
            .run(&program, "", Duration::from_millis(300))
            .await
            .expect("run failed");

        assert!(output.timed_out, "Case should time out");
        assert!(started.elapsed() < Duration::from_secs(3), "Timeout must be a hard bound");
        assert_eq!(
            evaluate_case(&output, &TestCase::new("", "")),
            CaseVerdict::TimeLimitExceeded
        );
        engine.release(program).await;
    }

    /// Test: Non-zero exit is a runtime error carrying stderr
    #[tokio::test]
    async fn test_process_engine_runtime_error() {
        let engine = ProcessEngine::new(shell_languages());
        let (program, _) = engine
            .prepare(&Language::Python, "echo boom >&2\nexit 3\n", COMPILE_TIMEOUT)
            .await
            .expect("prepare failed");

        let output = engine.run(&program, "", CASE_TIMEOUT).await.expect("run failed");

        assert!(output.runtime_error);
        assert_eq!(output.exit_code, Some(3));
        assert!(output.stderr.contains("boom"));
        engine.release(program).await;
    }

    /// Test: Runaway output is capped and fails the case
    #[tokio::test]
    async fn test_process_engine_caps_runaway_output() {
        let engine = ProcessEngine::new(shell_languages());
        let flood = format!(
            "head -c {} /dev/zero | tr '\\0' a\n",
            crate::engine::MAX_OUTPUT_BYTES + 4 * 1024 * 1024
        );
        let (program, _) = engine
            .prepare(&Language::Python, &flood, COMPILE_TIMEOUT)
            .await
            .expect("prepare failed");

        let output = engine.run(&program, "", CASE_TIMEOUT).await.expect("run failed");

        assert!(!output.timed_out, "Capped output must not stall the child");
        assert!(output.runtime_error, "Overflowing output should fail the case");
        assert_eq!(output.stdout.len(), crate::engine::MAX_OUTPUT_BYTES);
        assert!(output.stderr.contains("Output limit exceeded"));
        assert_eq!(
            evaluate_case(&output, &TestCase::new("", "a")),
            CaseVerdict::RuntimeError
        );
        engine.release(program).await;
    }

    /// Test: Output under the cap is kept whole
    #[tokio::test]
    async fn test_process_engine_keeps_output_under_cap() {
        let engine = ProcessEngine::new(shell_languages());
        let (program, _) = engine
            .prepare(&Language::Python, "head -c 100000 /dev/zero | tr '\\0' a\n", COMPILE_TIMEOUT)
            .await
            .expect("prepare failed");

        let output = engine.run(&program, "", CASE_TIMEOUT).await.expect("run failed");

        assert!(!output.runtime_error, "{}", output.stderr);
        assert_eq!(output.stdout.len(), 100_000);
        engine.release(program).await;
    }

    /// Test: Oversized sources are refused before touching the filesystem
    #[tokio::test]
    async fn test_process_engine_rejects_oversized_source() {
        let engine = ProcessEngine::new(shell_languages());
        let source = "#".repeat(crate::engine::MAX_SOURCE_CODE_BYTES + 1);
        assert!(engine.prepare(&Language::Python, &source, COMPILE_TIMEOUT).await.is_err());
    }

    /// Test: Wrong answer on case 2 keeps grading and classifies as a mismatch
    #[tokio::test]
    async fn test_grader_mismatch_on_second_case() {
        let grader = Grader::new(ProcessEngine::new(shell_languages()), Language::Python, COMPILE_TIMEOUT);
        let candidate = "read n\nif [ \"$n\" = 2 ]; then echo 5; else echo $((n * 2)); fi\n";

        let result = grader
            .grade(candidate, &doubling_suite(), CASE_TIMEOUT, &CancelFlag::new())
            .await;

        assert_eq!(result.per_case_pass, vec![true, false, true]);
        assert!(result.global_failure.is_none());
        match classify(&result) {
            Outcome::AssertionFailure { failing_cases, detail } => {
                assert_eq!(failing_cases, vec![2]);
                assert!(detail.contains("Expected:\n4"));
            }
            other => panic!("expected assertion failure, got {:?}", other),
        }
    }

    /// Test: Timeout on case 1 is fatal for the whole grading
    #[tokio::test]
    async fn test_grader_timeout_on_first_case() {
        let root = scratch_root();
        let engine = ProcessEngine::new(shell_languages()).with_scratch_root(&root);
        let grader = Grader::new(engine, Language::Python, COMPILE_TIMEOUT);

        let result = grader
            .grade("exec sleep 5\n", &doubling_suite(), Duration::from_millis(300), &CancelFlag::new())
            .await;

        assert_eq!(result.per_case_pass, vec![false]);
        assert_eq!(result.global_failure, Some(GlobalFailure::TimedOut { case: 1 }));
        assert!(matches!(classify(&result), Outcome::ExecutionError { .. }));
        assert_eq!(std::fs::read_dir(&root).unwrap().count(), 0, "Scratch directory should be removed");
        std::fs::remove_dir_all(&root).unwrap();
    }

    /// Test: Successful compilation and execution in a container
    #[tokio::test]
    #[ignore] // Requires Docker
    async fn test_docker_python_success() {
        let languages = LanguageConfigManager::builtin();
        let engine = DockerEngine::new_with_config(&languages).expect("Failed to create Docker engine");
        let grader = Grader::new(engine, Language::Python, Duration::from_secs(30));

        let result = grader
            .grade("n = int(input())\nprint(n * 2)\n", &doubling_suite(), CASE_TIMEOUT, &CancelFlag::new())
            .await;

        assert_eq!(result.per_case_pass, vec![true, true, true], "{:?}", result.diagnostics);
        assert_eq!(classify(&result), Outcome::AllPass);
    }

    /// Test: Java compilation errors short-circuit grading
    #[tokio::test]
    #[ignore] // Requires Docker
    async fn test_docker_java_compilation_error() {
        let languages = LanguageConfigManager::builtin();
        let engine = DockerEngine::new_with_config(&languages).expect("Failed to create Docker engine");
        let grader = Grader::new(engine, Language::Java, Duration::from_secs(60));

        let result = grader
            .grade(
                "public class Main { public static void main(String[] a) { int x = } }",
                &doubling_suite(),
                CASE_TIMEOUT,
                &CancelFlag::new(),
            )
            .await;

        assert!(result.per_case_pass.is_empty(), "No case should run");
        assert_eq!(result.global_failure, Some(GlobalFailure::CompilationFailed));
        assert!(result.global_diagnostic().unwrap().contains("error"));
    }

    /// Test: Infinite loop is killed inside the container
    #[tokio::test]
    #[ignore] // Requires Docker
    async fn test_docker_timeout() {
        let languages = LanguageConfigManager::builtin();
        let engine = DockerEngine::new_with_config(&languages).expect("Failed to create Docker engine");
        let grader = Grader::new(engine, Language::Python, Duration::from_secs(30));

        let started = std::time::Instant::now();
        let result = grader
            .grade("while True:\n    pass\n", &doubling_suite(), Duration::from_secs(1), &CancelFlag::new())
            .await;

        assert_eq!(result.global_failure, Some(GlobalFailure::TimedOut { case: 1 }));
        assert!(started.elapsed() < Duration::from_secs(20), "Timeout must be enforced");
    }

    /// Test: Rust runtime panic on the second case
    #[tokio::test]
    #[ignore] // Requires Docker
    async fn test_docker_rust_runtime_error() {
        let languages = LanguageConfigManager::builtin();
        let engine = DockerEngine::new_with_config(&languages).expect("Failed to create Docker engine");
        let grader = Grader::new(engine, Language::Rust, Duration::from_secs(120));
        let source = r#"
use std::io::Read;
fn main() {
    let mut s = String::new();
    std::io::stdin().read_to_string(&mut s).unwrap();
    let n: i64 = s.trim().parse().unwrap();
    if n == 2 { panic!("boom"); }
    println!("{}", n * 2);
}
"#;

        let result = grader
            .grade(source, &doubling_suite(), CASE_TIMEOUT, &CancelFlag::new())
            .await;

        assert_eq!(result.per_case_pass, vec![true, false]);
        assert_eq!(result.global_failure, Some(GlobalFailure::RuntimeFault { case: 2 }));
    }
}
