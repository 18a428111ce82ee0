/// Execution Engine - Abstraction for Code Execution
///
/// **Core Responsibility:**
/// Prepare a candidate once, then run it against individual stdin payloads
/// and capture raw outputs.
///
/// **Critical Architectural Boundary:**
/// - Engine knows HOW to execute (local process, Docker)
/// - Engine does NOT compare outputs
/// - Engine returns raw outputs for the evaluator to judge
///
/// `Err` from an engine always means infrastructure trouble (cannot spawn,
/// cannot reach Docker). Candidate-side failures come back as data.

use crate::config::LanguageConfigManager;
use crate::evaluator::{CompilationResult, TestExecutionOutput};
use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use reforge_common::types::Language;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tracing::{debug, warn};

/// Safety limits to prevent pathological inputs from reaching an engine
pub const MAX_SOURCE_CODE_BYTES: usize = 1024 * 1024; // 1MB
pub const MAX_TEST_INPUT_BYTES: usize = 10 * 1024 * 1024; // 10MB
/// Per-stream cap on captured program output
pub const MAX_OUTPUT_BYTES: usize = 16 * 1024 * 1024; // 16MB

#[async_trait]
pub trait ExecutionEngine: Send + Sync {
    /// Engine-specific handle to a prepared candidate
    type Program: Send + Sync;

    /// Write the candidate out and compile / syntax-check it.
    ///
    /// The returned program must be passed to `release` even when
    /// compilation failed.
    async fn prepare(
        &self,
        language: &Language,
        source_code: &str,
        compile_timeout: Duration,
    ) -> Result<(Self::Program, CompilationResult)>;

    /// Run the prepared candidate with `input` on stdin.
    ///
    /// `timeout` is a hard bound: the program is killed once it elapses.
    async fn run(
        &self,
        program: &Self::Program,
        input: &str,
        timeout: Duration,
    ) -> Result<TestExecutionOutput>;

    async fn release(&self, program: Self::Program);
}

pub fn check_source_size(source_code: &str) -> Result<()> {
    if source_code.len() > MAX_SOURCE_CODE_BYTES {
        bail!("Source code exceeds maximum size of {} bytes", MAX_SOURCE_CODE_BYTES);
    }
    Ok(())
}

pub fn check_input_size(input: &str) -> Result<()> {
    if input.len() > MAX_TEST_INPUT_BYTES {
        bail!("Test input exceeds maximum size of {} bytes", MAX_TEST_INPUT_BYTES);
    }
    Ok(())
}

/// Runs candidates as local child processes inside a scratch directory.
///
/// Provides process isolation only: no namespaces, no resource limits.
/// Use `DockerEngine` for untrusted code.
#[derive(Debug, Clone)]
pub struct ProcessEngine {
    languages: LanguageConfigManager,
    scratch_root: PathBuf,
}

#[derive(Debug)]
pub struct ProcessProgram {
    workdir: PathBuf,
    run_command: Vec<String>,
}

impl ProcessEngine {
    pub fn new(languages: LanguageConfigManager) -> Self {
        Self {
            languages,
            scratch_root: std::env::temp_dir(),
        }
    }

    pub fn with_scratch_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.scratch_root = root.into();
        self
    }
}

#[async_trait]
impl ExecutionEngine for ProcessEngine {
    type Program = ProcessProgram;

    async fn prepare(
        &self,
        language: &Language,
        source_code: &str,
        compile_timeout: Duration,
    ) -> Result<(ProcessProgram, CompilationResult)> {
        check_source_size(source_code)?;
        let config = self.languages.get_config(language)?;

        let workdir = self
            .scratch_root
            .join(format!("reforge-{}", uuid::Uuid::new_v4()));
        tokio::fs::create_dir_all(&workdir)
            .await
            .with_context(|| format!("Failed to create scratch directory {}", workdir.display()))?;
        tokio::fs::write(workdir.join(&config.file_name), source_code)
            .await
            .context("Failed to write candidate source")?;

        let program = ProcessProgram {
            workdir,
            run_command: config.run_command.clone(),
        };

        let compilation = match &config.compile_command {
            None => CompilationResult::success(),
            Some(command) => {
                let output =
                    run_bounded(command, &program.workdir, None, compile_timeout).await?;
                if output.timed_out {
                    CompilationResult::failure(format!(
                        "Compilation timed out after {}ms",
                        compile_timeout.as_millis()
                    ))
                } else if output.runtime_error {
                    // Compilers disagree on which stream carries diagnostics
                    let mut text = output.stderr;
                    text.push_str(&output.stdout);
                    CompilationResult::failure(text)
                } else {
                    CompilationResult::success()
                }
            }
        };

        debug!(
            language = %language,
            workdir = %program.workdir.display(),
            compiled = compilation.success,
            "Prepared candidate"
        );

        Ok((program, compilation))
    }

    async fn run(
        &self,
        program: &ProcessProgram,
        input: &str,
        timeout: Duration,
    ) -> Result<TestExecutionOutput> {
        check_input_size(input)?;
        run_bounded(&program.run_command, &program.workdir, Some(input), timeout).await
    }

    async fn release(&self, program: ProcessProgram) {
        if let Err(e) = tokio::fs::remove_dir_all(&program.workdir).await {
            warn!(
                workdir = %program.workdir.display(),
                error = %e,
                "Failed to remove scratch directory"
            );
        }
    }
}

/// Spawn `command` in `workdir` and wait for it under a hard timeout.
///
/// The child is spawned with `kill_on_drop`, so when the timeout fires and
/// the wait future is dropped the process is killed.
async fn run_bounded(
    command: &[String],
    workdir: &Path,
    stdin: Option<&str>,
    timeout: Duration,
) -> Result<TestExecutionOutput> {
    let (program, args) = command
        .split_first()
        .context("Language command is empty")?;

    let start_time = Instant::now();

    let mut child = Command::new(program)
        .args(args)
        .current_dir(workdir)
        .stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .with_context(|| format!("Failed to spawn '{}'", program))?;

    // Feed stdin from a separate task so a program that writes before it
    // finishes reading cannot deadlock against us
    if let (Some(mut pipe), Some(input)) = (child.stdin.take(), stdin) {
        let payload = input.as_bytes().to_vec();
        tokio::spawn(async move {
            // A program that exits without reading closes the pipe early
            let _ = pipe.write_all(&payload).await;
            let _ = pipe.shutdown().await;
        });
    }

    let stdout_pipe = child.stdout.take().context("Child stdout was not captured")?;
    let stderr_pipe = child.stderr.take().context("Child stderr was not captured")?;
    let mut stdout_task = tokio::spawn(read_capped(stdout_pipe, MAX_OUTPUT_BYTES));
    let mut stderr_task = tokio::spawn(read_capped(stderr_pipe, MAX_OUTPUT_BYTES));

    let finished = tokio::time::timeout(timeout, async {
        // Once a reader hits its cap it drops the pipe, so the child cannot
        // stay blocked on a full pipe
        let (stdout, stderr) = tokio::join!(&mut stdout_task, &mut stderr_task);
        let status = child.wait().await.context("Failed to wait for child process")?;
        let stdout = stdout.context("stdout reader panicked")?.context("Failed to read child stdout")?;
        let stderr = stderr.context("stderr reader panicked")?.context("Failed to read child stderr")?;
        Ok::<_, anyhow::Error>((status, stdout, stderr))
    })
    .await;

    let output = match finished {
        Ok(result) => {
            let (status, stdout, stderr) = result?;
            let exit_code = status.code().map(i64::from);
            let mut stderr_text = describe_exit(String::from_utf8_lossy(&stderr.bytes).into_owned(), &status);
            let output_limit_exceeded = stdout.truncated || stderr.truncated;
            if output_limit_exceeded {
                warn!(limit_bytes = MAX_OUTPUT_BYTES, "Candidate output exceeded the capture limit");
                stderr_text.push_str(&format!(
                    "\n[Output limit exceeded: more than {} bytes written]",
                    MAX_OUTPUT_BYTES
                ));
            }
            TestExecutionOutput {
                stdout: String::from_utf8_lossy(&stdout.bytes).into_owned(),
                stderr: stderr_text,
                exit_code,
                execution_time_ms: start_time.elapsed().as_millis() as u64,
                timed_out: false,
                runtime_error: output_limit_exceeded || !status.success(),
            }
        }
        Err(_) => {
            stdout_task.abort();
            stderr_task.abort();
            TestExecutionOutput {
                stdout: String::new(),
                stderr: format!("[Execution timed out after {}ms]", timeout.as_millis()),
                exit_code: None,
                execution_time_ms: start_time.elapsed().as_millis() as u64,
                timed_out: true,
                runtime_error: false,
            }
        }
    };

    Ok(output)
}

/// Bytes read from one output stream, at most `limit`
struct CapturedStream {
    bytes: Vec<u8>,
    truncated: bool,
}

async fn read_capped<R>(reader: R, limit: usize) -> std::io::Result<CapturedStream>
where
    R: AsyncRead + Unpin,
{
    let mut bytes = Vec::new();
    // One byte past the limit tells a full-but-legal stream from an overflowing one
    reader.take(limit as u64 + 1).read_to_end(&mut bytes).await?;
    let truncated = bytes.len() > limit;
    bytes.truncate(limit);
    Ok(CapturedStream { bytes, truncated })
}

#[cfg(unix)]
fn describe_exit(mut stderr: String, status: &std::process::ExitStatus) -> String {
    use std::os::unix::process::ExitStatusExt;

    match status.signal() {
        Some(9) => stderr.push_str("\n[Process killed: likely exceeded memory limit]"),
        Some(11) => stderr.push_str("\n[Process killed: segmentation fault]"),
        Some(signal) => stderr.push_str(&format!("\n[Process killed by signal {}]", signal)),
        None => {}
    }
    stderr
}

#[cfg(not(unix))]
fn describe_exit(stderr: String, _status: &std::process::ExitStatus) -> String {
    stderr
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_read_capped_at_exact_limit() {
        let captured = read_capped(&b"abcd"[..], 4).await.unwrap();
        assert_eq!(captured.bytes, b"abcd");
        assert!(!captured.truncated);
    }

    #[tokio::test]
    async fn test_read_capped_past_limit() {
        let captured = read_capped(&b"abcdef"[..], 4).await.unwrap();
        assert_eq!(captured.bytes, b"abcd");
        assert!(captured.truncated);
    }
}
