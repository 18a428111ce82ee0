/// Docker-based execution engine for sandboxed candidate execution
///
/// **Docker Execution Rules:**
/// 1. Pulls the language image if not present
/// 2. Creates one long-lived container per candidate:
///    - Network disabled
///    - CPU/memory limits from the language config
/// 3. Writes the source and compiles once (`exec`)
/// 4. Runs every case against the compiled artifact (`exec`), each bounded by
///    `timeout -s KILL` inside the container and a tokio timeout outside it
/// 5. Force-removes the container when the program is released or dropped

use crate::config::LanguageConfigManager;
use crate::engine::{check_input_size, check_source_size, ExecutionEngine, MAX_OUTPUT_BYTES};
use crate::evaluator::{CompilationResult, TestExecutionOutput};
use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose};
use bollard::container::{
    Config, CreateContainerOptions, KillContainerOptions, LogOutput, RemoveContainerOptions,
    StartContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecOptions, StartExecResults};
use bollard::image::CreateImageOptions;
use bollard::Docker;
use futures_util::stream::StreamExt;
use reforge_common::types::Language;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const CODE_DIR: &str = "/code";
const INPUT_PATH: &str = "/tmp/case-input";

/// Base64 payload per `exec` when writing files; stays well below the
/// kernel's per-argument length limit
const WRITE_CHUNK_BYTES: usize = 64 * 1024;

/// Extra time granted to the outer timeout so the in-container `timeout`
/// gets to fire first
const KILL_GRACE: Duration = Duration::from_millis(500);

/// Exit statuses `timeout` reports for a command it had to stop
const TIMEOUT_EXIT_CODES: [i64; 2] = [124, 137];

pub struct DockerEngine {
    docker: Docker,
    languages: LanguageConfigManager,
}

/// A running container holding one prepared candidate.
///
/// Dropping it removes the container, so cleanup also happens when the
/// grading future is cancelled mid-run.
pub struct ContainerProgram {
    docker: Docker,
    container_id: String,
    run_command: Vec<String>,
}

impl Drop for ContainerProgram {
    fn drop(&mut self) {
        // Best-effort cleanup - cannot be async in Drop
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(container_id = %self.container_id, "No runtime available to remove container");
            return;
        };
        let docker = self.docker.clone();
        let container_id = self.container_id.clone();

        handle.spawn(async move {
            let remove_options = RemoveContainerOptions {
                force: true,
                ..Default::default()
            };

            if let Err(e) = docker.remove_container(&container_id, Some(remove_options)).await {
                warn!(container_id = %container_id, error = %e, "Failed to cleanup container");
            }
        });
    }
}

/// Collected result of one `exec`
struct ExecOutput {
    stdout: String,
    stderr: String,
    exit_code: Option<i64>,
    /// Output went past `MAX_OUTPUT_BYTES` and reading stopped early
    truncated: bool,
}

fn cap_text(mut text: String) -> String {
    if text.len() > MAX_OUTPUT_BYTES {
        let mut end = MAX_OUTPUT_BYTES;
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        text.truncate(end);
    }
    text
}

impl DockerEngine {
    /// Create a new Docker engine with language config manager
    pub fn new_with_config(languages: &LanguageConfigManager) -> Result<Self> {
        let docker = Docker::connect_with_local_defaults()
            .context("Failed to connect to Docker daemon")?;

        Ok(DockerEngine {
            docker,
            languages: languages.clone(),
        })
    }

    /// Ensure Docker image is available (pull if needed)
    async fn ensure_image(&self, image: &str) -> Result<()> {
        if self.docker.inspect_image(image).await.is_ok() {
            debug!(image = %image, "Image cache hit");
            return Ok(());
        }

        warn!(image = %image, "Image cache miss, pulling now");

        let options = Some(CreateImageOptions {
            from_image: image,
            ..Default::default()
        });

        let mut stream = self.docker.create_image(options, None, None);
        while let Some(result) = stream.next().await {
            result.context("Failed to pull Docker image")?;
        }

        info!(image = %image, "Image pulled successfully");
        Ok(())
    }

    /// Run a shell command in the container and collect its output, keeping
    /// at most `MAX_OUTPUT_BYTES` per stream
    async fn exec_collect(&self, container_id: &str, script: &str) -> Result<ExecOutput> {
        let exec_config = CreateExecOptions {
            cmd: Some(vec!["sh".to_string(), "-c".to_string(), script.to_string()]),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            working_dir: Some(CODE_DIR.to_string()),
            ..Default::default()
        };

        let exec = self.docker
            .create_exec(container_id, exec_config)
            .await
            .context("Failed to create exec")?;

        let start_config = StartExecOptions {
            detach: false,
            ..Default::default()
        };

        let mut stdout = String::new();
        let mut stderr = String::new();
        let mut truncated = false;

        match self.docker.start_exec(&exec.id, Some(start_config)).await? {
            StartExecResults::Attached { mut output, .. } => {
                while let Some(msg) = output.next().await {
                    match msg? {
                        LogOutput::StdOut { message } => {
                            stdout.push_str(&String::from_utf8_lossy(&message));
                        }
                        LogOutput::StdErr { message } => {
                            stderr.push_str(&String::from_utf8_lossy(&message));
                        }
                        _ => {}
                    }
                    if stdout.len() > MAX_OUTPUT_BYTES || stderr.len() > MAX_OUTPUT_BYTES {
                        // Stop reading; the in-container timeout ends the process
                        truncated = true;
                        break;
                    }
                }
            }
            StartExecResults::Detached => bail!("Exec unexpectedly started detached"),
        }

        let inspect = self.docker.inspect_exec(&exec.id).await?;
        Ok(ExecOutput {
            stdout: cap_text(stdout),
            stderr: cap_text(stderr),
            exit_code: inspect.exit_code,
            truncated,
        })
    }

    /// Write `content` to `path` inside the container in base64 chunks
    async fn write_file(&self, container_id: &str, path: &str, content: &str) -> Result<()> {
        let encoded = general_purpose::STANDARD.encode(content);
        let script = format!(": > {}.b64", path);
        self.exec_checked(container_id, &script).await?;

        // base64 output is ASCII, so byte chunks are valid str slices
        for chunk in encoded.as_bytes().chunks(WRITE_CHUNK_BYTES) {
            let chunk = std::str::from_utf8(chunk).context("Invalid base64 chunk")?;
            let script = format!("printf '%s' '{}' >> {}.b64", chunk, path);
            self.exec_checked(container_id, &script).await?;
        }

        let script = format!("base64 -d {0}.b64 > {0} && rm -f {0}.b64", path);
        self.exec_checked(container_id, &script).await
    }

    async fn exec_checked(&self, container_id: &str, script: &str) -> Result<()> {
        let output = self.exec_collect(container_id, script).await?;
        if output.exit_code != Some(0) {
            bail!("Container command failed ({:?}): {}", output.exit_code, output.stderr.trim());
        }
        Ok(())
    }
}

#[async_trait]
impl ExecutionEngine for DockerEngine {
    type Program = ContainerProgram;

    async fn prepare(
        &self,
        language: &Language,
        source_code: &str,
        compile_timeout: Duration,
    ) -> Result<(ContainerProgram, CompilationResult)> {
        check_source_size(source_code)?;
        let config = self.languages.get_config(language)?;

        self.ensure_image(&config.image).await
            .with_context(|| format!("Failed to ensure Docker image '{}' is available", config.image))?;

        let container_config = Config {
            image: Some(config.image.clone()),
            cmd: Some(vec!["sleep".to_string(), "infinity".to_string()]),
            entrypoint: Some(vec![]),
            network_disabled: Some(true), // SECURITY: No network access
            working_dir: Some(CODE_DIR.to_string()),
            host_config: Some(bollard::models::HostConfig {
                memory: Some(i64::from(config.memory_limit_mb) * 1024 * 1024),
                nano_cpus: Some((config.cpu_limit * 1_000_000_000.0) as i64),
                readonly_rootfs: Some(false), // Compilers write next to the source
                ..Default::default()
            }),
            ..Default::default()
        };

        let container_name = format!("reforge-{}", uuid::Uuid::new_v4());
        let create_options = CreateContainerOptions {
            name: container_name.as_str(),
            platform: None,
        };

        let container = self.docker
            .create_container(Some(create_options), container_config)
            .await
            .context("Failed to create Docker container")?;

        // Owned from here on, so every early return below removes the container
        let program = ContainerProgram {
            docker: self.docker.clone(),
            container_id: container.id,
            run_command: config.run_command.clone(),
        };

        self.docker
            .start_container(&program.container_id, None::<StartContainerOptions<String>>)
            .await
            .context("Failed to start Docker container")?;

        let source_path = format!("{}/{}", CODE_DIR, config.file_name);
        self.write_file(&program.container_id, &source_path, source_code)
            .await
            .context("Failed to write source code to container")?;

        let compilation = match &config.compile_command {
            None => CompilationResult::success(),
            Some(command) => {
                let start_time = Instant::now();
                let script = command.join(" ");
                let compile = self.exec_collect(&program.container_id, &script);
                match tokio::time::timeout(compile_timeout, compile).await {
                    Ok(result) => {
                        let output = result?;
                        debug!(
                            compilation_time_ms = start_time.elapsed().as_millis() as u64,
                            exit_code = ?output.exit_code,
                            "Compilation finished"
                        );
                        if output.exit_code == Some(0) && !output.truncated {
                            CompilationResult::success()
                        } else {
                            CompilationResult::failure(format!("{}{}", output.stderr, output.stdout))
                        }
                    }
                    Err(_) => CompilationResult::failure(format!(
                        "Compilation timed out after {}ms",
                        compile_timeout.as_millis()
                    )),
                }
            }
        };

        Ok((program, compilation))
    }

    async fn run(
        &self,
        program: &ContainerProgram,
        input: &str,
        timeout: Duration,
    ) -> Result<TestExecutionOutput> {
        check_input_size(input)?;
        self.write_file(&program.container_id, INPUT_PATH, input)
            .await
            .context("Failed to write test input to container")?;

        // `timeout` takes whole seconds with a fractional part
        let seconds = format!("{:.3}", timeout.as_secs_f64());
        let script = format!(
            "timeout -s KILL {} {} < {}",
            seconds,
            program.run_command.join(" "),
            INPUT_PATH
        );

        let start_time = Instant::now();
        let execution = self.exec_collect(&program.container_id, &script);
        let result = tokio::time::timeout(timeout + KILL_GRACE, execution).await;
        let execution_time_ms = start_time.elapsed().as_millis() as u64;

        let output = match result {
            Ok(Ok(ExecOutput { stdout, mut stderr, exit_code, truncated })) => {
                let killed = exit_code.is_some_and(|code| TIMEOUT_EXIT_CODES.contains(&code));
                let timed_out = killed && start_time.elapsed() >= timeout;
                if exit_code == Some(137) && !timed_out {
                    stderr.push_str("\n[Container process killed: likely OOM or exceeded memory limit]");
                } else if exit_code == Some(139) {
                    stderr.push_str("\n[Container process killed: segmentation fault]");
                }
                if truncated {
                    warn!(limit_bytes = MAX_OUTPUT_BYTES, "Candidate output exceeded the capture limit");
                    stderr.push_str(&format!(
                        "\n[Output limit exceeded: more than {} bytes written]",
                        MAX_OUTPUT_BYTES
                    ));
                }
                TestExecutionOutput {
                    stdout: if timed_out { String::new() } else { stdout },
                    stderr,
                    exit_code,
                    execution_time_ms,
                    timed_out,
                    runtime_error: !timed_out && (truncated || exit_code != Some(0)),
                }
            }
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                warn!(
                    container_id = %program.container_id,
                    timeout_ms = timeout.as_millis() as u64,
                    "Case outlived its timeout, killing container"
                );
                if let Err(e) = self.docker
                    .kill_container(&program.container_id, None::<KillContainerOptions<String>>)
                    .await
                {
                    warn!(error = %e, "Failed to kill timed-out container");
                }
                TestExecutionOutput {
                    stdout: String::new(),
                    stderr: format!("[Execution timed out after {}ms]", timeout.as_millis()),
                    exit_code: None,
                    execution_time_ms,
                    timed_out: true,
                    runtime_error: false,
                }
            }
        };

        Ok(output)
    }

    async fn release(&self, program: ContainerProgram) {
        debug!(container_id = %program.container_id, "Releasing container");
        drop(program);
    }
}
