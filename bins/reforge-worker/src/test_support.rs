//! Scripted collaborators shared by the unit tests.
//!
//! `ScriptedEngine` interprets the candidate text as a tiny behaviour script
//! instead of running it:
//! - `ENGINE DOWN` → `prepare` returns an infrastructure error
//! - `SYNTAX ERROR` → compilation fails
//! - `hang` → every case times out
//! - `crash on N` → runtime error when the input is N; bare `crash` always
//! - `but N` → wrong answer when the input is N
//! - `double` → prints twice the input, `echo` → prints the input

use crate::cancel::CancelFlag;
use crate::completion::CompletionService;
use crate::engine::ExecutionEngine;
use crate::evaluator::{CompilationResult, TestExecutionOutput};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use reforge_common::types::Language;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Clone, Default)]
pub struct ScriptedEngine {
    prepares: Arc<AtomicUsize>,
    runs: Arc<AtomicUsize>,
    releases: Arc<AtomicUsize>,
    cancel_on_run: Option<CancelFlag>,
}

impl ScriptedEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raises `cancel` while the first case is running
    pub fn cancelling(cancel: CancelFlag) -> Self {
        Self {
            cancel_on_run: Some(cancel),
            ..Default::default()
        }
    }

    pub fn prepares(&self) -> usize {
        self.prepares.load(Ordering::SeqCst)
    }

    pub fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }

    pub fn releases(&self) -> usize {
        self.releases.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ExecutionEngine for ScriptedEngine {
    type Program = String;

    async fn prepare(
        &self,
        _language: &Language,
        source_code: &str,
        _compile_timeout: Duration,
    ) -> Result<(String, CompilationResult)> {
        self.prepares.fetch_add(1, Ordering::SeqCst);
        if source_code.contains("ENGINE DOWN") {
            return Err(anyhow!("Docker daemon unreachable"));
        }
        let compilation = if source_code.contains("SYNTAX ERROR") {
            CompilationResult::failure("  File \"main.py\", line 1\nSyntaxError: invalid syntax".to_string())
        } else {
            CompilationResult::success()
        };
        Ok((source_code.to_string(), compilation))
    }

    async fn run(
        &self,
        program: &String,
        input: &str,
        timeout: Duration,
    ) -> Result<TestExecutionOutput> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        if let Some(cancel) = &self.cancel_on_run {
            cancel.cancel();
        }
        let n: i64 = input.trim().parse().unwrap_or(0);

        if program.contains("hang") {
            return Ok(TestExecutionOutput {
                stderr: format!("[Execution timed out after {}ms]", timeout.as_millis()),
                execution_time_ms: timeout.as_millis() as u64,
                timed_out: true,
                ..Default::default()
            });
        }

        if program.trim() == "crash" || program.contains(&format!("crash on {}", n)) {
            return Ok(TestExecutionOutput {
                stderr: "Traceback (most recent call last):\nZeroDivisionError: division by zero".to_string(),
                exit_code: Some(1),
                execution_time_ms: 3,
                runtime_error: true,
                ..Default::default()
            });
        }

        let stdout = if program.contains(&format!("but {}", n)) {
            "wrong\n".to_string()
        } else if program.starts_with("double") {
            format!("{}\n", n * 2)
        } else if program.starts_with("echo") {
            input.to_string()
        } else {
            String::new()
        };

        Ok(TestExecutionOutput {
            stdout,
            exit_code: Some(0),
            execution_time_ms: 2,
            ..Default::default()
        })
    }

    async fn release(&self, _program: String) {
        self.releases.fetch_add(1, Ordering::SeqCst);
    }
}

/// Completion service replaying canned responses and recording prompts
#[derive(Clone, Default)]
pub struct ScriptedCompletion {
    responses: Arc<Mutex<VecDeque<String>>>,
    prompts: Arc<Mutex<Vec<String>>>,
    fail: bool,
    cancel_on_call: Option<CancelFlag>,
}

impl ScriptedCompletion {
    /// Replies with `responses` in order, then repeats the last one
    pub fn replying(responses: &[&str]) -> Self {
        Self {
            responses: Arc::new(Mutex::new(responses.iter().map(|r| r.to_string()).collect())),
            ..Default::default()
        }
    }

    /// Raises `cancel` while each request is in flight
    pub fn cancelling(mut self, cancel: CancelFlag) -> Self {
        self.cancel_on_call = Some(cancel);
        self
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Default::default()
        }
    }

    pub fn calls(&self) -> usize {
        self.prompts.lock().unwrap().len()
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }
}

#[async_trait]
impl CompletionService for ScriptedCompletion {
    async fn complete(&self, prompt: &str) -> Result<String> {
        self.prompts.lock().unwrap().push(prompt.to_string());
        if let Some(cancel) = &self.cancel_on_call {
            cancel.cancel();
        }
        if self.fail {
            return Err(anyhow!("provider request failed (503): upstream unavailable"));
        }
        let mut responses = self.responses.lock().unwrap();
        let response = if responses.len() > 1 {
            responses.pop_front()
        } else {
            responses.front().cloned()
        };
        response.ok_or_else(|| anyhow!("no scripted response left"))
    }
}
