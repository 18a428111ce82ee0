//! Completion service: turns a repair prompt into revised program text.
//!
//! The loop only sees the `CompletionService` trait. The shipped
//! implementation talks to any OpenAI-compatible `/chat/completions`
//! endpoint and reports token usage into a caller-owned `UsageLedger`.

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, warn};

const DEFAULT_API_BASE: &str = "https://api.openai.com/v1";
const DEFAULT_MODEL: &str = "gpt-4o-mini";
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 120;

/// Maximum length for provider error bodies carried into error messages
const MAX_ERROR_CONTENT_LEN: usize = 200;

#[async_trait]
pub trait CompletionService: Send + Sync {
    /// Return the model's reply to `prompt`. Errors are fatal to the invocation.
    async fn complete(&self, prompt: &str) -> Result<String>;
}

/// Token usage reported by the provider for one request
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
    #[serde(default)]
    pub total_tokens: u64,
    /// Cost in USD when the provider reports one
    #[serde(default, alias = "total_cost")]
    pub cost: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct UsageTotals {
    pub requests: u64,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    pub total_cost: f64,
}

/// Caller-owned usage accumulator, shared with the completion service
#[derive(Debug, Clone, Default)]
pub struct UsageLedger {
    totals: Arc<Mutex<UsageTotals>>,
}

impl UsageLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, usage: &Usage) {
        // A poisoned ledger only means another recorder panicked mid-update
        let mut totals = self.totals.lock().unwrap_or_else(|e| e.into_inner());
        totals.requests += 1;
        totals.prompt_tokens += usage.prompt_tokens;
        totals.completion_tokens += usage.completion_tokens;
        totals.total_tokens += usage.total_tokens;
        totals.total_cost += usage.cost.unwrap_or(0.0);
    }

    pub fn totals(&self) -> UsageTotals {
        self.totals.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[derive(Debug, Clone)]
pub struct CompletionConfig {
    pub api_base_url: String,
    pub api_key: String,
    pub model: String,
    pub system_prompt: Option<String>,
    pub request_timeout: Duration,
}

impl CompletionConfig {
    /// Read `REFORGE_API_BASE`, `REFORGE_API_KEY` (or `OPENAI_API_KEY`),
    /// `REFORGE_MODEL` and `REFORGE_REQUEST_TIMEOUT_SECS`
    pub fn from_env() -> Result<Self> {
        let api_key = std::env::var("REFORGE_API_KEY")
            .or_else(|_| std::env::var("OPENAI_API_KEY"))
            .context("REFORGE_API_KEY (or OPENAI_API_KEY) must be set to request repairs")?;

        let request_timeout_secs = std::env::var("REFORGE_REQUEST_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_REQUEST_TIMEOUT_SECS);

        Ok(Self {
            api_base_url: std::env::var("REFORGE_API_BASE")
                .unwrap_or_else(|_| DEFAULT_API_BASE.to_string()),
            api_key,
            model: std::env::var("REFORGE_MODEL").unwrap_or_else(|_| DEFAULT_MODEL.to_string()),
            system_prompt: std::env::var("REFORGE_SYSTEM_PROMPT").ok(),
            request_timeout: Duration::from_secs(request_timeout_secs),
        })
    }
}

pub struct OpenAiCompletionService {
    client: reqwest::Client,
    config: CompletionConfig,
    ledger: UsageLedger,
}

impl OpenAiCompletionService {
    pub fn new(config: CompletionConfig, ledger: UsageLedger) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            client,
            config,
            ledger,
        })
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.config.api_base_url.trim_end_matches('/'))
    }
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    content: Option<String>,
}

#[async_trait]
impl CompletionService for OpenAiCompletionService {
    async fn complete(&self, prompt: &str) -> Result<String> {
        let mut messages = Vec::new();
        if let Some(system_prompt) = &self.config.system_prompt {
            messages.push(json!({ "role": "system", "content": system_prompt }));
        }
        messages.push(json!({ "role": "user", "content": prompt }));

        let body = json!({
            "model": self.config.model,
            "messages": messages,
        });

        debug!(model = %self.config.model, prompt_chars = prompt.len(), "Requesting repair");

        let response = self
            .client
            .post(self.endpoint())
            .bearer_auth(&self.config.api_key)
            .json(&body)
            .send()
            .await
            .context("provider request failed")?;

        let status = response.status();
        let body_text = response
            .text()
            .await
            .context("provider response read failed")?;

        if !status.is_success() {
            bail!(
                "provider request failed ({}): {}",
                status,
                truncate(&body_text, MAX_ERROR_CONTENT_LEN)
            );
        }

        let parsed: ChatResponse =
            serde_json::from_str(&body_text).context("provider response parse failed")?;

        match &parsed.usage {
            Some(usage) => self.ledger.record(usage),
            None => warn!("Provider response carried no usage block"),
        }

        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .filter(|content| !content.trim().is_empty())
            .ok_or_else(|| anyhow!("provider response missing assistant content"))
    }
}

/// Pull program text out of a model reply.
///
/// Takes the last fenced code block when there is one (models tend to put
/// the final version last), otherwise the whole reply.
pub fn extract_code(response: &str) -> String {
    let mut blocks = Vec::new();
    let mut rest = response;

    while let Some(open) = rest.find("```") {
        let after_fence = &rest[open + 3..];
        // Skip the info string, e.g. ```python
        let body_start = after_fence.find('\n').map(|i| i + 1).unwrap_or(after_fence.len());
        let body = &after_fence[body_start..];
        match body.find("```") {
            Some(close) => {
                blocks.push(&body[..close]);
                rest = &body[close + 3..];
            }
            None => break,
        }
    }

    match blocks.last() {
        Some(block) => block.trim_matches('\n').to_string(),
        None => response.trim().to_string(),
    }
}

fn truncate(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}
