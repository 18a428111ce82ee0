mod cancel;
mod classifier;
mod completion;
mod config;
mod docker;
mod engine;
mod evaluator;
mod feedback;
mod grader;
mod repair;
mod test_source;

#[cfg(test)]
mod engine_tests;
#[cfg(test)]
mod test_support;

use anyhow::{bail, Context, Result};
use cancel::CancelFlag;
use clap::{Args, Parser, Subcommand, ValueEnum};
use completion::{CompletionConfig, OpenAiCompletionService, UsageLedger};
use config::LanguageConfigManager;
use docker::DockerEngine;
use engine::{ExecutionEngine, ProcessEngine};
use grader::Grader;
use reforge_common::config::RepairConfig;
use reforge_common::types::{Language, Outcome};
use repair::{RepairLoop, RepairTask};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use test_source::{JsonlTestSource, RedisTestSource, TestSource};
use tracing::{error, info, warn};

/// Extra time granted after the deadline for the current case to unwind
const DEADLINE_GRACE: Duration = Duration::from_secs(10);

#[derive(Parser)]
#[command(name = "reforge-worker")]
#[command(about = "Reforge - grade generated programs on stdio tests and repair them", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Grade a candidate and repair it until it passes or the budget runs out
    Run {
        #[command(flatten)]
        common: CommonArgs,

        /// File holding the problem statement
        #[arg(short, long)]
        problem: PathBuf,

        /// Maximum number of repair requests (default REFORGE_TEST_LOOP or 3)
        #[arg(long)]
        test_loop: Option<u32>,
    },

    /// Grade a candidate once without repairing it
    Grade {
        #[command(flatten)]
        common: CommonArgs,
    },
}

#[derive(Args)]
struct CommonArgs {
    /// Problem identifier used to look up the test suite
    #[arg(short, long, default_value = "")]
    question_id: String,

    /// Fallback lookup key when no question id is given
    #[arg(long, default_value = "")]
    entry_point: String,

    /// File holding the candidate program
    #[arg(short, long)]
    candidate: PathBuf,

    /// Candidate language (python, java, rust)
    #[arg(short, long, default_value = "python")]
    language: Language,

    /// Where candidates run
    #[arg(long, value_enum, default_value_t = EngineKind::Process)]
    engine: EngineKind,

    /// JSONL dataset holding the public test cases
    #[arg(long, conflicts_with = "redis_url")]
    tests: Option<PathBuf>,

    /// Redis holding test cases under reforge:tests:{id} (default REDIS_URL)
    #[arg(long)]
    redis_url: Option<String>,

    /// Hard bound on each case (default REFORGE_CASE_TIMEOUT_MS or 6000)
    #[arg(long)]
    case_timeout_ms: Option<u64>,

    /// Overall deadline for the invocation; cancels the loop when reached
    #[arg(long)]
    deadline_secs: Option<u64>,
}

#[derive(Clone, Copy, ValueEnum)]
enum EngineKind {
    Process,
    Docker,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let common = match &cli.command {
        Commands::Run { common, .. } | Commands::Grade { common } => common,
    };

    let languages = LanguageConfigManager::load_default()
        .context("Failed to load language configurations")?;
    languages
        .get_config(&common.language)
        .with_context(|| format!("Available languages: {:?}", languages.list_languages()))?;

    info!(
        language = %common.language,
        languages = ?languages.list_languages(),
        "Reforge worker booting"
    );
    if let EngineKind::Docker = common.engine {
        info!(
            image = %languages.get_image(&common.language)?,
            memory_mb = languages.get_memory_limit_mb(&common.language)?,
            cpu_limit = languages.get_cpu_limit(&common.language)?,
            "Docker execution configuration"
        );
    }

    let passed = match common.engine {
        EngineKind::Process => execute(ProcessEngine::new(languages), &cli.command).await?,
        EngineKind::Docker => {
            let engine = DockerEngine::new_with_config(&languages)
                .context("Failed to create Docker engine")?;
            execute(engine, &cli.command).await?
        }
    };

    std::process::exit(if passed { 0 } else { 1 });
}

/// Stderr only: stdout carries the JSON result
fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false);

    if std::env::var("REFORGE_LOG_FORMAT").as_deref() == Ok("json") {
        builder.json().init();
    } else {
        builder.with_line_number(true).init();
    }
}

async fn execute<E: ExecutionEngine>(engine: E, command: &Commands) -> Result<bool> {
    match command {
        Commands::Run {
            common,
            problem,
            test_loop,
        } => run_repair(engine, common, problem, *test_loop).await,
        Commands::Grade { common } => run_grade(engine, common).await,
    }
}

async fn run_repair<E: ExecutionEngine>(
    engine: E,
    common: &CommonArgs,
    problem: &Path,
    test_loop: Option<u32>,
) -> Result<bool> {
    let mut repair_config = loop_config(common);
    if let Some(test_loop) = test_loop {
        repair_config.test_loop = test_loop;
    }

    let task = RepairTask {
        problem: read_file(problem).await?,
        candidate: read_file(&common.candidate).await?,
        question_id: common.question_id.clone(),
        entry_point: common.entry_point.clone(),
    };
    if task.search_key().is_empty() {
        bail!("Either --question-id or --entry-point is required");
    }

    let tests = test_source(common).await?;
    let ledger = UsageLedger::new();
    let completion = OpenAiCompletionService::new(CompletionConfig::from_env()?, ledger.clone())?;
    let grader = Grader::new(engine, common.language, repair_config.compile_timeout());
    let repair = RepairLoop::new(grader, Arc::new(completion), tests, repair_config);

    let cancel = cancel_on_signals(common.deadline_secs);
    let result = bounded(common.deadline_secs, repair.run(&task, &cancel)).await?;

    info!(
        question_id = %result.question_id,
        passed = result.passed,
        repairs = result.repair_count(),
        last_outcome = ?result.last_outcome().map(outcome_kind),
        "Repair run completed"
    );

    let totals = ledger.totals();
    info!(
        requests = totals.requests,
        prompt_tokens = totals.prompt_tokens,
        completion_tokens = totals.completion_tokens,
        total_cost = totals.total_cost,
        "Completion usage"
    );

    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(result.passed)
}

async fn run_grade<E: ExecutionEngine>(engine: E, common: &CommonArgs) -> Result<bool> {
    let repair_config = loop_config(common);
    let task = RepairTask {
        candidate: read_file(&common.candidate).await?,
        question_id: common.question_id.clone(),
        entry_point: common.entry_point.clone(),
        ..Default::default()
    };
    if task.search_key().is_empty() {
        bail!("Either --question-id or --entry-point is required");
    }

    let tests = test_source(common).await?;
    let suite = tests.resolve(task.search_key()).await;
    let grader = Grader::new(engine, common.language, repair_config.compile_timeout());

    let cancel = cancel_on_signals(common.deadline_secs);
    let grade = bounded(
        common.deadline_secs,
        async {
            Ok(grader
                .grade(&task.candidate, &suite, repair_config.per_case_timeout(), &cancel)
                .await)
        },
    )
    .await?;
    let outcome = classifier::classify(&grade);

    info!(
        question_id = %task.search_key(),
        passed = grade.passed_count(),
        total = grade.per_case_pass.len(),
        execution_ms = grade.elapsed_ms,
        "Grading completed"
    );

    let report = serde_json::json!({
        "question_id": task.search_key(),
        "grade": grade,
        "outcome": outcome,
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(outcome.is_pass())
}

fn outcome_kind(outcome: &Outcome) -> &'static str {
    match outcome {
        Outcome::AllPass => "all_pass",
        Outcome::ExecutionError { .. } => "execution_error",
        Outcome::AssertionFailure { .. } => "assertion_failure",
        Outcome::NoTests => "no_tests",
    }
}

fn loop_config(common: &CommonArgs) -> RepairConfig {
    let mut config = RepairConfig::from_env();
    if let Some(ms) = common.case_timeout_ms {
        config.per_case_timeout_ms = ms;
    }
    config
}

async fn read_file(path: &Path) -> Result<String> {
    tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))
}

async fn test_source(common: &CommonArgs) -> Result<Arc<dyn TestSource>> {
    if let Some(path) = &common.tests {
        info!(path = %path.display(), "Reading test cases from dataset");
        return Ok(Arc::new(JsonlTestSource::new(path)));
    }

    let redis_url = match &common.redis_url {
        Some(url) => url.clone(),
        None => std::env::var("REDIS_URL")
            .context("Either --tests or --redis-url (or REDIS_URL) is required")?,
    };

    let client = redis::Client::open(redis_url.as_str())?;
    let conn = redis::aio::ConnectionManager::new(client)
        .await
        .with_context(|| format!("Failed to connect to Redis at {}", redis_url))?;
    info!("Connected to Redis: {}", redis_url);

    Ok(Arc::new(RedisTestSource::new(conn)))
}

/// Flag raised by Ctrl-C or by the deadline, whichever comes first
fn cancel_on_signals(deadline_secs: Option<u64>) -> CancelFlag {
    let cancel = CancelFlag::new();

    let on_signal = cancel.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                warn!("Received shutdown signal, cancelling after the current case...");
                on_signal.cancel();
            }
            Err(e) => error!(error = %e, "Failed to install CTRL+C signal handler"),
        }
    });

    if let Some(secs) = deadline_secs {
        let on_deadline = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(secs)).await;
            warn!(deadline_secs = secs, "Deadline reached, cancelling");
            on_deadline.cancel();
        });
    }

    cancel
}

/// Hard stop when a cancelled invocation does not unwind in time
async fn bounded<T>(
    deadline_secs: Option<u64>,
    work: impl std::future::Future<Output = Result<T>>,
) -> Result<T> {
    match deadline_secs {
        None => work.await,
        Some(secs) => {
            let limit = Duration::from_secs(secs) + DEADLINE_GRACE;
            match tokio::time::timeout(limit, work).await {
                Ok(result) => result,
                Err(_) => bail!("Invocation exceeded its {}s deadline", secs),
            }
        }
    }
}
