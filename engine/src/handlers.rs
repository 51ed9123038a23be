//! Command handlers for CLI operations
//!
//! This module implements the handlers for all CLI commands:
//! - run / shell: drive requests through the pipeline
//! - history / show / search / stats: inspect the memory store
//! - prune / clear: explicit retention actions
//! - doctor: check the language model and executor

use anyhow::{Context, Result};
use serde_json::json;
use std::io::Write as _;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::cli::RunOptions;
use crate::conductor::{Orchestrator, PipelineReport, PipelineSettings};
use crate::config::Config;
use crate::db::{Database, MemoryStore, SqliteMemoryStore};
use crate::executor::PlaybookExecutor;
use crate::llm::ollama::OllamaGateway;
use crate::llm::Gateway;
use sdk::types::{InventoryRef, MemoryRecord, RecordFilter, Request};

/// Output format for command results
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Human-readable text output
    Text,
    /// JSON output for machine consumption
    Json,
}

/// Long-lived services built from the configuration
pub struct Services {
    pub database: Database,
    pub gateway: Arc<OllamaGateway>,
    pub memory: Arc<SqliteMemoryStore>,
    pub executor: Arc<PlaybookExecutor>,
}

impl Services {
    /// Open the memory database and construct the gateway and executor
    pub async fn open(config: &Config, check_mode: bool) -> Result<Self> {
        let database = Database::new(&config.memory_db_path())
            .await
            .context("Failed to open memory database")?;

        let gateway = Arc::new(
            OllamaGateway::new(
                config.llm.base_url.clone(),
                config.llm.embedding_model.clone(),
                config.llm.request_timeout(),
            )
            .with_temperature(config.llm.temperature),
        );

        let memory = Arc::new(database.memory(gateway.clone()));

        let executor = Arc::new(
            PlaybookExecutor::new(config.executor.program.clone(), &config.core.data_dir)
                .with_check_mode(config.executor.check_mode || check_mode),
        );

        Ok(Self {
            database,
            gateway,
            memory,
            executor,
        })
    }

    /// Orchestrator wired to these services
    pub fn orchestrator(&self, config: &Config) -> Orchestrator {
        Orchestrator::new(
            self.gateway.clone(),
            self.memory.clone(),
            self.executor.clone(),
            PipelineSettings::from_config(config),
        )
    }

    pub async fn close(self) -> Result<()> {
        self.database.close().await
    }
}

/// Inventory from the command line, else the configured default
fn resolve_inventory(options: &RunOptions, config: &Config) -> InventoryRef {
    let configured = config
        .executor
        .default_inventory
        .as_ref()
        .map(|p| p.to_string_lossy().to_string());
    InventoryRef::from_arg(options.inventory.as_deref().or(configured.as_deref()))
}

/// Cancel `token` when the operator presses Ctrl-C
fn cancel_on_ctrl_c(token: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted; cancelling the current run");
            token.cancel();
        }
    })
}

fn print_report(report: &PipelineReport, verbose: bool, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Text => print!("{}", report.render(verbose)),
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(report)?),
    }
    Ok(())
}

async fn run_one(
    orchestrator: &Orchestrator,
    task: &str,
    options: &RunOptions,
    config: &Config,
    format: OutputFormat,
) -> Result<u8> {
    let request = Request::new(
        task,
        resolve_inventory(options, config),
        options.model.clone(),
    );

    let cancel = CancellationToken::new();
    let watcher = cancel_on_ctrl_c(cancel.clone());
    let report = orchestrator.run(&request, &cancel).await;
    watcher.abort();

    print_report(&report, options.verbose, format)?;
    Ok(report.exit_code())
}

/// Run a task through the pipeline
///
/// Returns the process exit status: 0 when the verdict passed.
pub async fn handle_run(
    task: String,
    options: RunOptions,
    config: &Config,
    format: OutputFormat,
) -> Result<u8> {
    if task.trim().is_empty() {
        anyhow::bail!("Task must not be empty");
    }

    let services = Services::open(config, options.check).await?;
    let orchestrator = services.orchestrator(config);

    let code = run_one(&orchestrator, &task, &options, config, format).await?;

    drop(orchestrator);
    services.close().await?;
    Ok(code)
}

const SHELL_HELP: &str = "Type a task in plain English, for example 'check disk usage on web1'.\n\
     Commands: help, history, exit (or quit, q).";

/// Interactive mode: one task per line until EOF or `exit`
///
/// Returns the exit status of the last task run.
pub async fn handle_shell(options: RunOptions, config: &Config, format: OutputFormat) -> Result<u8> {
    let services = Services::open(config, options.check).await?;
    let orchestrator = services.orchestrator(config);

    if format == OutputFormat::Text {
        println!("Infrabot interactive shell. {}", SHELL_HELP);
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut last_code = 0;

    loop {
        if format == OutputFormat::Text {
            print!("infrabot> ");
            std::io::stdout().flush().ok();
        }

        let Some(line) = lines.next_line().await? else {
            break;
        };
        let line = line.trim();

        match line {
            "" => continue,
            "exit" | "quit" | "q" => break,
            "help" => println!("{}", SHELL_HELP),
            "history" => print_history(&services.memory.recent(10).await?, 10, format)?,
            task => {
                last_code = run_one(&orchestrator, task, &options, config, format).await?;
            }
        }
    }

    drop(orchestrator);
    services.close().await?;
    Ok(last_code)
}

fn status_label(record: &MemoryRecord) -> &'static str {
    match (record.passed(), &record.failed_stage) {
        (_, Some(_)) => "ERROR",
        (Some(true), None) => "PASSED",
        (Some(false), None) => "FAILED",
        (None, None) => "-",
    }
}

fn print_history(records: &[MemoryRecord], limit: u32, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Text => {
            if records.is_empty() {
                println!("No runs in history");
                return Ok(());
            }

            println!("Run History (last {} runs):", limit);
            println!();
            for record in records {
                println!(
                    "{}  {}  {:<6}  {}",
                    record.id,
                    record.timestamp.format("%Y-%m-%d %H:%M:%S"),
                    status_label(record),
                    record.request_text
                );
            }
        }
        OutputFormat::Json => {
            let output = json!({
                "records": records,
                "count": records.len(),
                "limit": limit
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
    }
    Ok(())
}

/// Show recent runs, newest first
pub async fn handle_history(limit: u32, config: &Config, format: OutputFormat) -> Result<()> {
    let services = Services::open(config, false).await?;
    let records = services
        .memory
        .recent(limit)
        .await
        .context("Failed to fetch run history")?;

    print_history(&records, limit, format)?;
    services.close().await
}

/// Show one record in full
pub async fn handle_show(record_id: String, config: &Config, format: OutputFormat) -> Result<()> {
    let services = Services::open(config, false).await?;
    let record = services
        .memory
        .get(&record_id)
        .await
        .context("Failed to fetch record")?
        .ok_or_else(|| anyhow::anyhow!("Record not found: {}", record_id))?;

    match format {
        OutputFormat::Text => {
            println!("Record:    {}", record.id);
            println!("Request:   {}", record.request_text);
            println!("Time:      {}", record.timestamp.format("%Y-%m-%d %H:%M:%S"));
            println!("Status:    {}", status_label(&record));
            if let Some(stage) = &record.failed_stage {
                println!("Failed in: {}", stage);
            }

            if let Some(artifact) = &record.artifact {
                println!();
                println!("Artifact {} v{}:", artifact.id, artifact.version);
                println!("{}", artifact.content.trim_end());
            }

            if let Some(result) = &record.execution_result {
                println!();
                println!(
                    "Execution: exit code {}, {} ms{}",
                    result
                        .exit_code
                        .map(|c| c.to_string())
                        .unwrap_or_else(|| "none".to_string()),
                    result.duration_ms,
                    if result.timed_out { ", timed out" } else { "" }
                );
                for (host, status) in &result.hosts {
                    println!("  {:<24} {}", host, status);
                }
            }

            if let Some(verdict) = &record.verdict {
                println!();
                println!("Verdict (confidence {:.2}):", verdict.confidence);
                println!("{}", verdict.summary);
            }
        }
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&json!({ "record": record }))?);
        }
    }

    services.close().await
}

/// Find past runs similar to `text`
pub async fn handle_search(
    text: String,
    k: usize,
    executed: bool,
    config: &Config,
    format: OutputFormat,
) -> Result<()> {
    let services = Services::open(config, false).await?;
    let filter = if executed {
        RecordFilter::executed()
    } else {
        RecordFilter::default()
    };

    let results = services
        .memory
        .query_similar(&text, k, filter)
        .await
        .context("Similarity search failed")?;

    match format {
        OutputFormat::Text => {
            if results.is_empty() {
                println!("No similar runs found");
            }
            for scored in &results {
                println!(
                    "{:.3}  {}  {:<6}  {}",
                    scored.score,
                    scored.record.id,
                    status_label(&scored.record),
                    scored.record.request_text
                );
            }
        }
        OutputFormat::Json => {
            let output = json!({
                "query": text,
                "k": k,
                "results": results,
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
    }

    services.close().await
}

/// Show memory statistics
pub async fn handle_stats(config: &Config, format: OutputFormat) -> Result<()> {
    let services = Services::open(config, false).await?;
    let stats = services.memory.stats().await.context("Failed to read stats")?;

    match format {
        OutputFormat::Text => {
            println!("Memory: {}", config.memory_db_path().display());
            println!("  Records:   {}", stats.total);
            println!("  Executed:  {}", stats.executed);
            println!("  Passed:    {}", stats.passed);
            println!("  Failed:    {}", stats.failed);
            if let (Some(oldest), Some(newest)) = (stats.oldest, stats.newest) {
                println!("  Oldest:    {}", oldest.format("%Y-%m-%d %H:%M:%S"));
                println!("  Newest:    {}", newest.format("%Y-%m-%d %H:%M:%S"));
            }
        }
        OutputFormat::Json => {
            let output = json!({
                "path": config.memory_db_path(),
                "stats": stats,
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
    }

    services.close().await
}

/// Apply the configured retention policy
pub async fn handle_prune(config: &Config, format: OutputFormat) -> Result<()> {
    let policy = config.memory.retention_policy();
    let services = Services::open(config, false).await?;

    let removed = if policy.is_unbounded() {
        0
    } else {
        services.memory.prune(&policy).await.context("Prune failed")?
    };

    match format {
        OutputFormat::Text => {
            if policy.is_unbounded() {
                println!(
                    "No retention policy configured (set memory.max_records or memory.retention_days)"
                );
            } else {
                println!("Removed {} record(s)", removed);
            }
        }
        OutputFormat::Json => {
            let output = json!({ "policy": policy, "removed": removed });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
    }

    services.close().await
}

/// Delete every record
pub async fn handle_clear(yes: bool, config: &Config, format: OutputFormat) -> Result<()> {
    if !yes {
        anyhow::bail!("Refusing to delete all records without --yes");
    }

    let services = Services::open(config, false).await?;
    let removed = services.memory.clear().await.context("Clear failed")?;

    match format {
        OutputFormat::Text => println!("Deleted {} record(s)", removed),
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&json!({ "removed": removed }))?)
        }
    }

    services.close().await
}

/// Validate configuration and check the gateway and executor
pub async fn handle_doctor(config: &Config, format: OutputFormat) -> Result<()> {
    let mut issues = Vec::new();
    let mut checks: Vec<(&str, String)> = Vec::new();

    // Config is already validated when loaded
    checks.push(("Configuration", "Valid".to_string()));
    checks.push(("Data directory", config.core.data_dir.display().to_string()));

    let services = match Services::open(config, false).await {
        Ok(services) => {
            checks.push(("Memory database", "OK".to_string()));
            Some(services)
        }
        Err(e) => {
            checks.push(("Memory database", "Failed".to_string()));
            issues.push(format!("Cannot open memory database: {:#}", e));
            None
        }
    };

    let gateway = OllamaGateway::new(
        config.llm.base_url.clone(),
        config.llm.embedding_model.clone(),
        config.llm.request_timeout(),
    );
    match gateway.check_health(&config.llm.model).await {
        Ok(health) => {
            if health.service_running {
                checks.push(("Ollama", format!("Running at {}", gateway.base_url())));
            } else {
                checks.push(("Ollama", "Not running".to_string()));
                issues.push(format!(
                    "Ollama is not reachable at {}. Start it with 'ollama serve'.",
                    gateway.base_url()
                ));
            }

            if health.model_available {
                checks.push(("Model", config.llm.model.clone()));
            } else if health.service_running {
                checks.push(("Model", "Missing".to_string()));
                issues.push(format!(
                    "Model '{}' is not pulled. Run 'ollama pull {}'.",
                    config.llm.model, config.llm.model
                ));
            }

            if health.embedding_model_available {
                checks.push(("Embedding model", config.llm.embedding_model.clone()));
            } else if health.service_running {
                checks.push(("Embedding model", "Missing".to_string()));
                issues.push(format!(
                    "Embedding model '{}' is not pulled. Run 'ollama pull {}'.",
                    config.llm.embedding_model, config.llm.embedding_model
                ));
            }
        }
        Err(e) => {
            checks.push(("Ollama", "Error".to_string()));
            issues.push(format!("Ollama health check failed: {}", e));
        }
    }

    let executor = PlaybookExecutor::new(config.executor.program.clone(), &config.core.data_dir);
    match executor.version().await {
        Ok(version) => checks.push(("Executor", version)),
        Err(e) => {
            checks.push(("Executor", "Not available".to_string()));
            issues.push(format!("{}: {}", executor.program(), e));
        }
    }

    if let Some(services) = services {
        services.close().await?;
    }

    match format {
        OutputFormat::Text => {
            println!("Infrabot Diagnostics");
            println!("====================");
            println!();

            for (check, status) in &checks {
                println!("  {:<20} {}", format!("{}:", check), status);
            }

            println!();

            if issues.is_empty() {
                println!("All checks passed");
            } else {
                println!("Issues found:");
                println!();
                for (i, issue) in issues.iter().enumerate() {
                    println!("  {}. {}", i + 1, issue);
                }
            }
        }
        OutputFormat::Json => {
            let output = json!({
                "checks": checks.iter().map(|(name, status)| {
                    json!({
                        "name": name,
                        "status": status
                    })
                }).collect::<Vec<_>>(),
                "issues": issues,
                "healthy": issues.is_empty()
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
    }

    Ok(())
}
