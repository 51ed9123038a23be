// Infrabot
// Main entry point for the infrabot binary

use clap::Parser;
use infrabot_engine::cli::{Cli, Command};
use infrabot_engine::config::Config;
use infrabot_engine::handlers::{
    handle_clear, handle_doctor, handle_history, handle_prune, handle_run, handle_search,
    handle_shell, handle_show, handle_stats, OutputFormat,
};
use infrabot_engine::telemetry::init_telemetry_with_level;
use sdk::errors::{EngineError, InfrabotErrorExt};
use std::process::ExitCode;

/// Exit status for errors outside a pipeline run (config, database, usage)
const EXIT_ERROR: u8 = 2;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let json = cli.json;

    match run(cli).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            let hint = e
                .downcast_ref::<EngineError>()
                .map(|engine| engine.user_hint().to_string());

            if json {
                let output = serde_json::json!({
                    "status": "error",
                    "error": format!("{:#}", e),
                    "hint": hint,
                });
                println!("{}", output);
            } else {
                eprintln!("Error: {:#}", e);
                if let Some(hint) = hint {
                    eprintln!("Hint: {}", hint);
                }
            }
            ExitCode::from(EXIT_ERROR)
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<u8> {
    // Load configuration (or use custom path if provided)
    let config = if let Some(config_path) = &cli.config {
        Config::load_from_path(config_path)?
    } else {
        Config::load_or_create()?
    };

    // --log overrides the configured level; RUST_LOG overrides both
    let log_level = cli.log.as_deref().unwrap_or(&config.core.log_level);
    init_telemetry_with_level(log_level);

    tracing::info!(
        "Infrabot v{} ({} - {})",
        env!("CARGO_PKG_VERSION"),
        env!("GIT_COMMIT_HASH"),
        env!("BUILD_TIMESTAMP")
    );

    let format = if cli.json {
        OutputFormat::Json
    } else {
        OutputFormat::Text
    };

    match cli.command {
        Command::Run { task, options } => handle_run(task, options, &config, format).await,
        Command::Shell { options } => handle_shell(options, &config, format).await,
        Command::History { limit } => handle_history(limit, &config, format).await.map(|_| 0),
        Command::Show { record_id } => handle_show(record_id, &config, format).await.map(|_| 0),
        Command::Search { text, k, executed } => handle_search(text, k, executed, &config, format)
            .await
            .map(|_| 0),
        Command::Stats => handle_stats(&config, format).await.map(|_| 0),
        Command::Prune => handle_prune(&config, format).await.map(|_| 0),
        Command::Clear { yes } => handle_clear(yes, &config, format).await.map(|_| 0),
        Command::Doctor => handle_doctor(&config, format).await.map(|_| 0),
    }
}
