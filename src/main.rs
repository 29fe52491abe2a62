//! `forge` — CLI entry point.

use clap::Parser;
use eyre::{Context, Result};
use tracing::{debug, info};

use forge::cli::{dispatch, exit_code, user_facing_message, Cli};
use forge::config::Config;

fn setup_logging(cli_log_level: Option<&str>, log_dir: &std::path::Path) -> Result<()> {
    std::fs::create_dir_all(log_dir).context("failed to create log directory")?;

    let level = match cli_log_level.map(|s| s.to_uppercase()) {
        Some(s) if s == "TRACE" => tracing::Level::TRACE,
        Some(s) if s == "DEBUG" => tracing::Level::DEBUG,
        Some(s) if s == "INFO" => tracing::Level::INFO,
        Some(s) if s == "WARN" || s == "WARNING" => tracing::Level::WARN,
        Some(s) if s == "ERROR" => tracing::Level::ERROR,
        Some(s) => {
            eprintln!("warning: unknown log level {s:?}, defaulting to INFO");
            tracing::Level::INFO
        }
        None => tracing::Level::INFO,
    };

    let log_file = std::fs::File::create(log_dir.join("forge.log")).context("failed to create log file")?;
    tracing_subscriber::fmt()
        .with_writer(log_file)
        .with_ansi(false)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()))
        .init();

    info!(?level, "logging initialized");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = Config::load(cli.config.as_deref()).context("failed to load configuration")?;
    setup_logging(cli.log_level.as_deref(), &config.log_dir)?;

    debug!(command = ?cli.command, "main: dispatching command");
    let result = dispatch(cli, &config).await;

    if let Err(e) = &result {
        eprintln!("error: {}", user_facing_message(e));
    }
    std::process::exit(exit_code(&result));
}
