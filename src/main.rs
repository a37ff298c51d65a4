mod agent;
mod audit;
mod auth;
mod backend;
mod config;
mod distributed;
mod logging;
mod permissions;
mod ratelimit;
mod server;
mod skills;

use clap::Parser;
use config::Config;

#[derive(Parser, Debug)]
#[command(name = "coreagentd", version)]
#[command(about = "core-agent — local-first AI agent runtime", long_about = None)]
struct Cli {
    /// Path to a TOML config file. Falls back to built-in defaults when omitted.
    #[arg(long)]
    config: Option<std::path::PathBuf>,

    /// Override the bind port from the config file.
    #[arg(long)]
    port: Option<u16>,

    /// Log level (trace, debug, info, warn, error). Overrides RUST_LOG.
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => Config::from_path(path)?,
        None => Config::default(),
    };
    if let Some(port) = cli.port {
        config.api.port = port;
    }

    let log_dir = logging::setup_tracing_with_settings(logging::LoggingSettings {
        level: cli.log_level.as_deref(),
        ..Default::default()
    })?;

    tracing::info!("--- core-agent startup ---");
    if let Some(path) = cli.config.as_ref() {
        tracing::info!("Config file: {}", path.display());
    } else {
        tracing::info!("Config file: (defaults)");
    }
    tracing::info!("LLM provider: {} ({})", config.llm.provider, config.llm.base_url);
    tracing::info!("Rate limit tier: {}", config.rate_limit.tier);
    tracing::info!("Log directory: {}", log_dir.display());
    tracing::info!("---------------------------");

    server::start_server(config).await
}
