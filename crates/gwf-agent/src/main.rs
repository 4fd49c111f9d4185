use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;

use gwf_config::AgentConfig;

mod http;
mod init;
mod service;

/// Filesystem watch-and-upload agent
#[derive(Parser)]
#[command(name = "gwf")]
#[command(version)]
#[command(about = "Watches directories and ships completed files to object storage", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level: trace, debug, info, warn, error
    #[arg(short = 'v', long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Observability listen address (overrides config file)
    #[arg(short, long, value_name = "ADDR")]
    listen: Option<String>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Build tokio runtime and run the agent
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to build tokio runtime")?
        .block_on(async_main(cli))
}

async fn async_main(cli: Cli) -> Result<()> {
    let mut config =
        AgentConfig::load(cli.config.as_deref()).context("failed to load configuration")?;

    apply_cli_overrides(&mut config, &cli);

    init::init_tracing(&config);

    service::run(config).await
}

fn apply_cli_overrides(config: &mut AgentConfig, cli: &Cli) {
    if let Some(level) = &cli.log_level {
        config.server.log_level = level.clone();
    }
    if let Some(listen) = &cli.listen {
        config.server.listen_addr = listen.clone();
    }
}
