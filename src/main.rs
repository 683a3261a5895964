use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;

use xcproxy::config::ProxyConfig;
use xcproxy::constants::DEFAULT_PORT;
use xcproxy::session::cli::CopilotCliDriver;
use xcproxy::{logger, server, AppContext};

/// Local proxy that lets Xcode's AI assistant drive Copilot-backed models.
#[derive(Parser, Debug)]
#[command(name = "xcproxy", version, about)]
struct Cli {
    /// Port to listen on (bridge URLs embed it).
    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Config file path (default: ~/.config/xcproxy/config.json).
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Working directory for sessions (project root Xcode is editing).
    #[arg(short = 'd', long)]
    directory: Option<PathBuf>,

    /// Append detailed logs to this file.
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Debug-level console logging.
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        eprintln!("xcproxy: {}", e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    logger::setup_logger(cli.verbose, cli.log_file.as_deref())?;

    let config_path = cli.config.unwrap_or_else(ProxyConfig::default_path);
    let config = ProxyConfig::load(&config_path)?;

    let driver = Arc::new(CopilotCliDriver::from_config(&config));
    let mut ctx = AppContext::new(config, driver, cli.port)?;
    ctx.working_directory = cli.directory;

    server::run(Arc::new(ctx)).await?;
    Ok(())
}
