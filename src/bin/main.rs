//! llama-playground binary.
//!
//! Entry point for driving a llama.cpp TCP server through the playground's
//! session layer from the command line.

use clap::Parser;
use llama_playground_core::{
    cli::commands::Commands,
    cli::handlers::{handle_complete, handle_find_port, handle_status},
    config::{ConfigArgs, Settings},
};
use tracing::{info, Level};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(flatten)]
    pub config: ConfigArgs,

    #[command(subcommand)]
    pub command: Commands,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let settings = Settings::load(&cli.config)?;

    let level = if settings.logging.debug { Level::DEBUG } else { Level::INFO };
    let default_filter = format!("llama_playground_core={}", level);

    // Logs go to stderr so completions on stdout stay clean
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(Level::WARN.into())
                .parse_lossy(
                    settings
                        .logging
                        .filter
                        .clone()
                        .or_else(|| std::env::var(EnvFilter::DEFAULT_ENV).ok())
                        .unwrap_or(default_filter),
                ),
        )
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .init();

    info!("llama-playground starting up");

    match cli.command {
        Commands::Complete(cmd) => handle_complete(settings, cmd).await?,
        Commands::Status(cmd) => handle_status(settings, cmd).await?,
        Commands::FindPort(cmd) => handle_find_port(cmd).await?,
    }

    Ok(())
}
