mod api;
mod cli;
mod model;
mod orchestrator;
mod storage;
#[cfg(feature = "tui")]
mod tui;

use anyhow::Result;
use clap::Parser;

#[tokio::main]
async fn main() -> Result<()> {
    let args = cli::Cli::parse();

    // Log to stderr in text mode only; the TUI owns the terminal.
    if args.text || cfg!(not(feature = "tui")) {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("handbook_chat=info")),
            )
            .with_writer(std::io::stderr)
            .init();
    }

    cli::run(args).await
}
