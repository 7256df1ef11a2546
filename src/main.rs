use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;

mod cli;

use cli::Args;
use tracehop::export::generate_report;
use tracehop::run_trace;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    if args.verbose {
        tracing_subscriber::fmt()
            .with_env_filter("debug")
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter("warn")
            .with_writer(std::io::stderr)
            .init();
    }

    let config = match args.to_config() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    };

    // Set up cancellation
    let cancel = CancellationToken::new();

    // Handle Ctrl+C
    let cancel_clone = cancel.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        cancel_clone.cancel();
    });

    let destination = config.destination.clone();
    let result = run_trace(config, cancel)
        .await
        .with_context(|| format!("trace to {} failed", destination))?;

    generate_report(&result, std::io::stdout())?;
    Ok(())
}
