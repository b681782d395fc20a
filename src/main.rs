//! Terrane CLI: reconcile declared cloud topologies.

use clap::Parser;
use terrane::core::error::EngineError;
use terrane::core::executor::CancelSignal;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(
    name = "terrane",
    version,
    about = "Reconciliation engine for declarative cloud topologies with dependency graphs, minimal diffs, batched apply"
)]
struct Cli {
    #[command(subcommand)]
    command: terrane::cli::Commands,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    let cancel = CancelSignal::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("interrupt: finishing in-flight operations, no new batches will start");
            on_interrupt.cancel();
        }
    });

    match terrane::cli::dispatch(cli.command, cancel).await {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            report(&e);
            std::process::exit(e.exit_code());
        }
    }
}

fn report(e: &EngineError) {
    match e {
        EngineError::Configuration(errors) => {
            for err in errors {
                eprintln!("  ERROR: {}", err);
            }
            eprintln!("error: {} configuration error(s); nothing was applied", errors.len());
        }
        other => eprintln!("error: {}", other),
    }
}
