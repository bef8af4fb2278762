//! superproxy — entry point: initialises tracing and dispatches to the
//! `fetcher`/`superproxy`/`checker` subcommand (spec §10).

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use superproxy::cli::{self, Cli, Commands};
use superproxy::error::Result;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let verbose = match &cli.command {
        Commands::Fetcher { verbose, .. }
        | Commands::Superproxy { verbose, .. }
        | Commands::Checker { verbose, .. } => *verbose,
    };

    let base_filter = "superproxy=info,tower_http=info";
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| cli::verbosity_filter(base_filter, verbose).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    cli::run(cli).await
}
