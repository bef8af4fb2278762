//! Argument parsing and subcommand dispatch (spec §10), generalising the
//! teacher's flat `main.rs` into the three-subcommand CLI the Python
//! `proxytools/cli.py` exposes (`fetcher`, `superproxy`, `checker`).

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tracing::{error, info};

use crate::checker::Checker;
use crate::config::Config;
use crate::error::Result;
use crate::fetcher::Fetcher;
use crate::gateway::Gateway;
use crate::pool::ProxyPool;

#[derive(Debug, Parser)]
#[command(name = "superproxy", about = "Self-healing rotating proxy broker and gateway")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run every configured scraper once, optionally through a Checker,
    /// and write the deduplicated proxy set to a file or stdout.
    Fetcher {
        #[arg(short, long)]
        config: Option<PathBuf>,
        #[arg(short = 'o', long)]
        options: Option<String>,
        #[arg(short, long, action = clap::ArgAction::Count)]
        verbose: u8,
        /// Also run the checker over freshly-scraped candidates.
        #[arg(long)]
        check: bool,
        /// Output path, or `-` for stdout.
        #[arg(short, long, default_value = "-")]
        save: String,
    },
    /// Run the long-lived forward-proxy gateway server.
    Superproxy {
        #[arg(short, long)]
        config: Option<PathBuf>,
        #[arg(short = 'o', long)]
        options: Option<String>,
        #[arg(short, long, action = clap::ArgAction::Count)]
        verbose: u8,
    },
    /// Load (or fetch) a proxy set and run the checker to quiescence.
    Checker {
        #[arg(short, long)]
        config: Option<PathBuf>,
        #[arg(short = 'o', long)]
        options: Option<String>,
        #[arg(short, long, action = clap::ArgAction::Count)]
        verbose: u8,
        /// Existing snapshot to load before checking; omit to fetch first.
        #[arg(short, long)]
        load: Option<PathBuf>,
        #[arg(short, long, default_value = "-")]
        save: String,
    },
}

/// Raise the tracing filter by one level per `-v` occurrence, matching
/// the Python CLI's `-v`/`-vv` convention (spec §10).
pub fn verbosity_filter(base: &str, verbose: u8) -> String {
    match verbose {
        0 => base.to_string(),
        1 => "superproxy=debug,tower_http=debug".to_string(),
        _ => "superproxy=trace,tower_http=trace".to_string(),
    }
}

fn write_proxies(proxies: &[crate::model::Proxy], destination: &str) -> Result<()> {
    let json = serde_json::to_vec_pretty(proxies)?;
    if destination == "-" {
        use std::io::Write;
        std::io::stdout().write_all(&json)?;
        println!();
    } else {
        std::fs::write(destination, json)?;
    }
    Ok(())
}

pub async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Fetcher {
            config,
            options,
            check,
            save,
            verbose: _,
        } => run_fetcher(config.as_deref(), options.as_deref(), check, &save).await,
        Commands::Superproxy {
            config,
            options,
            verbose: _,
        } => run_superproxy(config.as_deref(), options.as_deref()).await,
        Commands::Checker {
            config,
            options,
            load,
            save,
            verbose: _,
        } => run_checker(config.as_deref(), options.as_deref(), load.as_deref(), &save).await,
    }
}

async fn run_fetcher(config_path: Option<&std::path::Path>, options: Option<&str>, check: bool, save: &str) -> Result<()> {
    let config = Config::load(config_path, options)?;
    let pool = ProxyPool::new(config.pool.clone());
    let checker = if check {
        Some(Checker::new(config.checker.clone(), Arc::clone(&pool)))
    } else {
        None
    };
    let fetcher = Fetcher::new(config.fetcher.clone(), Arc::clone(&pool), checker);
    let proxies = fetcher.run_to_json().await;
    info!(count = proxies.len(), "fetcher run complete");
    write_proxies(&proxies, save)
}

async fn run_checker(
    config_path: Option<&std::path::Path>,
    options: Option<&str>,
    load: Option<&std::path::Path>,
    save: &str,
) -> Result<()> {
    let config = Config::load(config_path, options)?;
    let pool = ProxyPool::new(config.pool.clone());

    match load {
        Some(path) => pool.load(path)?,
        None => {
            let fetcher = Fetcher::new(config.fetcher.clone(), Arc::clone(&pool), None);
            for proxy in fetcher.run_to_json().await {
                pool.proxy(proxy, true);
            }
        }
    }

    let checker = Checker::new(config.checker.clone(), Arc::clone(&pool));
    pool.set_recheck_handle(Arc::clone(&checker));
    let snapshot = pool.list_active();
    for proxy in snapshot {
        checker.check(proxy).await;
    }
    while !checker.ready() {
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    }

    let mut rechecked = pool.list_active();
    rechecked.extend(pool.list_blacklisted());
    write_proxies(&rechecked, save)
}

async fn run_superproxy(config_path: Option<&std::path::Path>, options: Option<&str>) -> Result<()> {
    let config = Config::load(config_path, options)?;
    let pool = ProxyPool::new(config.pool.clone());
    let checker = Checker::new(config.checker.clone(), Arc::clone(&pool));
    pool.set_recheck_handle(Arc::clone(&checker));
    let fetcher = Fetcher::new(config.fetcher.clone(), Arc::clone(&pool), Some(Arc::clone(&checker)));
    pool.set_fetcher(fetcher.clone());

    let gateway = Gateway::new(config.gateway.clone(), Arc::clone(&pool), Some(fetcher), Some(checker));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let gateway_task = tokio::spawn(async move {
        if let Err(e) = gateway.run(shutdown_rx).await {
            error!(error = %e, "gateway stopped with an error");
        }
    });

    shutdown_signal().await;
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);
    let _ = gateway_task.await;

    Ok(())
}

/// Waits for SIGINT, SIGTERM, or SIGQUIT (spec §10: the SIGQUIT leg
/// mirrors the Python CLI's three-signal graceful shutdown).
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal(SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };
    #[cfg(unix)]
    let quit = async {
        signal(SignalKind::quit())
            .expect("failed to install SIGQUIT handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();
    #[cfg(not(unix))]
    let quit = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
        _ = quit => {},
    }
}
