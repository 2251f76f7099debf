mod cli;

use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Parser;
use notify_engine::{EngineConfig, Notification, NotificationEngine, TransportFault};
use tracing::{Level, error, info, warn};
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

use crate::cli::{Args, Commands};

#[tokio::main]
async fn main() {
    let args = Args::parse();
    if let Err(e) = run(args).await {
        error!("Application error: {}", e);
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<()> {
    init_logging(args.verbose, args.quiet)?;

    let Some(api_url) = args.api_url.clone() else {
        bail!("no API URL given (use --api-url or NOTIFY_API_URL)");
    };
    let Some(token) = args.token.clone() else {
        bail!("no token given (use --token or NOTIFY_TOKEN)");
    };

    match args.command {
        Commands::Watch {
            transport,
            interval,
            json,
        } => {
            let mut config = EngineConfig::new(api_url).with_transport(transport.into());
            config.baseline_interval = Duration::from_secs(interval);
            watch(config, &token, json).await
        }
        Commands::Count => {
            let engine = NotificationEngine::new(EngineConfig::new(api_url))
                .context("failed to build engine")?;
            engine.update_token(&token).await;
            let count = engine.load_unread_count().await?;
            println!("{count}");
            Ok(())
        }
        Commands::MarkRead { id } => {
            let engine = NotificationEngine::new(EngineConfig::new(api_url))
                .context("failed to build engine")?;
            engine.update_token(&token).await;
            engine.mark_read(id).await?;
            info!(id, "marked as read");
            Ok(())
        }
        Commands::MarkAllRead => {
            let engine = NotificationEngine::new(EngineConfig::new(api_url))
                .context("failed to build engine")?;
            engine.update_token(&token).await;
            engine.mark_all_read().await?;
            info!("marked all as read");
            Ok(())
        }
    }
}

async fn watch(config: EngineConfig, token: &str, json: bool) -> Result<()> {
    let engine = NotificationEngine::new(config).context("failed to build engine")?;
    let mut new_rx = engine.subscribe_new();
    let mut faults = engine.faults();
    let mut state = engine.watch_connection_state();
    let mut count = engine.watch_unread_count();

    engine.start(token).await?;
    info!("engine started, waiting for notifications (Ctrl-C to stop)");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down");
                break;
            }
            notification = new_rx.recv() => match notification {
                Ok(n) => print_notification(&n, json),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "event consumer lagged, some notifications were skipped");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            },
            fault = faults.recv() => match fault {
                Ok(TransportFault::Unauthorized) => {
                    engine.stop().await;
                    bail!("authentication rejected by the backend");
                }
                Ok(TransportFault::ReconnectExhausted { attempts }) => {
                    engine.stop().await;
                    bail!("gave up reconnecting after {attempts} attempts");
                }
                Ok(fault) => warn!(?fault, "transport fault"),
                Err(_) => break,
            },
            changed = state.changed() => {
                if changed.is_err() {
                    break;
                }
                info!(state = %*state.borrow_and_update(), "connection state");
            }
            changed = count.changed() => {
                if changed.is_err() {
                    break;
                }
                info!(count = *count.borrow_and_update(), "unread count");
            }
        }
    }

    engine.stop().await;
    Ok(())
}

fn print_notification(n: &Notification, json: bool) {
    if json {
        match serde_json::to_string(n) {
            Ok(line) => println!("{line}"),
            Err(e) => warn!(error = %e, "failed to serialize notification"),
        }
    } else {
        println!("[{}] #{} {} - {}", n.created_at, n.id, n.title, n.message);
    }
}

fn init_logging(verbose: bool, quiet: bool) -> Result<()> {
    let filter = if quiet {
        EnvFilter::new("error")
    } else if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::from_default_env().add_directive(Level::INFO.into())
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false).with_level(verbose))
        .init();
    Ok(())
}
