//! q4d command line.
//!
//! Usage:
//!   q4d [--config ~/.Q4D/config.json] subscribe [--topic queue]
//!   q4d [--config ~/.Q4D/config.json] publish -n <name> -s <hash> -l <location> -c <category>

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::{error, info};

use q4d::channels::{self, DEFAULT_TOPIC};
use q4d::config::Config;
use q4d::error::Result;
use q4d::pipeline::{ConcurrentQueue, Dispatcher, Job, RulesEngine};
use q4d::transfer::TransferExecutor;

#[derive(Debug, Parser)]
#[command(
    name = "q4d",
    version,
    about = "Automatically download files from a remote server using MQTT and lftp"
)]
struct Cli {
    /// Config file (default is $HOME/.Q4D/config.json).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Subscribe to a topic and download every job received.
    Subscribe {
        #[arg(long, default_value = DEFAULT_TOPIC)]
        topic: String,
    },

    /// Publish a single job and exit.
    Publish {
        /// Name of the payload.
        #[arg(short, long, default_value = "")]
        name: String,

        /// Hash of the payload.
        #[arg(short = 's', long, default_value = "")]
        hash: String,

        /// Remote location of the payload.
        #[arg(short, long, default_value = "")]
        location: String,

        /// Category label for the payload.
        #[arg(short, long, default_value = "")]
        category: String,

        #[arg(long, default_value = DEFAULT_TOPIC)]
        topic: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    run(cli).await?;
    Ok(())
}

async fn run(cli: Cli) -> Result<()> {
    let config = Config::load(cli.config.as_deref())?;

    match cli.command {
        Command::Subscribe { topic } => run_subscriber(config, &topic).await,
        Command::Publish {
            name,
            hash,
            location,
            category,
            topic,
        } => {
            let job = Job {
                name,
                hash,
                location,
                category,
            };
            channels::publish(&config.mqtt, &topic, &job).await?;
            Ok(())
        }
    }
}

async fn run_subscriber(config: Config, topic: &str) -> Result<()> {
    let Config {
        mqtt,
        routing,
        destinations,
    } = config;

    eprintln!("q4d v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Broker: {}:{}", mqtt.host, mqtt.port);
    eprintln!("   Topic: {}", topic);
    eprintln!(
        "   Rules: {} (default code {:?})",
        routing.code_conditions.len(),
        routing.default_code
    );
    eprintln!("   Destinations: {}\n", destinations.code_destinations.len());

    let queue = Arc::new(ConcurrentQueue::new());
    let dispatcher = Dispatcher::new(
        Arc::clone(&queue),
        RulesEngine::new(&routing),
        TransferExecutor::system(destinations),
    );
    let stats = dispatcher.stats();
    let handle = dispatcher.start();

    let result = channels::subscribe(&mqtt, topic, Arc::clone(&queue), shutdown_signal()).await;

    // Lets an in-flight transfer finish; queued jobs are not persisted.
    if let Err(e) = handle.shutdown().await {
        error!(error = %e, "Dispatcher task ended abnormally");
    }
    info!(
        processed = stats.processed(),
        succeeded = stats.succeeded(),
        failed = stats.failed(),
        dropped = queue.len(),
        "Subscriber stopped"
    );

    result?;
    Ok(())
}

/// Resolves on Ctrl-C, or SIGTERM on unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
