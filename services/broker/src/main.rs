// quiverd entry point.
use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

use broker::config::BrokerConfig;
use broker::observability;
use broker::supervisor::BrokerServer;

#[derive(Parser, Debug)]
#[command(name = "quiverd")]
#[command(about = "quiver pub/sub broker")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start a broker.
    Start(StartArgs),
}

#[derive(Args, Debug)]
struct StartArgs {
    /// Coordination service address (host:port)
    #[arg(long = "zk-addr", short = 'z')]
    zk_addr: String,

    /// Broker port
    #[arg(long)]
    port: Option<u16>,

    /// Log directory
    #[arg(long = "log-dir")]
    log_dir: Option<PathBuf>,

    /// Data directory
    #[arg(long = "data-dir")]
    data_dir: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long = "log-level")]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Start(args) => start(args).await,
    }
}

async fn start(args: StartArgs) -> Result<()> {
    let mut config = BrokerConfig::from_env_or_yaml().context("load broker config")?;
    config.coordination_addr = args.zk_addr;
    if let Some(log_dir) = args.log_dir {
        config.log_dir = log_dir;
    }
    if let Some(log_level) = args.log_level {
        config.log_level = log_level;
    }

    std::fs::create_dir_all(&config.log_dir)
        .with_context(|| format!("create log dir {}", config.log_dir.display()))?;
    let _log_guard = observability::init_logging(&config.log_dir, &config.log_level);
    observability::init_metrics(config.metrics_bind);

    tracing::info!(coordination = %config.coordination_addr, "starting quiverd");
    let mut server = BrokerServer::new(config);
    if let Some(port) = args.port {
        server = server.with_port(port);
    }
    if let Some(data_dir) = args.data_dir {
        server = server.with_data_dir(data_dir);
    }
    let handle = server.start().await.context("boot broker")?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("interrupt received");
        }
        _ = handle.stopped() => {
            tracing::info!("broker scope cancelled");
        }
    }
    handle.shutdown().await
}
