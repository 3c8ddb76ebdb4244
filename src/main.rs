//! keepvip - VIP failover and TCP load balancing for a cluster of hosts
//!
//! Usage:
//!   keepvip [OPTIONS]
//!
//! Options:
//!   -c, --config <FILE>    Configuration file path (default: keepvip.toml)
//!   -l, --log-level        Log level (error, warn, info, debug, trace)
//!   -h, --help             Print help

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tokio::sync::oneshot;
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use keepvip::config::Config;
use keepvip::consensus::RaftNode;
use keepvip::network::{is_privileged, ArpAnnouncer, IpCommandVip};
use keepvip::{Cluster, ControllerExit, Metrics, MetricsServer};

/// Log level for CLI
#[derive(Debug, Clone, Copy, ValueEnum, Default)]
enum LogLevel {
    /// Only errors
    Error,
    /// Warnings and errors
    Warn,
    /// Informational messages
    #[default]
    Info,
    /// Debug messages
    Debug,
    /// Trace messages (very verbose)
    Trace,
}

impl LogLevel {
    fn to_tracing_level(self) -> Level {
        match self {
            LogLevel::Error => Level::ERROR,
            LogLevel::Warn => Level::WARN,
            LogLevel::Info => Level::INFO,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Trace => Level::TRACE,
        }
    }
}

/// keepvip - leader-owned virtual IP with TCP load balancing
#[derive(Parser, Debug)]
#[command(name = "keepvip")]
#[command(version)]
#[command(about = "Keep a virtual IP on the elected leader of a cluster and balance TCP behind it")]
struct Args {
    /// Configuration file path (TOML format)
    #[arg(short, long, default_value = "keepvip.toml")]
    config: PathBuf,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, value_enum)]
    log_level: Option<LogLevel>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let config = match Config::load(&args.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Error loading config file: {}", e);
            std::process::exit(1);
        }
    };

    // CLI overrides config, config overrides default (info)
    let log_level = args.log_level.unwrap_or_else(|| {
        match config.log.level.to_lowercase().as_str() {
            "error" => LogLevel::Error,
            "warn" => LogLevel::Warn,
            "debug" => LogLevel::Debug,
            "trace" => LogLevel::Trace,
            _ => LogLevel::Info,
        }
    });

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level.to_tracing_level())
        .with_target(false)
        .with_thread_ids(true)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    info!("Loaded configuration from {:?}", args.config);

    if !is_privileged() {
        error!("must run as root");
        std::process::exit(1);
    }

    let vip_addr = config
        .vip_addr()
        .ok_or_else(|| format!("could not parse vip '{}'", config.vip))?;

    info!("Starting keepvip");
    info!("  Cluster: {}", config.cluster);
    info!("  VIP: {} on {}", vip_addr, config.interface);
    info!("  Members: {}", config.members.len());
    info!("  Checks: {} every {}s", config.checks.len(), config.checks_interval);
    info!("  Load balancers: {}", config.load_balancers.len());

    let metrics = Arc::new(Metrics::new());
    let (metrics_stop, metrics_stopped) = oneshot::channel::<()>();
    if config.metrics.enabled {
        let metrics_server = match MetricsServer::bind(metrics.clone(), config.metrics.bind).await {
            Ok(server) => server,
            Err(e) => {
                error!("Error starting metrics on {}: {}", config.metrics.bind, e);
                std::process::exit(1);
            }
        };
        tokio::spawn(async move {
            let shutdown = async {
                let _ = metrics_stopped.await;
            };
            if let Err(e) = metrics_server.run(shutdown).await {
                error!("Metrics server error: {}", e);
            }
        });
    } else {
        info!("  Metrics: disabled");
    }

    let mut cluster = Cluster::new(
        config.clone(),
        Arc::new(RaftNode::new(config.raft.clone())),
        Arc::new(IpCommandVip::new(vip_addr, config.interface.clone())),
        Arc::new(ArpAnnouncer::new()),
        metrics,
    );

    if let Err(e) = cluster.start().await {
        error!("Error starting cluster: {}", e);
        std::process::exit(1);
    }

    tokio::select! {
        signal = wait_for_shutdown_signal() => {
            if let Err(e) = signal {
                warn!("Signal handling failed, shutting down: {}", e);
            }
        }
        exit = cluster.wait() => {
            if let Err(e) = exit {
                error!("Cluster controller ended: {}", e);
            }
        }
    }

    let exit = cluster.stop().await?;
    let _ = metrics_stop.send(());

    if let ControllerExit::Fatal(failure) = exit {
        error!("{}", failure);
        std::process::exit(1);
    }

    Ok(())
}

async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?
            .recv()
            .await;
        Ok::<_, std::io::Error>(())
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<std::io::Result<()>>();

    tokio::select! {
        result = ctrl_c => {
            info!("Received Ctrl+C");
            result
        }
        result = terminate => {
            info!("Received SIGTERM");
            result
        }
    }
}
