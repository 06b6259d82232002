//! Main binary for the TGIS supervisor daemon (tgisd)

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;
use tgis_core::{GenerationChannel, ServiceContract};
use tgis_supervisor::{
    init_logging, LogFormat, LoggingConfig, ProcessSupervisor, RecoveryAction, SupervisorConfig,
};
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "tgisd")]
#[command(about = "Runs a TGIS server and keeps it alive")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE", env = "TGISD_CONFIG")]
    config: Option<PathBuf>,

    /// Model to serve
    #[arg(short, long, value_name = "MODEL", env = "TGISD_MODEL")]
    model: Option<String>,

    /// Log level
    #[arg(long, value_name = "LEVEL", default_value = "info")]
    log_level: String,

    /// Log format (text, json)
    #[arg(long, value_name = "FORMAT", default_value = "text")]
    log_format: LogFormat,

    /// Seconds to wait for the server to become ready
    #[arg(long, value_name = "SECS", default_value_t = 300)]
    ready_timeout: u64,

    /// Seconds between health checks once serving; 0 disables them
    #[arg(long, value_name = "SECS", default_value_t = 10)]
    watch_interval: u64,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Launch and supervise the server (default)
    Run,
    /// Validate configuration and exit
    Validate,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    init_logging(&LoggingConfig {
        level: cli.log_level.clone(),
        format: cli.log_format,
        ..LoggingConfig::default()
    })?;

    if let Some(path) = &cli.config {
        info!("Loading configuration from: {}", path.display());
    }
    let config = SupervisorConfig::load(cli.config.as_deref())
        .context("invalid supervisor configuration")?;

    match cli.command {
        Some(Commands::Validate) => {
            println!("Configuration is valid");
            println!("  gRPC port:     {}", config.grpc_port);
            println!("  HTTP port:     {}", config.http_port);
            println!("  shards:        {}", config.num_shards);
            println!("  load timeout:  {:?}", config.load_timeout);
            let methods: Vec<_> = GenerationChannel::DESCRIPTOR.method_names().collect();
            println!(
                "  service:       {} ({})",
                GenerationChannel::DESCRIPTOR,
                methods.join(", ")
            );
            Ok(())
        }
        Some(Commands::Run) | None => {
            let model = cli
                .model
                .clone()
                .context("--model is required to run the server")?;
            run(config, &model, &cli).await
        }
    }
}

async fn run(config: SupervisorConfig, model: &str, cli: &Cli) -> anyhow::Result<()> {
    let supervisor = ProcessSupervisor::<GenerationChannel>::new(config)?;
    let ready_timeout = Duration::from_secs(cli.ready_timeout);

    // Polled alongside the boot so a signal during it still stops the child
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    match supervisor
        .ensure_serving_until(model, ready_timeout, &mut shutdown)
        .await
    {
        Ok(Some(_)) => {}
        Ok(None) => return Ok(()),
        Err(e) => {
            error!("TGIS failed to start: {}", e);
            if e.is_retryable() {
                warn!("Startup may succeed with a longer --ready-timeout");
            }
            supervisor.terminate();
            return Err(e.into());
        }
    }
    info!(model = %model, pid = ?supervisor.process_id(), "TGIS is serving");

    let mut watch = (cli.watch_interval > 0)
        .then(|| tokio::time::interval(Duration::from_secs(cli.watch_interval)));

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("Shutdown signal received, stopping TGIS");
                break;
            }
            _ = tick(&mut watch) => {
                match supervisor.autorecover().await {
                    Ok(RecoveryAction::Relaunched) => warn!("TGIS was unhealthy and has been relaunched"),
                    Ok(_) => {}
                    Err(e) => error!("Autorecovery failed: {}", e),
                }
            }
        }
    }

    supervisor.terminate();
    Ok(())
}

/// Wait for the next watch tick, forever if watching is disabled
async fn tick(watch: &mut Option<tokio::time::Interval>) {
    match watch {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
