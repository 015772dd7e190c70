//! Vertical Scaler - benchmark-driven resource tuning for one deployment
//!
//! Repeatedly load-tests a Kubernetes deployment through Fortio, raises its
//! CPU until throughput stops improving, raises memory when pods fail to
//! become ready, and rolls back to the starting resources on failure.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use scaler_lib::{
    health::HealthRegistry,
    observability::ScalerMetrics,
    orchestrator::{self, KubeOrchestrator, ResourceOrchestrator},
    AutoscaleController, FortioClient, ShutdownSignal,
};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod api;
mod config;
mod output;

const SCALER_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Vertical Scaler
#[derive(Parser)]
#[command(name = "vertical-scaler")]
#[command(author, version, about = "Benchmark-driven vertical scaling for Kubernetes deployments", long_about = None)]
struct Cli {
    /// Configuration file (YAML, TOML or JSON)
    #[arg(long, short, env = "KWB_CONFIG")]
    config: Option<PathBuf>,

    /// Path to kubeconfig file (in-cluster or default kubeconfig if not specified)
    #[arg(long)]
    kubeconfig: Option<PathBuf>,

    /// Namespace of the target deployment
    #[arg(long, short)]
    namespace: Option<String>,

    /// Name of the target deployment
    #[arg(long, short)]
    deployment: Option<String>,

    /// Log output format
    #[arg(long, value_enum, default_value = "json")]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Json,
    Pretty,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the scaling experiment (default)
    Run,

    /// Check Fortio and the cluster, and show the current resources
    Probe,

    /// Set the replica count of the target deployment
    Scale {
        /// Desired replica count
        #[arg(long)]
        replicas: u32,
    },
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match format {
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init(),
        LogFormat::Pretty => tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().pretty())
            .init(),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    match execute(cli).await {
        Ok(code) => code,
        Err(e) => {
            error!(error = %format!("{:#}", e), "Vertical scaler failed");
            output::print_error(&format!("{:#}", e));
            ExitCode::FAILURE
        }
    }
}

async fn execute(cli: Cli) -> Result<ExitCode> {
    let config = config::AppConfig::load(cli.config.as_deref())?
        .with_target(cli.namespace, cli.deployment);
    let metrics = ScalerMetrics::new().context("Failed to create metrics registry")?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run_experiment(config, cli.kubeconfig, metrics).await,
        Commands::Probe => {
            probe(&config, cli.kubeconfig, metrics).await?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Scale { replicas } => {
            let orchestrator = connect(cli.kubeconfig, metrics).await?;
            let target = config.target();
            orchestrator
                .scale_replicas(&target, replicas)
                .await
                .with_context(|| format!("Failed to scale {}", target))?;
            output::print_success(&format!("Scaled {} to {} replicas", target, replicas));
            Ok(ExitCode::SUCCESS)
        }
    }
}

async fn connect(kubeconfig: Option<PathBuf>, metrics: ScalerMetrics) -> Result<KubeOrchestrator> {
    let client = orchestrator::connect(kubeconfig.as_deref())
        .await
        .context("Failed to connect to Kubernetes")?;
    Ok(KubeOrchestrator::new(client, metrics))
}

async fn probe(
    config: &config::AppConfig,
    kubeconfig: Option<PathBuf>,
    metrics: ScalerMetrics,
) -> Result<()> {
    let fortio = FortioClient::new(&config.benchmark.fortio_url)?;
    let run_id = fortio
        .probe(&config.benchmark.target_url)
        .await
        .context("Fortio is not reachable")?;

    let orchestrator = connect(kubeconfig, metrics).await?;
    let target = config.target();
    let spec = orchestrator
        .get_resource_spec(&target)
        .await
        .with_context(|| format!("Failed to read resources of {}", target))?;
    let health = orchestrator
        .get_health(&target)
        .await
        .with_context(|| format!("Failed to read health of {}", target))?;

    output::print_probe(&target, run_id, &spec, &health);
    Ok(())
}

async fn run_experiment(
    config: config::AppConfig,
    kubeconfig: Option<PathBuf>,
    metrics: ScalerMetrics,
) -> Result<ExitCode> {
    let target = config.target();
    info!(version = SCALER_VERSION, deployment = %target, "Starting vertical-scaler");

    let health_registry = HealthRegistry::new();
    let app_state = Arc::new(api::AppState::new(health_registry.clone(), metrics.clone()));
    let port = config.server.port;
    tokio::spawn(async move {
        if let Err(e) = api::serve(port, app_state).await {
            error!(error = %e, "API server stopped");
        }
    });

    let fortio = FortioClient::new(&config.benchmark.fortio_url)?;
    let probe_run = fortio
        .probe(&config.benchmark.target_url)
        .await
        .context("Fortio is not reachable")?;
    info!(run_id = probe_run, "Fortio connectivity confirmed");

    let orchestrator = connect(kubeconfig, metrics.clone()).await?;

    let (trigger, shutdown) = ShutdownSignal::new();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, stopping");
            trigger.trigger();
        }
    });

    let mut controller = AutoscaleController::builder()
        .config(config.controller_config())
        .benchmark(Arc::new(fortio))
        .orchestrator(Arc::new(orchestrator))
        .metrics(metrics)
        .health(health_registry)
        .shutdown(shutdown.clone())
        .build()
        .context("Invalid experiment configuration")?;

    let outcome = controller.run().await;
    output::print_outcome(&target, &outcome, controller.state());

    if config.server.linger && !shutdown.is_triggered() {
        info!(port, "Experiment finished, serving metrics until interrupted");
        shutdown.triggered().await;
    }

    Ok(ExitCode::from(u8::try_from(outcome.exit_code()).unwrap_or(1)))
}
