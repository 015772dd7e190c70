//! Scaler configuration
//!
//! Layered with the `config` crate: embedded defaults, then an optional
//! file, then `KWB_`-prefixed environment variables using `__` between
//! nested keys (e.g. `KWB_TARGET__NAMESPACE=fortio`).

use anyhow::{ensure, Context, Result};
use config::{Config, Environment, File, FileFormat};
use scaler_lib::{
    BackoffConfig, BenchmarkParameters, ControllerConfig, DeploymentTarget, ResourceQuantity,
};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

const ENV_PREFIX: &str = "KWB";

const DEFAULTS: &str = r#"
target:
  namespace: fortio
  deployment: fortioserver
resources:
  cpu_increment: 100m
  memory_increment: 100Mi
benchmark:
  fortio_url: http://localhost:8080/fortio/
  target_url: http://localhost:8080/echo
  connections: 1
  duration_secs: 10
  save: true
experiment:
  repeat_test_count: 3
  max_runs_without_improvement: 10
backoff:
  initial_interval_secs: 10
  multiplier: 1.0
  max_interval_secs: 60
  max_elapsed_secs: 60
server:
  port: 9090
  linger: false
"#;

/// Scaler configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub target: TargetConfig,
    pub resources: ResourcesConfig,
    pub benchmark: BenchmarkConfig,
    pub experiment: ExperimentConfig,
    pub backoff: BackoffSettings,
    pub server: ServerConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TargetConfig {
    pub namespace: String,
    pub deployment: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResourcesConfig {
    /// Added to CPU request and limit on every scale-up
    pub cpu_increment: ResourceQuantity,
    /// Added to memory request and limit when the deployment is not ready
    pub memory_increment: ResourceQuantity,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BenchmarkConfig {
    /// Base URL of the Fortio UI
    pub fortio_url: String,
    /// URL Fortio loads
    pub target_url: String,
    pub connections: u32,
    pub duration_secs: u64,
    pub save: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExperimentConfig {
    pub repeat_test_count: u32,
    pub max_runs_without_improvement: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BackoffSettings {
    pub initial_interval_secs: u64,
    pub multiplier: f64,
    pub max_interval_secs: u64,
    pub max_elapsed_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Port for health and metrics endpoints
    pub port: u16,
    /// Keep serving after the experiment ends, until interrupted
    pub linger: bool,
}

fn environment() -> Environment {
    Environment::with_prefix(ENV_PREFIX)
        .prefix_separator("_")
        .separator("__")
        .try_parsing(true)
}

impl AppConfig {
    /// Load configuration from defaults, an optional file and the environment
    pub fn load(path: Option<&Path>) -> Result<Self> {
        Self::load_with(path, environment())
    }

    fn load_with(path: Option<&Path>, env: Environment) -> Result<Self> {
        let mut builder =
            Config::builder().add_source(File::from_str(DEFAULTS, FileFormat::Yaml));
        if let Some(path) = path {
            ensure!(path.exists(), "Config file {} does not exist", path.display());
            builder = builder.add_source(File::from(path));
        }

        let config: AppConfig = builder
            .add_source(env)
            .build()
            .context("Failed to load configuration")?
            .try_deserialize()
            .context("Failed to parse configuration")?;

        config.validate()?;
        Ok(config)
    }

    /// Apply command-line overrides for the target deployment
    pub fn with_target(mut self, namespace: Option<String>, deployment: Option<String>) -> Self {
        if let Some(namespace) = namespace {
            self.target.namespace = namespace;
        }
        if let Some(deployment) = deployment {
            self.target.deployment = deployment;
        }
        self
    }

    fn validate(&self) -> Result<()> {
        ensure!(self.benchmark.connections > 0, "benchmark.connections must be positive");
        ensure!(self.benchmark.duration_secs > 0, "benchmark.duration_secs must be positive");
        ensure!(
            self.experiment.repeat_test_count > 0,
            "experiment.repeat_test_count must be positive"
        );
        Ok(())
    }

    pub fn target(&self) -> DeploymentTarget {
        DeploymentTarget::new(&self.target.namespace, &self.target.deployment)
    }

    pub fn controller_config(&self) -> ControllerConfig {
        ControllerConfig {
            target: self.target(),
            cpu_increment: self.resources.cpu_increment,
            memory_increment: self.resources.memory_increment,
            repeat_test_count: self.experiment.repeat_test_count,
            max_runs_without_improvement: self.experiment.max_runs_without_improvement,
            benchmark: BenchmarkParameters {
                target_url: self.benchmark.target_url.clone(),
                connections: self.benchmark.connections,
                duration: Duration::from_secs(self.benchmark.duration_secs),
                qps: -1,
                save: self.benchmark.save,
            },
            backoff: BackoffConfig {
                initial_interval: Duration::from_secs(self.backoff.initial_interval_secs),
                multiplier: self.backoff.multiplier,
                max_interval: Duration::from_secs(self.backoff.max_interval_secs),
                max_elapsed_time: Duration::from_secs(self.backoff.max_elapsed_secs),
            },
        }
    }
}
