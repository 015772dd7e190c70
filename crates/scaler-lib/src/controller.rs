//! Autoscale control loop
//!
//! Drives one vertical scaling experiment against a single deployment:
//! benchmark, compare with the best throughput so far, stop on a plateau,
//! repair readiness by raising memory, and raise CPU every
//! `repeat_test_count` cycles. Any failure after the first mutation rolls the
//! deployment back to the resources it had before the experiment.
//!
//! Every collaborator call is awaited in sequence, so at most one benchmark
//! run and at most one resource mutation are ever in flight.

use crate::backoff::{BackoffConfig, BackoffPolicy, ShutdownSignal, WaitOutcome};
use crate::benchmark::{BenchmarkParameters, BenchmarkRunner};
use crate::error::{Result, ScalerError};
use crate::health::{components, ExperimentPhase, HealthRegistry};
use crate::models::{BenchmarkResult, DeploymentHealth, DeploymentResourceSpec, DeploymentTarget};
use crate::observability::{ExperimentLogger, ScalerMetrics};
use crate::orchestrator::ResourceOrchestrator;
use crate::quantity::ResourceQuantity;
use std::fmt;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Configuration for one experiment
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Deployment being tuned
    pub target: DeploymentTarget,
    /// Added to CPU request and limit on every scale-up (default: 100m)
    pub cpu_increment: ResourceQuantity,
    /// Added to memory request and limit on every remediation (default: 100Mi)
    pub memory_increment: ResourceQuantity,
    /// Benchmark cycles per resource level (default: 3)
    pub repeat_test_count: u32,
    /// Plateau threshold, counted in multiples of `repeat_test_count` (default: 10)
    pub max_runs_without_improvement: u32,
    pub benchmark: BenchmarkParameters,
    pub backoff: BackoffConfig,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            target: DeploymentTarget::new("fortio", "fortioserver"),
            cpu_increment: ResourceQuantity::from_millis(100),
            memory_increment: ResourceQuantity::from_bytes(100 << 20),
            repeat_test_count: 3,
            max_runs_without_improvement: 10,
            benchmark: BenchmarkParameters::default(),
            backoff: BackoffConfig::default(),
        }
    }
}

impl ControllerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.target.namespace.is_empty() || self.target.name.is_empty() {
            return Err(ScalerError::InvalidConfig(
                "target namespace and deployment name are required".into(),
            ));
        }
        if self.repeat_test_count == 0 {
            return Err(ScalerError::InvalidConfig(
                "repeat test count must be at least 1".into(),
            ));
        }
        if self.cpu_increment.is_zero() {
            return Err(ScalerError::InvalidConfig(
                "cpu increment must be positive".into(),
            ));
        }
        if self.memory_increment.is_zero() {
            return Err(ScalerError::InvalidConfig(
                "memory increment must be positive".into(),
            ));
        }
        self.backoff.validate()
    }
}

/// Working state of the experiment
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExperimentState {
    pub best_qps: f64,
    pub best_run_id: Option<String>,
    /// Completed cycles since the last scale-up
    pub runs_since_scale: u32,
    /// Consecutive cycles without a new best
    pub runs_without_improvement: u32,
    pub deploy_error: bool,
    /// Resources before the first mutation; the rollback target
    pub starting_resources: Option<DeploymentResourceSpec>,
    /// Resources most recently pushed
    pub current_resources: Option<DeploymentResourceSpec>,
    /// Cycles run after initialization
    pub cycles: u32,
    pub scale_ups: u32,
    pub remediations: u32,
}

impl ExperimentState {
    /// Fold one benchmark result into the running best
    ///
    /// Returns true when the result is a strict improvement.
    pub fn record_result(&mut self, result: &BenchmarkResult) -> bool {
        if result.achieved_qps > self.best_qps {
            self.best_qps = result.achieved_qps;
            self.best_run_id = Some(result.run_id.clone());
            self.runs_without_improvement = 0;
            true
        } else {
            self.runs_without_improvement += 1;
            false
        }
    }

    /// Plateau test with integer division
    pub fn plateau_reached(&self, repeat_test_count: u32, max_runs_without_improvement: u32) -> bool {
        self.runs_without_improvement / repeat_test_count.max(1) >= max_runs_without_improvement
    }

    /// Record the rollback target; later calls are ignored
    fn capture_starting_resources(&mut self, spec: DeploymentResourceSpec) {
        if self.starting_resources.is_none() {
            self.starting_resources = Some(spec);
        }
    }
}

/// Why an experiment stopped before converging
#[derive(Debug, Clone)]
pub enum AbortReason {
    /// The deployment never became ready within the backoff budget
    DeploymentUnrecoverable,
    Cancelled,
    Failed(ScalerError),
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AbortReason::DeploymentUnrecoverable => {
                f.write_str("deployment did not become ready after remediation")
            }
            AbortReason::Cancelled => f.write_str("cancelled"),
            AbortReason::Failed(e) => write!(f, "{}", e),
        }
    }
}

/// What happened to the deployment's resources on abort
#[derive(Debug, Clone)]
pub enum RollbackStatus {
    /// Nothing had been changed
    NotNeeded,
    Restored(DeploymentResourceSpec),
    Failed(ScalerError),
}

/// Final result of [`AutoscaleController::run`]
#[derive(Debug, Clone)]
pub enum ExperimentOutcome {
    /// Plateau reached; the last applied resources are kept
    Converged {
        best_qps: f64,
        best_run_id: Option<String>,
        resources: Option<DeploymentResourceSpec>,
        cycles: u32,
    },
    Aborted {
        reason: AbortReason,
        rollback: RollbackStatus,
        cycles: u32,
    },
}

impl ExperimentOutcome {
    pub fn is_converged(&self) -> bool {
        matches!(self, ExperimentOutcome::Converged { .. })
    }

    /// Process exit code for this outcome
    pub fn exit_code(&self) -> i32 {
        if self.is_converged() {
            0
        } else {
            1
        }
    }
}

/// How the loop ended without an error
enum Terminal {
    Converged,
    Unrecoverable,
    Cancelled,
}

/// The experiment driver
pub struct AutoscaleController {
    config: ControllerConfig,
    benchmark: Arc<dyn BenchmarkRunner>,
    orchestrator: Arc<dyn ResourceOrchestrator>,
    backoff: BackoffPolicy,
    metrics: ScalerMetrics,
    logger: ExperimentLogger,
    health: HealthRegistry,
    shutdown: ShutdownSignal,
    state: ExperimentState,
    phase: ExperimentPhase,
    mutation_attempted: bool,
    outcome: Option<ExperimentOutcome>,
}

impl AutoscaleController {
    pub fn builder() -> AutoscaleControllerBuilder {
        AutoscaleControllerBuilder::new()
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    pub fn state(&self) -> &ExperimentState {
        &self.state
    }

    pub fn phase(&self) -> ExperimentPhase {
        self.phase
    }

    /// Run the experiment to a terminal outcome
    ///
    /// Calling this again after it returned yields the same outcome without
    /// touching either collaborator.
    pub async fn run(&mut self) -> ExperimentOutcome {
        if let Some(outcome) = &self.outcome {
            return outcome.clone();
        }

        self.logger.log_experiment_started(
            self.config.repeat_test_count,
            self.config.max_runs_without_improvement,
            &self.config.cpu_increment.to_string(),
            &self.config.memory_increment.to_string(),
        );
        self.health.register(components::BENCHMARK).await;
        self.health.register(components::ORCHESTRATOR).await;
        self.health.register(components::DEPLOYMENT).await;
        self.set_phase(ExperimentPhase::Init).await;

        let outcome = match self.execute().await {
            Ok(Terminal::Converged) => self.converge().await,
            Ok(Terminal::Unrecoverable) => self.abort(AbortReason::DeploymentUnrecoverable).await,
            Ok(Terminal::Cancelled) => self.abort(AbortReason::Cancelled).await,
            Err(e) => {
                self.mark_failed_component(&e).await;
                self.abort(AbortReason::Failed(e)).await
            }
        };

        self.outcome = Some(outcome.clone());
        outcome
    }

    async fn execute(&mut self) -> Result<Terminal> {
        if self.shutdown.is_triggered() {
            return Ok(Terminal::Cancelled);
        }
        if let Some(terminal) = self.initialize().await? {
            return Ok(terminal);
        }
        self.set_phase(ExperimentPhase::Running).await;

        loop {
            if self.shutdown.is_triggered() {
                info!(cycles = self.state.cycles, "Shutdown requested, stopping experiment");
                return Ok(Terminal::Cancelled);
            }
            if let Some(terminal) = self.run_cycle().await? {
                return Ok(terminal);
            }
        }
    }

    /// Baseline benchmark, rollback snapshot, and the first scale-up
    async fn initialize(&mut self) -> Result<Option<Terminal>> {
        let baseline = self.benchmark_once().await?;
        let improved = self.state.record_result(&baseline);
        // The baseline never counts towards the plateau
        self.state.runs_without_improvement = 0;
        if improved {
            self.metrics.set_best_qps(self.state.best_qps);
        }
        self.logger.log_benchmark(0, &baseline, self.state.best_qps, improved);

        let starting = self.fetch_resources().await?;
        debug!(
            cpu_request = %starting.cpu_request,
            memory_request = %starting.memory_request,
            "Captured starting resources"
        );
        self.state.capture_starting_resources(starting);

        self.scale_up().await
    }

    async fn run_cycle(&mut self) -> Result<Option<Terminal>> {
        self.state.cycles += 1;
        let cycle = self.state.cycles;

        let result = self.benchmark_once().await?;
        let improved = self.state.record_result(&result);
        if improved {
            self.metrics.set_best_qps(self.state.best_qps);
        }
        self.logger.log_benchmark(cycle, &result, self.state.best_qps, improved);

        if self.state.plateau_reached(
            self.config.repeat_test_count,
            self.config.max_runs_without_improvement,
        ) {
            return Ok(Some(Terminal::Converged));
        }

        let health = self.check_health().await?;
        if !health.is_healthy() {
            self.remediate(&health).await?;

            let recheck = self.check_health().await?;
            if !recheck.is_healthy() {
                match self.wait_for_health().await? {
                    WaitOutcome::Satisfied => {}
                    WaitOutcome::Exhausted => self.state.deploy_error = true,
                    WaitOutcome::Cancelled => return Ok(Some(Terminal::Cancelled)),
                }
            }
        }

        if self.state.deploy_error {
            self.metrics.inc_deploy_errors();
            self.health
                .set_unhealthy(components::DEPLOYMENT, "not ready after remediation")
                .await;
            return Ok(Some(Terminal::Unrecoverable));
        }

        self.state.runs_since_scale += 1;
        if self.state.runs_since_scale >= self.config.repeat_test_count {
            self.state.runs_since_scale = 0;
            return self.scale_up().await;
        }

        Ok(None)
    }

    async fn benchmark_once(&self) -> Result<BenchmarkResult> {
        let started = Instant::now();
        let result = self.benchmark.run(&self.config.benchmark).await?;
        self.metrics
            .observe_benchmark(result.achieved_qps, started.elapsed().as_secs_f64());
        self.health.set_healthy(components::BENCHMARK).await;
        Ok(result)
    }

    async fn fetch_resources(&self) -> Result<DeploymentResourceSpec> {
        self.orchestrator.get_resource_spec(&self.config.target).await
    }

    async fn push_resources(&mut self, spec: &DeploymentResourceSpec) -> Result<()> {
        self.mutation_attempted = true;
        self.orchestrator
            .update_resource_spec(&self.config.target, spec)
            .await?;
        self.state.current_resources = Some(spec.clone());
        self.metrics.set_current_resources(spec);
        Ok(())
    }

    /// Raise CPU request and limit, then give the rollout time to settle
    async fn scale_up(&mut self) -> Result<Option<Terminal>> {
        let current = self.fetch_resources().await?;
        let next = current.with_cpu_increment(self.config.cpu_increment);
        self.push_resources(&next).await?;

        self.state.scale_ups += 1;
        self.metrics.inc_scale_ups();
        self.logger.log_scale_up(&current, &next);

        match self.wait_for_health().await? {
            WaitOutcome::Satisfied => Ok(None),
            WaitOutcome::Exhausted => {
                warn!(
                    deployment = %self.config.target,
                    "Deployment did not settle after scale-up, continuing"
                );
                Ok(None)
            }
            WaitOutcome::Cancelled => Ok(Some(Terminal::Cancelled)),
        }
    }

    /// Raise memory request and limit of an unready deployment
    async fn remediate(&mut self, health: &DeploymentHealth) -> Result<()> {
        let current = self.fetch_resources().await?;
        let next = current.with_memory_increment(self.config.memory_increment);
        self.push_resources(&next).await?;

        self.state.remediations += 1;
        self.metrics.inc_remediations();
        self.logger.log_remediation(health, &current, &next);
        Ok(())
    }

    async fn check_health(&self) -> Result<DeploymentHealth> {
        let health = self.orchestrator.get_health(&self.config.target).await?;
        self.logger.log_health(&health);
        self.health.set_healthy(components::ORCHESTRATOR).await;
        if health.is_healthy() {
            self.health.set_healthy(components::DEPLOYMENT).await;
        } else {
            self.health
                .set_degraded(
                    components::DEPLOYMENT,
                    format!(
                        "{}/{} replicas ready",
                        health.ready_replicas, health.desired_replicas
                    ),
                )
                .await;
        }
        Ok(health)
    }

    async fn wait_for_health(&self) -> Result<WaitOutcome> {
        self.backoff
            .wait_until(
                || async move { Ok::<_, ScalerError>(self.check_health().await?.is_healthy()) },
                &self.shutdown,
            )
            .await
    }

    async fn converge(&mut self) -> ExperimentOutcome {
        self.set_phase(ExperimentPhase::Converged).await;
        self.logger.log_converged(
            self.state.best_qps,
            self.state.best_run_id.as_deref(),
            self.state.cycles,
        );

        ExperimentOutcome::Converged {
            best_qps: self.state.best_qps,
            best_run_id: self.state.best_run_id.clone(),
            resources: self.state.current_resources.clone(),
            cycles: self.state.cycles,
        }
    }

    async fn abort(&mut self, reason: AbortReason) -> ExperimentOutcome {
        let rollback = self.rollback().await;
        self.set_phase(ExperimentPhase::Aborted).await;
        self.logger.log_aborted(
            &reason.to_string(),
            matches!(rollback, RollbackStatus::Restored(_)),
            self.state.cycles,
        );

        ExperimentOutcome::Aborted {
            reason,
            rollback,
            cycles: self.state.cycles,
        }
    }

    /// Push the starting resources back if anything was changed
    ///
    /// The write is unversioned: the snapshot predates our own mutations.
    async fn rollback(&mut self) -> RollbackStatus {
        if !self.mutation_attempted {
            return RollbackStatus::NotNeeded;
        }
        let Some(starting) = self.state.starting_resources.as_ref().map(|s| s.unversioned()) else {
            return RollbackStatus::NotNeeded;
        };

        match self
            .orchestrator
            .update_resource_spec(&self.config.target, &starting)
            .await
        {
            Ok(()) => {
                self.state.current_resources = Some(starting.clone());
                self.metrics.set_current_resources(&starting);
                self.metrics.inc_rollbacks();
                self.logger.log_rollback(&starting, None);
                RollbackStatus::Restored(starting)
            }
            Err(e) => {
                self.logger.log_rollback(&starting, Some(&e.to_string()));
                RollbackStatus::Failed(e)
            }
        }
    }

    async fn mark_failed_component(&self, error: &ScalerError) {
        match error {
            ScalerError::BenchmarkUnavailable(msg) => {
                self.health.set_unhealthy(components::BENCHMARK, msg.clone()).await
            }
            e if e.is_fatal_api_failure() => {
                self.health
                    .set_unhealthy(components::ORCHESTRATOR, e.to_string())
                    .await
            }
            _ => {}
        }
    }

    async fn set_phase(&mut self, phase: ExperimentPhase) {
        debug!(from = %self.phase, to = %phase, "Experiment phase change");
        self.phase = phase;
        self.health.set_phase(phase).await;
    }
}

/// Builder for [`AutoscaleController`]
pub struct AutoscaleControllerBuilder {
    config: ControllerConfig,
    benchmark: Option<Arc<dyn BenchmarkRunner>>,
    orchestrator: Option<Arc<dyn ResourceOrchestrator>>,
    metrics: Option<ScalerMetrics>,
    health: Option<HealthRegistry>,
    shutdown: Option<ShutdownSignal>,
}

impl AutoscaleControllerBuilder {
    pub fn new() -> Self {
        Self {
            config: ControllerConfig::default(),
            benchmark: None,
            orchestrator: None,
            metrics: None,
            health: None,
            shutdown: None,
        }
    }

    pub fn config(mut self, config: ControllerConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the load-test runner
    pub fn benchmark(mut self, benchmark: Arc<dyn BenchmarkRunner>) -> Self {
        self.benchmark = Some(benchmark);
        self
    }

    /// Set the cluster adapter
    pub fn orchestrator(mut self, orchestrator: Arc<dyn ResourceOrchestrator>) -> Self {
        self.orchestrator = Some(orchestrator);
        self
    }

    pub fn metrics(mut self, metrics: ScalerMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn health(mut self, health: HealthRegistry) -> Self {
        self.health = Some(health);
        self
    }

    pub fn shutdown(mut self, shutdown: ShutdownSignal) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    /// Validate the configuration and build the controller
    pub fn build(self) -> Result<AutoscaleController> {
        self.config.validate()?;

        let benchmark = self
            .benchmark
            .ok_or_else(|| ScalerError::InvalidConfig("benchmark runner is required".into()))?;
        let orchestrator = self
            .orchestrator
            .ok_or_else(|| ScalerError::InvalidConfig("orchestrator is required".into()))?;
        let metrics = match self.metrics {
            Some(metrics) => metrics,
            None => ScalerMetrics::new().map_err(|e| {
                ScalerError::InvalidConfig(format!("failed to create metrics registry: {}", e))
            })?,
        };

        Ok(AutoscaleController {
            backoff: BackoffPolicy::new(self.config.backoff.clone()),
            logger: ExperimentLogger::new(&self.config.target),
            config: self.config,
            benchmark,
            orchestrator,
            metrics,
            health: self.health.unwrap_or_default(),
            shutdown: self.shutdown.unwrap_or_else(ShutdownSignal::never),
            state: ExperimentState::default(),
            phase: ExperimentPhase::Init,
            mutation_attempted: false,
            outcome: None,
        })
    }
}

impl Default for AutoscaleControllerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(run_id: &str, qps: f64) -> BenchmarkResult {
        BenchmarkResult {
            run_id: run_id.to_string(),
            achieved_qps: qps,
        }
    }

    #[test]
    fn test_improvement_then_regression() {
        let mut state = ExperimentState::default();

        assert!(state.record_result(&result("run-1", 500.0)));
        assert_eq!(state.best_qps, 500.0);
        assert_eq!(state.best_run_id.as_deref(), Some("run-1"));
        assert_eq!(state.runs_without_improvement, 0);

        assert!(!state.record_result(&result("run-2", 480.0)));
        assert_eq!(state.best_qps, 500.0);
        assert_eq!(state.best_run_id.as_deref(), Some("run-1"));
        assert_eq!(state.runs_without_improvement, 1);
    }

    #[test]
    fn test_equal_result_is_not_an_improvement() {
        let mut state = ExperimentState::default();
        state.record_result(&result("run-1", 500.0));

        assert!(!state.record_result(&result("run-2", 500.0)));
        assert_eq!(state.best_run_id.as_deref(), Some("run-1"));
    }

    #[test]
    fn test_improvement_resets_counter() {
        let mut state = ExperimentState::default();
        state.record_result(&result("run-1", 500.0));
        state.record_result(&result("run-2", 400.0));
        state.record_result(&result("run-3", 450.0));
        assert_eq!(state.runs_without_improvement, 2);

        state.record_result(&result("run-4", 600.0));
        assert_eq!(state.runs_without_improvement, 0);
        assert_eq!(state.best_run_id.as_deref(), Some("run-4"));
    }

    #[test]
    fn test_best_tracks_maximum() {
        let mut state = ExperimentState::default();
        let samples = [120.0, 340.0, 200.0, 340.0, 910.0, 15.0, 600.0];

        for (i, qps) in samples.iter().enumerate() {
            state.record_result(&result(&format!("run-{}", i), *qps));
            let max = samples[..=i].iter().cloned().fold(0.0, f64::max);
            assert_eq!(state.best_qps, max);
        }
        assert_eq!(state.best_run_id.as_deref(), Some("run-4"));
    }

    #[test]
    fn test_plateau_uses_integer_division() {
        let mut state = ExperimentState::default();

        for runs in 0..6 {
            state.runs_without_improvement = runs;
            assert!(!state.plateau_reached(3, 2), "plateau too early at {}", runs);
        }
        state.runs_without_improvement = 6;
        assert!(state.plateau_reached(3, 2));
        state.runs_without_improvement = 7;
        assert!(state.plateau_reached(3, 2));
    }

    #[test]
    fn test_starting_resources_captured_once() {
        let first = DeploymentResourceSpec {
            cpu_request: ResourceQuantity::from_millis(500),
            cpu_limit: ResourceQuantity::from_millis(1000),
            memory_request: ResourceQuantity::from_bytes(1 << 20),
            memory_limit: ResourceQuantity::from_bytes(2 << 20),
            resource_version: None,
        };
        let second = first.with_cpu_increment(ResourceQuantity::from_millis(100));

        let mut state = ExperimentState::default();
        state.capture_starting_resources(first.clone());
        state.capture_starting_resources(second);

        assert_eq!(state.starting_resources, Some(first));
    }

    #[test]
    fn test_config_defaults() {
        let config = ControllerConfig::default();

        assert_eq!(config.target.to_string(), "fortio/fortioserver");
        assert_eq!(config.cpu_increment.to_string(), "100m");
        assert_eq!(config.memory_increment.to_string(), "100Mi");
        assert_eq!(config.repeat_test_count, 3);
        assert_eq!(config.max_runs_without_improvement, 10);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_rejects_zero_repeat_count() {
        let config = ControllerConfig {
            repeat_test_count: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ScalerError::InvalidConfig(_))));
    }

    #[test]
    fn test_config_rejects_zero_increment() {
        let config = ControllerConfig {
            cpu_increment: ResourceQuantity::ZERO,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_builder_requires_collaborators() {
        let err = AutoscaleController::builder().build().err().unwrap();
        assert!(err.to_string().contains("benchmark runner is required"));
    }

    #[test]
    fn test_exit_codes() {
        let converged = ExperimentOutcome::Converged {
            best_qps: 1.0,
            best_run_id: None,
            resources: None,
            cycles: 1,
        };
        let aborted = ExperimentOutcome::Aborted {
            reason: AbortReason::Cancelled,
            rollback: RollbackStatus::NotNeeded,
            cycles: 0,
        };

        assert_eq!(converged.exit_code(), 0);
        assert_eq!(aborted.exit_code(), 1);
    }
}
