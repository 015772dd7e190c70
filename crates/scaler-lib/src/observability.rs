//! Observability infrastructure for the scaling experiment
//!
//! Provides:
//! - Prometheus metrics on an explicitly owned registry (best QPS, run
//!   counts, scale-ups, remediations, deploy errors, rollbacks, API calls)
//! - Structured JSON logging of experiment events with tracing

use crate::models::{BenchmarkResult, DeploymentHealth, DeploymentResourceSpec, DeploymentTarget};
use prometheus::core::Collector;
use prometheus::proto::MetricFamily;
use prometheus::{
    Encoder, Gauge, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts,
    Registry, TextEncoder,
};
use std::sync::Arc;
use tracing::{info, warn};

/// Histogram buckets for benchmark durations (in seconds)
const BENCHMARK_DURATION_BUCKETS: &[f64] = &[1.0, 5.0, 10.0, 15.0, 30.0, 60.0, 120.0, 300.0, 600.0];

const METRIC_PREFIX: &str = "vertical_scaler";

struct ScalerMetricsInner {
    registry: Registry,
    best_qps: Gauge,
    last_qps: Gauge,
    benchmark_runs: IntCounter,
    benchmark_duration_seconds: Histogram,
    scale_ups: IntCounter,
    remediations: IntCounter,
    deploy_errors: IntCounter,
    rollbacks: IntCounter,
    cpu_request_millicores: IntGauge,
    memory_request_bytes: IntGauge,
    orchestrator_requests: IntCounterVec,
    orchestrator_errors: IntCounterVec,
}

fn register<T: Collector + Clone + 'static>(registry: &Registry, metric: T) -> prometheus::Result<T> {
    registry.register(Box::new(metric.clone()))?;
    Ok(metric)
}

fn name(suffix: &str) -> String {
    format!("{}_{}", METRIC_PREFIX, suffix)
}

/// Metrics sink for the controller and its collaborators
///
/// Clones share one registry. Nothing is registered globally, so every
/// controller (and every test) can own an independent set.
#[derive(Clone)]
pub struct ScalerMetrics {
    inner: Arc<ScalerMetricsInner>,
}

impl ScalerMetrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let inner = ScalerMetricsInner {
            best_qps: register(
                &registry,
                Gauge::with_opts(Opts::new(name("best_qps"), "Best throughput observed so far"))?,
            )?,
            last_qps: register(
                &registry,
                Gauge::with_opts(Opts::new(name("last_qps"), "Throughput of the latest benchmark run"))?,
            )?,
            benchmark_runs: register(
                &registry,
                IntCounter::new(name("benchmark_runs_total"), "Total benchmark runs completed")?,
            )?,
            benchmark_duration_seconds: register(
                &registry,
                Histogram::with_opts(
                    HistogramOpts::new(
                        name("benchmark_duration_seconds"),
                        "Wall-clock time of each benchmark run",
                    )
                    .buckets(BENCHMARK_DURATION_BUCKETS.to_vec()),
                )?,
            )?,
            scale_ups: register(
                &registry,
                IntCounter::new(name("scale_ups_total"), "CPU scale-up steps applied")?,
            )?,
            remediations: register(
                &registry,
                IntCounter::new(name("remediations_total"), "Memory remediations applied")?,
            )?,
            deploy_errors: register(
                &registry,
                IntCounter::new(
                    name("deploy_errors_total"),
                    "Deployments that never became ready within the backoff budget",
                )?,
            )?,
            rollbacks: register(
                &registry,
                IntCounter::new(name("rollbacks_total"), "Rollbacks to the starting resources")?,
            )?,
            cpu_request_millicores: register(
                &registry,
                IntGauge::new(name("cpu_request_millicores"), "CPU request last pushed")?,
            )?,
            memory_request_bytes: register(
                &registry,
                IntGauge::new(name("memory_request_bytes"), "Memory request last pushed")?,
            )?,
            orchestrator_requests: register(
                &registry,
                IntCounterVec::new(
                    Opts::new(name("orchestrator_requests_total"), "Orchestrator API calls by verb"),
                    &["verb"],
                )?,
            )?,
            orchestrator_errors: register(
                &registry,
                IntCounterVec::new(
                    Opts::new(name("orchestrator_errors_total"), "Failed orchestrator API calls by verb"),
                    &["verb"],
                )?,
            )?,
            registry,
        };

        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.inner.registry
    }

    pub fn gather(&self) -> Vec<MetricFamily> {
        self.inner.registry.gather()
    }

    /// Render every metric in the Prometheus text format
    pub fn encode_text(&self) -> prometheus::Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }

    /// Record a completed benchmark run
    pub fn observe_benchmark(&self, achieved_qps: f64, duration_secs: f64) {
        self.inner.benchmark_runs.inc();
        self.inner.last_qps.set(achieved_qps);
        self.inner.benchmark_duration_seconds.observe(duration_secs);
    }

    pub fn set_best_qps(&self, qps: f64) {
        self.inner.best_qps.set(qps);
    }

    pub fn inc_scale_ups(&self) {
        self.inner.scale_ups.inc();
    }

    pub fn inc_remediations(&self) {
        self.inner.remediations.inc();
    }

    pub fn inc_deploy_errors(&self) {
        self.inner.deploy_errors.inc();
    }

    pub fn inc_rollbacks(&self) {
        self.inner.rollbacks.inc();
    }

    /// Update the gauges mirroring the last pushed resource spec
    pub fn set_current_resources(&self, spec: &DeploymentResourceSpec) {
        self.inner
            .cpu_request_millicores
            .set(i64::try_from(spec.cpu_request.millis()).unwrap_or(i64::MAX));
        self.inner
            .memory_request_bytes
            .set(i64::try_from(spec.memory_request.as_bytes()).unwrap_or(i64::MAX));
    }

    pub fn record_orchestrator_request(&self, verb: &str) {
        self.inner.orchestrator_requests.with_label_values(&[verb]).inc();
    }

    pub fn record_orchestrator_error(&self, verb: &str) {
        self.inner.orchestrator_errors.with_label_values(&[verb]).inc();
    }

    pub fn best_qps(&self) -> f64 {
        self.inner.best_qps.get()
    }

    pub fn benchmark_runs(&self) -> u64 {
        self.inner.benchmark_runs.get()
    }

    pub fn scale_ups(&self) -> u64 {
        self.inner.scale_ups.get()
    }

    pub fn remediations(&self) -> u64 {
        self.inner.remediations.get()
    }

    pub fn deploy_errors(&self) -> u64 {
        self.inner.deploy_errors.get()
    }

    pub fn rollbacks(&self) -> u64 {
        self.inner.rollbacks.get()
    }
}

/// Structured logger for experiment events
///
/// Every event carries an `event` field and the target deployment so the
/// JSON output can be filtered per experiment.
#[derive(Clone)]
pub struct ExperimentLogger {
    namespace: String,
    deployment: String,
}

impl ExperimentLogger {
    pub fn new(target: &DeploymentTarget) -> Self {
        Self {
            namespace: target.namespace.clone(),
            deployment: target.name.clone(),
        }
    }

    pub fn log_experiment_started(
        &self,
        repeat_test_count: u32,
        max_runs_without_improvement: u32,
        cpu_increment: &str,
        memory_increment: &str,
    ) {
        info!(
            event = "experiment_started",
            namespace = %self.namespace,
            deployment = %self.deployment,
            repeat_test_count = repeat_test_count,
            max_runs_without_improvement = max_runs_without_improvement,
            cpu_increment = %cpu_increment,
            memory_increment = %memory_increment,
            "Vertical scaling experiment started"
        );
    }

    pub fn log_benchmark(&self, cycle: u32, result: &BenchmarkResult, best_qps: f64, improved: bool) {
        info!(
            event = "benchmark_completed",
            namespace = %self.namespace,
            deployment = %self.deployment,
            cycle = cycle,
            run_id = %result.run_id,
            achieved_qps = result.achieved_qps,
            best_qps = best_qps,
            improved = improved,
            "Benchmark run evaluated"
        );
    }

    pub fn log_scale_up(&self, from: &DeploymentResourceSpec, to: &DeploymentResourceSpec) {
        info!(
            event = "scale_up",
            namespace = %self.namespace,
            deployment = %self.deployment,
            cpu_request_from = %from.cpu_request,
            cpu_request_to = %to.cpu_request,
            cpu_limit_from = %from.cpu_limit,
            cpu_limit_to = %to.cpu_limit,
            "Scaled up CPU"
        );
    }

    pub fn log_remediation(
        &self,
        health: &DeploymentHealth,
        from: &DeploymentResourceSpec,
        to: &DeploymentResourceSpec,
    ) {
        warn!(
            event = "memory_remediation",
            namespace = %self.namespace,
            deployment = %self.deployment,
            desired_replicas = health.desired_replicas,
            ready_replicas = health.ready_replicas,
            memory_request_from = %from.memory_request,
            memory_request_to = %to.memory_request,
            memory_limit_to = %to.memory_limit,
            "Deployment not ready, raised memory"
        );
    }

    pub fn log_health(&self, health: &DeploymentHealth) {
        if health.is_healthy() {
            info!(
                event = "health_check",
                namespace = %self.namespace,
                deployment = %self.deployment,
                desired_replicas = health.desired_replicas,
                ready_replicas = health.ready_replicas,
                healthy = true,
                "Deployment is ready"
            );
        } else {
            info!(
                event = "health_check",
                namespace = %self.namespace,
                deployment = %self.deployment,
                desired_replicas = health.desired_replicas,
                ready_replicas = health.ready_replicas,
                healthy = false,
                "Deployment is not ready"
            );
        }
    }

    pub fn log_rollback(&self, spec: &DeploymentResourceSpec, error: Option<&str>) {
        match error {
            None => warn!(
                event = "rollback",
                namespace = %self.namespace,
                deployment = %self.deployment,
                cpu_request = %spec.cpu_request,
                cpu_limit = %spec.cpu_limit,
                memory_request = %spec.memory_request,
                memory_limit = %spec.memory_limit,
                success = true,
                "Restored starting resources"
            ),
            Some(error) => warn!(
                event = "rollback",
                namespace = %self.namespace,
                deployment = %self.deployment,
                success = false,
                error = %error,
                "Failed to restore starting resources"
            ),
        }
    }

    pub fn log_converged(&self, best_qps: f64, best_run_id: Option<&str>, cycles: u32) {
        info!(
            event = "experiment_converged",
            namespace = %self.namespace,
            deployment = %self.deployment,
            best_qps = best_qps,
            best_run_id = ?best_run_id,
            cycles = cycles,
            "Reached maximum runs without an improvement"
        );
    }

    pub fn log_aborted(&self, reason: &str, rolled_back: bool, cycles: u32) {
        warn!(
            event = "experiment_aborted",
            namespace = %self.namespace,
            deployment = %self.deployment,
            reason = %reason,
            rolled_back = rolled_back,
            cycles = cycles,
            "Experiment aborted"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quantity::ResourceQuantity;

    #[test]
    fn test_metrics_are_independent_per_instance() {
        let first = ScalerMetrics::new().unwrap();
        let second = ScalerMetrics::new().unwrap();

        first.observe_benchmark(100.0, 10.0);
        first.set_best_qps(100.0);

        assert_eq!(first.benchmark_runs(), 1);
        assert_eq!(first.best_qps(), 100.0);
        assert_eq!(second.benchmark_runs(), 0);
    }

    #[test]
    fn test_clones_share_registry() {
        let metrics = ScalerMetrics::new().unwrap();
        let clone = metrics.clone();

        clone.inc_scale_ups();
        clone.inc_remediations();
        clone.inc_deploy_errors();
        clone.inc_rollbacks();

        assert_eq!(metrics.scale_ups(), 1);
        assert_eq!(metrics.remediations(), 1);
        assert_eq!(metrics.deploy_errors(), 1);
        assert_eq!(metrics.rollbacks(), 1);
    }

    #[test]
    fn test_encode_text_exposes_metrics() {
        let metrics = ScalerMetrics::new().unwrap();
        metrics.set_best_qps(512.5);
        metrics.record_orchestrator_request("update");
        metrics.record_orchestrator_error("update");
        metrics.set_current_resources(&DeploymentResourceSpec {
            cpu_request: ResourceQuantity::from_millis(600),
            cpu_limit: ResourceQuantity::from_millis(1100),
            memory_request: ResourceQuantity::from_bytes(1024),
            memory_limit: ResourceQuantity::from_bytes(2048),
            resource_version: None,
        });

        let text = metrics.encode_text().unwrap();
        assert!(text.contains("vertical_scaler_best_qps 512.5"));
        assert!(text.contains("vertical_scaler_orchestrator_requests_total{verb=\"update\"} 1"));
        assert!(text.contains("vertical_scaler_orchestrator_errors_total{verb=\"update\"} 1"));
        assert!(text.contains("vertical_scaler_cpu_request_millicores 600"));
        assert!(text.contains("vertical_scaler_memory_request_bytes 1024"));
    }

    #[test]
    fn test_experiment_logger_creation() {
        let logger = ExperimentLogger::new(&DeploymentTarget::new("fortio", "fortioserver"));
        assert_eq!(logger.namespace, "fortio");
        assert_eq!(logger.deployment, "fortioserver");
    }
}
