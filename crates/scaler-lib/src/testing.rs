//! In-memory collaborators for exercising the controller without a cluster
//! or a load generator
//!
//! Both doubles record every call and flag any overlap between two calls in
//! flight at once.

use crate::benchmark::{BenchmarkParameters, BenchmarkRunner};
use crate::error::{Result, ScalerError};
use crate::models::{BenchmarkResult, DeploymentHealth, DeploymentResourceSpec, DeploymentTarget};
use crate::orchestrator::ResourceOrchestrator;
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

/// Marks a call as in flight for its lifetime
struct InFlight<'a> {
    flag: &'a AtomicBool,
}

impl<'a> InFlight<'a> {
    fn enter(flag: &'a AtomicBool, overlap: &AtomicBool) -> Self {
        if flag.swap(true, Ordering::SeqCst) {
            overlap.store(true, Ordering::SeqCst);
        }
        Self { flag }
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

/// Benchmark runner that replays a fixed list of results
///
/// Run ids are `run-1`, `run-2`, ... in call order. Once the script is
/// exhausted every call fails with `BenchmarkUnavailable`.
pub struct ScriptedBenchmark {
    script: Mutex<VecDeque<Result<f64>>>,
    calls: AtomicUsize,
    in_flight: AtomicBool,
    overlapped: AtomicBool,
}

impl ScriptedBenchmark {
    pub fn new(qps: impl IntoIterator<Item = f64>) -> Self {
        Self {
            script: Mutex::new(qps.into_iter().map(Ok).collect()),
            calls: AtomicUsize::new(0),
            in_flight: AtomicBool::new(false),
            overlapped: AtomicBool::new(false),
        }
    }

    /// Append a failing run to the script
    pub fn then_fail(self, error: ScalerError) -> Self {
        if let Ok(mut script) = self.script.lock() {
            script.push_back(Err(error));
        }
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// True if two runs were ever in flight together
    pub fn overlapped(&self) -> bool {
        self.overlapped.load(Ordering::SeqCst)
    }

    fn next(&self) -> Result<f64> {
        let mut script = self
            .script
            .lock()
            .map_err(|_| ScalerError::BenchmarkUnavailable("script lock poisoned".into()))?;
        script
            .pop_front()
            .unwrap_or_else(|| Err(ScalerError::BenchmarkUnavailable("script exhausted".into())))
    }
}

#[async_trait]
impl BenchmarkRunner for ScriptedBenchmark {
    async fn run(&self, _parameters: &BenchmarkParameters) -> Result<BenchmarkResult> {
        let _guard = InFlight::enter(&self.in_flight, &self.overlapped);
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        tokio::task::yield_now().await;

        let achieved_qps = self.next()?;
        Ok(BenchmarkResult {
            run_id: format!("run-{}", call),
            achieved_qps,
        })
    }
}

#[derive(Debug)]
struct DeploymentState {
    spec: DeploymentResourceSpec,
    version: u64,
    health_script: VecDeque<DeploymentHealth>,
    default_health: DeploymentHealth,
    health_reads: usize,
    updates: Vec<DeploymentResourceSpec>,
    update_attempts: usize,
    failing_updates: HashMap<usize, ScalerError>,
    failing_reads: HashMap<usize, ScalerError>,
    edits_after_read: HashMap<usize, DeploymentResourceSpec>,
    spec_reads: usize,
    replicas: Vec<u32>,
}

/// Orchestrator holding a single deployment in memory
///
/// Health checks consume a scripted sequence first and then report the
/// default health. Failures can be injected for specific update or read
/// calls, counted from zero.
///
/// Reads hand out the current object version and every applied write bumps
/// it, so a versioned write based on an outdated read fails with
/// [`ScalerError::Conflict`] just as it would against the API server.
pub struct InMemoryOrchestrator {
    state: Mutex<DeploymentState>,
    in_flight: AtomicBool,
    overlapped: AtomicBool,
}

impl InMemoryOrchestrator {
    pub fn new(spec: DeploymentResourceSpec) -> Self {
        Self {
            state: Mutex::new(DeploymentState {
                spec,
                version: 1,
                health_script: VecDeque::new(),
                default_health: DeploymentHealth {
                    desired_replicas: 1,
                    ready_replicas: 1,
                },
                health_reads: 0,
                updates: Vec::new(),
                update_attempts: 0,
                failing_updates: HashMap::new(),
                failing_reads: HashMap::new(),
                edits_after_read: HashMap::new(),
                spec_reads: 0,
                replicas: Vec::new(),
            }),
            in_flight: AtomicBool::new(false),
            overlapped: AtomicBool::new(false),
        }
    }

    /// Health reported by the next checks, in order
    pub fn with_health_sequence(self, health: impl IntoIterator<Item = DeploymentHealth>) -> Self {
        self.with_state(|state| state.health_script.extend(health))
    }

    /// Health reported once the sequence is used up
    pub fn with_default_health(self, health: DeploymentHealth) -> Self {
        self.with_state(|state| state.default_health = health)
    }

    /// Fail the `index`-th update attempt without applying it
    pub fn fail_update(self, index: usize, error: ScalerError) -> Self {
        self.with_state(|state| {
            state.failing_updates.insert(index, error);
        })
    }

    /// Fail the `index`-th resource spec read
    pub fn fail_read(self, index: usize, error: ScalerError) -> Self {
        self.with_state(|state| {
            state.failing_reads.insert(index, error);
        })
    }

    /// Let another writer replace the spec right after the `index`-th read
    pub fn edit_after_read(self, index: usize, spec: DeploymentResourceSpec) -> Self {
        self.with_state(|state| {
            state.edits_after_read.insert(index, spec);
        })
    }

    fn with_state(self, f: impl FnOnce(&mut DeploymentState)) -> Self {
        if let Ok(mut state) = self.state.lock() {
            f(&mut state);
        }
        self
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, DeploymentState>> {
        self.state
            .lock()
            .map_err(|_| ScalerError::OrchestratorUnavailable("state lock poisoned".into()))
    }

    /// Spec as currently stored
    pub fn current_spec(&self) -> Option<DeploymentResourceSpec> {
        self.lock().ok().map(|state| state.spec.clone())
    }

    /// Every successfully applied update, oldest first
    pub fn updates(&self) -> Vec<DeploymentResourceSpec> {
        self.lock().map(|state| state.updates.clone()).unwrap_or_default()
    }

    pub fn health_reads(&self) -> usize {
        self.lock().map(|state| state.health_reads).unwrap_or_default()
    }

    pub fn replica_requests(&self) -> Vec<u32> {
        self.lock().map(|state| state.replicas.clone()).unwrap_or_default()
    }

    /// True if two mutations were ever in flight together
    pub fn overlapped(&self) -> bool {
        self.overlapped.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ResourceOrchestrator for InMemoryOrchestrator {
    async fn get_resource_spec(&self, _target: &DeploymentTarget) -> Result<DeploymentResourceSpec> {
        let mut state = self.lock()?;
        let index = state.spec_reads;
        state.spec_reads += 1;
        if let Some(error) = state.failing_reads.remove(&index) {
            return Err(error);
        }
        let read = DeploymentResourceSpec {
            resource_version: Some(state.version.to_string()),
            ..state.spec.clone()
        };
        if let Some(edited) = state.edits_after_read.remove(&index) {
            state.spec = edited;
            state.version += 1;
        }
        Ok(read)
    }

    async fn update_resource_spec(
        &self,
        _target: &DeploymentTarget,
        spec: &DeploymentResourceSpec,
    ) -> Result<()> {
        let _guard = InFlight::enter(&self.in_flight, &self.overlapped);
        tokio::task::yield_now().await;

        let mut state = self.lock()?;
        let attempt = state.update_attempts;
        state.update_attempts += 1;
        if let Some(error) = state.failing_updates.remove(&attempt) {
            return Err(error);
        }
        let current = state.version.to_string();
        if let Some(version) = spec.resource_version.as_deref() {
            if version != current {
                return Err(ScalerError::Conflict(format!(
                    "object has been modified: version {} is not {}",
                    version, current
                )));
            }
        }
        state.version += 1;
        state.spec = spec.unversioned();
        state.updates.push(spec.clone());
        Ok(())
    }

    async fn get_health(&self, _target: &DeploymentTarget) -> Result<DeploymentHealth> {
        let mut state = self.lock()?;
        state.health_reads += 1;
        let default = state.default_health;
        Ok(state.health_script.pop_front().unwrap_or(default))
    }

    async fn scale_replicas(&self, _target: &DeploymentTarget, replicas: u32) -> Result<()> {
        let mut state = self.lock()?;
        state.replicas.push(replicas);
        state.default_health = DeploymentHealth {
            desired_replicas: replicas,
            ready_replicas: replicas,
        };
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quantity::ResourceQuantity;

    fn spec() -> DeploymentResourceSpec {
        DeploymentResourceSpec {
            cpu_request: ResourceQuantity::from_millis(500),
            cpu_limit: ResourceQuantity::from_millis(1000),
            memory_request: ResourceQuantity::from_bytes(256 << 20),
            memory_limit: ResourceQuantity::from_bytes(512 << 20),
            resource_version: None,
        }
    }

    fn target() -> DeploymentTarget {
        DeploymentTarget::new("fortio", "fortioserver")
    }

    #[tokio::test]
    async fn test_scripted_benchmark_replays_in_order() {
        let bench = ScriptedBenchmark::new([100.0, 200.0]);
        let params = BenchmarkParameters::default();

        let first = bench.run(&params).await.unwrap();
        let second = bench.run(&params).await.unwrap();

        assert_eq!(first.run_id, "run-1");
        assert_eq!(first.achieved_qps, 100.0);
        assert_eq!(second.run_id, "run-2");
        assert!(bench.run(&params).await.is_err());
        assert_eq!(bench.calls(), 3);
    }

    #[tokio::test]
    async fn test_scripted_failure() {
        let bench = ScriptedBenchmark::new([100.0])
            .then_fail(ScalerError::BenchmarkUnavailable("down".into()));
        let params = BenchmarkParameters::default();

        assert!(bench.run(&params).await.is_ok());
        assert!(matches!(
            bench.run(&params).await,
            Err(ScalerError::BenchmarkUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_in_memory_update_and_failure_injection() {
        let orchestrator = InMemoryOrchestrator::new(spec())
            .fail_update(1, ScalerError::Conflict("stale".into()));
        let bigger = spec().with_cpu_increment(ResourceQuantity::from_millis(100));

        orchestrator.update_resource_spec(&target(), &bigger).await.unwrap();
        let err = orchestrator
            .update_resource_spec(&target(), &spec())
            .await
            .unwrap_err();

        assert!(matches!(err, ScalerError::Conflict(_)));
        assert_eq!(orchestrator.current_spec(), Some(bigger.clone()));
        assert_eq!(orchestrator.updates(), vec![bigger]);
    }

    #[tokio::test]
    async fn test_in_memory_rejects_write_based_on_stale_read() {
        let edited = spec().with_memory_increment(ResourceQuantity::from_bytes(1 << 20));
        let orchestrator = InMemoryOrchestrator::new(spec()).edit_after_read(0, edited.clone());

        let read = orchestrator.get_resource_spec(&target()).await.unwrap();
        assert_eq!(read.resource_version.as_deref(), Some("1"));
        let next = read.with_cpu_increment(ResourceQuantity::from_millis(100));

        let err = orchestrator
            .update_resource_spec(&target(), &next)
            .await
            .unwrap_err();
        assert!(matches!(err, ScalerError::Conflict(_)));
        assert_eq!(orchestrator.current_spec(), Some(edited));
        assert!(orchestrator.updates().is_empty());

        // A fresh read succeeds, as does an unversioned write
        let fresh = orchestrator.get_resource_spec(&target()).await.unwrap();
        assert_eq!(fresh.resource_version.as_deref(), Some("2"));
        orchestrator
            .update_resource_spec(&target(), &fresh.with_cpu_increment(ResourceQuantity::from_millis(100)))
            .await
            .unwrap();
        orchestrator
            .update_resource_spec(&target(), &read.unversioned())
            .await
            .unwrap();
        assert_eq!(orchestrator.current_spec(), Some(spec()));
    }

    #[tokio::test]
    async fn test_in_memory_health_sequence() {
        let unready = DeploymentHealth {
            desired_replicas: 3,
            ready_replicas: 2,
        };
        let orchestrator = InMemoryOrchestrator::new(spec()).with_health_sequence([unready]);

        assert_eq!(orchestrator.get_health(&target()).await.unwrap(), unready);
        assert!(orchestrator.get_health(&target()).await.unwrap().is_healthy());
        assert_eq!(orchestrator.health_reads(), 2);
    }

    #[tokio::test]
    async fn test_in_memory_scale_replicas() {
        let orchestrator = InMemoryOrchestrator::new(spec());
        orchestrator.scale_replicas(&target(), 4).await.unwrap();

        assert_eq!(orchestrator.replica_requests(), vec![4]);
        let health = orchestrator.get_health(&target()).await.unwrap();
        assert_eq!(health.desired_replicas, 4);
    }
}
