//! Process health for liveness and readiness probes
//!
//! Liveness reflects the worst status among the experiment's collaborators.
//! Readiness follows the experiment phase: the process is ready while cycles
//! are running and after a plateau, and never during initialization or
//! after an abort.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Status of one tracked component, ordered from best to worst
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentStatus {
    Healthy,
    /// Working, but the last observation was not clean (e.g. replicas not ready yet)
    Degraded,
    Unhealthy,
}

/// Lifecycle phase of the experiment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExperimentPhase {
    /// Baseline benchmark and initial scale-up
    Init,
    Running,
    /// Plateau reached
    Converged,
    Aborted,
}

impl ExperimentPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ExperimentPhase::Converged | ExperimentPhase::Aborted)
    }
}

impl fmt::Display for ExperimentPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ExperimentPhase::Init => "init",
            ExperimentPhase::Running => "running",
            ExperimentPhase::Converged => "converged",
            ExperimentPhase::Aborted => "aborted",
        })
    }
}

/// Last observation of one component
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub status: ComponentStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub checked_at: DateTime<Utc>,
}

impl ComponentHealth {
    pub fn new(status: ComponentStatus, message: Option<String>) -> Self {
        Self {
            status,
            message,
            checked_at: Utc::now(),
        }
    }
}

/// Body of `/healthz`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: ComponentStatus,
    pub phase: ExperimentPhase,
    pub components: BTreeMap<String, ComponentHealth>,
}

/// Body of `/readyz`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadinessResponse {
    pub ready: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Names of the tracked components
pub mod components {
    /// The load generator
    pub const BENCHMARK: &str = "benchmark";
    /// The cluster API
    pub const ORCHESTRATOR: &str = "orchestrator";
    /// Readiness of the deployment under test
    pub const DEPLOYMENT: &str = "deployment";
}

#[derive(Debug)]
struct RegistryState {
    phase: ExperimentPhase,
    components: BTreeMap<String, ComponentHealth>,
}

/// Shared handle to component health and the experiment phase
#[derive(Debug, Clone)]
pub struct HealthRegistry {
    state: Arc<RwLock<RegistryState>>,
}

impl Default for HealthRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self {
            state: Arc::new(RwLock::new(RegistryState {
                phase: ExperimentPhase::Init,
                components: BTreeMap::new(),
            })),
        }
    }

    /// Start tracking `name` as healthy; an existing entry is kept
    pub async fn register(&self, name: &str) {
        self.state
            .write()
            .await
            .components
            .entry(name.to_string())
            .or_insert_with(|| ComponentHealth::new(ComponentStatus::Healthy, None));
    }

    pub async fn update(&self, name: &str, health: ComponentHealth) {
        self.state
            .write()
            .await
            .components
            .insert(name.to_string(), health);
    }

    pub async fn set_healthy(&self, name: &str) {
        self.update(name, ComponentHealth::new(ComponentStatus::Healthy, None))
            .await;
    }

    pub async fn set_degraded(&self, name: &str, message: impl Into<String>) {
        self.update(
            name,
            ComponentHealth::new(ComponentStatus::Degraded, Some(message.into())),
        )
        .await;
    }

    pub async fn set_unhealthy(&self, name: &str, message: impl Into<String>) {
        self.update(
            name,
            ComponentHealth::new(ComponentStatus::Unhealthy, Some(message.into())),
        )
        .await;
    }

    pub async fn set_phase(&self, phase: ExperimentPhase) {
        self.state.write().await.phase = phase;
    }

    pub async fn phase(&self) -> ExperimentPhase {
        self.state.read().await.phase
    }

    /// Snapshot for `/healthz`; the overall status is the worst component's
    pub async fn health(&self) -> HealthResponse {
        let state = self.state.read().await;
        let status = state
            .components
            .values()
            .map(|c| c.status)
            .max()
            .unwrap_or(ComponentStatus::Healthy);

        HealthResponse {
            status,
            phase: state.phase,
            components: state.components.clone(),
        }
    }

    /// Snapshot for `/readyz`
    pub async fn readiness(&self) -> ReadinessResponse {
        let health = self.health().await;

        let reason = match health.phase {
            ExperimentPhase::Init => Some("experiment initializing".to_string()),
            ExperimentPhase::Aborted => Some("experiment aborted".to_string()),
            ExperimentPhase::Running | ExperimentPhase::Converged => health
                .components
                .iter()
                .find(|(_, c)| c.status == ComponentStatus::Unhealthy)
                .map(|(name, _)| format!("{} unhealthy", name)),
        };

        ReadinessResponse {
            ready: reason.is_none(),
            reason,
        }
    }
}
