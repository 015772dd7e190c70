//! Vertical scaling library for a single Kubernetes deployment
//!
//! This crate provides the core functionality for:
//! - Kubernetes-style resource quantities
//! - Load testing through Fortio
//! - Reading and updating deployment resources through the Kubernetes API
//! - The benchmark/evaluate/scale control loop with rollback
//! - Bounded backoff for deployment readiness
//! - Health checks and observability

pub mod backoff;
pub mod benchmark;
pub mod controller;
pub mod error;
pub mod health;
pub mod models;
pub mod observability;
pub mod orchestrator;
pub mod quantity;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use backoff::{BackoffConfig, BackoffPolicy, ShutdownSignal, ShutdownTrigger, WaitOutcome};
pub use benchmark::{BenchmarkParameters, BenchmarkRunner, FortioClient};
pub use controller::{
    AbortReason, AutoscaleController, AutoscaleControllerBuilder, ControllerConfig,
    ExperimentOutcome, ExperimentState, RollbackStatus,
};
pub use error::{Result, ScalerError};
pub use health::{
    ComponentHealth, ComponentStatus, ExperimentPhase, HealthRegistry, HealthResponse,
    ReadinessResponse,
};
pub use models::*;
pub use observability::{ExperimentLogger, ScalerMetrics};
pub use orchestrator::{KubeOrchestrator, ResourceOrchestrator};
pub use quantity::{QuantityError, QuantityFormat, ResourceQuantity};
