//! Deployment orchestration
//!
//! The controller reads and writes the target's resource spec, observes
//! replica readiness, and occasionally changes the replica count through
//! this trait. [`KubeOrchestrator`] talks to a real cluster.

mod kubernetes;

pub use kubernetes::{connect, KubeOrchestrator};

use crate::error::Result;
use crate::models::{DeploymentHealth, DeploymentResourceSpec, DeploymentTarget};
use async_trait::async_trait;

/// Trait for cluster API adapters
#[async_trait]
pub trait ResourceOrchestrator: Send + Sync {
    /// Current requests and limits of the target's primary container
    async fn get_resource_spec(&self, target: &DeploymentTarget) -> Result<DeploymentResourceSpec>;

    /// Replace requests and limits of the primary container
    ///
    /// Implementations must reject the write with
    /// [`ScalerError::Conflict`](crate::error::ScalerError::Conflict) when the
    /// deployment changed since it was read.
    async fn update_resource_spec(
        &self,
        target: &DeploymentTarget,
        spec: &DeploymentResourceSpec,
    ) -> Result<()>;

    async fn get_health(&self, target: &DeploymentTarget) -> Result<DeploymentHealth>;

    /// Set the desired replica count
    async fn scale_replicas(&self, target: &DeploymentTarget, replicas: u32) -> Result<()>;
}
