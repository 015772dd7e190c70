//! Kubernetes adapter
//!
//! Reads and replaces the `resources` block of the deployment's first
//! container. A spec carries the `resourceVersion` it was read at, and the
//! replace sends that version back, so an edit made after the caller's read
//! is rejected by the API server with 409 instead of being overwritten.

use super::ResourceOrchestrator;
use crate::error::{Result, ScalerError};
use crate::models::{DeploymentHealth, DeploymentResourceSpec, DeploymentTarget};
use crate::observability::ScalerMetrics;
use crate::quantity::ResourceQuantity;
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Container;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::api::{Api, Patch, PatchParams, PostParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::Client;
use serde_json::json;
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{debug, info};

const CPU: &str = "cpu";
const MEMORY: &str = "memory";

/// Build a client from an explicit kubeconfig, or infer one from the
/// environment (in-cluster service account or `~/.kube/config`)
pub async fn connect(kubeconfig: Option<&Path>) -> Result<Client> {
    let config = match kubeconfig {
        Some(path) => {
            let kubeconfig = Kubeconfig::read_from(path).map_err(|e| {
                ScalerError::InvalidConfig(format!(
                    "failed to read kubeconfig {}: {}",
                    path.display(),
                    e
                ))
            })?;
            kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await
                .map_err(|e| ScalerError::InvalidConfig(format!("invalid kubeconfig: {}", e)))?
        }
        None => kube::Config::infer().await.map_err(|e| {
            ScalerError::OrchestratorUnavailable(format!("no usable cluster configuration: {}", e))
        })?,
    };

    Client::try_from(config).map_err(|e| {
        ScalerError::OrchestratorUnavailable(format!("failed to create kubernetes client: {}", e))
    })
}

/// Orchestrator backed by the Kubernetes API
pub struct KubeOrchestrator {
    client: Client,
    metrics: ScalerMetrics,
}

impl KubeOrchestrator {
    pub fn new(client: Client, metrics: ScalerMetrics) -> Self {
        Self { client, metrics }
    }

    fn api(&self, target: &DeploymentTarget) -> Api<Deployment> {
        Api::namespaced(self.client.clone(), &target.namespace)
    }

    /// Count the call and its failure, if any, under `verb`
    fn observe<T>(&self, verb: &str, result: Result<T>) -> Result<T> {
        self.metrics.record_orchestrator_request(verb);
        if result.is_err() {
            self.metrics.record_orchestrator_error(verb);
        }
        result
    }

    async fn fetch(&self, target: &DeploymentTarget) -> Result<Deployment> {
        self.api(target)
            .get(&target.name)
            .await
            .map_err(|e| map_kube_error(e, &format!("get deployment {}", target)))
    }

    /// Fetch the full object, overlay `spec`, and replace it; a versioned
    /// spec keeps its own `resourceVersion` rather than the fetched one
    async fn replace_resources(
        &self,
        target: &DeploymentTarget,
        spec: &DeploymentResourceSpec,
    ) -> Result<()> {
        let mut deployment = self.fetch(target).await?;
        apply_resource_spec(&mut deployment, spec)?;

        self.api(target)
            .replace(&target.name, &PostParams::default(), &deployment)
            .await
            .map_err(|e| map_kube_error(e, &format!("update deployment {}", target)))?;
        Ok(())
    }

    async fn patch_replicas(&self, target: &DeploymentTarget, replicas: u32) -> Result<()> {
        let patch = json!({ "spec": { "replicas": replicas } });
        self.api(target)
            .patch_scale(&target.name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| map_kube_error(e, &format!("scale deployment {}", target)))?;
        Ok(())
    }
}

#[async_trait]
impl ResourceOrchestrator for KubeOrchestrator {
    async fn get_resource_spec(&self, target: &DeploymentTarget) -> Result<DeploymentResourceSpec> {
        let result = match self.fetch(target).await {
            Ok(deployment) => resource_spec_from(&deployment),
            Err(e) => Err(e),
        };
        let spec = self.observe("get", result)?;
        debug!(
            deployment = %target,
            cpu_request = %spec.cpu_request,
            memory_request = %spec.memory_request,
            "Read container resources"
        );
        Ok(spec)
    }

    async fn update_resource_spec(
        &self,
        target: &DeploymentTarget,
        spec: &DeploymentResourceSpec,
    ) -> Result<()> {
        let result = self.replace_resources(target, spec).await;
        self.observe("update", result)?;
        info!(
            deployment = %target,
            cpu_request = %spec.cpu_request,
            cpu_limit = %spec.cpu_limit,
            memory_request = %spec.memory_request,
            memory_limit = %spec.memory_limit,
            "Updated container resources"
        );
        Ok(())
    }

    async fn get_health(&self, target: &DeploymentTarget) -> Result<DeploymentHealth> {
        let result = self.fetch(target).await.map(|d| health_from(&d));
        self.observe("health", result)
    }

    async fn scale_replicas(&self, target: &DeploymentTarget, replicas: u32) -> Result<()> {
        let result = self.patch_replicas(target, replicas).await;
        self.observe("scale", result)?;
        info!(deployment = %target, replicas, "Scaled replicas");
        Ok(())
    }
}

fn map_kube_error(err: kube::Error, context: &str) -> ScalerError {
    match err {
        kube::Error::Api(response) if response.code == 409 => {
            ScalerError::Conflict(format!("{}: {}", context, response.message))
        }
        other => ScalerError::OrchestratorUnavailable(format!("{}: {}", context, other)),
    }
}

fn deployment_name(deployment: &Deployment) -> &str {
    deployment.metadata.name.as_deref().unwrap_or("<unnamed>")
}

fn primary_container(deployment: &Deployment) -> Result<&Container> {
    deployment
        .spec
        .as_ref()
        .and_then(|spec| spec.template.spec.as_ref())
        .and_then(|pod| pod.containers.first())
        .ok_or_else(|| {
            ScalerError::OrchestratorUnavailable(format!(
                "deployment {} has no containers",
                deployment_name(deployment)
            ))
        })
}

fn primary_container_mut(deployment: &mut Deployment) -> Result<&mut Container> {
    let name = deployment_name(deployment).to_string();
    deployment
        .spec
        .as_mut()
        .and_then(|spec| spec.template.spec.as_mut())
        .and_then(|pod| pod.containers.first_mut())
        .ok_or_else(|| {
            ScalerError::OrchestratorUnavailable(format!("deployment {} has no containers", name))
        })
}

fn lookup(
    values: Option<&BTreeMap<String, Quantity>>,
    resource: &str,
    kind: &str,
    container: &Container,
) -> Result<ResourceQuantity> {
    let quantity = values.and_then(|v| v.get(resource)).ok_or_else(|| {
        ScalerError::OrchestratorUnavailable(format!(
            "container {} has no {} {}",
            container.name, resource, kind
        ))
    })?;
    Ok(quantity.0.parse::<ResourceQuantity>()?)
}

/// Extract the first container's requests and limits
pub(crate) fn resource_spec_from(deployment: &Deployment) -> Result<DeploymentResourceSpec> {
    let container = primary_container(deployment)?;
    let resources = container.resources.as_ref();
    let requests = resources.and_then(|r| r.requests.as_ref());
    let limits = resources.and_then(|r| r.limits.as_ref());

    Ok(DeploymentResourceSpec {
        cpu_request: lookup(requests, CPU, "request", container)?,
        cpu_limit: lookup(limits, CPU, "limit", container)?,
        memory_request: lookup(requests, MEMORY, "request", container)?,
        memory_limit: lookup(limits, MEMORY, "limit", container)?,
        resource_version: deployment.metadata.resource_version.clone(),
    })
}

/// Overwrite the first container's CPU and memory requests and limits
///
/// Other resource names (ephemeral storage, extended resources) are kept.
/// A versioned spec pins the object to the version it was read at.
pub(crate) fn apply_resource_spec(
    deployment: &mut Deployment,
    spec: &DeploymentResourceSpec,
) -> Result<()> {
    if let Some(version) = &spec.resource_version {
        deployment.metadata.resource_version = Some(version.clone());
    }

    let container = primary_container_mut(deployment)?;
    let resources = container.resources.get_or_insert_with(Default::default);

    let requests = resources.requests.get_or_insert_with(BTreeMap::new);
    requests.insert(CPU.to_string(), Quantity(spec.cpu_request.to_string()));
    requests.insert(MEMORY.to_string(), Quantity(spec.memory_request.to_string()));

    let limits = resources.limits.get_or_insert_with(BTreeMap::new);
    limits.insert(CPU.to_string(), Quantity(spec.cpu_limit.to_string()));
    limits.insert(MEMORY.to_string(), Quantity(spec.memory_limit.to_string()));

    Ok(())
}

/// Desired replicas default to 1 when unset; ready replicas default to 0
pub(crate) fn health_from(deployment: &Deployment) -> DeploymentHealth {
    let desired = deployment
        .spec
        .as_ref()
        .and_then(|spec| spec.replicas)
        .unwrap_or(1);
    let ready = deployment
        .status
        .as_ref()
        .and_then(|status| status.ready_replicas)
        .unwrap_or(0);

    DeploymentHealth {
        desired_replicas: u32::try_from(desired).unwrap_or(0),
        ready_replicas: u32::try_from(ready).unwrap_or(0),
    }
}
