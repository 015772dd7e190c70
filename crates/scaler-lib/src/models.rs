//! Core data models for the scaling experiment

use crate::quantity::ResourceQuantity;
use serde::{Deserialize, Serialize};
use std::fmt;

/// The deployment whose first container is being tuned
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentTarget {
    pub namespace: String,
    pub name: String,
}

impl DeploymentTarget {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for DeploymentTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Requests and limits of the target's primary container
///
/// A spec read from the cluster carries the object version it was read at.
/// Writing it back (or a spec derived from it) fails with a conflict if the
/// deployment changed in between. Equality compares the quantities only.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeploymentResourceSpec {
    pub cpu_request: ResourceQuantity,
    pub cpu_limit: ResourceQuantity,
    pub memory_request: ResourceQuantity,
    pub memory_limit: ResourceQuantity,
    /// Object version at read time; `None` writes over whatever is current
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_version: Option<String>,
}

impl PartialEq for DeploymentResourceSpec {
    fn eq(&self, other: &Self) -> bool {
        self.cpu_request == other.cpu_request
            && self.cpu_limit == other.cpu_limit
            && self.memory_request == other.memory_request
            && self.memory_limit == other.memory_limit
    }
}

impl Eq for DeploymentResourceSpec {}

impl DeploymentResourceSpec {
    /// Copy of this spec that is written without a version precondition
    pub fn unversioned(&self) -> Self {
        Self {
            resource_version: None,
            ..self.clone()
        }
    }

    /// Copy of this spec with CPU request and limit raised by `delta`
    pub fn with_cpu_increment(&self, delta: ResourceQuantity) -> Self {
        Self {
            cpu_request: self.cpu_request.add(delta),
            cpu_limit: self.cpu_limit.add(delta),
            ..self.clone()
        }
    }

    /// Copy of this spec with memory request and limit raised by `delta`
    pub fn with_memory_increment(&self, delta: ResourceQuantity) -> Self {
        Self {
            memory_request: self.memory_request.add(delta),
            memory_limit: self.memory_limit.add(delta),
            ..self.clone()
        }
    }
}

/// Replica counts observed in a single health check
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentHealth {
    pub desired_replicas: u32,
    pub ready_replicas: u32,
}

impl DeploymentHealth {
    /// Converged only when exactly the desired number of replicas is ready
    pub fn is_healthy(&self) -> bool {
        self.ready_replicas == self.desired_replicas
    }
}

/// Outcome of one load-test run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BenchmarkResult {
    pub run_id: String,
    pub achieved_qps: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> DeploymentResourceSpec {
        DeploymentResourceSpec {
            cpu_request: ResourceQuantity::from_millis(500),
            cpu_limit: ResourceQuantity::from_millis(1000),
            memory_request: ResourceQuantity::from_bytes(256 << 20),
            memory_limit: ResourceQuantity::from_bytes(512 << 20),
            resource_version: Some("41".to_string()),
        }
    }

    #[test]
    fn test_cpu_increment_leaves_memory_untouched() {
        let scaled = spec().with_cpu_increment(ResourceQuantity::from_millis(100));

        assert_eq!(scaled.cpu_request.millis(), 600);
        assert_eq!(scaled.cpu_limit.millis(), 1100);
        assert_eq!(scaled.memory_request, spec().memory_request);
        assert_eq!(scaled.memory_limit, spec().memory_limit);
        assert_eq!(scaled.resource_version.as_deref(), Some("41"));
    }

    #[test]
    fn test_equality_ignores_version() {
        let unversioned = spec().unversioned();

        assert!(unversioned.resource_version.is_none());
        assert_eq!(unversioned, spec());
        assert_ne!(
            unversioned,
            spec().with_cpu_increment(ResourceQuantity::from_millis(1))
        );
    }

    #[test]
    fn test_memory_increment_leaves_cpu_untouched() {
        let scaled = spec().with_memory_increment(ResourceQuantity::from_bytes(100 << 20));

        assert_eq!(scaled.memory_request.as_bytes(), 356 << 20);
        assert_eq!(scaled.memory_limit.as_bytes(), 612 << 20);
        assert_eq!(scaled.cpu_request, spec().cpu_request);
    }

    #[test]
    fn test_health_requires_exact_match() {
        let health = |desired, ready| DeploymentHealth {
            desired_replicas: desired,
            ready_replicas: ready,
        };

        assert!(health(3, 3).is_healthy());
        assert!(!health(3, 2).is_healthy());
        assert!(!health(3, 4).is_healthy());
        assert!(health(0, 0).is_healthy());
    }

    #[test]
    fn test_target_display() {
        assert_eq!(DeploymentTarget::new("fortio", "fortioserver").to_string(), "fortio/fortioserver");
    }
}
