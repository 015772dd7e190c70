//! Load-test benchmarking
//!
//! The controller only needs a run identifier and the achieved throughput
//! from each run; everything else the load generator reports is ignored.

mod fortio;

pub use fortio::FortioClient;

use crate::error::Result;
use crate::models::BenchmarkResult;
use async_trait::async_trait;
use std::time::Duration;

/// Parameters for one synchronous load-test run
#[derive(Debug, Clone, PartialEq)]
pub struct BenchmarkParameters {
    /// URL the load generator sends requests to
    pub target_url: String,
    /// Number of concurrent connections
    pub connections: u32,
    /// How long the run lasts
    pub duration: Duration,
    /// Requested rate; -1 means as fast as possible
    pub qps: i64,
    /// Whether the load generator keeps the result
    pub save: bool,
}

impl Default for BenchmarkParameters {
    fn default() -> Self {
        Self {
            target_url: "http://localhost:8080/echo".to_string(),
            connections: 1,
            duration: Duration::from_secs(10),
            qps: -1,
            save: true,
        }
    }
}

/// Trait for load-test implementations
#[async_trait]
pub trait BenchmarkRunner: Send + Sync {
    /// Run one benchmark to completion and report its throughput
    async fn run(&self, parameters: &BenchmarkParameters) -> Result<BenchmarkResult>;
}
