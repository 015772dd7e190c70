//! Fortio REST client
//!
//! Runs are submitted to `<base>/rest/run?jsonPath=.metadata` with every
//! option encoded as a string, the way the Fortio UI form posts them.

use super::{BenchmarkParameters, BenchmarkRunner};
use crate::error::{Result, ScalerError};
use crate::models::BenchmarkResult;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info};
use url::Url;

/// Extra time allowed on top of the run duration before a request times out
const REQUEST_GRACE: Duration = Duration::from_secs(30);

/// Calls made by the connectivity probe
const PROBE_CALLS: u32 = 10;

#[derive(Debug, Serialize)]
struct RunRequest {
    metadata: RunMetadata,
}

#[derive(Debug, Serialize)]
struct RunMetadata {
    url: String,
    #[serde(rename = "c")]
    connections: String,
    #[serde(rename = "n", skip_serializing_if = "Option::is_none")]
    num_calls: Option<String>,
    #[serde(rename = "t", skip_serializing_if = "Option::is_none")]
    duration: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    qps: Option<String>,
    #[serde(rename = "async")]
    run_async: String,
    save: String,
}

#[derive(Debug, Deserialize)]
struct RunResponse {
    #[serde(rename = "RunID", default)]
    run_id: i64,
    #[serde(rename = "ResultID", default)]
    result_id: Option<String>,
    #[serde(rename = "ActualQPS", default)]
    actual_qps: Option<f64>,
}

/// Benchmark runner backed by a Fortio server
pub struct FortioClient {
    client: Client,
    run_url: Url,
}

impl FortioClient {
    /// Create a client for the Fortio UI rooted at `base_url`
    pub fn new(base_url: &str) -> Result<Self> {
        let mut base = Url::parse(base_url).map_err(|e| {
            ScalerError::InvalidConfig(format!("invalid fortio url {}: {}", base_url, e))
        })?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }

        let mut run_url = base
            .join("rest/run")
            .map_err(|e| ScalerError::InvalidConfig(format!("invalid fortio url: {}", e)))?;
        run_url.set_query(Some("jsonPath=.metadata"));

        let client = Client::builder()
            .build()
            .map_err(|e| ScalerError::InvalidConfig(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self { client, run_url })
    }

    pub fn run_url(&self) -> &Url {
        &self.run_url
    }

    /// Submit a short asynchronous run to check that Fortio is reachable
    ///
    /// Returns the run id Fortio assigned.
    pub async fn probe(&self, target_url: &str) -> Result<i64> {
        let metadata = RunMetadata {
            url: target_url.to_string(),
            connections: "1".to_string(),
            num_calls: Some(PROBE_CALLS.to_string()),
            duration: None,
            qps: None,
            run_async: "on".to_string(),
            save: "off".to_string(),
        };

        let response = self.submit(metadata, REQUEST_GRACE).await?;
        if response.run_id == 0 {
            return Err(ScalerError::BenchmarkUnavailable(
                "fortio did not start the probe run".into(),
            ));
        }

        debug!(run_id = response.run_id, "Fortio connectivity probe succeeded");
        Ok(response.run_id)
    }

    async fn submit(&self, metadata: RunMetadata, timeout: Duration) -> Result<RunResponse> {
        debug!(
            url = %self.run_url,
            target = %metadata.url,
            duration = ?metadata.duration,
            "Submitting fortio run"
        );

        let response = self
            .client
            .post(self.run_url.clone())
            .timeout(timeout)
            .json(&RunRequest { metadata })
            .send()
            .await
            .map_err(|e| {
                ScalerError::BenchmarkUnavailable(format!(
                    "request to {} failed: {}",
                    self.run_url, e
                ))
            })?;

        let status = response.status();
        let body = response.text().await.map_err(|e| {
            ScalerError::BenchmarkUnavailable(format!("failed to read fortio response: {}", e))
        })?;

        if !status.is_success() {
            return Err(ScalerError::BenchmarkUnavailable(format!(
                "fortio returned {}: {}",
                status, body
            )));
        }

        serde_json::from_str(&body).map_err(|e| {
            ScalerError::BenchmarkUnavailable(format!("unparsable fortio response: {}", e))
        })
    }
}

#[async_trait]
impl BenchmarkRunner for FortioClient {
    async fn run(&self, parameters: &BenchmarkParameters) -> Result<BenchmarkResult> {
        let metadata = RunMetadata {
            url: parameters.target_url.clone(),
            connections: parameters.connections.to_string(),
            num_calls: None,
            duration: Some(format_duration(parameters.duration)),
            qps: Some(parameters.qps.to_string()),
            run_async: "off".to_string(),
            save: if parameters.save { "on" } else { "off" }.to_string(),
        };

        let response = self
            .submit(metadata, parameters.duration + REQUEST_GRACE)
            .await?;

        let run_id = match response.result_id {
            Some(id) if !id.is_empty() => id,
            _ if response.run_id != 0 => response.run_id.to_string(),
            _ => {
                return Err(ScalerError::BenchmarkUnavailable(
                    "fortio response carries no run identifier".into(),
                ))
            }
        };
        let achieved_qps = response.actual_qps.ok_or_else(|| {
            ScalerError::BenchmarkUnavailable("fortio response carries no ActualQPS".into())
        })?;

        info!(run_id = %run_id, achieved_qps, "Fortio run completed");
        Ok(BenchmarkResult {
            run_id,
            achieved_qps,
        })
    }
}

/// Fortio duration flag, e.g. `10s` or `500ms`
fn format_duration(duration: Duration) -> String {
    if duration.subsec_millis() == 0 {
        format!("{}s", duration.as_secs())
    } else {
        format!("{}ms", duration.as_millis())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;
    use serde_json::json;

    fn run_query() -> Matcher {
        Matcher::UrlEncoded("jsonPath".into(), ".metadata".into())
    }

    fn client_for(server: &mockito::ServerGuard) -> FortioClient {
        FortioClient::new(&format!("{}/fortio/", server.url())).unwrap()
    }

    #[test]
    fn test_run_url_is_built_from_base() {
        let client = FortioClient::new("http://localhost:8080/fortio/").unwrap();
        assert_eq!(
            client.run_url().as_str(),
            "http://localhost:8080/fortio/rest/run?jsonPath=.metadata"
        );

        let without_slash = FortioClient::new("http://localhost:8080/fortio").unwrap();
        assert_eq!(without_slash.run_url(), client.run_url());
    }

    #[test]
    fn test_invalid_base_url() {
        assert!(matches!(
            FortioClient::new("not a url"),
            Err(ScalerError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_secs(10)), "10s");
        assert_eq!(format_duration(Duration::from_millis(1500)), "1500ms");
    }

    #[tokio::test]
    async fn test_run_posts_metadata_and_reads_result() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/fortio/rest/run")
            .match_query(run_query())
            .match_body(Matcher::PartialJson(json!({
                "metadata": {
                    "url": "http://localhost:8080/echo",
                    "c": "1",
                    "t": "10s",
                    "qps": "-1",
                    "async": "off",
                    "save": "on"
                }
            })))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"RunID": 7, "ResultID": "2024-01-01-120000_echo", "ActualQPS": 512.5, "NumThreads": 1}"#)
            .create_async()
            .await;

        let client = client_for(&server);
        let result = tokio_test::assert_ok!(client.run(&BenchmarkParameters::default()).await);

        mock.assert_async().await;
        assert_eq!(result.run_id, "2024-01-01-120000_echo");
        assert_eq!(result.achieved_qps, 512.5);
    }

    #[tokio::test]
    async fn test_run_falls_back_to_numeric_run_id() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/fortio/rest/run")
            .match_query(run_query())
            .with_status(200)
            .with_body(r#"{"RunID": 42, "ActualQPS": 100.0}"#)
            .create_async()
            .await;

        let client = client_for(&server);
        let result = client.run(&BenchmarkParameters::default()).await.unwrap();

        assert_eq!(result.run_id, "42");
        assert_eq!(result.achieved_qps, 100.0);
    }

    #[tokio::test]
    async fn test_run_rejects_error_status() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/fortio/rest/run")
            .match_query(run_query())
            .with_status(500)
            .with_body("boom")
            .create_async()
            .await;

        let client = client_for(&server);
        let err = client.run(&BenchmarkParameters::default()).await.unwrap_err();

        assert!(matches!(err, ScalerError::BenchmarkUnavailable(ref msg) if msg.contains("500")));
    }

    #[tokio::test]
    async fn test_run_rejects_malformed_body() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/fortio/rest/run")
            .match_query(run_query())
            .with_status(200)
            .with_body("<html>not json</html>")
            .create_async()
            .await;

        let client = client_for(&server);
        let err = client.run(&BenchmarkParameters::default()).await.unwrap_err();

        assert!(matches!(err, ScalerError::BenchmarkUnavailable(_)));
    }

    #[tokio::test]
    async fn test_run_requires_actual_qps() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/fortio/rest/run")
            .match_query(run_query())
            .with_status(200)
            .with_body(r#"{"RunID": 3}"#)
            .create_async()
            .await;

        let client = client_for(&server);
        let err = client.run(&BenchmarkParameters::default()).await.unwrap_err();
        assert!(err.to_string().contains("ActualQPS"));
    }

    #[tokio::test]
    async fn test_run_requires_identifier() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/fortio/rest/run")
            .match_query(run_query())
            .with_status(200)
            .with_body(r#"{"ActualQPS": 10.0}"#)
            .create_async()
            .await;

        let client = client_for(&server);
        let err = client.run(&BenchmarkParameters::default()).await.unwrap_err();
        assert!(err.to_string().contains("run identifier"));
    }

    #[tokio::test]
    async fn test_probe_submits_async_run() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/fortio/rest/run")
            .match_query(run_query())
            .match_body(Matcher::PartialJson(json!({
                "metadata": { "n": "10", "async": "on", "save": "off" }
            })))
            .with_status(200)
            .with_body(r#"{"message": "started", "RunID": 9}"#)
            .create_async()
            .await;

        let client = client_for(&server);
        let run_id = client.probe("http://localhost:8080/echo").await.unwrap();

        mock.assert_async().await;
        assert_eq!(run_id, 9);
    }

    #[tokio::test]
    async fn test_probe_fails_without_run_id() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/fortio/rest/run")
            .match_query(run_query())
            .with_status(200)
            .with_body("{}")
            .create_async()
            .await;

        let client = client_for(&server);
        let err = client.probe("http://localhost:8080/echo").await.unwrap_err();

        assert!(matches!(err, ScalerError::BenchmarkUnavailable(_)));
    }

    #[tokio::test]
    async fn test_unreachable_fortio() {
        let client = FortioClient::new("http://127.0.0.1:1/fortio/").unwrap();
        let err = tokio_test::assert_err!(client.run(&BenchmarkParameters::default()).await);

        assert!(matches!(err, ScalerError::BenchmarkUnavailable(_)));
    }
}
