//! Load signal sampling.
//!
//! The decision engine consumes one [`LoadSample`] per tick: aggregate CPU
//! utilization in percent and a pending-workload count. The Prometheus
//! implementation issues both instant queries concurrently, and any
//! transport error, non-success status, or empty result becomes `0.0` with
//! a warning, which biases the engine toward not scaling up during a
//! metrics outage.

use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::retry::RetryPolicy;

/// One observation of cluster load.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LoadSample {
    /// Aggregate CPU utilization, 0 to 100.
    pub cpu_percent: f64,
    /// Workloads waiting for capacity.
    pub pending_work: f64,
}

/// Source of load signals. Implementations own the failure policy: a failed
/// sample comes back as zero, never as an error the caller must handle.
#[async_trait]
pub trait MetricsSource: Send + Sync {
    async fn sample(&self) -> LoadSample;
}

pub struct PrometheusMetrics {
    client: reqwest::Client,
    base_url: String,
    cpu_query: String,
    pending_query: String,
    retry: RetryPolicy,
}

impl PrometheusMetrics {
    pub fn new(base_url: &str, cpu_query: &str, pending_query: &str, retry: RetryPolicy) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .expect("Failed to build HTTP client");

        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            cpu_query: cpu_query.to_string(),
            pending_query: pending_query.to_string(),
            retry,
        }
    }

    async fn scalar(&self, signal: &'static str, expression: &str) -> Result<f64> {
        self.retry.run(signal, || self.query_once(expression)).await
    }

    /// Run one instant query and take the first sample's value.
    async fn query_once(&self, expression: &str) -> Result<f64> {
        let url = format!("{}/api/v1/query", self.base_url);
        debug!(query = expression, "Running instant query");

        let response = self
            .client
            .get(&url)
            .query(&[("query", expression)])
            .send()
            .await?;

        if !response.status().is_success() {
            anyhow::bail!("Instant query failed: {}", response.status());
        }

        let body: QueryResponse = response.json().await?;
        if body.status != "success" {
            anyhow::bail!("Instant query returned status '{}'", body.status);
        }

        let sample = body
            .data
            .result
            .first()
            .ok_or_else(|| anyhow!("Instant query returned no samples"))?;

        Ok(sample.value.1.parse()?)
    }
}

#[async_trait]
impl MetricsSource for PrometheusMetrics {
    async fn sample(&self) -> LoadSample {
        let (cpu, pending) = tokio::join!(
            self.scalar("cpu query", &self.cpu_query),
            self.scalar("pending query", &self.pending_query),
        );

        LoadSample {
            cpu_percent: or_zero("cpu", cpu),
            pending_work: or_zero("pending", pending),
        }
    }
}

fn or_zero(signal: &str, result: Result<f64>) -> f64 {
    match result {
        Ok(value) => value,
        Err(err) => {
            warn!(signal, error = %err, "Load signal unavailable, defaulting to 0");
            0.0
        }
    }
}

/// Instant query response: `data.result[].value` is `[unix_ts, "value"]`.
#[derive(Debug, Deserialize)]
struct QueryResponse {
    status: String,
    data: QueryData,
}

#[derive(Debug, Deserialize)]
struct QueryData {
    #[serde(default)]
    result: Vec<QuerySample>,
}

#[derive(Debug, Deserialize)]
struct QuerySample {
    value: (f64, String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn vector_body(value: &str) -> serde_json::Value {
        serde_json::json!({
            "status": "success",
            "data": {
                "resultType": "vector",
                "result": [{"metric": {}, "value": [1700000000.0, value]}]
            }
        })
    }

    fn empty_body() -> serde_json::Value {
        serde_json::json!({
            "status": "success",
            "data": {"resultType": "vector", "result": []}
        })
    }

    fn source(server: &MockServer) -> PrometheusMetrics {
        PrometheusMetrics::new(
            &server.uri(),
            "cpu_expr",
            "pending_expr",
            RetryPolicy::no_retry(Duration::from_secs(1)),
        )
    }

    #[tokio::test]
    async fn samples_both_signals() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/query"))
            .and(query_param("query", "cpu_expr"))
            .respond_with(ResponseTemplate::new(200).set_body_json(vector_body("82.5")))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/v1/query"))
            .and(query_param("query", "pending_expr"))
            .respond_with(ResponseTemplate::new(200).set_body_json(vector_body("3")))
            .mount(&server)
            .await;

        let sample = source(&server).sample().await;
        assert_eq!(sample.cpu_percent, 82.5);
        assert_eq!(sample.pending_work, 3.0);
    }

    #[tokio::test]
    async fn server_error_defaults_to_zero() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/query"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let sample = source(&server).sample().await;
        assert_eq!(sample.cpu_percent, 0.0);
        assert_eq!(sample.pending_work, 0.0);
    }

    #[tokio::test]
    async fn empty_result_defaults_to_zero() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/query"))
            .and(query_param("query", "cpu_expr"))
            .respond_with(ResponseTemplate::new(200).set_body_json(empty_body()))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/v1/query"))
            .and(query_param("query", "pending_expr"))
            .respond_with(ResponseTemplate::new(200).set_body_json(vector_body("1")))
            .mount(&server)
            .await;

        let sample = source(&server).sample().await;
        assert_eq!(sample.cpu_percent, 0.0);
        assert_eq!(sample.pending_work, 1.0);
    }

    #[tokio::test]
    async fn unreachable_endpoint_defaults_to_zero() {
        let metrics = PrometheusMetrics::new(
            "http://127.0.0.1:1",
            "cpu_expr",
            "pending_expr",
            RetryPolicy::no_retry(Duration::from_millis(200)),
        );

        let sample = metrics.sample().await;
        assert_eq!(sample.cpu_percent, 0.0);
        assert_eq!(sample.pending_work, 0.0);
    }
}
