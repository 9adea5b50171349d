//! Orchestration API client.
//!
//! Speaks directly to the cluster API server with a bearer token fetched
//! from the blob store. Only the four operations the loop needs: cordon a
//! node, list the pods bound to it, evict a pod, and read node readiness.
//! The server usually presents a self-signed certificate, so verification
//! can be switched off in config.

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use crate::retry::RetryPolicy;

/// A pod bound to some node. `daemonset` pods are recreated on the node by
/// their controller, so draining skips them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodRef {
    pub namespace: String,
    pub name: String,
    pub daemonset: bool,
}

#[async_trait]
pub trait OrchestrationApi: Send + Sync {
    /// Mark a node unschedulable.
    async fn cordon(&self, node: &str) -> Result<()>;

    /// All pods currently bound to `node`.
    async fn pods_on_node(&self, node: &str) -> Result<Vec<PodRef>>;

    /// Evict one pod through the eviction subresource.
    async fn evict(&self, namespace: &str, pod: &str) -> Result<()>;

    /// Names of nodes whose `Ready` condition is `True`.
    async fn ready_nodes(&self) -> Result<Vec<String>>;
}

pub struct HttpOrchestrationApi {
    client: reqwest::Client,
    base_url: String,
    token: String,
    retry: RetryPolicy,
}

impl HttpOrchestrationApi {
    pub fn new(base_url: &str, token: &str, insecure_tls: bool, retry: RetryPolicy) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .danger_accept_invalid_certs(insecure_tls)
            .build()
            .expect("Failed to build HTTP client");

        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
            retry,
        }
    }

    async fn cordon_once(&self, node: &str) -> Result<()> {
        let url = format!("{}/api/v1/nodes/{}", self.base_url, node);
        debug!(node, "Cordoning node");

        let response = self
            .client
            .patch(&url)
            .bearer_auth(&self.token)
            .header(CONTENT_TYPE, "application/strategic-merge-patch+json")
            .body(json!({"spec": {"unschedulable": true}}).to_string())
            .send()
            .await?;

        if !response.status().is_success() {
            anyhow::bail!("Failed to cordon node '{}': {}", node, response.status());
        }
        Ok(())
    }

    async fn pods_once(&self, node: &str) -> Result<Vec<PodRef>> {
        let url = format!("{}/api/v1/pods", self.base_url);
        let selector = format!("spec.nodeName={node}");

        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.token)
            .query(&[("fieldSelector", selector.as_str())])
            .send()
            .await?;

        if !response.status().is_success() {
            anyhow::bail!("Failed to list pods on '{}': {}", node, response.status());
        }

        let list: PodList = response.json().await?;
        Ok(list
            .items
            .into_iter()
            .map(|pod| PodRef {
                daemonset: pod
                    .metadata
                    .owner_references
                    .iter()
                    .any(|owner| owner.kind == "DaemonSet"),
                namespace: pod.metadata.namespace,
                name: pod.metadata.name,
            })
            .collect())
    }

    async fn evict_once(&self, namespace: &str, pod: &str) -> Result<()> {
        let url = format!(
            "{}/api/v1/namespaces/{}/pods/{}/eviction",
            self.base_url, namespace, pod
        );

        let body = json!({
            "apiVersion": "policy/v1",
            "kind": "Eviction",
            "metadata": {"name": pod, "namespace": namespace}
        });

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.token)
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            anyhow::bail!(
                "Failed to evict pod '{}/{}': {}",
                namespace,
                pod,
                response.status()
            );
        }
        Ok(())
    }

    async fn ready_nodes_once(&self) -> Result<Vec<String>> {
        let url = format!("{}/api/v1/nodes", self.base_url);

        let response = self.client.get(&url).bearer_auth(&self.token).send().await?;

        if !response.status().is_success() {
            anyhow::bail!("Failed to list nodes: {}", response.status());
        }

        let list: NodeList = response.json().await?;
        Ok(list
            .items
            .into_iter()
            .filter(|node| {
                node.status
                    .conditions
                    .iter()
                    .any(|c| c.kind == "Ready" && c.status == "True")
            })
            .map(|node| node.metadata.name)
            .collect())
    }
}

#[async_trait]
impl OrchestrationApi for HttpOrchestrationApi {
    async fn cordon(&self, node: &str) -> Result<()> {
        self.retry.run("cordon node", || self.cordon_once(node)).await
    }

    async fn pods_on_node(&self, node: &str) -> Result<Vec<PodRef>> {
        self.retry.run("list pods", || self.pods_once(node)).await
    }

    async fn evict(&self, namespace: &str, pod: &str) -> Result<()> {
        self.retry
            .run("evict pod", || self.evict_once(namespace, pod))
            .await
    }

    async fn ready_nodes(&self) -> Result<Vec<String>> {
        self.retry.run("list nodes", || self.ready_nodes_once()).await
    }
}

#[derive(Debug, Deserialize)]
struct PodList {
    #[serde(default)]
    items: Vec<PodItem>,
}

#[derive(Debug, Deserialize)]
struct PodItem {
    metadata: PodMeta,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PodMeta {
    name: String,
    namespace: String,
    #[serde(default)]
    owner_references: Vec<OwnerRef>,
}

#[derive(Debug, Deserialize)]
struct OwnerRef {
    kind: String,
}

#[derive(Debug, Deserialize)]
struct NodeList {
    #[serde(default)]
    items: Vec<NodeItem>,
}

#[derive(Debug, Deserialize)]
struct NodeItem {
    metadata: NodeMeta,
    #[serde(default)]
    status: NodeStatus,
}

#[derive(Debug, Deserialize)]
struct NodeMeta {
    name: String,
}

#[derive(Debug, Default, Deserialize)]
struct NodeStatus {
    #[serde(default)]
    conditions: Vec<NodeCondition>,
}

#[derive(Debug, Deserialize)]
struct NodeCondition {
    #[serde(rename = "type")]
    kind: String,
    status: String,
}
