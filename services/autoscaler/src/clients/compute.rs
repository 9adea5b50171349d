//! Compute provisioner client.
//!
//! Workers are instances tagged with the cluster name and a worker role.
//! Launching prefers spot capacity and falls back exactly once to on-demand
//! when the spot request fails for any reason; deeper retry is left to the
//! next tick. Termination is fire-and-forget: the instance disappearing from
//! inventory is the only confirmation the loop ever looks at.

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::placement::pick_launch_subnet;
use crate::retry::RetryPolicy;

/// A worker instance as reported by the provisioner. Reflected inventory,
/// not owned state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerNode {
    pub instance_id: String,
    pub private_ip: IpAddr,
    pub launch_time: DateTime<Utc>,
    pub zone: String,
    pub subnet_id: String,
}

impl WorkerNode {
    /// Orchestration-API node name. Nodes register under their private
    /// address with dots replaced by dashes (`ip-10-0-1-23`).
    pub fn node_name(&self) -> String {
        format!("ip-{}", self.private_ip.to_string().replace(['.', ':'], "-"))
    }
}

#[async_trait]
pub trait ComputeProvider: Send + Sync {
    /// Live worker inventory: instances tagged for this cluster that are
    /// running or still coming up.
    async fn list_workers(&self) -> Result<Vec<WorkerNode>>;

    /// Launch `count` workers into the least-loaded zone, bootstrapped with
    /// `join_token`. Returns the accepted instance ids.
    async fn launch_workers(&self, count: usize, join_token: &str) -> Result<Vec<String>>;

    /// Request termination of one instance.
    async fn terminate_worker(&self, instance_id: &str) -> Result<()>;
}

pub struct HttpComputeProvider {
    client: reqwest::Client,
    base_url: String,
    cluster: String,
    worker_subnets: Vec<String>,
    server_addr: String,
    retry: RetryPolicy,
    /// Launches must not be repeated blindly, so they run without retry.
    launch_retry: RetryPolicy,
}

impl HttpComputeProvider {
    pub fn new(
        base_url: &str,
        cluster: &str,
        worker_subnets: Vec<String>,
        server_addr: &str,
        retry: RetryPolicy,
    ) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .expect("Failed to build HTTP client");

        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            cluster: cluster.to_string(),
            worker_subnets,
            server_addr: server_addr.to_string(),
            retry,
            launch_retry: RetryPolicy::no_retry(retry.timeout),
        }
    }

    async fn list_once(&self) -> Result<Vec<WorkerNode>> {
        let url = format!("{}/v1/instances", self.base_url);
        let response = self
            .client
            .get(&url)
            .query(&[("cluster", self.cluster.as_str()), ("role", "worker")])
            .send()
            .await?;

        if !response.status().is_success() {
            anyhow::bail!("Failed to list instances: {}", response.status());
        }

        let list: InstanceList = response.json().await?;
        Ok(list
            .instances
            .into_iter()
            .filter(|i| matches!(i.state.as_str(), "running" | "pending"))
            .map(|i| WorkerNode {
                instance_id: i.instance_id,
                private_ip: i.private_ip,
                launch_time: i.launch_time,
                zone: i.zone,
                subnet_id: i.subnet_id,
            })
            .collect())
    }

    /// Map the configured worker subnets to their zones.
    async fn subnet_zones_once(&self) -> Result<BTreeMap<String, Vec<String>>> {
        if self.worker_subnets.is_empty() {
            anyhow::bail!("no worker subnets configured");
        }

        let url = format!("{}/v1/subnets", self.base_url);
        let ids = self.worker_subnets.join(",");
        let response = self
            .client
            .get(&url)
            .query(&[("ids", ids.as_str())])
            .send()
            .await?;

        if !response.status().is_success() {
            anyhow::bail!("Failed to resolve subnets: {}", response.status());
        }

        let list: SubnetList = response.json().await?;
        let mut by_zone: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for subnet in list.subnets {
            by_zone.entry(subnet.zone).or_default().push(subnet.subnet_id);
        }
        Ok(by_zone)
    }

    async fn launch_once(
        &self,
        count: usize,
        subnet_id: &str,
        user_data: &str,
        capacity: &str,
    ) -> Result<Vec<String>> {
        let url = format!("{}/v1/instances", self.base_url);
        let request = LaunchRequest {
            cluster: &self.cluster,
            subnet_id,
            count,
            capacity,
            user_data,
        };

        let response = self.client.post(&url).json(&request).send().await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Launch ({capacity}) failed: {status} - {body}");
        }

        let accepted: LaunchResponse = response.json().await?;
        Ok(accepted.instance_ids)
    }

    async fn terminate_once(&self, instance_id: &str) -> Result<()> {
        let url = format!("{}/v1/instances/{}", self.base_url, instance_id);
        let response = self.client.delete(&url).send().await?;

        if !response.status().is_success() {
            anyhow::bail!(
                "Failed to terminate instance '{}': {}",
                instance_id,
                response.status()
            );
        }
        Ok(())
    }
}

#[async_trait]
impl ComputeProvider for HttpComputeProvider {
    async fn list_workers(&self) -> Result<Vec<WorkerNode>> {
        self.retry.run("list instances", || self.list_once()).await
    }

    async fn launch_workers(&self, count: usize, join_token: &str) -> Result<Vec<String>> {
        let (zones, workers) = tokio::join!(
            self.retry.run("resolve subnets", || self.subnet_zones_once()),
            self.list_workers(),
        );
        let zones = zones?;
        let occupied: Vec<String> = workers?.into_iter().map(|w| w.zone).collect();

        let (zone, subnet) = pick_launch_subnet(&zones, &occupied)
            .ok_or_else(|| anyhow!("no eligible worker subnet"))?;
        let user_data = bootstrap_user_data(&self.server_addr, join_token);

        debug!(zone, subnet, count, "Launching workers");

        let spot = self
            .launch_retry
            .run("spot launch", || {
                self.launch_once(count, subnet, &user_data, "spot")
            })
            .await;

        let instance_ids = match spot {
            Ok(ids) => ids,
            Err(err) => {
                warn!(error = %err, "Spot launch failed, falling back to on-demand");
                self.launch_retry
                    .run("on-demand launch", || {
                        self.launch_once(count, subnet, &user_data, "on_demand")
                    })
                    .await?
            }
        };

        info!(zone, subnet, instances = ?instance_ids, "Workers launching");
        Ok(instance_ids)
    }

    async fn terminate_worker(&self, instance_id: &str) -> Result<()> {
        self.retry
            .run("terminate instance", || self.terminate_once(instance_id))
            .await
    }
}

/// Boot script a new worker runs on first start: fetch the agent installer
/// from the cluster server and join with the token. Base64 as the
/// provisioner expects user data.
fn bootstrap_user_data(server_addr: &str, join_token: &str) -> String {
    let script = format!(
        "#!/bin/bash\n\
         set -euo pipefail\n\
         curl -sfk https://{server_addr}:6443/v1/agent-installer -o /tmp/agent-install.sh\n\
         AGENT_SERVER=https://{server_addr}:6443 AGENT_TOKEN={join_token} bash /tmp/agent-install.sh\n"
    );
    BASE64.encode(script)
}

#[derive(Debug, Deserialize)]
struct InstanceList {
    #[serde(default)]
    instances: Vec<InstanceRecord>,
}

#[derive(Debug, Deserialize)]
struct InstanceRecord {
    instance_id: String,
    private_ip: IpAddr,
    launch_time: DateTime<Utc>,
    zone: String,
    subnet_id: String,
    state: String,
}

#[derive(Debug, Serialize)]
struct LaunchRequest<'a> {
    cluster: &'a str,
    subnet_id: &'a str,
    count: usize,
    capacity: &'a str,
    user_data: &'a str,
}

#[derive(Debug, Deserialize)]
struct LaunchResponse {
    instance_ids: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct SubnetList {
    #[serde(default)]
    subnets: Vec<SubnetRecord>,
}

#[derive(Debug, Deserialize)]
struct SubnetRecord {
    subnet_id: String,
    zone: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn provider(server: &MockServer, subnets: &[&str]) -> HttpComputeProvider {
        HttpComputeProvider::new(
            &server.uri(),
            "demo",
            subnets.iter().map(|s| s.to_string()).collect(),
            "cluster.internal",
            RetryPolicy::no_retry(Duration::from_secs(1)),
        )
    }

    fn instance(id: &str, ip: &str, zone: &str, subnet: &str, state: &str) -> serde_json::Value {
        json!({
            "instance_id": id,
            "private_ip": ip,
            "launch_time": "2026-01-10T08:00:00Z",
            "zone": zone,
            "subnet_id": subnet,
            "state": state,
        })
    }

    async fn mount_inventory(server: &MockServer, instances: serde_json::Value) {
        Mock::given(method("GET"))
            .and(path("/v1/instances"))
            .and(query_param("cluster", "demo"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"instances": instances})))
            .mount(server)
            .await;
    }

    async fn mount_subnets(server: &MockServer, subnets: serde_json::Value) {
        Mock::given(method("GET"))
            .and(path("/v1/subnets"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"subnets": subnets})))
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn list_keeps_only_running_and_pending() {
        let server = MockServer::start().await;
        mount_inventory(
            &server,
            json!([
                instance("i-1", "10.0.1.5", "eu-1a", "sn-a", "running"),
                instance("i-2", "10.0.2.6", "eu-1b", "sn-b", "pending"),
                instance("i-3", "10.0.1.7", "eu-1a", "sn-a", "terminated"),
            ]),
        )
        .await;

        let workers = provider(&server, &["sn-a"]).list_workers().await.unwrap();
        let ids: Vec<_> = workers.iter().map(|w| w.instance_id.as_str()).collect();
        assert_eq!(ids, vec!["i-1", "i-2"]);
    }

    #[tokio::test]
    async fn launch_targets_least_loaded_zone() {
        let server = MockServer::start().await;
        mount_inventory(
            &server,
            json!([instance("i-1", "10.0.1.5", "eu-1a", "sn-a", "running")]),
        )
        .await;
        mount_subnets(
            &server,
            json!([
                {"subnet_id": "sn-a", "zone": "eu-1a"},
                {"subnet_id": "sn-b", "zone": "eu-1b"},
            ]),
        )
        .await;
        Mock::given(method("POST"))
            .and(path("/v1/instances"))
            .and(body_partial_json(json!({"subnet_id": "sn-b", "capacity": "spot"})))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"instance_ids": ["i-new"]})),
            )
            .expect(1)
            .mount(&server)
            .await;

        let ids = provider(&server, &["sn-a", "sn-b"])
            .launch_workers(1, "tok")
            .await
            .unwrap();
        assert_eq!(ids, vec!["i-new"]);
    }

    #[tokio::test]
    async fn spot_failure_falls_back_to_on_demand() {
        let server = MockServer::start().await;
        mount_inventory(&server, json!([])).await;
        mount_subnets(&server, json!([{"subnet_id": "sn-a", "zone": "eu-1a"}])).await;
        Mock::given(method("POST"))
            .and(path("/v1/instances"))
            .and(body_partial_json(json!({"capacity": "spot"})))
            .respond_with(ResponseTemplate::new(500).set_body_string("no spot capacity"))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v1/instances"))
            .and(body_partial_json(json!({"capacity": "on_demand"})))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"instance_ids": ["i-od"]})),
            )
            .expect(1)
            .mount(&server)
            .await;

        let ids = provider(&server, &["sn-a"]).launch_workers(1, "tok").await.unwrap();
        assert_eq!(ids, vec!["i-od"]);
    }

    #[tokio::test]
    async fn both_capacity_classes_failing_is_an_error() {
        let server = MockServer::start().await;
        mount_inventory(&server, json!([])).await;
        mount_subnets(&server, json!([{"subnet_id": "sn-a", "zone": "eu-1a"}])).await;
        Mock::given(method("POST"))
            .and(path("/v1/instances"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let err = provider(&server, &["sn-a"])
            .launch_workers(1, "tok")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("on_demand"));
    }

    #[tokio::test]
    async fn launch_without_subnets_is_an_error() {
        let server = MockServer::start().await;
        let err = provider(&server, &[]).launch_workers(1, "tok").await.unwrap_err();
        assert!(err.to_string().contains("no worker subnets"));
    }

    #[tokio::test]
    async fn terminate_hits_instance_resource() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/v1/instances/i-gone"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        provider(&server, &["sn-a"]).terminate_worker("i-gone").await.unwrap();
    }

    #[test]
    fn node_name_derives_from_private_ip() {
        let node = WorkerNode {
            instance_id: "i-1".to_string(),
            private_ip: "10.0.12.34".parse().unwrap(),
            launch_time: Utc::now(),
            zone: "eu-1a".to_string(),
            subnet_id: "sn-a".to_string(),
        };
        assert_eq!(node.node_name(), "ip-10-0-12-34");
    }

    #[test]
    fn user_data_embeds_server_and_token() {
        let encoded = bootstrap_user_data("cluster.internal", "tok-123");
        let script = String::from_utf8(BASE64.decode(encoded).unwrap()).unwrap();
        assert!(script.starts_with("#!/bin/bash"));
        assert!(script.contains("https://cluster.internal:6443"));
        assert!(script.contains("AGENT_TOKEN=tok-123"));
    }
}
