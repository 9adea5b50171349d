//! Node draining ahead of termination.
//!
//! Draining is best-effort: the node is being removed either way, so the
//! drain exists to move workloads off gracefully, not to guarantee zero
//! disruption. The fixed grace wait bounds total scale-down latency.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tracing::{info, warn};

use crate::clients::OrchestrationApi;

pub struct NodeDrainer {
    api: Arc<dyn OrchestrationApi>,
    grace: Duration,
}

impl NodeDrainer {
    pub fn new(api: Arc<dyn OrchestrationApi>, grace: Duration) -> Self {
        Self { api, grace }
    }

    /// Cordon the node, evict its non-daemon pods, then wait out the grace
    /// period so evicted workloads can reschedule.
    ///
    /// Individual eviction failures are logged and skipped. A failure before
    /// that (cordon, pod listing) aborts the drain; callers treat the whole
    /// drain as best-effort and proceed to termination regardless.
    pub async fn drain(&self, node: &str) -> Result<()> {
        self.api.cordon(node).await?;

        let pods = self.api.pods_on_node(node).await?;
        let mut evicted = 0usize;
        for pod in pods.iter().filter(|p| !p.daemonset) {
            match self.api.evict(&pod.namespace, &pod.name).await {
                Ok(()) => evicted += 1,
                Err(err) => {
                    warn!(
                        namespace = %pod.namespace,
                        pod = %pod.name,
                        error = %err,
                        "Eviction failed, skipping"
                    );
                }
            }
        }

        info!(node, evicted, pods = pods.len(), "Node drained, waiting grace period");
        tokio::time::sleep(self.grace).await;
        Ok(())
    }
}
