//! Periodic tick worker.
//!
//! Drives the control loop on a fixed interval until shutdown is signaled.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{info, instrument};

use crate::orchestrator::{Orchestrator, TickOutcome};

pub struct TickWorker {
    orchestrator: Arc<Orchestrator>,
    interval: Duration,
}

impl TickWorker {
    pub fn new(orchestrator: Arc<Orchestrator>, interval: Duration) -> Self {
        Self {
            orchestrator,
            interval,
        }
    }

    /// Run ticks until shutdown is signaled.
    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.interval.as_secs(),
            "Starting tick worker"
        );

        let mut interval = tokio::time::interval(self.interval);
        // Don't tick immediately on startup - wait for the first interval
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    // Steady ticks stay quiet; failures are logged where
                    // they happen.
                    match self.orchestrator.run_tick().await {
                        TickOutcome::Steady { .. } | TickOutcome::Errored { .. } => {}
                        outcome => info!(outcome = ?outcome, "Tick complete"),
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Tick worker shutting down");
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::{HttpBlobStore, HttpComputeProvider, HttpOrchestrationApi, PrometheusMetrics};
    use crate::engine::ScalingPolicy;
    use crate::orchestrator::{Collaborators, OrchestratorSettings};
    use crate::retry::RetryPolicy;
    use crate::store::MemoryStateStore;

    fn idle_orchestrator() -> Arc<Orchestrator> {
        // Collaborators point at a closed port; nothing here gets called
        // before the first interval elapses.
        let retry = RetryPolicy::no_retry(Duration::from_millis(100));
        Arc::new(Orchestrator::new(
            OrchestratorSettings {
                policy: ScalingPolicy {
                    min_nodes: 1,
                    max_nodes: 3,
                    scale_up_cpu: 70.0,
                    scale_down_cpu: 30.0,
                    pending_threshold: 0.0,
                    scale_up_cooldown: Duration::from_secs(300),
                    scale_down_cooldown: Duration::from_secs(600),
                },
                verify_timeout: Duration::from_secs(600),
                lock_ttl: Duration::from_secs(300),
                drain_grace: Duration::ZERO,
                join_token_key: "node-token".to_string(),
            },
            Collaborators {
                store: Arc::new(MemoryStateStore::new("test", chrono::Utc::now())),
                metrics: Arc::new(PrometheusMetrics::new("http://127.0.0.1:1", "up", "up", retry)),
                compute: Arc::new(HttpComputeProvider::new(
                    "http://127.0.0.1:1",
                    "test",
                    vec![],
                    "",
                    retry,
                )),
                orch: Arc::new(HttpOrchestrationApi::new("http://127.0.0.1:1", "", false, retry)),
                blob: Arc::new(HttpBlobStore::new("http://127.0.0.1:1", retry)),
            },
        ))
    }

    #[tokio::test]
    async fn shutdown_signal_stops_the_worker() {
        let worker = TickWorker::new(idle_orchestrator(), Duration::from_secs(3600));
        let (tx, rx) = watch::channel(false);

        let handle = tokio::spawn(async move { worker.run(rx).await });
        tx.send(true).unwrap();

        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("worker did not stop on shutdown")
            .unwrap();
    }
}
