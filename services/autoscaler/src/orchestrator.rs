//! The control loop.
//!
//! Each tick runs to completion on one logical thread of control: take the
//! coordination lock (or skip the tick), reconcile any in-flight action
//! before anything else, otherwise sample load and inventory, decide, execute
//! and persist, then release the lock. Concurrent invocations (the periodic
//! worker, a manual trigger, another replica) are arbitrated by the
//! non-blocking lock plus the store's conditional writes underneath it.
//!
//! Scale-up completes only once every launched instance is present in
//! inventory *and* its node reports Ready; an action stuck past the
//! verification timeout is abandoned with the store's escape hatch.
//! Interruption notices bypass the lock entirely: the node is being
//! reclaimed regardless, so the loop drains it best-effort and launches one
//! replacement, independent of cooldowns and bounds.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use smartscale_id::{ActionId, RequestId};
use tracing::{error, info, warn};

use crate::clients::{BlobStore, ComputeProvider, MetricsSource, OrchestrationApi, WorkerNode};
use crate::config::Config;
use crate::drain::NodeDrainer;
use crate::engine::{decide, ClusterSnapshot, Decision, ScalingPolicy};
use crate::store::{ScalingAction, StateStore, StoreError};

/// What one tick did. Surfaced by the trigger API and logged by the worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TickOutcome {
    /// Another invocation holds the lock; nothing was done.
    SkippedLockBusy,
    /// An action is in flight and cannot be completed yet.
    InFlight { action_id: ActionId },
    /// A previously started scale-up verified ready and was closed.
    CompletedScaleUp { action_id: ActionId },
    /// A previously started scale-down was resumed and closed.
    CompletedScaleDown { action_id: ActionId },
    /// An action sat past the verification timeout and was reset.
    Abandoned { action_id: ActionId },
    /// A new scale-up was started; completion follows on a later tick.
    ScaledUp {
        action_id: ActionId,
        instance_ids: Vec<String>,
        reason: String,
    },
    /// A worker was drained, terminated and the action closed.
    ScaledDown {
        action_id: ActionId,
        instance_id: String,
        reason: String,
    },
    /// No action warranted.
    Steady { reason: String },
    /// A conditional write lost to a concurrent owner; aborted cleanly.
    LostRace,
    /// A collaborator failure ended the tick early.
    Errored { message: String },
}

/// Tunables the orchestrator needs, split out of [`Config`] so tests can
/// construct them directly.
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub policy: ScalingPolicy,
    pub verify_timeout: Duration,
    pub lock_ttl: Duration,
    pub drain_grace: Duration,
    pub join_token_key: String,
}

impl OrchestratorSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            policy: config.policy.clone(),
            verify_timeout: config.action_verify_timeout,
            lock_ttl: config.lock_ttl,
            drain_grace: config.drain_grace,
            join_token_key: config.join_token_key.clone(),
        }
    }
}

/// Everything the orchestrator acts through.
pub struct Collaborators {
    pub store: Arc<dyn StateStore>,
    pub metrics: Arc<dyn MetricsSource>,
    pub compute: Arc<dyn ComputeProvider>,
    pub orch: Arc<dyn OrchestrationApi>,
    pub blob: Arc<dyn BlobStore>,
}

pub struct Orchestrator {
    policy: ScalingPolicy,
    verify_timeout: Duration,
    lock_ttl: Duration,
    join_token_key: String,
    store: Arc<dyn StateStore>,
    metrics: Arc<dyn MetricsSource>,
    compute: Arc<dyn ComputeProvider>,
    orch: Arc<dyn OrchestrationApi>,
    blob: Arc<dyn BlobStore>,
    drainer: NodeDrainer,
}

impl Orchestrator {
    pub fn new(settings: OrchestratorSettings, collaborators: Collaborators) -> Self {
        let drainer = NodeDrainer::new(collaborators.orch.clone(), settings.drain_grace);
        Self {
            policy: settings.policy,
            verify_timeout: settings.verify_timeout,
            lock_ttl: settings.lock_ttl,
            join_token_key: settings.join_token_key,
            store: collaborators.store,
            metrics: collaborators.metrics,
            compute: collaborators.compute,
            orch: collaborators.orch,
            blob: collaborators.blob,
            drainer,
        }
    }

    /// Run one decide-and-act cycle. Never returns an error: every failure
    /// mode folds into a [`TickOutcome`], and the worst of them is a tick
    /// that did nothing.
    pub async fn run_tick(&self) -> TickOutcome {
        let request_id = RequestId::new();
        let now = Utc::now();

        let acquired = match self.store.acquire_lock(request_id, self.lock_ttl, now).await {
            Ok(acquired) => acquired,
            Err(err) => return errored("lock acquisition failed", err.into()),
        };
        if !acquired {
            info!(request_id = %request_id, "Lock busy, skipping tick");
            return TickOutcome::SkippedLockBusy;
        }

        let outcome = match self.locked_tick().await {
            Ok(outcome) => outcome,
            Err(err) => errored("tick aborted", err),
        };

        // Always attempt release; a lost lock just means the TTL or another
        // owner already reclaimed it.
        match self.store.release_lock(request_id).await {
            Ok(true) => {}
            Ok(false) => warn!(request_id = %request_id, "Lock no longer held at release"),
            Err(err) => warn!(request_id = %request_id, error = %err, "Lock release failed"),
        }

        outcome
    }

    async fn locked_tick(&self) -> Result<TickOutcome> {
        let state = self.store.get().await?;

        // Reconcile before deciding: two decisions must never race over the
        // same action record.
        if let Some(action) = state.action {
            return self.reconcile(action).await;
        }

        let (sample, workers) = tokio::join!(self.metrics.sample(), self.compute.list_workers());
        let workers = workers?;

        if let Err(err) = self.store.record_worker_count(workers.len()).await {
            warn!(error = %err, "Failed to refresh worker count snapshot");
        }

        let snapshot = ClusterSnapshot {
            worker_count: workers.len(),
            cpu_percent: sample.cpu_percent,
            pending_work: sample.pending_work,
            scaling_in_progress: false,
            last_scale_at: state.last_scale_at,
            now: Utc::now(),
        };
        let decision = decide(&self.policy, &snapshot);

        info!(
            cpu = sample.cpu_percent,
            pending = sample.pending_work,
            workers = workers.len(),
            decision = ?decision,
            "Evaluated cluster"
        );

        match decision {
            Decision::ScaleUp { delta, reason } => self.start_scale_up(delta, reason).await,
            Decision::ScaleDown { reason, .. } => self.execute_scale_down(reason, &workers).await,
            Decision::Hold { reason } => Ok(TickOutcome::Steady {
                reason: reason.to_string(),
            }),
        }
    }

    /// Open a scale-up action and launch. The action is completed by a later
    /// tick once the new capacity verifies ready; a failure after `begin`
    /// leaves the action open for reconciliation to abandon via the timeout.
    async fn start_scale_up(&self, delta: usize, reason: &'static str) -> Result<TickOutcome> {
        let action_id = ActionId::new();
        let now = Utc::now();

        if !applied(self.store.begin_scale_up(action_id, now).await)? {
            return Ok(TickOutcome::LostRace);
        }
        info!(action_id = %action_id, reason, delta, "Scale-up started");

        let join_token = self.blob.read(&self.join_token_key).await?;
        let instance_ids = self.compute.launch_workers(delta, &join_token).await?;

        if !applied(
            self.store
                .record_scale_up_instances(action_id, &instance_ids)
                .await,
        )? {
            return Ok(TickOutcome::LostRace);
        }

        info!(
            action_id = %action_id,
            instances = ?instance_ids,
            "Workers launching, completion pending readiness"
        );
        Ok(TickOutcome::ScaledUp {
            action_id,
            instance_ids,
            reason: reason.to_string(),
        })
    }

    /// Remove the oldest worker: begin, drain, terminate and complete, all
    /// in one invocation.
    async fn execute_scale_down(
        &self,
        reason: &'static str,
        workers: &[WorkerNode],
    ) -> Result<TickOutcome> {
        let Some(victim) = workers.iter().min_by(|a, b| {
            a.launch_time
                .cmp(&b.launch_time)
                .then_with(|| a.instance_id.cmp(&b.instance_id))
        }) else {
            warn!("Scale-down decided with empty inventory");
            return Ok(TickOutcome::Steady {
                reason: "stable".to_string(),
            });
        };

        let action_id = ActionId::new();
        let now = Utc::now();
        let targets: BTreeSet<String> = [victim.instance_id.clone()].into();

        if !applied(self.store.begin_scale_down(action_id, now, &targets).await)? {
            return Ok(TickOutcome::LostRace);
        }
        info!(
            action_id = %action_id,
            instance = %victim.instance_id,
            reason,
            "Scale-down started"
        );

        self.remove_worker(victim).await?;

        if !applied(
            self.store
                .mark_scale_down_completed(action_id, &victim.instance_id)
                .await,
        )? {
            return Ok(TickOutcome::LostRace);
        }
        if !applied(self.store.complete_scale_down(action_id, Utc::now()).await)? {
            return Ok(TickOutcome::LostRace);
        }

        info!(action_id = %action_id, instance = %victim.instance_id, "Scale-down complete");
        Ok(TickOutcome::ScaledDown {
            action_id,
            instance_id: victim.instance_id.clone(),
            reason: reason.to_string(),
        })
    }

    /// Pick up an in-flight action left by an earlier invocation (or this
    /// one, for a scale-up awaiting readiness).
    async fn reconcile(&self, action: ScalingAction) -> Result<TickOutcome> {
        let now = Utc::now();
        let age = now
            .signed_duration_since(action.started_at())
            .to_std()
            .unwrap_or_default();

        match action {
            ScalingAction::ScaleUp {
                action_id,
                launched,
                ..
            } => {
                // An empty launched list (crash between begin and record)
                // can never verify; the timeout below reclaims it.
                if !launched.is_empty() && self.scale_up_verified(&launched).await? {
                    if !applied(self.store.complete_scale_up(action_id, now).await)? {
                        return Ok(TickOutcome::LostRace);
                    }
                    info!(action_id = %action_id, instances = ?launched, "Scale-up verified ready");
                    return Ok(TickOutcome::CompletedScaleUp { action_id });
                }

                if age > self.verify_timeout {
                    warn!(
                        action_id = %action_id,
                        age_secs = age.as_secs(),
                        "Scale-up stuck past verification timeout, abandoning"
                    );
                    self.store.fail_scaling(now).await?;
                    return Ok(TickOutcome::Abandoned { action_id });
                }

                info!(action_id = %action_id, "Scale-up still in flight");
                Ok(TickOutcome::InFlight { action_id })
            }
            ScalingAction::ScaleDown {
                action_id,
                targets,
                completed,
                ..
            } => {
                if age > self.verify_timeout {
                    warn!(
                        action_id = %action_id,
                        age_secs = age.as_secs(),
                        "Scale-down stuck past verification timeout, abandoning"
                    );
                    self.store.fail_scaling(now).await?;
                    return Ok(TickOutcome::Abandoned { action_id });
                }

                self.resume_scale_down(action_id, targets, completed).await
            }
        }
    }

    /// True when every launched instance is present in inventory and its
    /// node reports Ready.
    async fn scale_up_verified(&self, launched: &[String]) -> Result<bool> {
        let (workers, ready) = tokio::join!(self.compute.list_workers(), self.orch.ready_nodes());
        let workers = workers?;
        let ready: BTreeSet<String> = ready?.into_iter().collect();

        Ok(launched.iter().all(|id| {
            workers
                .iter()
                .any(|w| &w.instance_id == id && ready.contains(&w.node_name()))
        }))
    }

    /// Finish a scale-down another invocation started: remove the targets
    /// that still exist, mark the ones already gone, then close the action.
    async fn resume_scale_down(
        &self,
        action_id: ActionId,
        targets: BTreeSet<String>,
        completed: BTreeSet<String>,
    ) -> Result<TickOutcome> {
        let workers = self.compute.list_workers().await?;

        for target in targets.difference(&completed) {
            match workers.iter().find(|w| &w.instance_id == target) {
                Some(worker) => self.remove_worker(worker).await?,
                None => info!(instance = %target, "Target already absent from inventory"),
            }
            if !applied(self.store.mark_scale_down_completed(action_id, target).await)? {
                return Ok(TickOutcome::LostRace);
            }
        }

        if !applied(self.store.complete_scale_down(action_id, Utc::now()).await)? {
            return Ok(TickOutcome::LostRace);
        }

        info!(action_id = %action_id, "Scale-down resumed and completed");
        Ok(TickOutcome::CompletedScaleDown { action_id })
    }

    /// Drain best-effort, then terminate. Drain failure never blocks the
    /// termination.
    async fn remove_worker(&self, worker: &WorkerNode) -> Result<()> {
        let node = worker.node_name();
        if let Err(err) = self.drainer.drain(&node).await {
            warn!(node = %node, error = %err, "Drain failed, terminating anyway");
        }
        self.compute.terminate_worker(&worker.instance_id).await
    }

    /// Compensating path for an interruption notice. Runs outside the lock
    /// and never touches the state record: the provisioner reclaims the
    /// instance whether or not we act, so this is damage control, not a
    /// scaling decision. The replacement ignores cooldowns and bounds; net
    /// capacity is unchanged once the reclaimed node disappears.
    pub async fn handle_interruption(&self, instance_id: &str) {
        info!(instance = instance_id, "Interruption notice received");

        match self.compute.list_workers().await {
            Ok(workers) => match workers.iter().find(|w| w.instance_id == instance_id) {
                Some(worker) => {
                    let node = worker.node_name();
                    if let Err(err) = self.drainer.drain(&node).await {
                        warn!(node = %node, error = %err, "Drain failed ahead of reclaim");
                    }
                }
                None => {
                    info!(instance = instance_id, "Instance not in inventory, skipping drain")
                }
            },
            Err(err) => warn!(error = %err, "Inventory fetch failed, skipping drain"),
        }

        let launched = async {
            let join_token = self.blob.read(&self.join_token_key).await?;
            self.compute.launch_workers(1, &join_token).await
        }
        .await;

        match launched {
            Ok(ids) => info!(instances = ?ids, "Replacement worker launching"),
            Err(err) => error!(error = %err, "Replacement launch failed"),
        }
    }
}

/// `Ok(true)` when a conditional write landed, `Ok(false)` when it lost to a
/// concurrent owner. Backend faults propagate.
fn applied(result: Result<(), StoreError>) -> Result<bool, StoreError> {
    match result {
        Ok(()) => Ok(true),
        Err(StoreError::Conflict(op)) => {
            warn!(op, "Lost conditional write, aborting");
            Ok(false)
        }
        Err(err) => Err(err),
    }
}

fn errored(context: &str, err: anyhow::Error) -> TickOutcome {
    let message = format!("{context}: {err:#}");
    error!(error = %message, "Tick failed");
    TickOutcome::Errored { message }
}
