//! In-memory state store.
//!
//! Same conditional semantics as the Postgres store behind a process-local
//! mutex. Selected with `SCALE_STATE_BACKEND=memory` for single-process
//! development; also the backend the orchestrator unit tests run against.
//! The lock still arbitrates between the periodic worker and manual ticks
//! inside one process, but cannot coordinate across replicas.

use std::collections::BTreeSet;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use smartscale_id::{ActionId, RequestId};
use tokio::sync::Mutex;

use super::{ClusterState, ScalingAction, StateStore, StoreError};

pub struct MemoryStateStore {
    state: Mutex<ClusterState>,
}

impl MemoryStateStore {
    pub fn new(cluster: &str, now: DateTime<Utc>) -> Self {
        Self {
            state: Mutex::new(ClusterState::initial(cluster, now)),
        }
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn get(&self) -> Result<ClusterState, StoreError> {
        Ok(self.state.lock().await.clone())
    }

    async fn acquire_lock(
        &self,
        owner: RequestId,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;

        let free = match (state.lock_owner, state.lock_expires_at) {
            (None, _) => true,
            (Some(held_by), _) if held_by == owner => true,
            (Some(_), Some(expires_at)) => expires_at < now,
            (Some(_), None) => false,
        };
        if !free {
            return Ok(false);
        }

        state.lock_owner = Some(owner);
        state.lock_expires_at = Some(now + ttl);
        state.updated_at = now;
        Ok(true)
    }

    async fn release_lock(&self, owner: RequestId) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        if state.lock_owner != Some(owner) {
            return Ok(false);
        }
        state.lock_owner = None;
        state.lock_expires_at = None;
        Ok(true)
    }

    async fn begin_scale_up(
        &self,
        action_id: ActionId,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        if state.scaling_in_progress {
            return Err(StoreError::Conflict("begin_scale_up"));
        }
        state.scaling_in_progress = true;
        state.action = Some(ScalingAction::ScaleUp {
            action_id,
            started_at: now,
            launched: Vec::new(),
        });
        state.updated_at = now;
        Ok(())
    }

    async fn record_scale_up_instances(
        &self,
        action_id: ActionId,
        instance_ids: &[String],
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        match &mut state.action {
            Some(ScalingAction::ScaleUp { action_id: id, launched, .. }) if *id == action_id => {
                *launched = instance_ids.to_vec();
                Ok(())
            }
            _ => Err(StoreError::Conflict("record_scale_up_instances")),
        }
    }

    async fn complete_scale_up(
        &self,
        action_id: ActionId,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        match &state.action {
            Some(ScalingAction::ScaleUp { action_id: id, .. }) if *id == action_id => {
                state.scaling_in_progress = false;
                state.action = None;
                state.last_scale_at = now;
                state.updated_at = now;
                Ok(())
            }
            _ => Err(StoreError::Conflict("complete_scale_up")),
        }
    }

    async fn begin_scale_down(
        &self,
        action_id: ActionId,
        now: DateTime<Utc>,
        targets: &BTreeSet<String>,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        if state.scaling_in_progress {
            return Err(StoreError::Conflict("begin_scale_down"));
        }
        state.scaling_in_progress = true;
        state.action = Some(ScalingAction::ScaleDown {
            action_id,
            started_at: now,
            targets: targets.clone(),
            completed: BTreeSet::new(),
        });
        state.updated_at = now;
        Ok(())
    }

    async fn mark_scale_down_completed(
        &self,
        action_id: ActionId,
        instance_id: &str,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        match &mut state.action {
            Some(ScalingAction::ScaleDown { action_id: id, completed, .. })
                if *id == action_id =>
            {
                completed.insert(instance_id.to_string());
                Ok(())
            }
            _ => Err(StoreError::Conflict("mark_scale_down_completed")),
        }
    }

    async fn complete_scale_down(
        &self,
        action_id: ActionId,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        match &state.action {
            Some(ScalingAction::ScaleDown { action_id: id, .. }) if *id == action_id => {
                state.scaling_in_progress = false;
                state.action = None;
                state.last_scale_at = now;
                state.updated_at = now;
                Ok(())
            }
            _ => Err(StoreError::Conflict("complete_scale_down")),
        }
    }

    async fn fail_scaling(&self, now: DateTime<Utc>) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.scaling_in_progress = false;
        state.action = None;
        state.updated_at = now;
        Ok(())
    }

    async fn record_worker_count(&self, count: usize) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.worker_count = count as i64;
        state.updated_at = Utc::now();
        Ok(())
    }
}
