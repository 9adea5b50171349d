//! Cluster scaling state.
//!
//! One record per cluster tracks whether an action is in flight, what that
//! action is, when the last action completed, and who holds the coordination
//! lock. Every mutation is a *conditional* transition: callers never
//! read-modify-write, they ask the store to apply a change that only succeeds
//! if the record is still in the expected shape. A failed condition surfaces
//! as [`StoreError::Conflict`] and means another invocation got there first.
//!
//! Two implementations: [`PgStateStore`] (Postgres, production) and
//! [`MemoryStateStore`] (single-process dev and tests). Both enforce the same
//! transition conditions, so code exercised against one behaves the same
//! against the other.

mod memory;
mod postgres;

pub use memory::MemoryStateStore;
pub use postgres::PgStateStore;

use std::collections::BTreeSet;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use smartscale_id::{ActionId, RequestId};
use thiserror::Error;

/// State store operation errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A conditional transition found the record in a different shape than
    /// expected. The caller lost a race and must abort without retrying.
    #[error("conditional update rejected during {0}")]
    Conflict(&'static str),

    /// No state record exists for the cluster.
    #[error("no state record for cluster '{0}'")]
    NotFound(String),

    /// Failed to connect to the backend.
    #[error("failed to connect to state backend: {0}")]
    Connect(#[source] sqlx::Error),

    /// A query failed for backend reasons.
    #[error("state query failed: {0}")]
    Query(#[source] sqlx::Error),

    /// Stored action payload could not be serialized or parsed.
    #[error("action serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// An in-flight scaling action, persisted so a later invocation can pick up
/// where a crashed or still-working one left off.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ScalingAction {
    /// Capacity is being added. `launched` is empty between beginning the
    /// action and recording the launch result; instances appear here as soon
    /// as the provisioner accepts the request.
    ScaleUp {
        action_id: ActionId,
        started_at: DateTime<Utc>,
        launched: Vec<String>,
    },
    /// Capacity is being removed. `completed` grows toward `targets` as each
    /// victim is drained and terminated.
    ScaleDown {
        action_id: ActionId,
        started_at: DateTime<Utc>,
        targets: BTreeSet<String>,
        completed: BTreeSet<String>,
    },
}

impl ScalingAction {
    pub fn started_at(&self) -> DateTime<Utc> {
        match self {
            ScalingAction::ScaleUp { started_at, .. }
            | ScalingAction::ScaleDown { started_at, .. } => *started_at,
        }
    }
}

/// The persisted scaling record for one cluster.
///
/// `worker_count` is an informational snapshot refreshed each tick; live
/// provisioner inventory is authoritative for decisions. Invariant:
/// `scaling_in_progress` is true exactly when `action` is present.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterState {
    pub cluster: String,
    pub scaling_in_progress: bool,
    pub last_scale_at: DateTime<Utc>,
    pub worker_count: i64,
    pub action: Option<ScalingAction>,
    pub lock_owner: Option<RequestId>,
    pub lock_expires_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl ClusterState {
    /// The initial record for a cluster that has never scaled.
    ///
    /// `last_scale_at` starts at the epoch so the first decision is not
    /// blocked by a cooldown that never ran.
    pub fn initial(cluster: &str, now: DateTime<Utc>) -> Self {
        Self {
            cluster: cluster.to_string(),
            scaling_in_progress: false,
            last_scale_at: DateTime::UNIX_EPOCH,
            worker_count: 0,
            action: None,
            lock_owner: None,
            lock_expires_at: None,
            updated_at: now,
        }
    }
}

/// Conditional operations on the cluster scaling record.
///
/// Lock operations return `Ok(false)` when the condition does not hold; that
/// is an expected outcome (someone else holds the lock), not an error.
/// Action transitions instead return [`StoreError::Conflict`], because a
/// caller inside the lock should never lose an action race unless something
/// external reset the record.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Read the current record.
    async fn get(&self) -> Result<ClusterState, StoreError>;

    /// Try to take the coordination lock. Succeeds when the lock is free,
    /// already held by `owner`, or held but expired. Never blocks.
    async fn acquire_lock(
        &self,
        owner: RequestId,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Release the lock if `owner` still holds it. A `false` return means
    /// the lock moved on (TTL reclaim); callers log and continue.
    async fn release_lock(&self, owner: RequestId) -> Result<bool, StoreError>;

    /// Open a scale-up action. Fails with `Conflict` if any action is
    /// already in progress.
    async fn begin_scale_up(
        &self,
        action_id: ActionId,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Record the instances the provisioner accepted for an open scale-up.
    async fn record_scale_up_instances(
        &self,
        action_id: ActionId,
        instance_ids: &[String],
    ) -> Result<(), StoreError>;

    /// Close a scale-up: clears the action and stamps `last_scale_at`.
    async fn complete_scale_up(
        &self,
        action_id: ActionId,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Open a scale-down action against the given victims.
    async fn begin_scale_down(
        &self,
        action_id: ActionId,
        now: DateTime<Utc>,
        targets: &BTreeSet<String>,
    ) -> Result<(), StoreError>;

    /// Mark one victim as drained and terminated. Set semantics: marking an
    /// instance twice is not an error, so a retried step stays idempotent.
    async fn mark_scale_down_completed(
        &self,
        action_id: ActionId,
        instance_id: &str,
    ) -> Result<(), StoreError>;

    /// Close a scale-down: clears the action and stamps `last_scale_at`.
    async fn complete_scale_down(
        &self,
        action_id: ActionId,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Escape hatch: clear any in-flight action unconditionally. Does *not*
    /// stamp `last_scale_at`; a failed action should not restart cooldowns.
    async fn fail_scaling(&self, now: DateTime<Utc>) -> Result<(), StoreError>;

    /// Refresh the informational worker-count snapshot.
    async fn record_worker_count(&self, count: usize) -> Result<(), StoreError>;
}
