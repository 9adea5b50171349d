//! Postgres state store.
//!
//! One `cluster_state` row per cluster. Every transition is a single
//! conditional `UPDATE`; `rows_affected == 0` means the condition did not
//! hold and the caller lost a race. No transition ever reads the row first,
//! so there is no read-modify-write window to race through. The scale-down
//! completion append mutates the JSONB payload server-side for the same
//! reason: two owners marking different victims must both land.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use smartscale_id::{ActionId, RequestId};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use tracing::info;

use super::{ClusterState, ScalingAction, StateStore, StoreError};
use std::collections::BTreeSet;

const SCHEMA: &str = include_str!("../../schema/cluster_state.sql");

#[derive(Clone)]
pub struct PgStateStore {
    pool: PgPool,
    cluster: String,
}

impl PgStateStore {
    /// Connect, apply the bundled schema, and seed the cluster's row so every
    /// later operation can assume the record exists.
    pub async fn connect(database_url: &str, cluster: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(5))
            .connect(database_url)
            .await
            .map_err(StoreError::Connect)?;

        let store = Self {
            pool,
            cluster: cluster.to_string(),
        };
        store.ensure_schema().await?;
        store.ensure_row().await?;

        info!(cluster, "Cluster state store ready");
        Ok(store)
    }

    async fn ensure_schema(&self) -> Result<(), StoreError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&self.pool)
            .await
            .map_err(StoreError::Query)?;
        Ok(())
    }

    async fn ensure_row(&self) -> Result<(), StoreError> {
        sqlx::query("INSERT INTO cluster_state (cluster) VALUES ($1) ON CONFLICT (cluster) DO NOTHING")
            .bind(&self.cluster)
            .execute(&self.pool)
            .await
            .map_err(StoreError::Query)?;
        Ok(())
    }

    /// `Ok` iff the conditional update landed on exactly one row.
    fn conditional(&self, rows: u64, op: &'static str) -> Result<(), StoreError> {
        if rows == 1 {
            Ok(())
        } else {
            Err(StoreError::Conflict(op))
        }
    }
}

impl<'r> sqlx::FromRow<'r, PgRow> for ClusterState {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        let action: Option<serde_json::Value> = row.try_get("action")?;
        let action: Option<ScalingAction> = action
            .map(serde_json::from_value)
            .transpose()
            .map_err(|e| sqlx::Error::ColumnDecode {
                index: "action".to_string(),
                source: Box::new(e),
            })?;

        let lock_owner: Option<String> = row.try_get("lock_owner")?;
        let lock_owner: Option<RequestId> = lock_owner
            .map(|s| s.parse())
            .transpose()
            .map_err(|e| sqlx::Error::ColumnDecode {
                index: "lock_owner".to_string(),
                source: Box::new(e),
            })?;

        Ok(Self {
            cluster: row.try_get("cluster")?,
            scaling_in_progress: row.try_get("scaling_in_progress")?,
            last_scale_at: row.try_get("last_scale_at")?,
            worker_count: row.try_get("worker_count")?,
            action,
            lock_owner,
            lock_expires_at: row.try_get("lock_expires_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

#[async_trait]
impl StateStore for PgStateStore {
    async fn get(&self) -> Result<ClusterState, StoreError> {
        sqlx::query_as::<_, ClusterState>("SELECT * FROM cluster_state WHERE cluster = $1")
            .bind(&self.cluster)
            .fetch_optional(&self.pool)
            .await
            .map_err(StoreError::Query)?
            .ok_or_else(|| StoreError::NotFound(self.cluster.clone()))
    }

    async fn acquire_lock(
        &self,
        owner: RequestId,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE cluster_state
            SET lock_owner = $2, lock_expires_at = $3, updated_at = $4
            WHERE cluster = $1
              AND (lock_owner IS NULL OR lock_owner = $2 OR lock_expires_at < $4)
            "#,
        )
        .bind(&self.cluster)
        .bind(owner.to_string())
        .bind(now + ttl)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(StoreError::Query)?;

        Ok(result.rows_affected() == 1)
    }

    async fn release_lock(&self, owner: RequestId) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE cluster_state
            SET lock_owner = NULL, lock_expires_at = NULL, updated_at = now()
            WHERE cluster = $1 AND lock_owner = $2
            "#,
        )
        .bind(&self.cluster)
        .bind(owner.to_string())
        .execute(&self.pool)
        .await
        .map_err(StoreError::Query)?;

        Ok(result.rows_affected() == 1)
    }

    async fn begin_scale_up(
        &self,
        action_id: ActionId,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let action = ScalingAction::ScaleUp {
            action_id,
            started_at: now,
            launched: Vec::new(),
        };
        let payload = serde_json::to_value(&action)?;

        let result = sqlx::query(
            r#"
            UPDATE cluster_state
            SET scaling_in_progress = TRUE, action = $3, action_id = $2, updated_at = $4
            WHERE cluster = $1 AND scaling_in_progress = FALSE
            "#,
        )
        .bind(&self.cluster)
        .bind(action_id.to_string())
        .bind(&payload)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(StoreError::Query)?;

        self.conditional(result.rows_affected(), "begin_scale_up")
    }

    async fn record_scale_up_instances(
        &self,
        action_id: ActionId,
        instance_ids: &[String],
    ) -> Result<(), StoreError> {
        let launched = serde_json::to_value(instance_ids)?;

        let result = sqlx::query(
            r#"
            UPDATE cluster_state
            SET action = jsonb_set(action, '{launched}', $3), updated_at = $4
            WHERE cluster = $1 AND action_id = $2 AND action->>'kind' = 'scale_up'
            "#,
        )
        .bind(&self.cluster)
        .bind(action_id.to_string())
        .bind(&launched)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(StoreError::Query)?;

        self.conditional(result.rows_affected(), "record_scale_up_instances")
    }

    async fn complete_scale_up(
        &self,
        action_id: ActionId,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE cluster_state
            SET scaling_in_progress = FALSE, action = NULL, action_id = NULL,
                last_scale_at = $3, updated_at = $3
            WHERE cluster = $1 AND action_id = $2 AND action->>'kind' = 'scale_up'
            "#,
        )
        .bind(&self.cluster)
        .bind(action_id.to_string())
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(StoreError::Query)?;

        self.conditional(result.rows_affected(), "complete_scale_up")
    }

    async fn begin_scale_down(
        &self,
        action_id: ActionId,
        now: DateTime<Utc>,
        targets: &BTreeSet<String>,
    ) -> Result<(), StoreError> {
        let action = ScalingAction::ScaleDown {
            action_id,
            started_at: now,
            targets: targets.clone(),
            completed: BTreeSet::new(),
        };
        let payload = serde_json::to_value(&action)?;

        let result = sqlx::query(
            r#"
            UPDATE cluster_state
            SET scaling_in_progress = TRUE, action = $3, action_id = $2, updated_at = $4
            WHERE cluster = $1 AND scaling_in_progress = FALSE
            "#,
        )
        .bind(&self.cluster)
        .bind(action_id.to_string())
        .bind(&payload)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(StoreError::Query)?;

        self.conditional(result.rows_affected(), "begin_scale_down")
    }

    async fn mark_scale_down_completed(
        &self,
        action_id: ActionId,
        instance_id: &str,
    ) -> Result<(), StoreError> {
        // Server-side set append: already-present ids rewrite the same array,
        // so a retried mark succeeds without duplicating the entry.
        let result = sqlx::query(
            r#"
            UPDATE cluster_state
            SET action = jsonb_set(
                    action,
                    '{completed}',
                    CASE
                        WHEN action->'completed' ? $3 THEN action->'completed'
                        ELSE (action->'completed') || to_jsonb($3::text)
                    END
                ),
                updated_at = $4
            WHERE cluster = $1 AND action_id = $2 AND action->>'kind' = 'scale_down'
            "#,
        )
        .bind(&self.cluster)
        .bind(action_id.to_string())
        .bind(instance_id)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(StoreError::Query)?;

        self.conditional(result.rows_affected(), "mark_scale_down_completed")
    }

    async fn complete_scale_down(
        &self,
        action_id: ActionId,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE cluster_state
            SET scaling_in_progress = FALSE, action = NULL, action_id = NULL,
                last_scale_at = $3, updated_at = $3
            WHERE cluster = $1 AND action_id = $2 AND action->>'kind' = 'scale_down'
            "#,
        )
        .bind(&self.cluster)
        .bind(action_id.to_string())
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(StoreError::Query)?;

        self.conditional(result.rows_affected(), "complete_scale_down")
    }

    async fn fail_scaling(&self, now: DateTime<Utc>) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE cluster_state
            SET scaling_in_progress = FALSE, action = NULL, action_id = NULL, updated_at = $2
            WHERE cluster = $1
            "#,
        )
        .bind(&self.cluster)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(StoreError::Query)?;

        if result.rows_affected() == 1 {
            Ok(())
        } else {
            Err(StoreError::NotFound(self.cluster.clone()))
        }
    }

    async fn record_worker_count(&self, count: usize) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE cluster_state SET worker_count = $2, updated_at = $3 WHERE cluster = $1",
        )
        .bind(&self.cluster)
        .bind(count as i64)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(StoreError::Query)?;

        if result.rows_affected() == 1 {
            Ok(())
        } else {
            Err(StoreError::NotFound(self.cluster.clone()))
        }
    }
}
