//! Postgres queue store.
//!
//! Every write a worker makes is conditional on the row still being
//! `in_progress` under that worker, so the store stays the sole arbiter of
//! claims even with many dispatchers sharing one table.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use uuid::Uuid;

use super::{Db, WORK_READY_CHANNEL};
use crate::error::{Error, Result};
use crate::model::{Progress, Status, WorkItem, WorkItemId};
use crate::store::{ItemFilter, QueueStore};

const COLUMNS: &str = "id, work_type, status, scheduled_time, expiration_time, payload, progress, \
     retry_count, max_retries, claimed_by, cancel_requested, failure_description, \
     created_at, updated_at, completed_at";

#[async_trait]
impl QueueStore for Db {
    async fn insert_item(&self, item: &WorkItem) -> Result<()> {
        let mut tx = self.pool().begin().await?;
        sqlx::query(
            "INSERT INTO work_items (id, work_type, status, scheduled_time, expiration_time, payload, progress, retry_count, max_retries, claimed_by, cancel_requested, failure_description, created_at, updated_at, completed_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)",
        )
        .bind(item.id.0)
        .bind(&item.work_type)
        .bind(item.status.to_string())
        .bind(item.scheduled_time)
        .bind(item.expiration_time)
        .bind(&item.payload)
        .bind(Json(&item.progress))
        .bind(item.retry_count as i32)
        .bind(item.max_retries.map(|n| n as i32))
        .bind(&item.claimed_by)
        .bind(item.cancel_requested)
        .bind(&item.failure_description)
        .bind(item.created_at)
        .bind(item.updated_at)
        .bind(item.completed_at)
        .execute(&mut *tx)
        .await?;

        // NOTIFY is transactional: only fires on commit
        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(WORK_READY_CHANNEL)
            .bind(&item.work_type)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn get_item(&self, id: WorkItemId) -> Result<WorkItem> {
        let row: Option<WorkItemRow> =
            sqlx::query_as(&format!("SELECT {COLUMNS} FROM work_items WHERE id = $1"))
                .bind(id.0)
                .fetch_optional(self.pool())
                .await?;

        row.ok_or_else(|| Error::NotFound(format!("work item {id}")))?
            .try_into_work_item()
    }

    async fn get_pending_items(&self, work_type: &str, max_items: usize) -> Result<Vec<WorkItem>> {
        let rows: Vec<WorkItemRow> = sqlx::query_as(&format!(
            "SELECT {COLUMNS} FROM work_items
             WHERE work_type = $1 AND status = 'pending' AND scheduled_time <= $2
               AND (expiration_time IS NULL OR expiration_time > $2)
             ORDER BY scheduled_time, seq
             LIMIT $3"
        ))
        .bind(work_type)
        .bind(Utc::now())
        .bind(max_items as i64)
        .fetch_all(self.pool())
        .await?;

        rows.into_iter().map(WorkItemRow::try_into_work_item).collect()
    }

    async fn pending_work_types(&self) -> Result<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT DISTINCT work_type FROM work_items
             WHERE status = 'pending' AND scheduled_time <= $1
               AND (expiration_time IS NULL OR expiration_time > $1)
             ORDER BY work_type",
        )
        .bind(Utc::now())
        .fetch_all(self.pool())
        .await?;

        Ok(rows.into_iter().map(|(t,)| t).collect())
    }

    async fn claim_item(&self, item: &mut WorkItem, worker_id: &str) -> Result<bool> {
        let row: Option<WorkItemRow> = sqlx::query_as(&format!(
            "UPDATE work_items SET status = 'in_progress', claimed_by = $2, updated_at = $3
             WHERE id = $1 AND status = 'pending' AND scheduled_time <= $3
               AND (expiration_time IS NULL OR expiration_time > $3)
             RETURNING {COLUMNS}"
        ))
        .bind(item.id.0)
        .bind(worker_id)
        .bind(Utc::now())
        .fetch_optional(self.pool())
        .await?;

        match row {
            Some(row) => {
                *item = row.try_into_work_item()?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn update_item(&self, item: &WorkItem, worker_id: &str) -> Result<WorkItem> {
        if item.status != Status::InProgress && !Status::InProgress.can_transition_to(item.status) {
            return Err(Error::InvalidTransition {
                from: Status::InProgress,
                to: item.status,
            });
        }

        let row: Option<WorkItemRow> = sqlx::query_as(&format!(
            "UPDATE work_items SET status = $3, scheduled_time = $4, expiration_time = $5, progress = $6,
                 retry_count = $7, claimed_by = $8, failure_description = $9, updated_at = $10, completed_at = $11
             WHERE id = $1 AND status = 'in_progress' AND claimed_by = $2
             RETURNING {COLUMNS}"
        ))
        .bind(item.id.0)
        .bind(worker_id)
        .bind(item.status.to_string())
        .bind(item.scheduled_time)
        .bind(item.expiration_time)
        .bind(Json(&item.progress))
        .bind(item.retry_count as i32)
        .bind(&item.claimed_by)
        .bind(&item.failure_description)
        .bind(item.updated_at)
        .bind(item.completed_at)
        .fetch_optional(self.pool())
        .await?;

        match row {
            Some(row) => row.try_into_work_item(),
            None => {
                // Distinguish a missing row from a lost claim.
                self.get_item(item.id).await?;
                Err(Error::ClaimLost(item.id))
            }
        }
    }

    async fn request_cancel(&self, id: WorkItemId) -> Result<WorkItem> {
        let row: Option<WorkItemRow> = sqlx::query_as(&format!(
            "UPDATE work_items SET
                 status = CASE WHEN status IN ('pending', 'postponed') THEN 'canceled' ELSE status END,
                 completed_at = CASE WHEN status IN ('pending', 'postponed') THEN $2 ELSE completed_at END,
                 cancel_requested = true,
                 updated_at = $2
             WHERE id = $1 AND status IN ('pending', 'postponed', 'in_progress')
             RETURNING {COLUMNS}"
        ))
        .bind(id.0)
        .bind(Utc::now())
        .fetch_optional(self.pool())
        .await?;

        match row {
            Some(row) => row.try_into_work_item(),
            // Terminal (unchanged) or missing.
            None => self.get_item(id).await,
        }
    }

    async fn list_items(&self, filter: &ItemFilter) -> Result<Vec<WorkItem>> {
        let rows: Vec<WorkItemRow> = sqlx::query_as(&format!(
            "SELECT {COLUMNS} FROM work_items
             WHERE ($1::text IS NULL OR status = $1)
               AND ($2::text IS NULL OR work_type = $2)
             ORDER BY scheduled_time DESC, seq DESC
             LIMIT $3"
        ))
        .bind(filter.status.map(|s| s.to_string()))
        .bind(&filter.work_type)
        .bind(filter.limit.map(|n| n as i64))
        .fetch_all(self.pool())
        .await?;

        rows.into_iter().map(WorkItemRow::try_into_work_item).collect()
    }

    async fn reset_in_progress(&self, worker_id: &str) -> Result<Vec<WorkItem>> {
        let rows: Vec<WorkItemRow> = sqlx::query_as(&format!(
            "UPDATE work_items SET
                 status = CASE WHEN cancel_requested THEN 'canceled' ELSE 'pending' END,
                 completed_at = CASE WHEN cancel_requested THEN $2 ELSE completed_at END,
                 claimed_by = NULL,
                 updated_at = $2
             WHERE status = 'in_progress' AND claimed_by = $1
             RETURNING {COLUMNS}"
        ))
        .bind(worker_id)
        .bind(Utc::now())
        .fetch_all(self.pool())
        .await?;

        rows.into_iter().map(WorkItemRow::try_into_work_item).collect()
    }
}

/// Internal row type for sqlx::FromRow.
#[derive(sqlx::FromRow)]
struct WorkItemRow {
    id: Uuid,
    work_type: String,
    status: String,
    scheduled_time: DateTime<Utc>,
    expiration_time: Option<DateTime<Utc>>,
    payload: serde_json::Value,
    progress: Json<Progress>,
    retry_count: i32,
    max_retries: Option<i32>,
    claimed_by: Option<String>,
    cancel_requested: bool,
    failure_description: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
}

impl WorkItemRow {
    fn try_into_work_item(self) -> Result<WorkItem> {
        Ok(WorkItem {
            id: WorkItemId(self.id),
            work_type: self.work_type,
            status: self.status.parse()?,
            scheduled_time: self.scheduled_time,
            expiration_time: self.expiration_time,
            payload: self.payload,
            progress: self.progress.0,
            retry_count: self.retry_count.max(0) as u32,
            max_retries: self.max_retries.map(|n| n.max(0) as u32),
            claimed_by: self.claimed_by,
            cancel_requested: self.cancel_requested,
            failure_description: self.failure_description,
            created_at: self.created_at,
            updated_at: self.updated_at,
            completed_at: self.completed_at,
        })
    }
}
