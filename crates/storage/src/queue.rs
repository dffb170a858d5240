use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, SubsecRound, Utc};
use sqlx::{sqlite::SqliteRow, Executor, Row, Sqlite};
use tracing::debug;

use shared::domain::{
    EntityKind, MutationId, MutationRecord, MutationStatus, NewMutation, OperationKind,
};

use crate::{now, MutationQueue, Storage};

const RECORD_COLUMNS: &str = "id, entity_type, entity_id, operation, payload, status, \
                              retry_count, created_at, last_attempt_at";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueCounts {
    pub pending: u64,
    pub in_progress: u64,
    pub completed: u64,
    pub failed: u64,
}

pub(crate) async fn insert_mutation<'e, E>(
    executor: E,
    mutation: &NewMutation,
    created_at: DateTime<Utc>,
) -> Result<MutationId>
where
    E: Executor<'e, Database = Sqlite>,
{
    let id: i64 = sqlx::query_scalar(
        "INSERT INTO sync_queue (entity_type, entity_id, operation, payload, status, retry_count, created_at)
         VALUES (?, ?, ?, ?, 'PENDING', 0, ?)
         RETURNING id",
    )
    .bind(mutation.entity_type.as_str())
    .bind(&mutation.entity_id)
    .bind(mutation.operation.as_str())
    .bind(&mutation.payload)
    .bind(created_at)
    .fetch_one(executor)
    .await
    .context("failed to enqueue mutation")?;
    Ok(MutationId(id))
}

fn record_from_row(row: &SqliteRow) -> Result<MutationRecord> {
    let operation = row
        .get::<String, _>("operation")
        .parse::<OperationKind>()
        .map_err(|err| anyhow!(err))?;
    let status = row
        .get::<String, _>("status")
        .parse::<MutationStatus>()
        .map_err(|err| anyhow!(err))?;
    let retry_count = u32::try_from(row.get::<i64, _>("retry_count"))
        .context("retry_count out of range")?;
    Ok(MutationRecord {
        id: MutationId(row.get::<i64, _>("id")),
        entity_type: EntityKind::from_tag(&row.get::<String, _>("entity_type")),
        entity_id: row.get::<String, _>("entity_id"),
        operation,
        payload: row.get::<String, _>("payload"),
        status,
        retry_count,
        created_at: row.get::<DateTime<Utc>, _>("created_at"),
        last_attempt_at: row.get::<Option<DateTime<Utc>>, _>("last_attempt_at"),
    })
}

#[async_trait]
impl MutationQueue for Storage {
    async fn enqueue(&self, mutation: NewMutation) -> Result<MutationId> {
        let id = insert_mutation(&self.pool, &mutation, now()).await?;
        debug!(
            mutation_id = id.0,
            entity_type = %mutation.entity_type,
            operation = %mutation.operation,
            "queue: enqueued mutation"
        );
        Ok(id)
    }

    async fn pending_records(&self) -> Result<Vec<MutationRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {RECORD_COLUMNS} FROM sync_queue
             WHERE status = 'PENDING'
             ORDER BY created_at ASC, id ASC"
        ))
        .fetch_all(&self.pool)
        .await
        .context("failed to load pending mutations")?;
        rows.iter().map(record_from_row).collect()
    }

    async fn update_status(&self, id: MutationId, status: MutationStatus) -> Result<()> {
        let result = sqlx::query(
            "UPDATE sync_queue
             SET status = ?1,
                 last_attempt_at = CASE WHEN ?1 = 'IN_PROGRESS' THEN ?2 ELSE last_attempt_at END
             WHERE id = ?3 AND status NOT IN ('COMPLETED', 'FAILED')",
        )
        .bind(status.as_str())
        .bind(now())
        .bind(id.0)
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to set mutation {id} to {status}"))?;
        if result.rows_affected() == 0 {
            debug!(mutation_id = id.0, %status, "queue: status update ignored for terminal or missing record");
        }
        Ok(())
    }

    async fn update_retry(
        &self,
        id: MutationId,
        retry_count: u32,
        status: MutationStatus,
    ) -> Result<()> {
        let result = sqlx::query(
            "UPDATE sync_queue
             SET retry_count = MAX(retry_count, ?1), status = ?2
             WHERE id = ?3 AND status NOT IN ('COMPLETED', 'FAILED')",
        )
        .bind(i64::from(retry_count))
        .bind(status.as_str())
        .bind(id.0)
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to record retry for mutation {id}"))?;
        if result.rows_affected() == 0 {
            debug!(mutation_id = id.0, "queue: retry update ignored for terminal or missing record");
        }
        Ok(())
    }

    async fn reset_stale(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE sync_queue SET status = 'PENDING'
             WHERE status = 'IN_PROGRESS' AND COALESCE(last_attempt_at, created_at) < ?",
        )
        .bind(cutoff.trunc_subsecs(3))
        .execute(&self.pool)
        .await
        .context("failed to reset stale mutations")?;
        Ok(result.rows_affected())
    }

    async fn purge_terminal(&self, before: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM sync_queue
             WHERE status IN ('COMPLETED', 'FAILED') AND created_at < ?",
        )
        .bind(before.trunc_subsecs(3))
        .execute(&self.pool)
        .await
        .context("failed to purge terminal mutations")?;
        Ok(result.rows_affected())
    }
}

impl Storage {
    pub async fn record(&self, id: MutationId) -> Result<Option<MutationRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {RECORD_COLUMNS} FROM sync_queue WHERE id = ?"
        ))
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(record_from_row).transpose()
    }

    /// Every record regardless of status, oldest first.
    pub async fn all_records(&self) -> Result<Vec<MutationRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {RECORD_COLUMNS} FROM sync_queue ORDER BY created_at ASC, id ASC"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(record_from_row).collect()
    }

    pub async fn queue_counts(&self) -> Result<QueueCounts> {
        let rows = sqlx::query("SELECT status, COUNT(*) FROM sync_queue GROUP BY status")
            .fetch_all(&self.pool)
            .await?;
        let mut counts = QueueCounts::default();
        for row in rows {
            let count = u64::try_from(row.get::<i64, _>(1)).unwrap_or_default();
            match row.get::<String, _>(0).parse::<MutationStatus>() {
                Ok(MutationStatus::Pending) => counts.pending = count,
                Ok(MutationStatus::InProgress) => counts.in_progress = count,
                Ok(MutationStatus::Completed) => counts.completed = count,
                Ok(MutationStatus::Failed) => counts.failed = count,
                Err(err) => return Err(anyhow!(err)),
            }
        }
        Ok(counts)
    }
}
