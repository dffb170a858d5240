use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, SubsecRound, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous},
    Pool, Sqlite,
};
use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};

use shared::{
    domain::{
        ChatMessage, EntityKind, FollowEdge, MessageStatus, MutationId, MutationRecord,
        MutationStatus, NewMutation, PostLike, SyncState,
    },
    protocol::PresenceStatus,
};

mod cache;
mod queue;

pub use cache::{CachedEntity, StoredMessage, StoredPresence};
pub use queue::QueueCounts;

/// Durable ledger of write intents waiting to reach the remote service.
///
/// `enqueue` returns only after the row is committed. `pending_records` yields
/// `PENDING` rows oldest first and never a terminal one.
#[async_trait]
pub trait MutationQueue: Send + Sync {
    async fn enqueue(&self, mutation: NewMutation) -> Result<MutationId>;
    async fn pending_records(&self) -> Result<Vec<MutationRecord>>;
    async fn update_status(&self, id: MutationId, status: MutationStatus) -> Result<()>;
    async fn update_retry(
        &self,
        id: MutationId,
        retry_count: u32,
        status: MutationStatus,
    ) -> Result<()>;
    /// Returns records stuck `IN_PROGRESS` since before `cutoff` to `PENDING`.
    async fn reset_stale(&self, cutoff: DateTime<Utc>) -> Result<u64>;
    /// Deletes terminal records created before `before`.
    async fn purge_terminal(&self, before: DateTime<Utc>) -> Result<u64>;
}

/// Row-level writes against the on-device entity store.
///
/// Every write is a single upsert or delete so the sync worker and the
/// realtime channel can interleave without coordination.
#[async_trait]
pub trait LocalCache: Send + Sync {
    async fn insert_follow(&self, edge: &FollowEdge, state: SyncState) -> Result<()>;
    async fn delete_follow(&self, edge: &FollowEdge) -> Result<()>;
    async fn insert_like(&self, like: &PostLike, state: SyncState) -> Result<()>;
    async fn delete_like(&self, like: &PostLike) -> Result<()>;
    async fn delete_entity(&self, kind: &EntityKind, entity_id: &str) -> Result<()>;
    async fn set_sync_state(
        &self,
        kind: &EntityKind,
        entity_id: &str,
        state: SyncState,
    ) -> Result<()>;
    async fn upsert_message(&self, message: &ChatMessage, status: MessageStatus) -> Result<()>;
    async fn set_message_status(&self, message_id: &str, status: MessageStatus) -> Result<()>;
    async fn update_presence(
        &self,
        user_id: &str,
        status: PresenceStatus,
        seen_at: DateTime<Utc>,
    ) -> Result<()>;
    async fn upsert_reaction(&self, message_id: &str, user_id: &str, emoji: &str) -> Result<()>;
    async fn remove_reaction(&self, message_id: &str, user_id: &str, emoji: &str) -> Result<()>;
}

/// Local change applied together with its queued mutation.
#[derive(Debug, Clone, PartialEq)]
pub enum OptimisticWrite {
    Follow(FollowEdge),
    Unfollow(FollowEdge),
    Like(PostLike),
    Unlike(PostLike),
    SaveEntity {
        kind: EntityKind,
        entity_id: String,
        body: String,
    },
    RemoveEntity {
        kind: EntityKind,
        entity_id: String,
    },
    SendMessage(ChatMessage),
    /// The mutation has no local row, e.g. marking notifications read.
    Nothing,
}

#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Full);
        // Each in-memory connection is its own database.
        let pool = if is_memory_url(database_url) {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(5)
        }
        .connect_with(connect_options)
        .await
        .with_context(|| format!("failed to open database '{database_url}'"))?;
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context("failed to run storage migrations")?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    /// Applies the optimistic local write and appends its mutation in one
    /// transaction, so neither is visible without the other.
    pub async fn apply_and_enqueue(
        &self,
        write: OptimisticWrite,
        mutation: NewMutation,
    ) -> Result<MutationId> {
        let mut tx = self.pool.begin().await?;
        let now = now();
        match &write {
            OptimisticWrite::Follow(edge) => {
                cache::insert_follow_row(&mut *tx, edge, SyncState::Pending, now).await?
            }
            OptimisticWrite::Unfollow(edge) => cache::delete_follow_row(&mut *tx, edge).await?,
            OptimisticWrite::Like(like) => {
                cache::insert_like_row(&mut *tx, like, SyncState::Pending, now).await?
            }
            OptimisticWrite::Unlike(like) => cache::delete_like_row(&mut *tx, like).await?,
            OptimisticWrite::SaveEntity {
                kind,
                entity_id,
                body,
            } => {
                cache::upsert_entity_row(&mut *tx, kind, entity_id, body, SyncState::Pending, now)
                    .await?
            }
            OptimisticWrite::RemoveEntity { kind, entity_id } => {
                cache::delete_entity_row(&mut *tx, kind, entity_id).await?
            }
            OptimisticWrite::SendMessage(message) => {
                cache::upsert_message_row(&mut *tx, message, MessageStatus::Sending).await?
            }
            OptimisticWrite::Nothing => {}
        }
        let id = queue::insert_mutation(&mut *tx, &mutation, now).await?;
        tx.commit()
            .await
            .context("failed to commit optimistic write")?;
        Ok(id)
    }
}

/// Timestamps are stored at millisecond precision so their text form sorts
/// chronologically.
pub(crate) fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(3)
}

fn is_memory_url(database_url: &str) -> bool {
    database_url.contains(":memory:") || database_url.contains("mode=memory")
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if is_memory_url(database_url) || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
