use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, SubsecRound, Utc};
use sqlx::{Executor, Row, Sqlite};

use shared::{
    domain::{ChatMessage, EntityKind, FollowEdge, MessageStatus, PostLike, SyncState},
    protocol::PresenceStatus,
};

use crate::{now, LocalCache, Storage};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedEntity {
    pub entity_type: EntityKind,
    pub entity_id: String,
    pub body: String,
    pub sync_state: SyncState,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMessage {
    pub message: ChatMessage,
    pub status: MessageStatus,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredPresence {
    pub user_id: String,
    pub status: String,
    pub is_online: bool,
    pub last_seen_at: DateTime<Utc>,
}

pub(crate) async fn insert_follow_row<'e, E>(
    executor: E,
    edge: &FollowEdge,
    state: SyncState,
    created_at: DateTime<Utc>,
) -> Result<()>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query(
        "INSERT INTO follows (follower_id, following_id, sync_state, created_at)
         VALUES (?, ?, ?, ?)
         ON CONFLICT(follower_id, following_id) DO UPDATE SET sync_state = excluded.sync_state",
    )
    .bind(&edge.follower_id)
    .bind(&edge.following_id)
    .bind(state.as_str())
    .bind(created_at)
    .execute(executor)
    .await
    .context("failed to write follow edge")?;
    Ok(())
}

pub(crate) async fn delete_follow_row<'e, E>(executor: E, edge: &FollowEdge) -> Result<()>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query("DELETE FROM follows WHERE follower_id = ? AND following_id = ?")
        .bind(&edge.follower_id)
        .bind(&edge.following_id)
        .execute(executor)
        .await
        .context("failed to delete follow edge")?;
    Ok(())
}

pub(crate) async fn insert_like_row<'e, E>(
    executor: E,
    like: &PostLike,
    state: SyncState,
    created_at: DateTime<Utc>,
) -> Result<()>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query(
        "INSERT INTO likes (user_id, post_id, sync_state, created_at)
         VALUES (?, ?, ?, ?)
         ON CONFLICT(user_id, post_id) DO UPDATE SET sync_state = excluded.sync_state",
    )
    .bind(&like.user_id)
    .bind(&like.post_id)
    .bind(state.as_str())
    .bind(created_at)
    .execute(executor)
    .await
    .context("failed to write like")?;
    Ok(())
}

pub(crate) async fn delete_like_row<'e, E>(executor: E, like: &PostLike) -> Result<()>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query("DELETE FROM likes WHERE user_id = ? AND post_id = ?")
        .bind(&like.user_id)
        .bind(&like.post_id)
        .execute(executor)
        .await
        .context("failed to delete like")?;
    Ok(())
}

pub(crate) async fn upsert_entity_row<'e, E>(
    executor: E,
    kind: &EntityKind,
    entity_id: &str,
    body: &str,
    state: SyncState,
    updated_at: DateTime<Utc>,
) -> Result<()>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query(
        "INSERT INTO entities (entity_type, entity_id, body, sync_state, updated_at)
         VALUES (?, ?, ?, ?, ?)
         ON CONFLICT(entity_type, entity_id) DO UPDATE SET
             body = excluded.body,
             sync_state = excluded.sync_state,
             updated_at = excluded.updated_at",
    )
    .bind(kind.as_str())
    .bind(entity_id)
    .bind(body)
    .bind(state.as_str())
    .bind(updated_at)
    .execute(executor)
    .await
    .with_context(|| format!("failed to write {kind} {entity_id}"))?;
    Ok(())
}

pub(crate) async fn delete_entity_row<'e, E>(
    executor: E,
    kind: &EntityKind,
    entity_id: &str,
) -> Result<()>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query("DELETE FROM entities WHERE entity_type = ? AND entity_id = ?")
        .bind(kind.as_str())
        .bind(entity_id)
        .execute(executor)
        .await
        .with_context(|| format!("failed to delete {kind} {entity_id}"))?;
    Ok(())
}

pub(crate) async fn upsert_message_row<'e, E>(
    executor: E,
    message: &ChatMessage,
    status: MessageStatus,
) -> Result<()>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query(
        "INSERT INTO messages (id, chat_id, sender_id, content, media_url, status, sent_at)
         VALUES (?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(id) DO UPDATE SET
             content = excluded.content,
             media_url = excluded.media_url,
             status = excluded.status",
    )
    .bind(&message.id)
    .bind(&message.chat_id)
    .bind(&message.sender_id)
    .bind(&message.content)
    .bind(&message.media_url)
    .bind(status.as_str())
    .bind(message.sent_at.trunc_subsecs(3))
    .execute(executor)
    .await
    .with_context(|| format!("failed to write message {}", message.id))?;
    Ok(())
}

#[async_trait]
impl LocalCache for Storage {
    async fn insert_follow(&self, edge: &FollowEdge, state: SyncState) -> Result<()> {
        insert_follow_row(&self.pool, edge, state, now()).await
    }

    async fn delete_follow(&self, edge: &FollowEdge) -> Result<()> {
        delete_follow_row(&self.pool, edge).await
    }

    async fn insert_like(&self, like: &PostLike, state: SyncState) -> Result<()> {
        insert_like_row(&self.pool, like, state, now()).await
    }

    async fn delete_like(&self, like: &PostLike) -> Result<()> {
        delete_like_row(&self.pool, like).await
    }

    async fn delete_entity(&self, kind: &EntityKind, entity_id: &str) -> Result<()> {
        delete_entity_row(&self.pool, kind, entity_id).await
    }

    async fn set_sync_state(
        &self,
        kind: &EntityKind,
        entity_id: &str,
        state: SyncState,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE entities SET sync_state = ?, updated_at = ?
             WHERE entity_type = ? AND entity_id = ?",
        )
        .bind(state.as_str())
        .bind(now())
        .bind(kind.as_str())
        .bind(entity_id)
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to set sync state of {kind} {entity_id}"))?;
        Ok(())
    }

    async fn upsert_message(&self, message: &ChatMessage, status: MessageStatus) -> Result<()> {
        upsert_message_row(&self.pool, message, status).await
    }

    async fn set_message_status(&self, message_id: &str, status: MessageStatus) -> Result<()> {
        sqlx::query("UPDATE messages SET status = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(message_id)
            .execute(&self.pool)
            .await
            .with_context(|| format!("failed to set status of message {message_id}"))?;
        Ok(())
    }

    async fn update_presence(
        &self,
        user_id: &str,
        status: PresenceStatus,
        seen_at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO user_presence (user_id, status, is_online, last_seen_at)
             VALUES (?, ?, ?, ?)
             ON CONFLICT(user_id) DO UPDATE SET
                 status = excluded.status,
                 is_online = excluded.is_online,
                 last_seen_at = excluded.last_seen_at",
        )
        .bind(user_id)
        .bind(status.as_str())
        .bind(status.is_online())
        .bind(seen_at.trunc_subsecs(3))
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to update presence of {user_id}"))?;
        Ok(())
    }

    async fn upsert_reaction(&self, message_id: &str, user_id: &str, emoji: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO message_reactions (message_id, user_id, emoji, created_at)
             VALUES (?, ?, ?, ?)
             ON CONFLICT(message_id, user_id, emoji) DO NOTHING",
        )
        .bind(message_id)
        .bind(user_id)
        .bind(emoji)
        .bind(now())
        .execute(&self.pool)
        .await
        .context("failed to write reaction")?;
        Ok(())
    }

    async fn remove_reaction(&self, message_id: &str, user_id: &str, emoji: &str) -> Result<()> {
        sqlx::query(
            "DELETE FROM message_reactions WHERE message_id = ? AND user_id = ? AND emoji = ?",
        )
        .bind(message_id)
        .bind(user_id)
        .bind(emoji)
        .execute(&self.pool)
        .await
        .context("failed to remove reaction")?;
        Ok(())
    }
}

impl Storage {
    pub async fn follow_state(&self, edge: &FollowEdge) -> Result<Option<SyncState>> {
        let row = sqlx::query(
            "SELECT sync_state FROM follows WHERE follower_id = ? AND following_id = ?",
        )
        .bind(&edge.follower_id)
        .bind(&edge.following_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| parse_sync_state(&r.get::<String, _>(0)))
            .transpose()
    }

    pub async fn like_state(&self, like: &PostLike) -> Result<Option<SyncState>> {
        let row = sqlx::query("SELECT sync_state FROM likes WHERE user_id = ? AND post_id = ?")
            .bind(&like.user_id)
            .bind(&like.post_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| parse_sync_state(&r.get::<String, _>(0)))
            .transpose()
    }

    pub async fn save_entity(
        &self,
        kind: &EntityKind,
        entity_id: &str,
        body: &str,
        state: SyncState,
    ) -> Result<()> {
        upsert_entity_row(&self.pool, kind, entity_id, body, state, now()).await
    }

    pub async fn entity(&self, kind: &EntityKind, entity_id: &str) -> Result<Option<CachedEntity>> {
        let row = sqlx::query(
            "SELECT body, sync_state FROM entities WHERE entity_type = ? AND entity_id = ?",
        )
        .bind(kind.as_str())
        .bind(entity_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| {
            Ok(CachedEntity {
                entity_type: kind.clone(),
                entity_id: entity_id.to_string(),
                body: r.get::<String, _>(0),
                sync_state: parse_sync_state(&r.get::<String, _>(1))?,
            })
        })
        .transpose()
    }

    pub async fn message(&self, message_id: &str) -> Result<Option<StoredMessage>> {
        let row = sqlx::query(
            "SELECT id, chat_id, sender_id, content, media_url, status, sent_at
             FROM messages WHERE id = ?",
        )
        .bind(message_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| {
            let status = r
                .get::<String, _>(5)
                .parse::<MessageStatus>()
                .map_err(|err| anyhow!(err))?;
            Ok(StoredMessage {
                message: ChatMessage {
                    id: r.get::<String, _>(0),
                    chat_id: r.get::<String, _>(1),
                    sender_id: r.get::<String, _>(2),
                    content: r.get::<String, _>(3),
                    media_url: r.get::<Option<String>, _>(4),
                    sent_at: r.get::<DateTime<Utc>, _>(6),
                },
                status,
            })
        })
        .transpose()
    }

    /// `(user_id, emoji)` pairs reacting to a message.
    pub async fn reactions(&self, message_id: &str) -> Result<Vec<(String, String)>> {
        let rows = sqlx::query(
            "SELECT user_id, emoji FROM message_reactions
             WHERE message_id = ? ORDER BY created_at ASC, user_id ASC",
        )
        .bind(message_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|r| (r.get::<String, _>(0), r.get::<String, _>(1)))
            .collect())
    }

    pub async fn presence(&self, user_id: &str) -> Result<Option<StoredPresence>> {
        let row = sqlx::query(
            "SELECT user_id, status, is_online, last_seen_at FROM user_presence WHERE user_id = ?",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| StoredPresence {
            user_id: r.get::<String, _>(0),
            status: r.get::<String, _>(1),
            is_online: r.get::<bool, _>(2),
            last_seen_at: r.get::<DateTime<Utc>, _>(3),
        }))
    }
}

fn parse_sync_state(value: &str) -> Result<SyncState> {
    value.parse::<SyncState>().map_err(|err| anyhow!(err))
}
