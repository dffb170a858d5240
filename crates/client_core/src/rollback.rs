use anyhow::Result;
use shared::domain::{
    split_composite_id, EntityKind, FollowEdge, MessageStatus, MutationRecord, OperationKind,
    PostLike, SyncState,
};
use storage::LocalCache;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RollbackAction {
    RemoveFollow(FollowEdge),
    RestoreFollow(FollowEdge),
    RemoveLike(PostLike),
    RestoreLike(PostLike),
    RemoveEntity { kind: EntityKind, entity_id: String },
    MarkEntityFailed { kind: EntityKind, entity_id: String },
    MarkMessageFailed { message_id: String },
}

pub fn plan_rollback(record: &MutationRecord) -> Option<RollbackAction> {
    let entity_id = record.entity_id.clone();
    match (&record.entity_type, record.operation) {
        (EntityKind::Follow, OperationKind::Create) => {
            follow_edge(&record.entity_id).map(RollbackAction::RemoveFollow)
        }
        (EntityKind::Follow, OperationKind::Delete) => {
            follow_edge(&record.entity_id).map(RollbackAction::RestoreFollow)
        }
        (EntityKind::Like, OperationKind::Create) => {
            post_like(&record.entity_id).map(RollbackAction::RemoveLike)
        }
        (EntityKind::Like, OperationKind::Delete) => {
            post_like(&record.entity_id).map(RollbackAction::RestoreLike)
        }
        (EntityKind::Comment | EntityKind::Post, OperationKind::Create) => {
            Some(RollbackAction::RemoveEntity {
                kind: record.entity_type.clone(),
                entity_id,
            })
        }
        // Durable user records stay on the device so the user can retry them.
        (
            EntityKind::Task
            | EntityKind::Workout
            | EntityKind::Habit
            | EntityKind::Challenge
            | EntityKind::Habitat
            | EntityKind::Story,
            OperationKind::Create,
        ) => Some(RollbackAction::MarkEntityFailed {
            kind: record.entity_type.clone(),
            entity_id,
        }),
        (EntityKind::ChatMessage, OperationKind::Create) => {
            Some(RollbackAction::MarkMessageFailed {
                message_id: entity_id,
            })
        }
        _ => None,
    }
}

pub async fn apply_rollback(cache: &dyn LocalCache, action: &RollbackAction) -> Result<()> {
    match action {
        RollbackAction::RemoveFollow(edge) => cache.delete_follow(edge).await,
        RollbackAction::RestoreFollow(edge) => cache.insert_follow(edge, SyncState::Synced).await,
        RollbackAction::RemoveLike(like) => cache.delete_like(like).await,
        RollbackAction::RestoreLike(like) => cache.insert_like(like, SyncState::Synced).await,
        RollbackAction::RemoveEntity { kind, entity_id } => {
            cache.delete_entity(kind, entity_id).await
        }
        RollbackAction::MarkEntityFailed { kind, entity_id } => {
            cache
                .set_sync_state(kind, entity_id, SyncState::Failed)
                .await
        }
        RollbackAction::MarkMessageFailed { message_id } => {
            cache
                .set_message_status(message_id, MessageStatus::Failed)
                .await
        }
    }
}

fn follow_edge(entity_id: &str) -> Option<FollowEdge> {
    split_composite_id(entity_id).map(|(follower, following)| FollowEdge::new(follower, following))
}

fn post_like(entity_id: &str) -> Option<PostLike> {
    split_composite_id(entity_id).map(|(user, post)| PostLike::new(user, post))
}

#[cfg(test)]
#[path = "tests/rollback_tests.rs"]
mod tests;
