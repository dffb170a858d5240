use super::*;
use crate::test_support::memory_storage;
use chrono::Utc;
use shared::domain::{ChatMessage, MutationId, MutationStatus};

fn failed(entity_type: EntityKind, entity_id: &str, operation: OperationKind) -> MutationRecord {
    MutationRecord {
        id: MutationId(1),
        entity_type,
        entity_id: entity_id.to_string(),
        operation,
        payload: "{}".into(),
        status: MutationStatus::Failed,
        retry_count: 5,
        created_at: Utc::now(),
        last_attempt_at: None,
    }
}

#[test]
fn relationship_rollbacks_invert_the_optimistic_write() {
    assert_eq!(
        plan_rollback(&failed(EntityKind::Follow, "me_u2", OperationKind::Create)),
        Some(RollbackAction::RemoveFollow(FollowEdge::new("me", "u2")))
    );
    assert_eq!(
        plan_rollback(&failed(EntityKind::Follow, "me_u2", OperationKind::Delete)),
        Some(RollbackAction::RestoreFollow(FollowEdge::new("me", "u2")))
    );
    assert_eq!(
        plan_rollback(&failed(EntityKind::Like, "me_p1", OperationKind::Create)),
        Some(RollbackAction::RemoveLike(PostLike::new("me", "p1")))
    );
    assert_eq!(
        plan_rollback(&failed(EntityKind::Like, "me_p1", OperationKind::Delete)),
        Some(RollbackAction::RestoreLike(PostLike::new("me", "p1")))
    );
}

#[test]
fn created_content_is_removed_but_user_records_are_kept() {
    for kind in [EntityKind::Comment, EntityKind::Post] {
        assert_eq!(
            plan_rollback(&failed(kind.clone(), "x1", OperationKind::Create)),
            Some(RollbackAction::RemoveEntity {
                kind,
                entity_id: "x1".into()
            })
        );
    }
    for kind in [
        EntityKind::Task,
        EntityKind::Workout,
        EntityKind::Habit,
        EntityKind::Challenge,
        EntityKind::Habitat,
        EntityKind::Story,
    ] {
        assert_eq!(
            plan_rollback(&failed(kind.clone(), "x1", OperationKind::Create)),
            Some(RollbackAction::MarkEntityFailed {
                kind,
                entity_id: "x1".into()
            })
        );
    }
    assert_eq!(
        plan_rollback(&failed(EntityKind::ChatMessage, "m1", OperationKind::Create)),
        Some(RollbackAction::MarkMessageFailed {
            message_id: "m1".into()
        })
    );
}

#[test]
fn everything_else_has_no_rollback() {
    let cases = [
        failed(EntityKind::Comment, "c1", OperationKind::Delete),
        failed(EntityKind::Task, "t1", OperationKind::Update),
        failed(EntityKind::Post, "p1", OperationKind::Delete),
        failed(EntityKind::NotificationRead, "n1", OperationKind::Update),
        failed(EntityKind::ChallengeJoin, "c1", OperationKind::Create),
        failed(EntityKind::from_tag("badge"), "b1", OperationKind::Create),
        failed(EntityKind::Follow, "no-separator", OperationKind::Create),
        failed(EntityKind::Like, "a_b_c", OperationKind::Delete),
    ];
    for record in cases {
        assert_eq!(plan_rollback(&record), None, "{record:?}");
    }
}

#[tokio::test]
async fn removing_a_follow_leaves_other_edges_alone() {
    let storage = memory_storage().await;
    let rolled_back = FollowEdge::new("me", "u2");
    let kept = FollowEdge::new("me", "u3");
    storage
        .insert_follow(&rolled_back, SyncState::Pending)
        .await
        .expect("edge");
    storage
        .insert_follow(&kept, SyncState::Synced)
        .await
        .expect("edge");

    apply_rollback(&storage, &RollbackAction::RemoveFollow(rolled_back.clone()))
        .await
        .expect("rollback");

    assert_eq!(storage.follow_state(&rolled_back).await.expect("load"), None);
    assert_eq!(
        storage.follow_state(&kept).await.expect("load"),
        Some(SyncState::Synced)
    );
}

#[tokio::test]
async fn restoring_a_like_marks_it_synced_and_is_repeatable() {
    let storage = memory_storage().await;
    let like = PostLike::new("me", "p1");
    let action = RollbackAction::RestoreLike(like.clone());

    apply_rollback(&storage, &action).await.expect("restore");
    apply_rollback(&storage, &action).await.expect("restore again");

    assert_eq!(
        storage.like_state(&like).await.expect("load"),
        Some(SyncState::Synced)
    );
}

#[tokio::test]
async fn entity_and_message_rollbacks_update_the_cache() {
    let storage = memory_storage().await;
    storage
        .save_entity(&EntityKind::Comment, "c1", r#"{"text":"nice"}"#, SyncState::Pending)
        .await
        .expect("comment");
    storage
        .save_entity(&EntityKind::Workout, "w1", r#"{"km":5}"#, SyncState::Pending)
        .await
        .expect("workout");
    let message = ChatMessage {
        id: "m1".into(),
        chat_id: "c1".into(),
        sender_id: "me".into(),
        content: "hello".into(),
        media_url: None,
        sent_at: Utc::now(),
    };
    storage
        .upsert_message(&message, MessageStatus::Sending)
        .await
        .expect("message");

    let actions = [
        RollbackAction::RemoveEntity {
            kind: EntityKind::Comment,
            entity_id: "c1".into(),
        },
        RollbackAction::MarkEntityFailed {
            kind: EntityKind::Workout,
            entity_id: "w1".into(),
        },
        RollbackAction::MarkMessageFailed {
            message_id: "m1".into(),
        },
    ];
    for action in &actions {
        apply_rollback(&storage, action).await.expect("rollback");
    }

    assert!(storage
        .entity(&EntityKind::Comment, "c1")
        .await
        .expect("load")
        .is_none());
    let workout = storage
        .entity(&EntityKind::Workout, "w1")
        .await
        .expect("load")
        .expect("kept");
    assert_eq!(workout.sync_state, SyncState::Failed);
    assert_eq!(workout.body, r#"{"km":5}"#);
    let stored = storage.message("m1").await.expect("load").expect("kept");
    assert_eq!(stored.status, MessageStatus::Failed);
}
