use super::*;

#[test]
fn resource_paths_are_pluralized() {
    assert_eq!(EntityKind::Post.resource_path(), "posts");
    assert_eq!(EntityKind::Story.resource_path(), "stories");
    assert_eq!(EntityKind::Habitat.resource_path(), "habitats");
    assert_eq!(EntityKind::ChatMessage.resource_path(), "chat_messages");
    assert_eq!(EntityKind::from_tag("address").resource_path(), "addresses");
    assert_eq!(EntityKind::from_tag("survey").resource_path(), "surveys");
}

#[test]
fn unknown_entity_tags_are_preserved() {
    let kind = EntityKind::from_tag("journal_entry");
    assert_eq!(kind, EntityKind::Other("journal_entry".into()));
    assert_eq!(kind.as_str(), "journal_entry");
    assert!(!kind.has_typed_endpoint());

    let json = serde_json::to_string(&EntityKind::NotificationReadAll).expect("json");
    assert_eq!(json, "\"notification_read_all\"");
    let back: EntityKind = serde_json::from_str(&json).expect("parse");
    assert_eq!(back, EntityKind::NotificationReadAll);
}

#[test]
fn composite_ids_need_exactly_two_parts() {
    assert_eq!(split_composite_id("u1_p1"), Some(("u1", "p1")));
    assert_eq!(split_composite_id("u1"), None);
    assert_eq!(split_composite_id("u1_p1_x"), None);
    assert_eq!(split_composite_id("_p1"), None);
    assert_eq!(split_composite_id("u1_"), None);
    assert_eq!(FollowEdge::new("a", "b").entity_id(), "a_b");
    assert_eq!(PostLike::new("u1", "p1").entity_id(), "u1_p1");
}

#[test]
fn stored_enums_round_trip_through_text() {
    assert_eq!("IN_PROGRESS".parse::<MutationStatus>(), Ok(MutationStatus::InProgress));
    assert_eq!(MutationStatus::InProgress.as_str(), "IN_PROGRESS");
    assert_eq!(OperationKind::Delete.to_string(), "DELETE");
    assert!("MERGE".parse::<OperationKind>().is_err());
    assert!(MutationStatus::Failed.is_terminal());
    assert!(!MutationStatus::Pending.is_terminal());
}
