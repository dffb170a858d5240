use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ParseTagError;

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(pub i64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

id_newtype!(MutationId);

/// Declares a unit enum persisted as an upper-case text column.
macro_rules! stored_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "SCREAMING_SNAKE_CASE")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub fn as_str(self) -> &'static str {
                match self {
                    $(Self::$variant => $text),+
                }
            }
        }

        impl FromStr for $name {
            type Err = ParseTagError;

            fn from_str(value: &str) -> Result<Self, Self::Err> {
                match value {
                    $($text => Ok(Self::$variant),)+
                    other => Err(ParseTagError::new(stringify!($name), other)),
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

stored_enum!(OperationKind {
    Create => "CREATE",
    Update => "UPDATE",
    Delete => "DELETE",
});

stored_enum!(MutationStatus {
    Pending => "PENDING",
    InProgress => "IN_PROGRESS",
    Completed => "COMPLETED",
    Failed => "FAILED",
});

stored_enum!(SyncState {
    Pending => "PENDING",
    Synced => "SYNCED",
    Failed => "FAILED",
});

stored_enum!(MessageStatus {
    Sending => "SENDING",
    Sent => "SENT",
    Delivered => "DELIVERED",
    Read => "READ",
    Failed => "FAILED",
});

impl MutationStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// Tag of the entity family a queued mutation targets.
///
/// Unknown tags survive a round trip through the queue untouched and are
/// dispatched against the generic resource path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum EntityKind {
    Post,
    Task,
    Follow,
    Like,
    Comment,
    Workout,
    ChatMessage,
    NotificationRead,
    NotificationReadAll,
    ChallengeJoin,
    Habit,
    Challenge,
    Habitat,
    Story,
    Other(String),
}

impl EntityKind {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Post => "post",
            Self::Task => "task",
            Self::Follow => "follow",
            Self::Like => "like",
            Self::Comment => "comment",
            Self::Workout => "workout",
            Self::ChatMessage => "chat_message",
            Self::NotificationRead => "notification_read",
            Self::NotificationReadAll => "notification_read_all",
            Self::ChallengeJoin => "challenge_join",
            Self::Habit => "habit",
            Self::Challenge => "challenge",
            Self::Habitat => "habitat",
            Self::Story => "story",
            Self::Other(tag) => tag,
        }
    }

    pub fn from_tag(tag: &str) -> Self {
        match tag {
            "post" => Self::Post,
            "task" => Self::Task,
            "follow" => Self::Follow,
            "like" => Self::Like,
            "comment" => Self::Comment,
            "workout" => Self::Workout,
            "chat_message" => Self::ChatMessage,
            "notification_read" => Self::NotificationRead,
            "notification_read_all" => Self::NotificationReadAll,
            "challenge_join" => Self::ChallengeJoin,
            "habit" => Self::Habit,
            "challenge" => Self::Challenge,
            "habitat" => Self::Habitat,
            "story" => Self::Story,
            other => Self::Other(other.to_string()),
        }
    }

    /// Families with a dedicated endpoint instead of the generic resource path.
    pub fn has_typed_endpoint(&self) -> bool {
        matches!(
            self,
            Self::Follow
                | Self::Like
                | Self::NotificationRead
                | Self::NotificationReadAll
                | Self::ChallengeJoin
                | Self::ChatMessage
        )
    }

    /// Collection path used for generic create/update/delete.
    pub fn resource_path(&self) -> String {
        pluralize(self.as_str())
    }
}

impl From<String> for EntityKind {
    fn from(value: String) -> Self {
        Self::from_tag(&value)
    }
}

impl From<EntityKind> for String {
    fn from(value: EntityKind) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn pluralize(tag: &str) -> String {
    if let Some(stem) = tag.strip_suffix('y') {
        let after_consonant = stem
            .chars()
            .last()
            .is_some_and(|c| !matches!(c, 'a' | 'e' | 'i' | 'o' | 'u'));
        if after_consonant {
            return format!("{stem}ies");
        }
    }
    if tag.ends_with('s') {
        return format!("{tag}es");
    }
    format!("{tag}s")
}

/// Splits an edge key such as `follower_following` into its two halves.
///
/// Returns `None` unless the key has exactly two non-empty parts.
pub fn split_composite_id(entity_id: &str) -> Option<(&str, &str)> {
    let mut parts = entity_id.split('_');
    let left = parts.next()?;
    let right = parts.next()?;
    if parts.next().is_some() || left.is_empty() || right.is_empty() {
        return None;
    }
    Some((left, right))
}

pub fn composite_id(left: &str, right: &str) -> String {
    format!("{left}_{right}")
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MutationRecord {
    pub id: MutationId,
    pub entity_type: EntityKind,
    pub entity_id: String,
    pub operation: OperationKind,
    pub payload: String,
    pub status: MutationStatus,
    pub retry_count: u32,
    pub created_at: DateTime<Utc>,
    pub last_attempt_at: Option<DateTime<Utc>>,
}

/// A write intent before the queue assigns it an id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewMutation {
    pub entity_type: EntityKind,
    pub entity_id: String,
    pub operation: OperationKind,
    pub payload: String,
}

impl NewMutation {
    pub fn new(
        entity_type: EntityKind,
        entity_id: impl Into<String>,
        operation: OperationKind,
        payload: impl Into<String>,
    ) -> Self {
        Self {
            entity_type,
            entity_id: entity_id.into(),
            operation,
            payload: payload.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FollowEdge {
    pub follower_id: String,
    pub following_id: String,
}

impl FollowEdge {
    pub fn new(follower_id: impl Into<String>, following_id: impl Into<String>) -> Self {
        Self {
            follower_id: follower_id.into(),
            following_id: following_id.into(),
        }
    }

    pub fn entity_id(&self) -> String {
        composite_id(&self.follower_id, &self.following_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostLike {
    pub user_id: String,
    pub post_id: String,
}

impl PostLike {
    pub fn new(user_id: impl Into<String>, post_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            post_id: post_id.into(),
        }
    }

    pub fn entity_id(&self) -> String {
        composite_id(&self.user_id, &self.post_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: String,
    pub chat_id: String,
    pub sender_id: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_url: Option<String>,
    pub sent_at: DateTime<Utc>,
}

#[cfg(test)]
#[path = "tests/domain_tests.rs"]
mod tests;
