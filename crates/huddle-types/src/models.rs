use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    pub username: String,
    pub created_at: DateTime<Utc>,
}

/// What kind of audience a channel serves. Determines the join policy:
/// general channels are open to everyone, department and project channels
/// require an explicit invite.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    General,
    Department,
    Project,
}

impl ChannelKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::General => "general",
            Self::Department => "department",
            Self::Project => "project",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "general" => Some(Self::General),
            "department" => Some(Self::Department),
            "project" => Some(Self::Project),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Channel {
    pub id: Uuid,
    pub name: String,
    pub kind: ChannelKind,
    pub description: String,
    pub created_by: Uuid,
    pub created_at: DateTime<Utc>,
}

/// Durable relation granting a user access to a channel.
/// Unique per (channel_id, user_id); joining twice returns the same row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Membership {
    pub channel_id: Uuid,
    pub user_id: Uuid,
    pub joined_at: DateTime<Utc>,
}

/// A persisted chat message. Immutable once appended; id and created_at are
/// assigned by the message store, never by the connection that sent it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub channel_id: Uuid,
    pub author_id: Uuid,
    pub author_username: String,
    pub body: String,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_kind_round_trips_through_str() {
        for kind in [ChannelKind::General, ChannelKind::Department, ChannelKind::Project] {
            assert_eq!(ChannelKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(ChannelKind::parse("voice"), None);
    }
}
