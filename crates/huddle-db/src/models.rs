//! Database row types — these map directly to SQLite rows.
//! Distinct from huddle-types API models to keep the DB layer independent;
//! the `TryFrom` impls are where TEXT ids and timestamps get validated.

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, NaiveDateTime, Utc};
use uuid::Uuid;

use huddle_types::models::{Channel, ChannelKind, Membership, Message};

pub struct UserRow {
    pub id: String,
    pub username: String,
    pub password: String,
    pub created_at: String,
}

pub struct ChannelRow {
    pub id: String,
    pub name: String,
    pub kind: String,
    pub description: String,
    pub created_by: String,
    pub created_at: String,
}

pub struct MembershipRow {
    pub channel_id: String,
    pub user_id: String,
    pub joined_at: String,
}

pub struct MessageRow {
    pub id: String,
    pub channel_id: String,
    pub author_id: String,
    pub author_username: String,
    pub body: String,
    pub created_at: String,
}

/// SQLite's datetime('now') stores "YYYY-MM-DD HH:MM:SS" without a timezone;
/// rows written by huddle itself carry RFC 3339. Accept both as UTC.
pub fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    raw.parse::<DateTime<Utc>>()
        .or_else(|_| {
            NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S").map(|ndt| ndt.and_utc())
        })
        .with_context(|| format!("corrupt timestamp '{}'", raw))
}

impl TryFrom<ChannelRow> for Channel {
    type Error = anyhow::Error;

    fn try_from(row: ChannelRow) -> Result<Self> {
        Ok(Channel {
            id: row.id.parse::<Uuid>().context("corrupt channel id")?,
            kind: ChannelKind::parse(&row.kind)
                .ok_or_else(|| anyhow!("corrupt channel kind '{}'", row.kind))?,
            created_by: row.created_by.parse().context("corrupt created_by")?,
            created_at: parse_timestamp(&row.created_at)?,
            name: row.name,
            description: row.description,
        })
    }
}

impl TryFrom<MembershipRow> for Membership {
    type Error = anyhow::Error;

    fn try_from(row: MembershipRow) -> Result<Self> {
        Ok(Membership {
            channel_id: row.channel_id.parse().context("corrupt channel_id")?,
            user_id: row.user_id.parse().context("corrupt user_id")?,
            joined_at: parse_timestamp(&row.joined_at)?,
        })
    }
}

impl TryFrom<MessageRow> for Message {
    type Error = anyhow::Error;

    fn try_from(row: MessageRow) -> Result<Self> {
        Ok(Message {
            id: row.id.parse().context("corrupt message id")?,
            channel_id: row.channel_id.parse().context("corrupt channel_id")?,
            author_id: row.author_id.parse().context("corrupt author_id")?,
            created_at: parse_timestamp(&row.created_at)?,
            author_username: row.author_username,
            body: row.body,
        })
    }
}
