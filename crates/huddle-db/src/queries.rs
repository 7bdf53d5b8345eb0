use crate::Database;
use crate::models::{ChannelRow, MembershipRow, MessageRow, UserRow};
use anyhow::{Result, anyhow};
use chrono::SecondsFormat;
use uuid::Uuid;

impl Database {
    // -- Users --

    pub fn create_user(&self, id: &str, username: &str, password_hash: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO users (id, username, password) VALUES (?1, ?2, ?3)",
                (id, username, password_hash),
            )?;
            Ok(())
        })
    }

    pub fn get_user_by_username(&self, username: &str) -> Result<Option<UserRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, username, password, created_at FROM users WHERE username = ?1",
            )?;
            stmt.query_row([username], |row| {
                Ok(UserRow {
                    id: row.get(0)?,
                    username: row.get(1)?,
                    password: row.get(2)?,
                    created_at: row.get(3)?,
                })
            })
            .optional()
        })
    }

    // -- Channels --

    /// Insert a channel. Returns None when the name (case-insensitive) is
    /// already taken; the unique index makes the check-and-insert atomic, so
    /// two racing creates cannot both succeed.
    pub fn insert_channel(
        &self,
        id: &str,
        name: &str,
        kind: &str,
        description: &str,
        created_by: &str,
    ) -> Result<Option<ChannelRow>> {
        let created_at = now_rfc3339();
        self.with_conn(|conn| {
            let inserted = conn.execute(
                "INSERT OR IGNORE INTO channels (id, name, kind, description, created_by, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                (id, name, kind, description, created_by, &created_at),
            )?;
            if inserted == 0 {
                return Ok(None);
            }
            Ok(Some(ChannelRow {
                id: id.to_string(),
                name: name.to_string(),
                kind: kind.to_string(),
                description: description.to_string(),
                created_by: created_by.to_string(),
                created_at: created_at.clone(),
            }))
        })
    }

    pub fn get_channel(&self, id: &str) -> Result<Option<ChannelRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, name, kind, description, created_by, created_at
                 FROM channels WHERE id = ?1",
            )?;
            stmt.query_row([id], channel_from_row).optional()
        })
    }

    /// Every channel, annotated with whether `user_id` is a member and the
    /// current member count. One query; no N+1.
    pub fn list_channels_for(&self, user_id: &str) -> Result<Vec<(ChannelRow, bool, u64)>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT c.id, c.name, c.kind, c.description, c.created_by, c.created_at,
                        EXISTS(SELECT 1 FROM memberships m
                               WHERE m.channel_id = c.id AND m.user_id = ?1) AS is_member,
                        (SELECT COUNT(*) FROM memberships m2
                         WHERE m2.channel_id = c.id) AS member_count
                 FROM channels c
                 ORDER BY c.created_at, c.rowid",
            )?;

            let rows = stmt
                .query_map([user_id], |row| {
                    let channel = channel_from_row(row)?;
                    let is_member: bool = row.get(6)?;
                    let member_count: i64 = row.get(7)?;
                    Ok((channel, is_member, member_count.max(0) as u64))
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            Ok(rows)
        })
    }

    // -- Memberships --

    /// Idempotent join: inserting an existing (channel, user) pair is a
    /// no-op and the stored row is returned unchanged.
    pub fn upsert_membership(&self, channel_id: &str, user_id: &str) -> Result<MembershipRow> {
        let joined_at = now_rfc3339();
        self.with_conn(|conn| {
            conn.execute(
                "INSERT OR IGNORE INTO memberships (channel_id, user_id, joined_at)
                 VALUES (?1, ?2, ?3)",
                (channel_id, user_id, &joined_at),
            )?;

            let mut stmt = conn.prepare(
                "SELECT channel_id, user_id, joined_at FROM memberships
                 WHERE channel_id = ?1 AND user_id = ?2",
            )?;
            stmt.query_row([channel_id, user_id], |row| {
                Ok(MembershipRow {
                    channel_id: row.get(0)?,
                    user_id: row.get(1)?,
                    joined_at: row.get(2)?,
                })
            })
            .optional()?
            .ok_or_else(|| anyhow!("membership vanished after insert"))
        })
    }

    pub fn is_member(&self, channel_id: &str, user_id: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let hit: Option<i64> = conn
                .query_row(
                    "SELECT 1 FROM memberships WHERE channel_id = ?1 AND user_id = ?2",
                    [channel_id, user_id],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(hit.is_some())
        })
    }

    pub fn member_count(&self, channel_id: &str) -> Result<u64> {
        self.with_conn(|conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM memberships WHERE channel_id = ?1",
                [channel_id],
                |row| row.get(0),
            )?;
            Ok(count.max(0) as u64)
        })
    }

    // -- Messages --

    /// Append a message to a channel's log. The store assigns both the id
    /// and the timestamp here, under the connection lock, so concurrent
    /// senders can never produce duplicate ids or reordered commits.
    pub fn append_message(
        &self,
        channel_id: &str,
        author_id: &str,
        body: &str,
    ) -> Result<MessageRow> {
        let id = Uuid::new_v4().to_string();
        let created_at = now_rfc3339();

        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO messages (id, channel_id, author_id, body, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                (&id, channel_id, author_id, body, &created_at),
            )?;

            let author_username: Option<String> = conn
                .query_row(
                    "SELECT username FROM users WHERE id = ?1",
                    [author_id],
                    |row| row.get(0),
                )
                .optional()?;

            Ok(MessageRow {
                id: id.clone(),
                channel_id: channel_id.to_string(),
                author_id: author_id.to_string(),
                author_username: author_username.unwrap_or_else(|| "unknown".to_string()),
                body: body.to_string(),
                created_at: created_at.clone(),
            })
        })
    }

    /// Newest-first history page. `before` is the created_at cursor of the
    /// oldest message from the previous page.
    pub fn list_messages(
        &self,
        channel_id: &str,
        limit: u32,
        before: Option<&str>,
    ) -> Result<Vec<MessageRow>> {
        self.with_conn(|conn| {
            // JOIN users to fetch author_username in a single query
            let sql_base = "SELECT m.id, m.channel_id, m.author_id, u.username, m.body, m.created_at
                 FROM messages m
                 LEFT JOIN users u ON m.author_id = u.id
                 WHERE m.channel_id = ?1";

            let rows = match before {
                Some(cursor) => {
                    let sql = format!(
                        "{} AND m.created_at < ?2 ORDER BY m.created_at DESC, m.rowid DESC LIMIT ?3",
                        sql_base
                    );
                    let mut stmt = conn.prepare(&sql)?;
                    stmt.query_map(rusqlite::params![channel_id, cursor, limit], message_from_row)?
                        .collect::<std::result::Result<Vec<_>, _>>()?
                }
                None => {
                    let sql = format!(
                        "{} ORDER BY m.created_at DESC, m.rowid DESC LIMIT ?2",
                        sql_base
                    );
                    let mut stmt = conn.prepare(&sql)?;
                    stmt.query_map(rusqlite::params![channel_id, limit], message_from_row)?
                        .collect::<std::result::Result<Vec<_>, _>>()?
                }
            };

            Ok(rows)
        })
    }
}

fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn channel_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ChannelRow> {
    Ok(ChannelRow {
        id: row.get(0)?,
        name: row.get(1)?,
        kind: row.get(2)?,
        description: row.get(3)?,
        created_by: row.get(4)?,
        created_at: row.get(5)?,
    })
}

fn message_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<MessageRow> {
    Ok(MessageRow {
        id: row.get(0)?,
        channel_id: row.get(1)?,
        author_id: row.get(2)?,
        author_username: row
            .get::<_, Option<String>>(3)?
            .unwrap_or_else(|| "unknown".to_string()),
        body: row.get(4)?,
        created_at: row.get(5)?,
    })
}

/// Extension trait for optional query results
trait OptionalExt<T> {
    fn optional(self) -> Result<Option<T>>;
}

impl<T> OptionalExt<T> for std::result::Result<T, rusqlite::Error> {
    fn optional(self) -> Result<Option<T>> {
        match self {
            Ok(val) => Ok(Some(val)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}
