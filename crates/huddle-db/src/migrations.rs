use anyhow::Result;
use rusqlite::Connection;
use tracing::info;

pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS users (
            id          TEXT PRIMARY KEY,
            username    TEXT NOT NULL UNIQUE,
            password    TEXT NOT NULL,
            created_at  TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS channels (
            id          TEXT PRIMARY KEY,
            name        TEXT NOT NULL,
            kind        TEXT NOT NULL,
            description TEXT NOT NULL DEFAULT '',
            created_by  TEXT NOT NULL,
            created_at  TEXT NOT NULL DEFAULT (datetime('now'))
        );

        -- Channel names are unique case-insensitively
        CREATE UNIQUE INDEX IF NOT EXISTS idx_channels_name
            ON channels(LOWER(name));

        CREATE TABLE IF NOT EXISTS memberships (
            channel_id  TEXT NOT NULL REFERENCES channels(id),
            user_id     TEXT NOT NULL,
            joined_at   TEXT NOT NULL,
            UNIQUE(channel_id, user_id)
        );

        CREATE INDEX IF NOT EXISTS idx_memberships_channel
            ON memberships(channel_id);

        CREATE TABLE IF NOT EXISTS messages (
            id          TEXT PRIMARY KEY,
            channel_id  TEXT NOT NULL REFERENCES channels(id),
            author_id   TEXT NOT NULL REFERENCES users(id),
            body        TEXT NOT NULL,
            created_at  TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_messages_channel
            ON messages(channel_id, created_at);

        -- Seed the default general channel (nil creator = system)
        INSERT OR IGNORE INTO channels (id, name, kind, created_by)
            VALUES ('00000000-0000-0000-0000-000000000001', 'general', 'general',
                    '00000000-0000-0000-0000-000000000000');
        ",
    )?;

    info!("Database migrations complete");
    Ok(())
}
