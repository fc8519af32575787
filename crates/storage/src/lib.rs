use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    Pool, Row, Sqlite,
};
use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};

use shared::domain::{ChatMessage, ChatUser, MessageId, RoomId, SendStatus, UserId};

/// Durable cache of confirmed messages, keyed by server message id.
/// Writes are upserts, so replaying a history page or a live delivery is
/// always safe.
#[derive(Clone)]
pub struct MessageCache {
    pool: Pool<Sqlite>,
}

impl MessageCache {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(connect_options)
            .await?;
        let cache = Self { pool };
        cache.ensure_messages_table().await?;
        Ok(cache)
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

    async fn ensure_messages_table(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS cached_messages (
                message_id           TEXT PRIMARY KEY,
                room_id              TEXT NOT NULL,
                content              TEXT,
                created_at           TEXT NOT NULL,
                sender_user_id       TEXT NOT NULL,
                sender_nick          TEXT NOT NULL,
                sender_profile_image TEXT,
                attachments          TEXT NOT NULL DEFAULT '[]'
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("failed to ensure cached_messages table exists")?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_cached_messages_room_created
             ON cached_messages (room_id, created_at)",
        )
        .execute(&self.pool)
        .await
        .context("failed to ensure cached_messages index exists")?;

        Ok(())
    }

    /// All cached messages for a room, ascending by `created_at`, insertion
    /// order breaking ties.
    pub async fn load_messages(&self, room_id: &RoomId) -> Result<Vec<ChatMessage>> {
        let rows = sqlx::query(
            "SELECT message_id, room_id, content, created_at, sender_user_id, sender_nick, sender_profile_image, attachments
             FROM cached_messages
             WHERE room_id = ?
             ORDER BY created_at ASC, rowid ASC",
        )
        .bind(room_id.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(row_to_message).collect()
    }

    pub async fn upsert_message(&self, message: &ChatMessage) -> Result<()> {
        let attachments = serde_json::to_string(&message.attachments)
            .context("failed to serialize attachment refs")?;
        sqlx::query(
            "INSERT INTO cached_messages (message_id, room_id, content, created_at, sender_user_id, sender_nick, sender_profile_image, attachments)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(message_id) DO UPDATE SET
                 room_id = excluded.room_id,
                 content = excluded.content,
                 created_at = excluded.created_at,
                 sender_user_id = excluded.sender_user_id,
                 sender_nick = excluded.sender_nick,
                 sender_profile_image = excluded.sender_profile_image,
                 attachments = excluded.attachments",
        )
        .bind(message.id.as_str())
        .bind(message.room_id.as_str())
        .bind(message.content.as_deref())
        .bind(message.created_at)
        .bind(message.sender.user_id.as_str())
        .bind(&message.sender.nick)
        .bind(message.sender.profile_image.as_deref())
        .bind(attachments)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

fn row_to_message(row: sqlx::sqlite::SqliteRow) -> Result<ChatMessage> {
    let attachments: Vec<String> =
        serde_json::from_str(&row.get::<String, _>("attachments"))
            .context("failed to deserialize attachment refs")?;
    Ok(ChatMessage {
        id: MessageId(row.get::<String, _>("message_id")),
        room_id: RoomId(row.get::<String, _>("room_id")),
        content: row.get::<Option<String>, _>("content"),
        created_at: row.get::<DateTime<Utc>, _>("created_at"),
        sender: ChatUser {
            user_id: UserId(row.get::<String, _>("sender_user_id")),
            nick: row.get::<String, _>("sender_nick"),
            profile_image: row.get::<Option<String>, _>("sender_profile_image"),
        },
        attachments,
        send_status: SendStatus::Confirmed,
        local_id: None,
        upload_pending: false,
    })
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
    if database_url == "sqlite::memory:" || !database_url.starts_with("sqlite:") {
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
