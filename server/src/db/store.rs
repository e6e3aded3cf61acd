//! Durable, append-only message log.
//!
//! All queries return newest-first; callers reverse for chronological
//! display. Ids come from SQLite's AUTOINCREMENT and are monotonic.

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::DateTime;
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::chat::models::{Message, NewMessage, Target};
use crate::db::DbPool;
use crate::error::StoreError;

/// Persistence contract consumed by the delivery core.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Atomically append a message and return it with its assigned id.
    async fn append(&self, message: NewMessage) -> Result<Message, StoreError>;

    async fn get(&self, id: i64) -> Result<Option<Message>, StoreError>;

    /// Direct messages exchanged between two users, in either direction.
    async fn between(
        &self,
        user_a: &str,
        user_b: &str,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<Message>, StoreError>;

    async fn for_room(&self, room_id: &str, limit: u32, offset: u32) -> Result<Vec<Message>, StoreError>;

    async fn global(&self, limit: u32, offset: u32) -> Result<Vec<Message>, StoreError>;

    /// Flip `is_read`; the only mutation allowed after append.
    /// Returns false when no such message exists.
    async fn mark_read(&self, id: i64) -> Result<bool, StoreError>;

    /// The subset of `ids` already marked read.
    async fn read_among(&self, ids: &[i64]) -> Result<HashSet<i64>, StoreError>;

    /// Unread direct messages addressed to the user.
    async fn unread_count(&self, user_id: &str) -> Result<u64, StoreError>;

    async fn join_room(&self, room_id: &str, user_id: &str) -> Result<(), StoreError>;

    async fn rooms_for(&self, user_id: &str) -> Result<Vec<String>, StoreError>;

    async fn members_of(&self, room_id: &str) -> Result<Vec<String>, StoreError>;
}

/// SQLite implementation over the shared connection.
#[derive(Clone)]
pub struct SqliteStore {
    db: DbPool,
}

const SELECT_MESSAGE: &str =
    "SELECT id, sender_id, target_kind, target_id, content, timestamp_ns, is_read FROM messages";

impl SqliteStore {
    pub fn new(db: DbPool) -> Self {
        Self { db }
    }

    /// Run `f` against the connection on the blocking pool.
    async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&Connection) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || {
            let conn = db.lock().map_err(|_| StoreError::Poisoned)?;
            f(&conn)
        })
        .await?
    }
}

type MessageRow = (i64, String, String, Option<String>, String, i64, bool);

fn read_row(row: &Row<'_>) -> rusqlite::Result<MessageRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
    ))
}

fn into_message(row: MessageRow) -> Result<Message, StoreError> {
    let (id, sender_id, kind, target_id, content, timestamp_ns, is_read) = row;
    let target = Target::from_columns(&kind, target_id).ok_or(StoreError::Corrupt(id))?;
    Ok(Message {
        id,
        sender_id,
        target,
        content,
        timestamp: DateTime::from_timestamp_nanos(timestamp_ns),
        is_read,
    })
}

fn query_messages(
    conn: &Connection,
    sql: &str,
    params: impl rusqlite::Params,
) -> Result<Vec<Message>, StoreError> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt
        .query_map(params, read_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    rows.into_iter().map(into_message).collect()
}

#[async_trait]
impl MessageStore for SqliteStore {
    async fn append(&self, message: NewMessage) -> Result<Message, StoreError> {
        self.with_conn(move |conn| {
            let timestamp_ns = message
                .timestamp
                .timestamp_nanos_opt()
                .unwrap_or_else(|| message.timestamp.timestamp_micros().saturating_mul(1_000));
            // A single INSERT is atomic; the rowid is the assigned id
            conn.execute(
                "INSERT INTO messages (sender_id, target_kind, target_id, content, timestamp_ns, is_read)
                 VALUES (?1, ?2, ?3, ?4, ?5, 0)",
                params![
                    message.sender_id,
                    message.target.kind(),
                    message.target.id(),
                    message.content,
                    timestamp_ns,
                ],
            )?;
            let id = conn.last_insert_rowid();
            Ok(message.into_message(id))
        })
        .await
    }

    async fn get(&self, id: i64) -> Result<Option<Message>, StoreError> {
        self.with_conn(move |conn| {
            let row = conn
                .query_row(&format!("{} WHERE id = ?1", SELECT_MESSAGE), params![id], read_row)
                .optional()?;
            row.map(into_message).transpose()
        })
        .await
    }

    async fn between(
        &self,
        user_a: &str,
        user_b: &str,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<Message>, StoreError> {
        let (a, b) = (user_a.to_string(), user_b.to_string());
        self.with_conn(move |conn| {
            query_messages(
                conn,
                &format!(
                    "{} WHERE target_kind = 'direct'
                       AND ((sender_id = ?1 AND target_id = ?2) OR (sender_id = ?2 AND target_id = ?1))
                     ORDER BY id DESC LIMIT ?3 OFFSET ?4",
                    SELECT_MESSAGE
                ),
                params![a, b, limit, offset],
            )
        })
        .await
    }

    async fn for_room(&self, room_id: &str, limit: u32, offset: u32) -> Result<Vec<Message>, StoreError> {
        let room_id = room_id.to_string();
        self.with_conn(move |conn| {
            query_messages(
                conn,
                &format!(
                    "{} WHERE target_kind = 'room' AND target_id = ?1
                     ORDER BY id DESC LIMIT ?2 OFFSET ?3",
                    SELECT_MESSAGE
                ),
                params![room_id, limit, offset],
            )
        })
        .await
    }

    async fn global(&self, limit: u32, offset: u32) -> Result<Vec<Message>, StoreError> {
        self.with_conn(move |conn| {
            query_messages(
                conn,
                &format!(
                    "{} WHERE target_kind = 'broadcast' ORDER BY id DESC LIMIT ?1 OFFSET ?2",
                    SELECT_MESSAGE
                ),
                params![limit, offset],
            )
        })
        .await
    }

    async fn mark_read(&self, id: i64) -> Result<bool, StoreError> {
        self.with_conn(move |conn| {
            let updated = conn.execute("UPDATE messages SET is_read = 1 WHERE id = ?1", params![id])?;
            Ok(updated > 0)
        })
        .await
    }

    async fn read_among(&self, ids: &[i64]) -> Result<HashSet<i64>, StoreError> {
        if ids.is_empty() {
            return Ok(HashSet::new());
        }
        let ids = ids.to_vec();
        self.with_conn(move |conn| {
            let placeholders = vec!["?"; ids.len()].join(", ");
            let mut stmt = conn.prepare(&format!(
                "SELECT id FROM messages WHERE is_read = 1 AND id IN ({})",
                placeholders
            ))?;
            let read = stmt
                .query_map(rusqlite::params_from_iter(ids.iter()), |row| row.get::<_, i64>(0))?
                .collect::<rusqlite::Result<HashSet<_>>>()?;
            Ok(read)
        })
        .await
    }

    async fn unread_count(&self, user_id: &str) -> Result<u64, StoreError> {
        let user_id = user_id.to_string();
        self.with_conn(move |conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM messages
                 WHERE target_kind = 'direct' AND target_id = ?1 AND is_read = 0",
                params![user_id],
                |row| row.get(0),
            )?;
            Ok(count as u64)
        })
        .await
    }

    async fn join_room(&self, room_id: &str, user_id: &str) -> Result<(), StoreError> {
        let (room_id, user_id) = (room_id.to_string(), user_id.to_string());
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT OR IGNORE INTO room_members (room_id, user_id) VALUES (?1, ?2)",
                params![room_id, user_id],
            )?;
            Ok(())
        })
        .await
    }

    async fn rooms_for(&self, user_id: &str) -> Result<Vec<String>, StoreError> {
        let user_id = user_id.to_string();
        self.with_conn(move |conn| {
            let mut stmt =
                conn.prepare("SELECT room_id FROM room_members WHERE user_id = ?1 ORDER BY room_id")?;
            let rooms = stmt
                .query_map(params![user_id], |row| row.get::<_, String>(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rooms)
        })
        .await
    }

    async fn members_of(&self, room_id: &str) -> Result<Vec<String>, StoreError> {
        let room_id = room_id.to_string();
        self.with_conn(move |conn| {
            let mut stmt =
                conn.prepare("SELECT user_id FROM room_members WHERE room_id = ?1 ORDER BY user_id")?;
            let members = stmt
                .query_map(params![room_id], |row| row.get::<_, String>(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(members)
        })
        .await
    }
}
