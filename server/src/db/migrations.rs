use rusqlite_migration::{Migrations, M};

/// Define all schema migrations.
/// Uses SQLite user_version pragma for tracking, no migration table needed.
pub fn migrations() -> Migrations<'static> {
    Migrations::new(vec![
        M::up(
            "-- Migration 1: Message log

CREATE TABLE messages (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    sender_id TEXT NOT NULL,
    target_kind TEXT NOT NULL CHECK (target_kind IN ('broadcast', 'direct', 'room')),
    target_id TEXT,
    content TEXT NOT NULL,
    timestamp_ns INTEGER NOT NULL,
    is_read INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX idx_messages_direct ON messages(target_kind, sender_id, target_id, id);
CREATE INDEX idx_messages_target ON messages(target_kind, target_id, id);
",
        ),
        M::up(
            "-- Migration 2: Room membership

CREATE TABLE room_members (
    room_id TEXT NOT NULL,
    user_id TEXT NOT NULL,
    joined_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (room_id, user_id)
);

CREATE INDEX idx_room_members_user ON room_members(user_id);
",
        ),
    ])
}
