//! Chat message types shared by the store, the recency cache and the wire.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Where a message is addressed.
///
/// Flattened into [`Message`] on the wire, so a direct message serializes as
/// `{"scope":"direct","recipientId":"bob",...}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "scope", rename_all = "lowercase", rename_all_fields = "camelCase")]
pub enum Target {
    Broadcast,
    Direct { recipient_id: String },
    Room { room_id: String },
}

impl Target {
    /// Column value stored in `messages.target_kind`.
    pub fn kind(&self) -> &'static str {
        match self {
            Target::Broadcast => "broadcast",
            Target::Direct { .. } => "direct",
            Target::Room { .. } => "room",
        }
    }

    /// Column value stored in `messages.target_id`.
    pub fn id(&self) -> Option<&str> {
        match self {
            Target::Broadcast => None,
            Target::Direct { recipient_id } => Some(recipient_id),
            Target::Room { room_id } => Some(room_id),
        }
    }

    /// Rebuild a target from its stored columns.
    pub fn from_columns(kind: &str, id: Option<String>) -> Option<Self> {
        match (kind, id) {
            ("broadcast", _) => Some(Target::Broadcast),
            ("direct", Some(recipient_id)) => Some(Target::Direct { recipient_id }),
            ("room", Some(room_id)) => Some(Target::Room { room_id }),
            _ => None,
        }
    }
}

/// A persisted chat message. Immutable once appended, except `is_read`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: i64,
    pub sender_id: String,
    #[serde(flatten)]
    pub target: Target,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub is_read: bool,
}

impl Message {
    /// Score used to order the message inside a cache partition.
    pub fn score(&self) -> f64 {
        self.timestamp
            .timestamp_nanos_opt()
            .unwrap_or_else(|| self.timestamp.timestamp_micros().saturating_mul(1_000)) as f64
    }
}

/// A message that has not been appended yet; the store assigns its id.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub sender_id: String,
    pub target: Target,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl NewMessage {
    pub fn now(sender_id: &str, target: Target, content: String) -> Self {
        Self {
            sender_id: sender_id.to_string(),
            target,
            content,
            timestamp: Utc::now(),
        }
    }

    pub fn into_message(self, id: i64) -> Message {
        Message {
            id,
            sender_id: self.sender_id,
            target: self.target,
            content: self.content,
            timestamp: self.timestamp,
            is_read: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_direct_message_wire_shape() {
        let msg = NewMessage::now(
            "alice",
            Target::Direct {
                recipient_id: "bob".to_string(),
            },
            "hi".to_string(),
        )
        .into_message(7);

        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["id"], 7);
        assert_eq!(value["senderId"], "alice");
        assert_eq!(value["scope"], "direct");
        assert_eq!(value["recipientId"], "bob");
        assert_eq!(value["isRead"], false);

        let back: Message = serde_json::from_value(value).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn test_target_columns() {
        let room = Target::Room {
            room_id: "lobby".to_string(),
        };
        assert_eq!(
            Target::from_columns(room.kind(), room.id().map(str::to_string)),
            Some(room)
        );
        assert_eq!(Target::from_columns("direct", None), None);
    }
}
