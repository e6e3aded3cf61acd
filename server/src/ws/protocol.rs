//! JSON envelopes exchanged over the socket.
//!
//! Every frame is `{"type": <kind>, "content": <payload>}`. The server may
//! pack several envelopes into one text frame, separated by `\n`.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::auth::Identity;
use crate::chat::models::Message as ChatMessage;

/// A pre-encoded outbound envelope, shared between every recipient queue.
pub type Payload = Arc<str>;

/// Largest text frame the writer assembles from queued payloads.
pub const MAX_COALESCED_BYTES: usize = 64 * 1024;

/// Events a client may send.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", content = "content", rename_all = "snake_case")]
pub enum Inbound {
    /// Direct message, or a global broadcast when `recipientId` is absent.
    Message(MessageBody),
    RoomMessage(RoomMessageBody),
    Typing(TypingBody),
    JoinRoom(JoinRoomBody),
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageBody {
    #[serde(default)]
    pub recipient_id: Option<String>,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomMessageBody {
    pub room_id: String,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingBody {
    pub recipient_id: String,
    pub is_typing: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinRoomBody {
    pub room_id: String,
}

/// Events the server sends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "content", rename_all = "snake_case")]
pub enum Outbound {
    Message(ChatMessage),
    RoomMessage(ChatMessage),
    Typing(TypingNotice),
    Status(StatusNotice),
    Users(Vec<Identity>),
    Error(ErrorNotice),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingNotice {
    pub sender_id: String,
    pub is_typing: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusNotice {
    pub user_id: String,
    pub is_online: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorNotice {
    pub message: String,
}

impl Outbound {
    pub fn status(user_id: &str, is_online: bool) -> Self {
        Outbound::Status(StatusNotice {
            user_id: user_id.to_string(),
            is_online,
        })
    }

    pub fn error(message: impl Into<String>) -> Self {
        Outbound::Error(ErrorNotice {
            message: message.into(),
        })
    }

    /// Encode once; the result is shared by every queue it lands in.
    pub fn encode(&self) -> Option<Payload> {
        match serde_json::to_string(self) {
            Ok(json) => Some(json.into()),
            Err(e) => {
                tracing::error!(error = %e, "Failed to encode outbound envelope");
                None
            }
        }
    }
}

pub fn parse(text: &str) -> Result<Inbound, serde_json::Error> {
    serde_json::from_str(text)
}

/// Join `first` with whatever else is already queued, newline-separated,
/// without waiting and without exceeding `max_bytes` (a single oversized
/// payload is still sent whole).
pub fn coalesce(first: Payload, rx: &mut mpsc::Receiver<Payload>, max_bytes: usize) -> String {
    let mut frame = String::from(&*first);
    while frame.len() < max_bytes {
        match rx.try_recv() {
            Ok(next) => {
                frame.push('\n');
                frame.push_str(&next);
            }
            Err(_) => break,
        }
    }
    frame
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::models::{NewMessage, Target};

    #[test]
    fn test_parse_direct_and_global() {
        let direct = parse(r#"{"type":"message","content":{"recipientId":"bob","content":"hi"}}"#).unwrap();
        assert_eq!(
            direct,
            Inbound::Message(MessageBody {
                recipient_id: Some("bob".into()),
                content: "hi".into()
            })
        );

        let global = parse(r#"{"type":"message","content":{"content":"hello all"}}"#).unwrap();
        assert!(matches!(global, Inbound::Message(MessageBody { recipient_id: None, .. })));
    }

    #[test]
    fn test_parse_room_typing_join() {
        assert_eq!(
            parse(r#"{"type":"room_message","content":{"roomId":"r1","content":"yo"}}"#).unwrap(),
            Inbound::RoomMessage(RoomMessageBody {
                room_id: "r1".into(),
                content: "yo".into()
            })
        );
        assert_eq!(
            parse(r#"{"type":"typing","content":{"recipientId":"bob","isTyping":true}}"#).unwrap(),
            Inbound::Typing(TypingBody {
                recipient_id: "bob".into(),
                is_typing: true
            })
        );
        assert_eq!(
            parse(r#"{"type":"join_room","content":{"roomId":"r1"}}"#).unwrap(),
            Inbound::JoinRoom(JoinRoomBody { room_id: "r1".into() })
        );
    }

    #[test]
    fn test_parse_rejects_unknown_and_malformed() {
        assert!(parse(r#"{"type":"shout","content":{}}"#).is_err());
        assert!(parse(r#"{"type":"message"}"#).is_err());
        assert!(parse("not json").is_err());
    }

    #[test]
    fn test_outbound_wire_shape() {
        let json = Outbound::status("alice", true).encode().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["type"], "status");
        assert_eq!(value["content"]["userId"], "alice");
        assert_eq!(value["content"]["isOnline"], true);

        let msg = NewMessage::now(
            "alice",
            Target::Direct {
                recipient_id: "bob".into(),
            },
            "hi".into(),
        )
        .into_message(7);
        let json = Outbound::Message(msg.clone()).encode().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["content"]["id"], 7);
        assert_eq!(value["content"]["senderId"], "alice");
        assert_eq!(value["content"]["recipientId"], "bob");
        assert_eq!(serde_json::from_str::<Outbound>(&json).unwrap(), Outbound::Message(msg));
    }

    #[tokio::test]
    async fn test_coalesce_joins_queued_payloads() {
        let (tx, mut rx) = mpsc::channel::<Payload>(8);
        tx.send("b".into()).await.unwrap();
        tx.send("c".into()).await.unwrap();
        assert_eq!(coalesce("a".into(), &mut rx, MAX_COALESCED_BYTES), "a\nb\nc");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_coalesce_respects_byte_limit() {
        let (tx, mut rx) = mpsc::channel::<Payload>(8);
        tx.send("bbbb".into()).await.unwrap();
        tx.send("cccc".into()).await.unwrap();
        assert_eq!(coalesce("aaaa".into(), &mut rx, 6), "aaaa\nbbbb");
        assert_eq!(&*rx.try_recv().unwrap(), "cccc");
    }
}
