//! Cache partition keys.
//!
//! A direct conversation is keyed by its two participants in lexicographic
//! order, so (alice, bob) and (bob, alice) land in the same partition.

use std::fmt;

use crate::chat::models::{Message, Target};

/// A conversation whose history is cached as one partition.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Conversation {
    Global,
    Direct { low: String, high: String },
    Room(String),
}

impl Conversation {
    /// Direct conversation between two identities, in either order.
    pub fn direct(a: &str, b: &str) -> Self {
        let (low, high) = if a <= b { (a, b) } else { (b, a) };
        Conversation::Direct {
            low: low.to_string(),
            high: high.to_string(),
        }
    }

    pub fn room(room_id: &str) -> Self {
        Conversation::Room(room_id.to_string())
    }

    /// The conversation a message belongs to.
    pub fn of(message: &Message) -> Self {
        match &message.target {
            Target::Broadcast => Conversation::Global,
            Target::Direct { recipient_id } => Conversation::direct(&message.sender_id, recipient_id),
            Target::Room { room_id } => Conversation::room(room_id),
        }
    }

    /// Key of the cache partition holding this conversation.
    pub fn cache_key(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for Conversation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Conversation::Global => f.write_str("messages:global"),
            Conversation::Direct { low, high } => write!(f, "messages:private:{}:{}", low, high),
            Conversation::Room(room_id) => write!(f, "messages:room:{}", room_id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::models::NewMessage;

    #[test]
    fn test_direct_key_is_order_independent() {
        let pairs = [("alice", "bob"), ("Zed", "amy"), ("user-10", "user-9"), ("a", "ab")];
        for (a, b) in pairs {
            assert_eq!(Conversation::direct(a, b), Conversation::direct(b, a));
            assert_eq!(
                Conversation::direct(a, b).cache_key(),
                Conversation::direct(b, a).cache_key()
            );
        }
    }

    #[test]
    fn test_key_scheme() {
        assert_eq!(Conversation::Global.cache_key(), "messages:global");
        assert_eq!(
            Conversation::direct("bob", "alice").cache_key(),
            "messages:private:alice:bob"
        );
        assert_eq!(Conversation::room("42").cache_key(), "messages:room:42");
    }

    #[test]
    fn test_conversation_of_message() {
        let sent = NewMessage::now(
            "bob",
            Target::Direct {
                recipient_id: "alice".to_string(),
            },
            "yo".to_string(),
        )
        .into_message(1);
        assert_eq!(Conversation::of(&sent), Conversation::direct("alice", "bob"));

        let global = NewMessage::now("bob", Target::Broadcast, "all".to_string()).into_message(2);
        assert_eq!(Conversation::of(&global), Conversation::Global);
    }
}
