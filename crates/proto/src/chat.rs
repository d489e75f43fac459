use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use shoal_core::Id32;

use crate::Status;

/// A content-addressed room message. The hash is the identity used for
/// dedup when journals are merged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomMessage {
    pub hash: Id32,
    pub room_id: String,
    pub sender: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl RoomMessage {
    pub fn new(
        room_id: impl Into<String>,
        sender: impl Into<String>,
        message: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        let room_id = room_id.into();
        let sender = sender.into();
        let message = message.into();
        let hash = message_hash(&room_id, &sender, &message, timestamp);
        Self {
            hash,
            room_id,
            sender,
            message,
            timestamp,
        }
    }

    /// Journals are ordered by timestamp, ties broken by hash.
    pub fn sort_key(&self) -> (DateTime<Utc>, Id32) {
        (self.timestamp, self.hash)
    }
}

pub fn message_hash(room_id: &str, sender: &str, message: &str, timestamp: DateTime<Utc>) -> Id32 {
    let data = format!(
        "{}:{}:{}:{}",
        room_id,
        sender,
        message,
        timestamp.to_rfc3339()
    );
    Id32(Sha256::digest(data.as_bytes()).into())
}

/// One inbound record on a peer's chat port.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ChatFrame {
    /// 1:1 direct message.
    ChatMessage { from: String, message: String },
    /// Broadcast into a room the sender believes we are a member of.
    RoomMessage(RoomMessage),
    /// Pull request: "give me all messages you have for this room". Answered
    /// with a [`SyncResponse`] on the same socket.
    SyncRoomMessages { room_id: String, requester: String },
}

impl ChatFrame {
    /// Decodes one line of the chat stream. Malformed JSON and unknown
    /// action tags both yield `None`: the record is skipped, the connection
    /// stays open.
    pub fn decode(line: &str) -> Option<ChatFrame> {
        serde_json::from_str(line).ok()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncResponse {
    pub status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub messages: Option<Vec<RoomMessage>>,
}

impl SyncResponse {
    pub fn ok(messages: Vec<RoomMessage>) -> Self {
        Self {
            status: Status::Success,
            message: None,
            messages: Some(messages),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: Status::Error,
            message: Some(message.into()),
            messages: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 5, 17, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_hash_is_deterministic() {
        let a = RoomMessage::new("r1", "alice", "hi", ts());
        let b = RoomMessage::new("r1", "alice", "hi", ts());
        assert_eq!(a.hash, b.hash);
        let c = RoomMessage::new("r1", "alice", "hi!", ts());
        assert_ne!(a.hash, c.hash);
    }

    #[test]
    fn test_room_message_frame_is_flat() {
        let frame = ChatFrame::RoomMessage(RoomMessage::new("r1", "alice", "hi", ts()));
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["action"], "room_message");
        assert_eq!(json["room_id"], "r1");
        assert_eq!(json["sender"], "alice");
        assert!(json["hash"].is_string());
    }

    #[test]
    fn test_decode_skips_junk_and_unknown_actions() {
        assert!(ChatFrame::decode("not json at all").is_none());
        assert!(ChatFrame::decode(r#"{"action":"frobnicate","x":1}"#).is_none());
        let ok = ChatFrame::decode(r#"{"action":"chat_message","from":"bob","message":"yo"}"#);
        assert!(matches!(ok, Some(ChatFrame::ChatMessage { .. })));
    }

    #[test]
    fn test_sort_key_orders_by_timestamp_then_hash() {
        let earlier = RoomMessage::new("r", "a", "1", ts());
        let later = RoomMessage::new("r", "b", "2", ts() + chrono::Duration::seconds(5));
        assert!(earlier.sort_key() < later.sort_key());
    }
}
