use chrono::{DateTime, Utc};

/// Things a peer surfaces to whoever is driving it (the CLI, a UI, tests).
#[derive(Debug, Clone)]
pub enum PeerEvent {
    DirectMessage {
        from: String,
        message: String,
    },
    RoomMessage {
        room_id: String,
        sender: String,
        message: String,
        timestamp: DateTime<Utc>,
    },
}
