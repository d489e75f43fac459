mod memory;
mod sqlite;

use std::net::IpAddr;

use shoal_core::Id32;

pub use memory::MemStore;
pub use sqlite::SqliteStore;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("user already exists")]
    UserExists,
    #[error("user not found")]
    UserNotFound,
    #[error("room already exists")]
    RoomExists,
    #[error("room not found")]
    RoomNotFound,
    #[error("database error: {0}")]
    Sqlite(#[from] r2d2_sqlite::rusqlite::Error),
    #[error("connection pool error: {0}")]
    Pool(#[from] r2d2::Error),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ScoreTotals {
    pub seconds_online: f64,
    pub chunks_served: u64,
}

/// A peer's current network endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerEndpoint {
    pub addr: IpAddr,
    pub data_port: u16,
    pub chat_port: u16,
}

/// `active_peers_with_file` result row.
#[derive(Debug, Clone, PartialEq)]
pub struct ActivePeer {
    pub username: String,
    pub addr: IpAddr,
    pub data_port: u16,
    pub totals: ScoreTotals,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredFile {
    pub hash: Id32,
    pub name: String,
    pub size: u64,
    pub chunk_hashes: Vec<Id32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomRecord {
    pub room_id: String,
    pub moderator: String,
    pub created_at: i64,
    pub max_history: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberRecord {
    pub username: String,
    pub joined_at: i64,
}

/// Typed persistence operations behind the tracker. One implementation is
/// SQLite, one is in-memory; the service is written against this trait so
/// either can back it.
///
/// Timestamps are unix seconds. "cutoff" parameters mean: only peers with
/// `last_seen >= cutoff` count as online.
pub trait Store: Send + Sync + 'static {
    // users
    fn create_user(
        &self,
        username: &str,
        password_hash: &str,
        endpoint: PeerEndpoint,
    ) -> Result<()>;
    fn password_hash(&self, username: &str) -> Result<Option<String>>;
    /// Marks the peer active, updates its endpoints, stamps last_seen.
    fn activate_peer(&self, username: &str, endpoint: PeerEndpoint, now: i64) -> Result<()>;
    fn deactivate_peer(&self, username: &str) -> Result<()>;
    /// (active flag, last_seen), None if the user doesn't exist.
    fn peer_status(&self, username: &str) -> Result<Option<(bool, i64)>>;

    // file index
    /// Inserts the file if it's new, then associates the peer with it.
    fn announce_file(&self, username: &str, file: &StoredFile) -> Result<()>;
    /// Associates the peer without creating a file record.
    fn associate_partial(&self, username: &str, hash: &Id32) -> Result<()>;
    /// Replaces the peer's association set with exactly `hashes`, stamps
    /// last_seen, garbage-collects files nobody owns anymore.
    fn reconcile_peer_files(&self, username: &str, hashes: &[Id32], now: i64) -> Result<()>;
    /// Drops all of the peer's associations and garbage-collects orphans.
    fn remove_peer_files(&self, username: &str) -> Result<()>;
    fn active_peers_with_file(&self, hash: &Id32, cutoff: i64) -> Result<Vec<ActivePeer>>;
    fn file_metadata(&self, hash: &Id32) -> Result<Option<StoredFile>>;
    fn list_files(&self) -> Result<Vec<StoredFile>>;

    // presence
    fn online_users(&self, cutoff: i64) -> Result<Vec<String>>;
    fn peer_endpoint(&self, username: &str, cutoff: i64) -> Result<Option<PeerEndpoint>>;

    // scores
    fn add_score(&self, username: &str, seconds_online: f64, chunks_served: u64) -> Result<()>;
    fn score_totals(&self, username: &str) -> Result<ScoreTotals>;

    // rooms
    /// Creates the room and inserts the moderator as its first member.
    fn create_room(&self, room: &RoomRecord) -> Result<()>;
    fn delete_room(&self, room_id: &str) -> Result<()>;
    fn room_info(&self, room_id: &str) -> Result<Option<RoomRecord>>;
    fn list_rooms(&self) -> Result<Vec<(String, String)>>;
    fn add_room_member(&self, room_id: &str, username: &str, now: i64) -> Result<()>;
    fn remove_room_member(&self, room_id: &str, username: &str) -> Result<()>;
    fn room_members(&self, room_id: &str) -> Result<Vec<MemberRecord>>;
    fn is_room_member(&self, room_id: &str, username: &str) -> Result<bool>;
}
