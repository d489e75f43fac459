use std::collections::HashSet;
use std::path::Path;
use std::str::FromStr;

use r2d2::Pool;
use r2d2_sqlite::rusqlite::{params, Connection, OptionalExtension};
use r2d2_sqlite::SqliteConnectionManager;
use shoal_core::Id32;

use super::{
    ActivePeer, MemberRecord, PeerEndpoint, Result, RoomRecord, ScoreTotals, Store, StoreError,
    StoredFile,
};

/// SQLite-backed store. A connection pool serialises writes; every method
/// grabs a pooled connection for the duration of the call.
pub struct SqliteStore {
    pool: Pool<SqliteConnectionManager>,
}

impl SqliteStore {
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let manager = SqliteConnectionManager::file(db_path.as_ref());
        Self::from_manager(manager)
    }

    pub fn open_in_memory() -> Result<Self> {
        // A single shared connection, or each pooled connection would see its
        // own empty database.
        let manager = SqliteConnectionManager::memory();
        let pool = Pool::builder()
            .max_size(1)
            .build(manager)
            .map_err(StoreError::Pool)?;
        let store = Self { pool };
        store.create_tables()?;
        Ok(store)
    }

    fn from_manager(manager: SqliteConnectionManager) -> Result<Self> {
        let pool = Pool::new(manager).map_err(StoreError::Pool)?;
        let store = Self { pool };
        store.create_tables()?;
        Ok(store)
    }

    fn conn(&self) -> Result<r2d2::PooledConnection<SqliteConnectionManager>> {
        Ok(self.pool.get()?)
    }

    fn create_tables(&self) -> Result<()> {
        let conn = self.conn()?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS users (
                username TEXT PRIMARY KEY,
                password TEXT NOT NULL,
                addr TEXT NOT NULL,
                data_port INTEGER NOT NULL,
                chat_port INTEGER NOT NULL DEFAULT 0,
                active INTEGER NOT NULL DEFAULT 0,
                last_seen INTEGER NOT NULL DEFAULT 0
            );
            CREATE TABLE IF NOT EXISTS peer_scores (
                username TEXT PRIMARY KEY,
                seconds_online REAL NOT NULL DEFAULT 0,
                chunks_served INTEGER NOT NULL DEFAULT 0
            );
            CREATE TABLE IF NOT EXISTS files (
                file_hash TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                size INTEGER NOT NULL,
                chunk_hashes TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS peer_files (
                username TEXT NOT NULL,
                file_hash TEXT NOT NULL,
                PRIMARY KEY (username, file_hash)
            );
            CREATE TABLE IF NOT EXISTS chat_rooms (
                room_id TEXT PRIMARY KEY,
                moderator TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                max_history INTEGER NOT NULL DEFAULT 100
            );
            CREATE TABLE IF NOT EXISTS room_members (
                room_id TEXT NOT NULL,
                username TEXT NOT NULL,
                joined_at INTEGER NOT NULL,
                PRIMARY KEY (room_id, username)
            );
            ",
        )?;
        Ok(())
    }
}

fn gc_orphan_files(conn: &Connection) -> std::result::Result<(), r2d2_sqlite::rusqlite::Error> {
    conn.execute(
        "DELETE FROM files WHERE file_hash NOT IN (SELECT file_hash FROM peer_files)",
        [],
    )?;
    Ok(())
}

fn row_to_file(
    hash: String,
    name: String,
    size: i64,
    chunk_hashes: String,
) -> Result<StoredFile> {
    let hash = Id32::from_str(&hash).map_err(StoreError::Other)?;
    let chunk_hashes: Vec<Id32> =
        serde_json::from_str(&chunk_hashes).map_err(|e| StoreError::Other(e.into()))?;
    Ok(StoredFile {
        hash,
        name,
        size: size as u64,
        chunk_hashes,
    })
}

impl Store for SqliteStore {
    fn create_user(
        &self,
        username: &str,
        password_hash: &str,
        endpoint: PeerEndpoint,
    ) -> Result<()> {
        let conn = self.conn()?;
        let exists: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM users WHERE username = ?1",
                params![username],
                |row| row.get(0),
            )
            .optional()?;
        if exists.is_some() {
            return Err(StoreError::UserExists);
        }
        conn.execute(
            "INSERT INTO users (username, password, addr, data_port, chat_port)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                username,
                password_hash,
                endpoint.addr.to_string(),
                endpoint.data_port,
                endpoint.chat_port
            ],
        )?;
        Ok(())
    }

    fn password_hash(&self, username: &str) -> Result<Option<String>> {
        let conn = self.conn()?;
        Ok(conn
            .query_row(
                "SELECT password FROM users WHERE username = ?1",
                params![username],
                |row| row.get(0),
            )
            .optional()?)
    }

    fn activate_peer(&self, username: &str, endpoint: PeerEndpoint, now: i64) -> Result<()> {
        let conn = self.conn()?;
        let n = conn.execute(
            "UPDATE users SET addr = ?1, data_port = ?2, chat_port = ?3, active = 1,
                    last_seen = ?4 WHERE username = ?5",
            params![
                endpoint.addr.to_string(),
                endpoint.data_port,
                endpoint.chat_port,
                now,
                username
            ],
        )?;
        if n == 0 {
            return Err(StoreError::UserNotFound);
        }
        Ok(())
    }

    fn deactivate_peer(&self, username: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE users SET active = 0 WHERE username = ?1",
            params![username],
        )?;
        Ok(())
    }

    fn peer_status(&self, username: &str) -> Result<Option<(bool, i64)>> {
        let conn = self.conn()?;
        Ok(conn
            .query_row(
                "SELECT active, last_seen FROM users WHERE username = ?1",
                params![username],
                |row| Ok((row.get::<_, i64>(0)? != 0, row.get(1)?)),
            )
            .optional()?)
    }

    fn announce_file(&self, username: &str, file: &StoredFile) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT OR IGNORE INTO files (file_hash, name, size, chunk_hashes)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                file.hash.as_string(),
                file.name,
                file.size as i64,
                serde_json::to_string(&file.chunk_hashes)
                    .map_err(|e| StoreError::Other(e.into()))?
            ],
        )?;
        tx.execute(
            "INSERT OR IGNORE INTO peer_files (username, file_hash) VALUES (?1, ?2)",
            params![username, file.hash.as_string()],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn associate_partial(&self, username: &str, hash: &Id32) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT OR IGNORE INTO peer_files (username, file_hash) VALUES (?1, ?2)",
            params![username, hash.as_string()],
        )?;
        Ok(())
    }

    fn reconcile_peer_files(&self, username: &str, hashes: &[Id32], now: i64) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        tx.execute(
            "UPDATE users SET last_seen = ?1 WHERE username = ?2",
            params![now, username],
        )?;
        let old: HashSet<String> = {
            let mut stmt = tx.prepare("SELECT file_hash FROM peer_files WHERE username = ?1")?;
            let rows = stmt.query_map(params![username], |row| row.get::<_, String>(0))?;
            rows.collect::<std::result::Result<_, _>>()?
        };
        let new: HashSet<String> = hashes.iter().map(|h| h.as_string()).collect();
        for hash in new.difference(&old) {
            tx.execute(
                "INSERT OR IGNORE INTO peer_files (username, file_hash) VALUES (?1, ?2)",
                params![username, hash],
            )?;
        }
        for hash in old.difference(&new) {
            tx.execute(
                "DELETE FROM peer_files WHERE username = ?1 AND file_hash = ?2",
                params![username, hash],
            )?;
        }
        gc_orphan_files(&tx)?;
        tx.commit()?;
        Ok(())
    }

    fn remove_peer_files(&self, username: &str) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM peer_files WHERE username = ?1",
            params![username],
        )?;
        gc_orphan_files(&tx)?;
        tx.commit()?;
        Ok(())
    }

    fn active_peers_with_file(&self, hash: &Id32, cutoff: i64) -> Result<Vec<ActivePeer>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT u.username, u.addr, u.data_port, ps.seconds_online, ps.chunks_served
             FROM users u
             LEFT JOIN peer_scores ps ON u.username = ps.username
             WHERE u.active = 1 AND u.last_seen >= ?1
               AND u.username IN (SELECT username FROM peer_files WHERE file_hash = ?2)",
        )?;
        let rows = stmt.query_map(params![cutoff, hash.as_string()], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, u16>(2)?,
                row.get::<_, Option<f64>>(3)?,
                row.get::<_, Option<i64>>(4)?,
            ))
        })?;
        let mut peers = Vec::new();
        for row in rows {
            let (username, addr, data_port, seconds, chunks) = row?;
            let addr = addr
                .parse()
                .map_err(|e| StoreError::Other(anyhow::anyhow!("bad addr in db: {e}")))?;
            peers.push(ActivePeer {
                username,
                addr,
                data_port,
                totals: ScoreTotals {
                    seconds_online: seconds.unwrap_or(0.0),
                    chunks_served: chunks.unwrap_or(0) as u64,
                },
            });
        }
        Ok(peers)
    }

    fn file_metadata(&self, hash: &Id32) -> Result<Option<StoredFile>> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                "SELECT file_hash, name, size, chunk_hashes FROM files WHERE file_hash = ?1",
                params![hash.as_string()],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, String>(3)?,
                    ))
                },
            )
            .optional()?;
        row.map(|(h, n, s, c)| row_to_file(h, n, s, c)).transpose()
    }

    fn list_files(&self) -> Result<Vec<StoredFile>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT file_hash, name, size, chunk_hashes FROM files")?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, String>(3)?,
            ))
        })?;
        let mut files = Vec::new();
        for row in rows {
            let (h, n, s, c) = row?;
            files.push(row_to_file(h, n, s, c)?);
        }
        Ok(files)
    }

    fn online_users(&self, cutoff: i64) -> Result<Vec<String>> {
        let conn = self.conn()?;
        let mut stmt =
            conn.prepare("SELECT username FROM users WHERE active = 1 AND last_seen >= ?1")?;
        let rows = stmt.query_map(params![cutoff], |row| row.get(0))?;
        Ok(rows.collect::<std::result::Result<_, _>>()?)
    }

    fn peer_endpoint(&self, username: &str, cutoff: i64) -> Result<Option<PeerEndpoint>> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                "SELECT addr, data_port, chat_port FROM users
                 WHERE username = ?1 AND active = 1 AND last_seen >= ?2",
                params![username, cutoff],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, u16>(1)?,
                        row.get::<_, u16>(2)?,
                    ))
                },
            )
            .optional()?;
        row.map(|(addr, data_port, chat_port)| {
            let addr = addr
                .parse()
                .map_err(|e| StoreError::Other(anyhow::anyhow!("bad addr in db: {e}")))?;
            Ok(PeerEndpoint {
                addr,
                data_port,
                chat_port,
            })
        })
        .transpose()
    }

    fn add_score(&self, username: &str, seconds_online: f64, chunks_served: u64) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO peer_scores (username, seconds_online, chunks_served)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(username) DO UPDATE SET
                seconds_online = seconds_online + excluded.seconds_online,
                chunks_served = chunks_served + excluded.chunks_served",
            params![username, seconds_online, chunks_served as i64],
        )?;
        Ok(())
    }

    fn score_totals(&self, username: &str) -> Result<ScoreTotals> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                "SELECT seconds_online, chunks_served FROM peer_scores WHERE username = ?1",
                params![username],
                |row| Ok((row.get::<_, f64>(0)?, row.get::<_, i64>(1)?)),
            )
            .optional()?;
        Ok(row
            .map(|(seconds_online, chunks_served)| ScoreTotals {
                seconds_online,
                chunks_served: chunks_served as u64,
            })
            .unwrap_or_default())
    }

    fn create_room(&self, room: &RoomRecord) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let exists: Option<i64> = tx
            .query_row(
                "SELECT 1 FROM chat_rooms WHERE room_id = ?1",
                params![room.room_id],
                |row| row.get(0),
            )
            .optional()?;
        if exists.is_some() {
            return Err(StoreError::RoomExists);
        }
        tx.execute(
            "INSERT INTO chat_rooms (room_id, moderator, created_at, max_history)
             VALUES (?1, ?2, ?3, ?4)",
            params![room.room_id, room.moderator, room.created_at, room.max_history],
        )?;
        tx.execute(
            "INSERT INTO room_members (room_id, username, joined_at) VALUES (?1, ?2, ?3)",
            params![room.room_id, room.moderator, room.created_at],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn delete_room(&self, room_id: &str) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM room_members WHERE room_id = ?1",
            params![room_id],
        )?;
        tx.execute("DELETE FROM chat_rooms WHERE room_id = ?1", params![room_id])?;
        tx.commit()?;
        Ok(())
    }

    fn room_info(&self, room_id: &str) -> Result<Option<RoomRecord>> {
        let conn = self.conn()?;
        Ok(conn
            .query_row(
                "SELECT room_id, moderator, created_at, max_history
                 FROM chat_rooms WHERE room_id = ?1",
                params![room_id],
                |row| {
                    Ok(RoomRecord {
                        room_id: row.get(0)?,
                        moderator: row.get(1)?,
                        created_at: row.get(2)?,
                        max_history: row.get(3)?,
                    })
                },
            )
            .optional()?)
    }

    fn list_rooms(&self) -> Result<Vec<(String, String)>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT room_id, moderator FROM chat_rooms")?;
        let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
        Ok(rows.collect::<std::result::Result<_, _>>()?)
    }

    fn add_room_member(&self, room_id: &str, username: &str, now: i64) -> Result<()> {
        let conn = self.conn()?;
        let user_exists: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM users WHERE username = ?1",
                params![username],
                |row| row.get(0),
            )
            .optional()?;
        if user_exists.is_none() {
            return Err(StoreError::UserNotFound);
        }
        let room_exists: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM chat_rooms WHERE room_id = ?1",
                params![room_id],
                |row| row.get(0),
            )
            .optional()?;
        if room_exists.is_none() {
            return Err(StoreError::RoomNotFound);
        }
        conn.execute(
            "INSERT OR IGNORE INTO room_members (room_id, username, joined_at)
             VALUES (?1, ?2, ?3)",
            params![room_id, username, now],
        )?;
        Ok(())
    }

    fn remove_room_member(&self, room_id: &str, username: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "DELETE FROM room_members WHERE room_id = ?1 AND username = ?2",
            params![room_id, username],
        )?;
        Ok(())
    }

    fn room_members(&self, room_id: &str) -> Result<Vec<MemberRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT username, joined_at FROM room_members WHERE room_id = ?1 ORDER BY joined_at",
        )?;
        let rows = stmt.query_map(params![room_id], |row| {
            Ok(MemberRecord {
                username: row.get(0)?,
                joined_at: row.get(1)?,
            })
        })?;
        Ok(rows.collect::<std::result::Result<_, _>>()?)
    }

    fn is_room_member(&self, room_id: &str, username: &str) -> Result<bool> {
        let conn = self.conn()?;
        let row: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM room_members WHERE room_id = ?1 AND username = ?2",
                params![room_id, username],
                |row| row.get(0),
            )
            .optional()?;
        Ok(row.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint(data_port: u16) -> PeerEndpoint {
        PeerEndpoint {
            addr: "127.0.0.1".parse().unwrap(),
            data_port,
            chat_port: data_port + 1,
        }
    }

    fn file(tag: u8, owners_chunks: u32) -> StoredFile {
        StoredFile {
            hash: Id32::new([tag; 32]),
            name: format!("file{tag}.bin"),
            size: owners_chunks as u64 * 1024,
            chunk_hashes: (0..owners_chunks).map(|i| Id32::new([i as u8 + 1; 32])).collect(),
        }
    }

    #[test]
    fn test_user_lifecycle() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.create_user("alice", "phc", endpoint(7000)).unwrap();
        assert!(matches!(
            store.create_user("alice", "phc", endpoint(7000)),
            Err(StoreError::UserExists)
        ));
        assert_eq!(store.password_hash("alice").unwrap().unwrap(), "phc");
        assert_eq!(store.password_hash("bob").unwrap(), None);

        assert_eq!(store.peer_status("alice").unwrap(), Some((false, 0)));
        store.activate_peer("alice", endpoint(7002), 100).unwrap();
        assert_eq!(store.peer_status("alice").unwrap(), Some((true, 100)));
        let ep = store.peer_endpoint("alice", 50).unwrap().unwrap();
        assert_eq!(ep.data_port, 7002);
        // Stale cutoff hides the peer.
        assert_eq!(store.peer_endpoint("alice", 101).unwrap(), None);

        store.deactivate_peer("alice").unwrap();
        assert_eq!(store.peer_status("alice").unwrap(), Some((false, 100)));
    }

    #[test]
    fn test_announce_reconcile_and_gc() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.create_user("alice", "x", endpoint(7000)).unwrap();
        store.activate_peer("alice", endpoint(7000), 10).unwrap();

        let f1 = file(1, 3);
        let f2 = file(2, 2);
        store.announce_file("alice", &f1).unwrap();
        store.announce_file("alice", &f2).unwrap();
        assert_eq!(store.list_files().unwrap().len(), 2);
        assert_eq!(store.file_metadata(&f1.hash).unwrap().unwrap(), f1);

        // Dropping f2 from the share set deletes the association and the
        // now-orphaned file record.
        store
            .reconcile_peer_files("alice", &[f1.hash], 20)
            .unwrap();
        assert_eq!(store.list_files().unwrap().len(), 1);
        assert_eq!(store.file_metadata(&f2.hash).unwrap(), None);
        assert_eq!(store.peer_status("alice").unwrap(), Some((true, 20)));

        store.remove_peer_files("alice").unwrap();
        assert_eq!(store.list_files().unwrap().len(), 0);
    }

    #[test]
    fn test_partial_association_keeps_file_alive() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.create_user("seed", "x", endpoint(7000)).unwrap();
        store.create_user("leech", "x", endpoint(8000)).unwrap();
        store.activate_peer("seed", endpoint(7000), 10).unwrap();
        store.activate_peer("leech", endpoint(8000), 10).unwrap();

        let f = file(9, 3);
        store.announce_file("seed", &f).unwrap();
        store.associate_partial("leech", &f.hash).unwrap();

        let peers = store.active_peers_with_file(&f.hash, 0).unwrap();
        let mut names: Vec<_> = peers.iter().map(|p| p.username.as_str()).collect();
        names.sort_unstable();
        assert_eq!(names, vec!["leech", "seed"]);

        // Seed drops out entirely; the file survives through the partial.
        store.remove_peer_files("seed").unwrap();
        assert!(store.file_metadata(&f.hash).unwrap().is_some());
    }

    #[test]
    fn test_scores_accumulate() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.create_user("alice", "x", endpoint(7000)).unwrap();
        assert_eq!(store.score_totals("alice").unwrap(), ScoreTotals::default());
        store.add_score("alice", 60.0, 5).unwrap();
        store.add_score("alice", 30.5, 0).unwrap();
        let totals = store.score_totals("alice").unwrap();
        assert_eq!(totals.seconds_online, 90.5);
        assert_eq!(totals.chunks_served, 5);
    }

    #[test]
    fn test_rooms() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.create_user("mod", "x", endpoint(7000)).unwrap();
        store.create_user("alice", "x", endpoint(7002)).unwrap();

        let room = RoomRecord {
            room_id: "lobby".into(),
            moderator: "mod".into(),
            created_at: 1000,
            max_history: 100,
        };
        store.create_room(&room).unwrap();
        assert!(matches!(
            store.create_room(&room),
            Err(StoreError::RoomExists)
        ));
        // Moderator is the first member.
        assert!(store.is_room_member("lobby", "mod").unwrap());

        store.add_room_member("lobby", "alice", 1001).unwrap();
        assert!(matches!(
            store.add_room_member("lobby", "ghost", 1001),
            Err(StoreError::UserNotFound)
        ));
        assert!(matches!(
            store.add_room_member("nowhere", "alice", 1001),
            Err(StoreError::RoomNotFound)
        ));

        let members = store.room_members("lobby").unwrap();
        assert_eq!(members.len(), 2);
        assert_eq!(members[0].username, "mod");

        store.remove_room_member("lobby", "alice").unwrap();
        assert!(!store.is_room_member("lobby", "alice").unwrap());

        store.delete_room("lobby").unwrap();
        assert_eq!(store.room_info("lobby").unwrap(), None);
        assert!(!store.is_room_member("lobby", "mod").unwrap());
    }

    #[test]
    fn test_open_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tracker.db");
        {
            let store = SqliteStore::open(&path).unwrap();
            store.create_user("alice", "x", endpoint(7000)).unwrap();
        }
        // Reopen: state persisted.
        let store = SqliteStore::open(&path).unwrap();
        assert!(store.password_hash("alice").unwrap().is_some());
    }
}
