use std::collections::{HashMap, HashSet};

use parking_lot::Mutex;
use shoal_core::Id32;

use super::{
    ActivePeer, MemberRecord, PeerEndpoint, Result, RoomRecord, ScoreTotals, Store, StoreError,
    StoredFile,
};

#[derive(Debug, Clone)]
struct MemUser {
    password_hash: String,
    endpoint: PeerEndpoint,
    active: bool,
    last_seen: i64,
}

#[derive(Default)]
struct Inner {
    users: HashMap<String, MemUser>,
    scores: HashMap<String, ScoreTotals>,
    files: HashMap<Id32, StoredFile>,
    peer_files: HashSet<(String, Id32)>,
    rooms: HashMap<String, RoomRecord>,
    members: HashMap<String, Vec<MemberRecord>>,
}

impl Inner {
    fn gc_orphan_files(&mut self) {
        let peer_files = &self.peer_files;
        self.files
            .retain(|hash, _| peer_files.iter().any(|(_, h)| h == hash));
    }
}

/// In-memory store with the same semantics as the SQLite one. Used by tests
/// and by embedders that don't want a database file.
#[derive(Default)]
pub struct MemStore {
    inner: Mutex<Inner>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Store for MemStore {
    fn create_user(
        &self,
        username: &str,
        password_hash: &str,
        endpoint: PeerEndpoint,
    ) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.users.contains_key(username) {
            return Err(StoreError::UserExists);
        }
        inner.users.insert(
            username.to_owned(),
            MemUser {
                password_hash: password_hash.to_owned(),
                endpoint,
                active: false,
                last_seen: 0,
            },
        );
        Ok(())
    }

    fn password_hash(&self, username: &str) -> Result<Option<String>> {
        Ok(self
            .inner
            .lock()
            .users
            .get(username)
            .map(|u| u.password_hash.clone()))
    }

    fn activate_peer(&self, username: &str, endpoint: PeerEndpoint, now: i64) -> Result<()> {
        let mut inner = self.inner.lock();
        let user = inner
            .users
            .get_mut(username)
            .ok_or(StoreError::UserNotFound)?;
        user.endpoint = endpoint;
        user.active = true;
        user.last_seen = now;
        Ok(())
    }

    fn deactivate_peer(&self, username: &str) -> Result<()> {
        if let Some(user) = self.inner.lock().users.get_mut(username) {
            user.active = false;
        }
        Ok(())
    }

    fn peer_status(&self, username: &str) -> Result<Option<(bool, i64)>> {
        Ok(self
            .inner
            .lock()
            .users
            .get(username)
            .map(|u| (u.active, u.last_seen)))
    }

    fn announce_file(&self, username: &str, file: &StoredFile) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.files.entry(file.hash).or_insert_with(|| file.clone());
        inner.peer_files.insert((username.to_owned(), file.hash));
        Ok(())
    }

    fn associate_partial(&self, username: &str, hash: &Id32) -> Result<()> {
        self.inner
            .lock()
            .peer_files
            .insert((username.to_owned(), *hash));
        Ok(())
    }

    fn reconcile_peer_files(&self, username: &str, hashes: &[Id32], now: i64) -> Result<()> {
        let mut inner = self.inner.lock();
        if let Some(user) = inner.users.get_mut(username) {
            user.last_seen = now;
        }
        let new: HashSet<Id32> = hashes.iter().copied().collect();
        inner
            .peer_files
            .retain(|(u, h)| u != username || new.contains(h));
        for hash in new {
            inner.peer_files.insert((username.to_owned(), hash));
        }
        inner.gc_orphan_files();
        Ok(())
    }

    fn remove_peer_files(&self, username: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.peer_files.retain(|(u, _)| u != username);
        inner.gc_orphan_files();
        Ok(())
    }

    fn active_peers_with_file(&self, hash: &Id32, cutoff: i64) -> Result<Vec<ActivePeer>> {
        let inner = self.inner.lock();
        let mut peers = Vec::new();
        for (username, user) in &inner.users {
            if !user.active || user.last_seen < cutoff {
                continue;
            }
            if !inner.peer_files.contains(&(username.clone(), *hash)) {
                continue;
            }
            peers.push(ActivePeer {
                username: username.clone(),
                addr: user.endpoint.addr,
                data_port: user.endpoint.data_port,
                totals: inner.scores.get(username).copied().unwrap_or_default(),
            });
        }
        Ok(peers)
    }

    fn file_metadata(&self, hash: &Id32) -> Result<Option<StoredFile>> {
        Ok(self.inner.lock().files.get(hash).cloned())
    }

    fn list_files(&self) -> Result<Vec<StoredFile>> {
        Ok(self.inner.lock().files.values().cloned().collect())
    }

    fn online_users(&self, cutoff: i64) -> Result<Vec<String>> {
        Ok(self
            .inner
            .lock()
            .users
            .iter()
            .filter(|(_, u)| u.active && u.last_seen >= cutoff)
            .map(|(name, _)| name.clone())
            .collect())
    }

    fn peer_endpoint(&self, username: &str, cutoff: i64) -> Result<Option<PeerEndpoint>> {
        Ok(self
            .inner
            .lock()
            .users
            .get(username)
            .filter(|u| u.active && u.last_seen >= cutoff)
            .map(|u| u.endpoint))
    }

    fn add_score(&self, username: &str, seconds_online: f64, chunks_served: u64) -> Result<()> {
        let mut inner = self.inner.lock();
        let totals = inner.scores.entry(username.to_owned()).or_default();
        totals.seconds_online += seconds_online;
        totals.chunks_served += chunks_served;
        Ok(())
    }

    fn score_totals(&self, username: &str) -> Result<ScoreTotals> {
        Ok(self
            .inner
            .lock()
            .scores
            .get(username)
            .copied()
            .unwrap_or_default())
    }

    fn create_room(&self, room: &RoomRecord) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.rooms.contains_key(&room.room_id) {
            return Err(StoreError::RoomExists);
        }
        inner.rooms.insert(room.room_id.clone(), room.clone());
        inner.members.insert(
            room.room_id.clone(),
            vec![MemberRecord {
                username: room.moderator.clone(),
                joined_at: room.created_at,
            }],
        );
        Ok(())
    }

    fn delete_room(&self, room_id: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.rooms.remove(room_id);
        inner.members.remove(room_id);
        Ok(())
    }

    fn room_info(&self, room_id: &str) -> Result<Option<RoomRecord>> {
        Ok(self.inner.lock().rooms.get(room_id).cloned())
    }

    fn list_rooms(&self) -> Result<Vec<(String, String)>> {
        Ok(self
            .inner
            .lock()
            .rooms
            .values()
            .map(|r| (r.room_id.clone(), r.moderator.clone()))
            .collect())
    }

    fn add_room_member(&self, room_id: &str, username: &str, now: i64) -> Result<()> {
        let mut inner = self.inner.lock();
        if !inner.users.contains_key(username) {
            return Err(StoreError::UserNotFound);
        }
        let Some(members) = inner.members.get_mut(room_id) else {
            return Err(StoreError::RoomNotFound);
        };
        if !members.iter().any(|m| m.username == username) {
            members.push(MemberRecord {
                username: username.to_owned(),
                joined_at: now,
            });
        }
        Ok(())
    }

    fn remove_room_member(&self, room_id: &str, username: &str) -> Result<()> {
        if let Some(members) = self.inner.lock().members.get_mut(room_id) {
            members.retain(|m| m.username != username);
        }
        Ok(())
    }

    fn room_members(&self, room_id: &str) -> Result<Vec<MemberRecord>> {
        Ok(self
            .inner
            .lock()
            .members
            .get(room_id)
            .cloned()
            .unwrap_or_default())
    }

    fn is_room_member(&self, room_id: &str, username: &str) -> Result<bool> {
        Ok(self
            .inner
            .lock()
            .members
            .get(room_id)
            .is_some_and(|members| members.iter().any(|m| m.username == username)))
    }
}
