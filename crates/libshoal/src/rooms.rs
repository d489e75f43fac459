use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex as SyncMutex;
use serde::{Deserialize, Serialize};
use shoal_proto::chat::{ChatFrame, RoomMessage, SyncResponse};
use shoal_proto::control::RoomInfo;
use tokio::sync::{broadcast, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::chat::ChatFabric;
use crate::client::TrackerClient;
use crate::events::PeerEvent;

/// Rooms that saw a message in this window are synced every cycle.
const ACTIVITY_WINDOW: Duration = Duration::from_secs(5 * 60);
/// Idle rooms are still reconciled at least this often.
const STALE_SYNC: Duration = Duration::from_secs(10 * 60);
/// Members pulled from per sync round.
const SYNC_FANOUT: usize = 2;

#[derive(Default)]
struct RoomState {
    messages: Vec<RoomMessage>,
    last_activity: Option<Instant>,
    last_sync: Option<Instant>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Journal {
    messages: Vec<RoomMessage>,
}

/// Merges `incoming` into `existing`: duplicates (by hash) are discarded,
/// the result is ordered by timestamp with ties broken by hash. Returns the
/// records that were actually new.
pub fn merge_messages(
    existing: &mut Vec<RoomMessage>,
    incoming: impl IntoIterator<Item = RoomMessage>,
) -> Vec<RoomMessage> {
    let known: HashSet<_> = existing.iter().map(|m| m.hash).collect();
    let mut added = Vec::new();
    for msg in incoming {
        if !known.contains(&msg.hash) && !added.iter().any(|a: &RoomMessage| a.hash == msg.hash) {
            added.push(msg);
        }
    }
    existing.extend(added.iter().cloned());
    existing.sort_by_key(|m| m.sort_key());
    added
}

/// Per-room message journals with convergent replication.
///
/// The tracker stays the authority for membership; this only caches what it
/// says and refuses sync service to peers the tracker doesn't list.
pub struct RoomManager {
    username: String,
    client: Arc<TrackerClient>,
    fabric: Arc<ChatFabric>,
    journals_dir: PathBuf,
    logs_dir: PathBuf,
    rooms: DashMap<String, Arc<Mutex<RoomState>>>,
    syncing: SyncMutex<HashSet<String>>,
    events: broadcast::Sender<PeerEvent>,
}

impl RoomManager {
    pub fn new(
        username: String,
        client: Arc<TrackerClient>,
        fabric: Arc<ChatFabric>,
        root_dir: &Path,
        events: broadcast::Sender<PeerEvent>,
    ) -> anyhow::Result<Arc<Self>> {
        let journals_dir = root_dir.join("room_messages");
        let logs_dir = root_dir.join("chat_logs");
        std::fs::create_dir_all(&journals_dir)?;
        std::fs::create_dir_all(&logs_dir)?;
        Ok(Arc::new(Self {
            username,
            client,
            fabric,
            journals_dir,
            logs_dir,
            rooms: DashMap::new(),
            syncing: SyncMutex::new(HashSet::new()),
            events,
        }))
    }

    fn journal_path(&self, room_id: &str) -> PathBuf {
        self.journals_dir.join(format!("room_{room_id}.json"))
    }

    fn log_path(&self, room_id: &str) -> PathBuf {
        self.logs_dir.join(format!("room_{room_id}.log"))
    }

    pub fn active_rooms(&self) -> Vec<String> {
        self.rooms.iter().map(|e| e.key().clone()).collect()
    }

    /// Creates a room on the tracker (the creator becomes moderator and
    /// first member) and starts tracking it locally.
    pub async fn create_room(&self, room_id: &str, max_history: Option<u32>) -> anyhow::Result<()> {
        self.client.create_room(room_id, max_history).await?;
        self.activate_room(room_id).await?;
        Ok(())
    }

    /// Starts tracking a room this peer is a member of: loads the journal
    /// from disk and pulls the room metadata.
    pub async fn activate_room(&self, room_id: &str) -> anyhow::Result<RoomInfo> {
        let info = self
            .client
            .get_room_info(room_id)
            .await
            .context("error fetching room info")?;
        let journal = load_journal(&self.journal_path(room_id)).await;
        let loaded = journal.messages.len();
        let state = RoomState {
            messages: journal.messages,
            ..RoomState::default()
        };
        self.rooms
            .insert(room_id.to_owned(), Arc::new(Mutex::new(state)));
        info!(room_id, loaded, "room activated");
        Ok(info)
    }

    /// Self-removal: membership goes away on the tracker, local caches are
    /// dropped (the journal file stays).
    pub async fn leave_room(&self, room_id: &str) -> anyhow::Result<()> {
        self.client.remove_member(room_id, &self.username).await?;
        self.rooms.remove(room_id);
        Ok(())
    }

    /// Moderator-only: deletes the room on the tracker and the local
    /// journal with it.
    pub async fn delete_room(&self, room_id: &str) -> anyhow::Result<()> {
        self.client.delete_room(room_id).await?;
        self.rooms.remove(room_id);
        tokio::fs::remove_file(self.journal_path(room_id)).await.ok();
        Ok(())
    }

    /// The send path: hash, persist-and-merge, then broadcast to the
    /// current member list.
    pub async fn send_message(&self, room_id: &str, text: &str) -> anyhow::Result<()> {
        let state = self
            .rooms
            .get(room_id)
            .map(|e| e.value().clone())
            .context("room is not active, join it first")?;

        // Room info resolves moderator and max-history; it also proves the
        // room still exists before we put anything on disk.
        let room_info = self.client.get_room_info(room_id).await?;
        let msg = RoomMessage::new(room_id, &self.username, text, Utc::now());

        let added = self
            .merge_into(room_id, &state, vec![msg.clone()], Some(room_info.max_history))
            .await?;
        for msg in &added {
            self.append_audit_log(room_id, msg).await;
        }

        let members = self.client.get_room_members(room_id).await?;
        let frame = ChatFrame::RoomMessage(msg);
        for member in members {
            if member.username == self.username {
                continue;
            }
            if let Err(e) = self.fabric.send_to(&member.username, &frame).await {
                debug!(member = %member.username, "room broadcast failed: {e:#}");
            }
        }
        Ok(())
    }

    /// The receive path: merge a broadcast record if the room is locally
    /// active, ignore it otherwise.
    pub async fn receive_message(&self, msg: RoomMessage) {
        let room_id = msg.room_id.clone();
        let Some(state) = self.rooms.get(&room_id).map(|e| e.value().clone()) else {
            debug!(%room_id, "ignoring message for untracked room");
            return;
        };
        match self.merge_into(&room_id, &state, vec![msg], None).await {
            Ok(added) => {
                for msg in added {
                    self.append_audit_log(&room_id, &msg).await;
                    self.events
                        .send(PeerEvent::RoomMessage {
                            room_id: room_id.clone(),
                            sender: msg.sender,
                            message: msg.message,
                            timestamp: msg.timestamp,
                        })
                        .ok();
                }
            }
            Err(e) => warn!(%room_id, "error persisting received message: {e:#}"),
        }
    }

    /// Serves a pull request from another peer. Membership is checked
    /// against the tracker on every reply; non-members get nothing.
    pub async fn handle_sync_request(&self, room_id: &str, requester: &str) -> SyncResponse {
        let members = match self.client.get_room_members(room_id).await {
            Ok(members) => members,
            Err(e) => {
                debug!(room_id, requester, "membership lookup failed: {e:#}");
                return SyncResponse::error("access denied");
            }
        };
        if !members.iter().any(|m| m.username == requester) {
            return SyncResponse::error("access denied");
        }

        let messages = match self.rooms.get(room_id).map(|e| e.value().clone()) {
            Some(state) => state.lock().await.messages.clone(),
            None => load_journal(&self.journal_path(room_id)).await.messages,
        };
        SyncResponse::ok(messages)
    }

    /// One replication round: pull from up to two random members of every
    /// room that is either lively or overdue.
    pub async fn sync_cycle(&self) {
        for room_id in self.active_rooms() {
            let due = {
                let Some(state) = self.rooms.get(&room_id).map(|e| e.value().clone()) else {
                    continue;
                };
                let state = state.lock().await;
                let lively = state
                    .last_activity
                    .is_some_and(|t| t.elapsed() < ACTIVITY_WINDOW);
                let overdue = state.last_sync.is_none_or(|t| t.elapsed() > STALE_SYNC);
                lively || overdue
            };
            if !due {
                continue;
            }
            if let Err(e) = self.sync_room(&room_id).await {
                debug!(room_id, "sync round failed: {e:#}");
            }
        }
    }

    /// Pulls journals for one room. Guarded so two syncs of the same room
    /// never run concurrently.
    pub async fn sync_room(&self, room_id: &str) -> anyhow::Result<()> {
        if !self.syncing.lock().insert(room_id.to_owned()) {
            debug!(room_id, "sync already in flight");
            return Ok(());
        }
        let result = self.sync_room_inner(room_id).await;
        self.syncing.lock().remove(room_id);
        result
    }

    async fn sync_room_inner(&self, room_id: &str) -> anyhow::Result<()> {
        let state = self
            .rooms
            .get(room_id)
            .map(|e| e.value().clone())
            .context("room is not active")?;

        let members = self.client.get_room_members(room_id).await?;
        let candidates: Vec<String> = members
            .into_iter()
            .map(|m| m.username)
            .filter(|name| name != &self.username)
            .collect();
        let picked = {
            use rand::seq::IteratorRandom;
            candidates
                .into_iter()
                .choose_multiple(&mut rand::rng(), SYNC_FANOUT)
        };

        for member in picked {
            match self.fabric.sync_from(&member, room_id, &self.username).await {
                Ok(messages) => {
                    let added = self.merge_into(room_id, &state, messages, None).await?;
                    if !added.is_empty() {
                        debug!(room_id, %member, new = added.len(), "sync merged messages");
                    }
                    for msg in added {
                        self.append_audit_log(room_id, &msg).await;
                    }
                }
                Err(e) => debug!(room_id, %member, "sync pull failed: {e:#}"),
            }
        }
        state.lock().await.last_sync = Some(Instant::now());
        Ok(())
    }

    pub async fn history(&self, room_id: &str, limit: usize) -> Vec<RoomMessage> {
        let messages = match self.rooms.get(room_id).map(|e| e.value().clone()) {
            Some(state) => state.lock().await.messages.clone(),
            None => load_journal(&self.journal_path(room_id)).await.messages,
        };
        if limit > 0 && messages.len() > limit {
            messages[messages.len() - limit..].to_vec()
        } else {
            messages
        }
    }

    /// Read-modify-write of the journal under the room lock; the on-disk
    /// file is atomically replaced.
    async fn merge_into(
        &self,
        room_id: &str,
        state: &Mutex<RoomState>,
        incoming: Vec<RoomMessage>,
        trim_to: Option<u32>,
    ) -> anyhow::Result<Vec<RoomMessage>> {
        let mut state = state.lock().await;
        let added = merge_messages(&mut state.messages, incoming);
        if let Some(max) = trim_to {
            let max = max as usize;
            if max > 0 && state.messages.len() > max {
                let drop = state.messages.len() - max;
                state.messages.drain(..drop);
            }
        }
        if !added.is_empty() {
            state.last_activity = Some(Instant::now());
            store_journal(
                &self.journal_path(room_id),
                &Journal {
                    messages: state.messages.clone(),
                },
            )
            .await?;
        }
        Ok(added)
    }

    async fn append_audit_log(&self, room_id: &str, msg: &RoomMessage) {
        use tokio::io::AsyncWriteExt;
        let line = format!(
            "[{}] {}: {} (hash: {})\n",
            msg.timestamp.to_rfc3339(),
            msg.sender,
            msg.message,
            msg.hash
        );
        let result = async {
            let mut file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(self.log_path(room_id))
                .await?;
            file.write_all(line.as_bytes()).await
        }
        .await;
        if let Err(e) = result {
            warn!(room_id, "error appending chat log: {e:#}");
        }
    }

    pub(crate) async fn run_sync_loop(
        self: Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> anyhow::Result<()> {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick fires immediately; skip it so a freshly logged-in
        // peer doesn't sync before it joined anything.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = ticker.tick() => self.sync_cycle().await,
            }
        }
    }
}

async fn load_journal(path: &Path) -> Journal {
    match tokio::fs::read(path).await {
        Ok(bytes) => match serde_json::from_slice(&bytes) {
            Ok(journal) => journal,
            Err(e) => {
                warn!(path = %path.display(), "corrupt journal, starting empty: {e:#}");
                Journal::default()
            }
        },
        Err(_) => Journal::default(),
    }
}

async fn store_journal(path: &Path, journal: &Journal) -> anyhow::Result<()> {
    let tmp = path.with_extension("json.tmp");
    let bytes = serde_json::to_vec_pretty(journal)?;
    tokio::fs::write(&tmp, &bytes)
        .await
        .with_context(|| format!("error writing {tmp:?}"))?;
    tokio::fs::rename(&tmp, path)
        .await
        .with_context(|| format!("error replacing {path:?}"))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn msg(room: &str, sender: &str, text: &str, secs: i64) -> RoomMessage {
        let ts = chrono::Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap();
        RoomMessage::new(room, sender, text, ts)
    }

    #[test]
    fn test_merge_dedups_and_sorts() {
        let mut journal = vec![msg("r", "a", "first", 0), msg("r", "b", "third", 20)];
        let added = merge_messages(
            &mut journal,
            vec![
                msg("r", "a", "first", 0),   // duplicate
                msg("r", "c", "second", 10), // lands in the middle
            ],
        );
        assert_eq!(added.len(), 1);
        assert_eq!(added[0].message, "second");
        let texts: Vec<_> = journal.iter().map(|m| m.message.as_str()).collect();
        assert_eq!(texts, vec!["first", "second", "third"]);
    }

    #[test]
    fn test_merge_is_order_independent() {
        let all = vec![
            msg("r", "a", "m1", 0),
            msg("r", "b", "m2", 5),
            msg("r", "c", "m3", 9),
            msg("r", "a", "m4", 12),
        ];

        // Two members receive the same set in different interleavings.
        let mut left = Vec::new();
        merge_messages(&mut left, vec![all[1].clone(), all[3].clone()]);
        merge_messages(&mut left, vec![all[0].clone(), all[2].clone()]);

        let mut right = Vec::new();
        merge_messages(&mut right, vec![all[2].clone(), all[0].clone(), all[1].clone()]);
        merge_messages(&mut right, vec![all[3].clone(), all[1].clone()]);

        assert_eq!(left, right);
        assert_eq!(left.len(), 4);
    }

    #[test]
    fn test_merge_breaks_timestamp_ties_by_hash() {
        let a = msg("r", "a", "same instant", 7);
        let b = msg("r", "b", "same instant", 7);
        let mut one = Vec::new();
        merge_messages(&mut one, vec![a.clone(), b.clone()]);
        let mut two = Vec::new();
        merge_messages(&mut two, vec![b, a]);
        assert_eq!(one, two);
    }

    #[tokio::test]
    async fn test_journal_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("room_x.json");
        let journal = Journal {
            messages: vec![msg("x", "a", "persisted", 0)],
        };
        store_journal(&path, &journal).await.unwrap();
        let loaded = load_journal(&path).await;
        assert_eq!(loaded.messages, journal.messages);
        // No temp file left behind.
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[tokio::test]
    async fn test_missing_or_corrupt_journal_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("room_y.json");
        assert!(load_journal(&path).await.messages.is_empty());
        tokio::fs::write(&path, b"{{{{").await.unwrap();
        assert!(load_journal(&path).await.messages.is_empty());
    }
}
