use std::cmp::Ordering;
use std::net::SocketAddr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use shoal_proto::control::{
    ControlRequest, ControlResponse, FileEntry, PeerEntry, RoomInfo, RoomMemberInfo, RoomSummary,
};
use shoal_proto::framing;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, debug_span, info, warn};

use crate::auth::CredentialHasher;
use crate::config::TrackerConfig;
use crate::store::{PeerEndpoint, RoomRecord, ScoreTotals, Store, StoreError, StoredFile};

const DEFAULT_MAX_HISTORY: u32 = 100;

/// The tracker: a directory of peers, files, scores and rooms. One instance
/// serves many control connections; all state lives in the [`Store`].
pub struct Tracker {
    store: Arc<dyn Store>,
    hasher: Arc<dyn CredentialHasher>,
    config: TrackerConfig,
}

fn now_ts() -> i64 {
    Utc::now().timestamp()
}

fn ts_to_datetime(ts: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(ts, 0).unwrap_or_default()
}

impl Tracker {
    pub fn new(
        store: Arc<dyn Store>,
        hasher: Arc<dyn CredentialHasher>,
        config: TrackerConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            hasher,
            config,
        })
    }

    pub fn effective_score(&self, totals: &ScoreTotals) -> f64 {
        self.config.score_weight_time * totals.seconds_online
            + self.config.score_weight_chunks * totals.chunks_served as f64
    }

    fn cutoff(&self, now: i64) -> i64 {
        now - self.config.session_ttl.as_secs() as i64
    }

    /// Serves control connections until the token fires.
    pub async fn run(
        self: Arc<Self>,
        listener: TcpListener,
        cancel: CancellationToken,
    ) -> anyhow::Result<()> {
        info!(addr = ?listener.local_addr()?, "tracker listening");
        loop {
            let (stream, addr) = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                r = listener.accept() => r?,
            };
            let this = self.clone();
            shoal_core::spawn_utils::spawn_with_cancel(
                debug_span!("control", %addr),
                cancel.clone(),
                async move { this.handle_conn(stream).await },
            );
        }
    }

    async fn handle_conn(&self, stream: TcpStream) -> anyhow::Result<()> {
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);
        let mut session: Option<String> = None;

        let result = loop {
            let line = match framing::read_line(&mut reader).await {
                Ok(Some(line)) => line,
                Ok(None) => break Ok(()),
                Err(e) => break Err(e),
            };
            let response = match serde_json::from_str::<ControlRequest>(&line) {
                Ok(request) => self.handle_request(request, &mut session),
                // A JSON object we don't understand gets an error reply; a
                // line that isn't JSON at all is a framing violation and
                // closes the connection.
                Err(_) if serde_json::from_str::<serde_json::Value>(&line).is_ok() => {
                    ControlResponse::error("invalid request")
                }
                Err(e) => break Err(e.into()),
            };
            if let Err(e) = framing::write_frame(&mut write_half, &response).await {
                break Err(e);
            }
        };

        // Losing the control connection ends the session: the peer stops
        // claiming to serve anything.
        if let Some(username) = session {
            debug!(%username, "control connection closed, removing peer");
            self.remove_peer(&username);
        }
        write_half.shutdown().await.ok();
        result
    }

    /// Dispatches one request. `session` is the username bound to this
    /// connection by a successful login, if any.
    pub fn handle_request(
        &self,
        request: ControlRequest,
        session: &mut Option<String>,
    ) -> ControlResponse {
        match request {
            ControlRequest::Register {
                username,
                password,
                addr,
                data_port,
                chat_port,
            } => self.register(
                &username,
                &password,
                PeerEndpoint {
                    addr,
                    data_port,
                    chat_port,
                },
            ),
            ControlRequest::Login {
                username,
                password,
                addr,
                data_port,
                chat_port,
            } => {
                let response = self.login(
                    &username,
                    &password,
                    PeerEndpoint {
                        addr,
                        data_port,
                        chat_port,
                    },
                );
                if response.is_success() {
                    *session = Some(username);
                }
                response
            }
            ControlRequest::Heartbeat {
                file_hashes,
                metrics,
            } => match self.require_active(session) {
                Ok(username) => self.heartbeat(&username, &file_hashes, metrics),
                Err(resp) => resp,
            },
            ControlRequest::Announce {
                name,
                size,
                hash,
                chunk_hashes,
            } => match self.require_active(session) {
                Ok(username) => self.announce(&username, name, size, hash, chunk_hashes),
                Err(resp) => resp,
            },
            ControlRequest::PartialAnnounce { hash } => match self.require_active(session) {
                Ok(username) => match self.store.associate_partial(&username, &hash) {
                    Ok(()) => ControlResponse::success_msg("partial announce registered"),
                    Err(e) => internal_error(e),
                },
                Err(resp) => resp,
            },
            ControlRequest::GetPeers { hash } => self.get_peers(&hash),
            ControlRequest::GetFileMetadata { hash } => self.get_file_metadata(&hash),
            ControlRequest::ListFiles => match self.store.list_files() {
                Ok(files) => ControlResponse {
                    files: Some(
                        files
                            .into_iter()
                            .map(|f| FileEntry {
                                hash: f.hash,
                                name: f.name,
                                size: f.size,
                            })
                            .collect(),
                    ),
                    ..ControlResponse::success()
                },
                Err(e) => internal_error(e),
            },
            ControlRequest::ListOnlineUsers => {
                match self.store.online_users(self.cutoff(now_ts())) {
                    Ok(users) => ControlResponse {
                        users: Some(users),
                        ..ControlResponse::success()
                    },
                    Err(e) => internal_error(e),
                }
            }
            ControlRequest::GetPeerAddress { username } => self.peer_address(&username, false),
            ControlRequest::GetPeerChatAddress { username } => self.peer_address(&username, true),
            ControlRequest::CreateRoom {
                room_id,
                max_history,
            } => match self.require_active(session) {
                Ok(username) => self.create_room(&username, room_id, max_history),
                Err(resp) => resp,
            },
            ControlRequest::DeleteRoom { room_id } => match self.require_active(session) {
                Ok(username) => self.delete_room(&username, &room_id),
                Err(resp) => resp,
            },
            ControlRequest::AddMember { room_id, username } => {
                match self.require_active(session) {
                    Ok(requester) => self.add_member(&requester, &room_id, &username),
                    Err(resp) => resp,
                }
            }
            ControlRequest::RemoveMember { room_id, username } => {
                match self.require_active(session) {
                    Ok(requester) => self.remove_member(&requester, &room_id, &username),
                    Err(resp) => resp,
                }
            }
            ControlRequest::ListRooms => match self.store.list_rooms() {
                Ok(rooms) => ControlResponse {
                    rooms: Some(
                        rooms
                            .into_iter()
                            .map(|(room_id, moderator)| RoomSummary { room_id, moderator })
                            .collect(),
                    ),
                    ..ControlResponse::success()
                },
                Err(e) => internal_error(e),
            },
            ControlRequest::GetRoomMembers { room_id } => match self.require_active(session) {
                Ok(username) => self.room_members(&username, &room_id),
                Err(resp) => resp,
            },
            ControlRequest::GetRoomInfo { room_id } => match self.require_active(session) {
                Ok(username) => self.room_info(&username, &room_id),
                Err(resp) => resp,
            },
        }
    }

    fn register(&self, username: &str, password: &str, endpoint: PeerEndpoint) -> ControlResponse {
        if username.is_empty() || password.is_empty() {
            return ControlResponse::error("username or password missing");
        }
        let password_hash = match self.hasher.hash(password) {
            Ok(hash) => hash,
            Err(e) => return internal_error(StoreError::Other(e)),
        };
        match self.store.create_user(username, &password_hash, endpoint) {
            Ok(()) => {
                info!(username, "user registered");
                ControlResponse::success_msg("registered")
            }
            Err(StoreError::UserExists) => ControlResponse::error("user already exists"),
            Err(e) => internal_error(e),
        }
    }

    fn login(&self, username: &str, password: &str, endpoint: PeerEndpoint) -> ControlResponse {
        if username.is_empty() || password.is_empty() {
            return ControlResponse::error("username or password missing");
        }
        let stored = match self.store.password_hash(username) {
            Ok(stored) => stored,
            Err(e) => return internal_error(e),
        };
        let ok = stored
            .map(|stored| self.hasher.verify(password, &stored))
            .unwrap_or(false);
        if !ok {
            return ControlResponse::error("invalid credentials");
        }
        match self.store.activate_peer(username, endpoint, now_ts()) {
            Ok(()) => {
                info!(username, "peer logged in");
                ControlResponse::success_msg("login ok")
            }
            Err(e) => internal_error(e),
        }
    }

    fn heartbeat(
        &self,
        username: &str,
        file_hashes: &[shoal_core::Id32],
        metrics: shoal_proto::control::HeartbeatMetrics,
    ) -> ControlResponse {
        if let Err(e) = self
            .store
            .reconcile_peer_files(username, file_hashes, now_ts())
        {
            return internal_error(e);
        }
        if let Err(e) = self.store.add_score(
            username,
            metrics.seconds_online.max(0.0),
            metrics.chunks_served,
        ) {
            return internal_error(e);
        }
        match self.store.score_totals(username) {
            Ok(totals) => ControlResponse {
                score: Some(self.effective_score(&totals)),
                ..ControlResponse::success()
            },
            Err(e) => internal_error(e),
        }
    }

    fn announce(
        &self,
        username: &str,
        name: String,
        size: u64,
        hash: shoal_core::Id32,
        chunk_hashes: Vec<shoal_core::Id32>,
    ) -> ControlResponse {
        if name.is_empty() || size == 0 {
            return ControlResponse::error("file details missing");
        }
        let expected = match shoal_core::ChunkLayout::new(size) {
            Ok(layout) => layout.chunk_count() as usize,
            Err(_) => return ControlResponse::error("file details missing"),
        };
        if chunk_hashes.len() != expected {
            return ControlResponse::error("chunk list does not match file size");
        }
        let file = StoredFile {
            hash,
            name,
            size,
            chunk_hashes,
        };
        match self.store.announce_file(username, &file) {
            Ok(()) => {
                debug!(username, hash = %file.hash, "file announced");
                ControlResponse::success_msg("file announced")
            }
            Err(e) => internal_error(e),
        }
    }

    fn get_peers(&self, hash: &shoal_core::Id32) -> ControlResponse {
        let peers = match self
            .store
            .active_peers_with_file(hash, self.cutoff(now_ts()))
        {
            Ok(peers) => peers,
            Err(e) => return internal_error(e),
        };
        let mut peers: Vec<PeerEntry> = peers
            .into_iter()
            .map(|p| PeerEntry {
                score: self.effective_score(&p.totals),
                username: p.username,
                addr: p.addr,
                data_port: p.data_port,
            })
            .collect();
        peers.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal));
        ControlResponse {
            peers: Some(peers),
            ..ControlResponse::success()
        }
    }

    fn get_file_metadata(&self, hash: &shoal_core::Id32) -> ControlResponse {
        match self.store.file_metadata(hash) {
            Ok(Some(file)) => ControlResponse {
                metadata: Some(shoal_proto::control::FileMetadata {
                    name: file.name,
                    size: file.size,
                    chunk_hashes: file.chunk_hashes,
                }),
                ..ControlResponse::success()
            },
            Ok(None) => ControlResponse::error("file not found"),
            Err(e) => internal_error(e),
        }
    }

    fn peer_address(&self, username: &str, chat: bool) -> ControlResponse {
        match self.store.peer_endpoint(username, self.cutoff(now_ts())) {
            Ok(Some(ep)) => {
                let port = if chat { ep.chat_port } else { ep.data_port };
                ControlResponse {
                    addr: Some(SocketAddr::new(ep.addr, port)),
                    ..ControlResponse::success()
                }
            }
            Ok(None) => ControlResponse::error("peer not found"),
            Err(e) => internal_error(e),
        }
    }

    fn create_room(
        &self,
        username: &str,
        room_id: String,
        max_history: Option<u32>,
    ) -> ControlResponse {
        if room_id.is_empty() {
            return ControlResponse::error("room id missing");
        }
        let room = RoomRecord {
            room_id,
            moderator: username.to_owned(),
            created_at: now_ts(),
            max_history: max_history.unwrap_or(DEFAULT_MAX_HISTORY),
        };
        match self.store.create_room(&room) {
            Ok(()) => {
                info!(room_id = %room.room_id, moderator = username, "room created");
                ControlResponse::success_msg("room created")
            }
            Err(StoreError::RoomExists) => ControlResponse::error("room already exists"),
            Err(e) => internal_error(e),
        }
    }

    fn delete_room(&self, username: &str, room_id: &str) -> ControlResponse {
        let room = match self.store.room_info(room_id) {
            Ok(Some(room)) => room,
            Ok(None) => return ControlResponse::error("room not found"),
            Err(e) => return internal_error(e),
        };
        if room.moderator != username {
            return ControlResponse::error("access denied");
        }
        match self.store.delete_room(room_id) {
            Ok(()) => ControlResponse::success_msg("room deleted"),
            Err(e) => internal_error(e),
        }
    }

    fn add_member(&self, requester: &str, room_id: &str, username: &str) -> ControlResponse {
        let room = match self.store.room_info(room_id) {
            Ok(Some(room)) => room,
            Ok(None) => return ControlResponse::error("room not found"),
            Err(e) => return internal_error(e),
        };
        if room.moderator != requester {
            return ControlResponse::error("access denied");
        }
        match self.store.add_room_member(room_id, username, now_ts()) {
            Ok(()) => ControlResponse::success_msg("member added"),
            Err(StoreError::UserNotFound) => ControlResponse::error("user not found"),
            Err(StoreError::RoomNotFound) => ControlResponse::error("room not found"),
            Err(e) => internal_error(e),
        }
    }

    fn remove_member(&self, requester: &str, room_id: &str, username: &str) -> ControlResponse {
        let room = match self.store.room_info(room_id) {
            Ok(Some(room)) => room,
            Ok(None) => return ControlResponse::error("room not found"),
            Err(e) => return internal_error(e),
        };
        if room.moderator == username {
            return ControlResponse::error("the moderator can't be removed");
        }
        // The moderator may remove anyone; everyone else only themselves.
        if requester != room.moderator && requester != username {
            return ControlResponse::error("access denied");
        }
        match self.store.remove_room_member(room_id, username) {
            Ok(()) => ControlResponse::success_msg("member removed"),
            Err(e) => internal_error(e),
        }
    }

    fn room_members(&self, requester: &str, room_id: &str) -> ControlResponse {
        match self.members_only(requester, room_id) {
            Ok(()) => {}
            Err(resp) => return resp,
        }
        match self.store.room_members(room_id) {
            Ok(members) => ControlResponse {
                members: Some(
                    members
                        .into_iter()
                        .map(|m| RoomMemberInfo {
                            username: m.username,
                            joined_at: ts_to_datetime(m.joined_at),
                        })
                        .collect(),
                ),
                ..ControlResponse::success()
            },
            Err(e) => internal_error(e),
        }
    }

    fn room_info(&self, requester: &str, room_id: &str) -> ControlResponse {
        match self.members_only(requester, room_id) {
            Ok(()) => {}
            Err(resp) => return resp,
        }
        match self.store.room_info(room_id) {
            Ok(Some(room)) => ControlResponse {
                room_info: Some(RoomInfo {
                    room_id: room.room_id,
                    moderator: room.moderator,
                    created_at: ts_to_datetime(room.created_at),
                    max_history: room.max_history,
                }),
                ..ControlResponse::success()
            },
            Ok(None) => ControlResponse::error("room not found"),
            Err(e) => internal_error(e),
        }
    }

    fn members_only(&self, requester: &str, room_id: &str) -> Result<(), ControlResponse> {
        match self.store.room_info(room_id) {
            Ok(Some(_)) => {}
            Ok(None) => return Err(ControlResponse::error("room not found")),
            Err(e) => return Err(internal_error(e)),
        }
        match self.store.is_room_member(room_id, requester) {
            Ok(true) => Ok(()),
            Ok(false) => Err(ControlResponse::error("access denied")),
            Err(e) => Err(internal_error(e)),
        }
    }

    /// Session gate for everything that needs a logged-in peer: validates
    /// the active flag and the TTL, forcibly removing expired peers.
    fn require_active(&self, session: &Option<String>) -> Result<String, ControlResponse> {
        let Some(username) = session.as_deref() else {
            return Err(ControlResponse::error("not authenticated"));
        };
        let now = now_ts();
        match self.store.peer_status(username) {
            Ok(None) => Err(ControlResponse::error("user not found")),
            Ok(Some((false, _))) => Err(ControlResponse::error("not authenticated")),
            Ok(Some((true, last_seen))) if last_seen < self.cutoff(now) => {
                debug!(username, "session expired, removing peer");
                self.remove_peer(username);
                Err(ControlResponse::error("login expired"))
            }
            Ok(Some((true, _))) => Ok(username.to_owned()),
            Err(e) => Err(internal_error(e)),
        }
    }

    fn remove_peer(&self, username: &str) {
        if let Err(e) = self.store.remove_peer_files(username) {
            warn!(username, "error removing peer files: {e:#}");
        }
        if let Err(e) = self.store.deactivate_peer(username) {
            warn!(username, "error deactivating peer: {e:#}");
        }
    }
}

fn internal_error(e: StoreError) -> ControlResponse {
    warn!("store error: {e:#}");
    ControlResponse::error("internal error")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemStore;
    use shoal_core::Id32;
    use shoal_proto::control::HeartbeatMetrics;

    /// Identity "hasher" so tests don't pay argon2 cost.
    struct PlainHasher;
    impl CredentialHasher for PlainHasher {
        fn hash(&self, password: &str) -> anyhow::Result<String> {
            Ok(password.to_owned())
        }
        fn verify(&self, password: &str, stored: &str) -> bool {
            password == stored
        }
    }

    fn tracker() -> (Arc<Tracker>, Arc<MemStore>) {
        let store = Arc::new(MemStore::new());
        let tracker = Tracker::new(
            store.clone(),
            Arc::new(PlainHasher),
            TrackerConfig::default(),
        );
        (tracker, store)
    }

    fn register_and_login(
        tracker: &Tracker,
        username: &str,
        data_port: u16,
    ) -> Option<String> {
        let mut session = None;
        let resp = tracker.handle_request(
            ControlRequest::Register {
                username: username.into(),
                password: "pw".into(),
                addr: "127.0.0.1".parse().unwrap(),
                data_port,
                chat_port: data_port + 1,
            },
            &mut session,
        );
        assert!(resp.is_success(), "{:?}", resp.message);
        let resp = tracker.handle_request(
            ControlRequest::Login {
                username: username.into(),
                password: "pw".into(),
                addr: "127.0.0.1".parse().unwrap(),
                data_port,
                chat_port: data_port + 1,
            },
            &mut session,
        );
        assert!(resp.is_success(), "{:?}", resp.message);
        session
    }

    fn announce(tracker: &Tracker, session: &mut Option<String>, tag: u8) -> Id32 {
        let data = vec![tag; 100];
        let digests = shoal_core::digest::digest_bytes(&data).unwrap();
        let resp = tracker.handle_request(
            ControlRequest::Announce {
                name: format!("f{tag}.bin"),
                size: digests.size,
                hash: digests.file_hash,
                chunk_hashes: digests.chunk_hashes,
            },
            session,
        );
        assert!(resp.is_success(), "{:?}", resp.message);
        digests.file_hash
    }

    #[test]
    fn test_register_login_flow() {
        let (tracker, _) = tracker();
        let mut session = None;

        // Wrong password.
        register_and_login(&tracker, "alice", 7000);
        let resp = tracker.handle_request(
            ControlRequest::Login {
                username: "alice".into(),
                password: "wrong".into(),
                addr: "127.0.0.1".parse().unwrap(),
                data_port: 7000,
                chat_port: 7001,
            },
            &mut session,
        );
        assert!(!resp.is_success());
        assert_eq!(resp.message.as_deref(), Some("invalid credentials"));
        assert_eq!(session, None);

        // Duplicate registration.
        let resp = tracker.handle_request(
            ControlRequest::Register {
                username: "alice".into(),
                password: "pw".into(),
                addr: "127.0.0.1".parse().unwrap(),
                data_port: 7000,
                chat_port: 7001,
            },
            &mut session,
        );
        assert_eq!(resp.message.as_deref(), Some("user already exists"));
    }

    #[test]
    fn test_session_required() {
        let (tracker, _) = tracker();
        let mut session = None;
        let resp = tracker.handle_request(
            ControlRequest::PartialAnnounce {
                hash: Id32::new([1; 32]),
            },
            &mut session,
        );
        assert_eq!(resp.message.as_deref(), Some("not authenticated"));
    }

    #[test]
    fn test_heartbeat_accumulates_score() {
        let (tracker, _) = tracker();
        let mut session = register_and_login(&tracker, "alice", 7000);
        let hash = announce(&tracker, &mut session, 1);

        let resp = tracker.handle_request(
            ControlRequest::Heartbeat {
                file_hashes: vec![hash],
                metrics: HeartbeatMetrics {
                    seconds_online: 60.0,
                    chunks_served: 3,
                },
            },
            &mut session,
        );
        assert!(resp.is_success());
        // Defaults: w_time = 1.0, w_chunks = 10.0.
        assert_eq!(resp.score, Some(60.0 + 30.0));

        let resp = tracker.handle_request(
            ControlRequest::Heartbeat {
                file_hashes: vec![hash],
                metrics: HeartbeatMetrics {
                    seconds_online: 40.0,
                    chunks_served: 0,
                },
            },
            &mut session,
        );
        assert_eq!(resp.score, Some(130.0));
    }

    #[test]
    fn test_heartbeat_reconciles_associations() {
        let (tracker, _) = tracker();
        let mut session = register_and_login(&tracker, "alice", 7000);
        let hash = announce(&tracker, &mut session, 1);

        let resp = tracker.handle_request(ControlRequest::GetPeers { hash }, &mut session);
        assert_eq!(resp.peers.unwrap().len(), 1);

        // A heartbeat that no longer lists the file drops the association
        // and garbage-collects the orphan.
        let resp = tracker.handle_request(
            ControlRequest::Heartbeat {
                file_hashes: vec![],
                metrics: HeartbeatMetrics {
                    seconds_online: 1.0,
                    chunks_served: 0,
                },
            },
            &mut session,
        );
        assert!(resp.is_success());
        let resp = tracker.handle_request(ControlRequest::GetPeers { hash }, &mut session);
        assert_eq!(resp.peers.unwrap().len(), 0);
        let resp =
            tracker.handle_request(ControlRequest::GetFileMetadata { hash }, &mut session);
        assert_eq!(resp.message.as_deref(), Some("file not found"));
    }

    #[test]
    fn test_expired_session_is_removed() {
        let (tracker, store) = tracker();
        let mut session = register_and_login(&tracker, "alice", 7000);
        let hash = announce(&tracker, &mut session, 1);

        // Backdate the last heartbeat past the TTL.
        store
            .activate_peer(
                "alice",
                PeerEndpoint {
                    addr: "127.0.0.1".parse().unwrap(),
                    data_port: 7000,
                    chat_port: 7001,
                },
                now_ts() - 3600,
            )
            .unwrap();

        let resp = tracker.handle_request(
            ControlRequest::Announce {
                name: "x.bin".into(),
                size: 1,
                hash: Id32::new([7; 32]),
                chunk_hashes: vec![Id32::new([7; 32])],
            },
            &mut session,
        );
        assert_eq!(resp.message.as_deref(), Some("login expired"));

        // The expired peer no longer appears in any peer list.
        let resp = tracker.handle_request(ControlRequest::GetPeers { hash }, &mut None);
        assert_eq!(resp.peers.unwrap_or_default().len(), 0);
    }

    #[test]
    fn test_get_peers_sorted_by_score() {
        let (tracker, store) = tracker();
        let mut s1 = register_and_login(&tracker, "low", 7000);
        let hash = announce(&tracker, &mut s1, 1);
        let mut s2 = register_and_login(&tracker, "high", 8000);
        let resp = tracker.handle_request(ControlRequest::PartialAnnounce { hash }, &mut s2);
        assert!(resp.is_success());

        store.add_score("high", 1000.0, 100).unwrap();
        store.add_score("low", 10.0, 0).unwrap();

        let resp = tracker.handle_request(ControlRequest::GetPeers { hash }, &mut None);
        let peers = resp.peers.unwrap();
        assert_eq!(peers.len(), 2);
        assert_eq!(peers[0].username, "high");
        assert!(peers[0].score > peers[1].score);
    }

    #[test]
    fn test_room_authority() {
        let (tracker, _) = tracker();
        let mut moderator = register_and_login(&tracker, "mod", 7000);
        let mut alice = register_and_login(&tracker, "alice", 8000);
        let mut carol = register_and_login(&tracker, "carol", 9000);

        let resp = tracker.handle_request(
            ControlRequest::CreateRoom {
                room_id: "lobby".into(),
                max_history: None,
            },
            &mut moderator,
        );
        assert!(resp.is_success());

        // Only the moderator may add members.
        let resp = tracker.handle_request(
            ControlRequest::AddMember {
                room_id: "lobby".into(),
                username: "carol".into(),
            },
            &mut alice,
        );
        assert_eq!(resp.message.as_deref(), Some("access denied"));
        let resp = tracker.handle_request(
            ControlRequest::AddMember {
                room_id: "lobby".into(),
                username: "alice".into(),
            },
            &mut moderator,
        );
        assert!(resp.is_success());

        // Members-only reads.
        let resp = tracker.handle_request(
            ControlRequest::GetRoomMembers {
                room_id: "lobby".into(),
            },
            &mut carol,
        );
        assert_eq!(resp.message.as_deref(), Some("access denied"));
        let resp = tracker.handle_request(
            ControlRequest::GetRoomMembers {
                room_id: "lobby".into(),
            },
            &mut alice,
        );
        assert_eq!(resp.members.unwrap().len(), 2);

        // Self-removal is allowed, removing someone else is not.
        let resp = tracker.handle_request(
            ControlRequest::RemoveMember {
                room_id: "lobby".into(),
                username: "mod".into(),
            },
            &mut alice,
        );
        assert!(!resp.is_success());
        let resp = tracker.handle_request(
            ControlRequest::RemoveMember {
                room_id: "lobby".into(),
                username: "alice".into(),
            },
            &mut alice,
        );
        assert!(resp.is_success());

        // Only the moderator may delete the room.
        let resp = tracker.handle_request(
            ControlRequest::DeleteRoom {
                room_id: "lobby".into(),
            },
            &mut carol,
        );
        assert_eq!(resp.message.as_deref(), Some("access denied"));
        let resp = tracker.handle_request(
            ControlRequest::DeleteRoom {
                room_id: "lobby".into(),
            },
            &mut moderator,
        );
        assert!(resp.is_success());
    }

    #[test]
    fn test_moderator_cannot_be_removed() {
        let (tracker, _) = tracker();
        let mut moderator = register_and_login(&tracker, "mod", 7000);
        let resp = tracker.handle_request(
            ControlRequest::CreateRoom {
                room_id: "lobby".into(),
                max_history: Some(10),
            },
            &mut moderator,
        );
        assert!(resp.is_success());
        // Not even by themselves.
        let resp = tracker.handle_request(
            ControlRequest::RemoveMember {
                room_id: "lobby".into(),
                username: "mod".into(),
            },
            &mut moderator,
        );
        assert!(!resp.is_success());
    }
}
