use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use parking_lot::Mutex as SyncMutex;
use shoal_core::spawn_utils::spawn;
use shoal_core::Id32;
use shoal_proto::chat::ChatFrame;
use shoal_proto::control::HeartbeatMetrics;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug_span, info, trace, warn};

use crate::chat::{self, ChatFabric};
use crate::chunk_server;
use crate::client::TrackerClient;
use crate::config::PeerConfig;
use crate::downloader;
use crate::events::PeerEvent;
use crate::rooms::RoomManager;
use crate::share::ShareRegistry;

/// A logged-in peer: both listeners running, heartbeat and room sync loops
/// ticking. Dropping the session (or calling [`shutdown`](Self::shutdown))
/// stops everything.
pub struct PeerSession {
    username: String,
    config: PeerConfig,
    client: Arc<TrackerClient>,
    share: Arc<ShareRegistry>,
    rooms: Arc<RoomManager>,
    fabric: Arc<ChatFabric>,
    score: Arc<SyncMutex<f64>>,
    events_tx: broadcast::Sender<PeerEvent>,
    cancel: CancellationToken,
    data_addr: SocketAddr,
    chat_addr: SocketAddr,
}

impl PeerSession {
    /// Creates an account. No session is kept open.
    pub async fn register(
        config: &PeerConfig,
        username: &str,
        password: &str,
    ) -> anyhow::Result<()> {
        let client = TrackerClient::connect(config.tracker_addr)
            .await
            .context("error connecting to tracker")?;
        client
            .register(
                username,
                password,
                config.advertised_ip,
                config.data_port,
                config.chat_port,
            )
            .await?;
        Ok(())
    }

    /// Logs in and brings the peer fully online: binds the data and chat
    /// ports, announces everything already on disk, starts the background
    /// loops.
    pub async fn login(
        config: PeerConfig,
        username: &str,
        password: &str,
    ) -> anyhow::Result<Arc<Self>> {
        let data_listener = TcpListener::bind((config.listen_ip, config.data_port))
            .await
            .context("error binding data port")?;
        let chat_listener = TcpListener::bind((config.listen_ip, config.chat_port))
            .await
            .context("error binding chat port")?;
        let data_addr = data_listener.local_addr()?;
        let chat_addr = chat_listener.local_addr()?;

        let client = Arc::new(
            TrackerClient::connect(config.tracker_addr)
                .await
                .context("error connecting to tracker")?,
        );
        client
            .login(
                username,
                password,
                config.advertised_ip,
                data_addr.port(),
                chat_addr.port(),
            )
            .await?;
        info!(username, ?data_addr, ?chat_addr, "logged in");

        let share = Arc::new(ShareRegistry::new(&config.root_dir, username)?);
        let (events_tx, _) = broadcast::channel(256);
        let fabric = ChatFabric::new(
            client.clone(),
            config.sync_connect_timeout,
            config.sync_read_timeout,
        );
        let rooms = RoomManager::new(
            username.to_owned(),
            client.clone(),
            fabric.clone(),
            &config.root_dir,
            events_tx.clone(),
        )?;

        let cancel = CancellationToken::new();
        let session = Arc::new(Self {
            username: username.to_owned(),
            client,
            share,
            rooms,
            fabric,
            score: Arc::new(SyncMutex::new(0.0)),
            events_tx,
            cancel: cancel.clone(),
            data_addr,
            chat_addr,
            config,
        });

        spawn(debug_span!("chunk_server", username), {
            let share = session.share.clone();
            let cancel = cancel.clone();
            chunk_server::run(data_listener, share, cancel)
        });
        spawn(debug_span!("chat_server", username), {
            let rooms = session.rooms.clone();
            let events = session.events_tx.clone();
            let cancel = cancel.clone();
            chat::run(chat_listener, rooms, events, cancel)
        });
        spawn(debug_span!("heartbeat", username), {
            run_heartbeat_loop(
                session.client.clone(),
                session.share.clone(),
                session.score.clone(),
                session.config.heartbeat_interval,
                cancel.clone(),
            )
        });
        spawn(debug_span!("room_sync", username), {
            session
                .rooms
                .clone()
                .run_sync_loop(session.config.room_sync_interval, cancel.clone())
        });

        // With the listeners up we can safely advertise what's on disk.
        session.auto_announce().await;

        Ok(session)
    }

    /// Scans the download directory and re-announces whole files and
    /// leftover partials, so a restarted peer is a seed again right away.
    async fn auto_announce(&self) {
        let share = self.share.clone();
        let items = match tokio::task::spawn_blocking(move || share.scan()).await {
            Ok(Ok(items)) => items,
            Ok(Err(e)) => {
                warn!("error scanning download dir: {e:#}");
                return;
            }
            Err(e) => {
                warn!("scan task died: {e:#}");
                return;
            }
        };
        for item in items {
            if let Err(e) = self
                .client
                .announce(
                    &item.name,
                    item.digests.size,
                    item.digests.file_hash,
                    item.digests.chunk_hashes.clone(),
                )
                .await
            {
                warn!(name = %item.name, "auto announce failed: {e:#}");
            }
        }
        for hash in self.share.partial_hashes() {
            if let Err(e) = self.client.partial_announce(hash).await {
                warn!(%hash, "partial auto announce failed: {e:#}");
            }
        }
    }

    /// Digests a file and announces it to the tracker; the file is served
    /// from where it is.
    pub async fn announce_file(&self, path: &Path) -> anyhow::Result<Id32> {
        let path = path.to_owned();
        let digest_path = path.clone();
        let digests =
            tokio::task::spawn_blocking(move || shoal_core::digest::digest_file(&digest_path))
                .await??;
        let name = path
            .file_name()
            .context("path has no file name")?
            .to_string_lossy()
            .into_owned();
        self.client
            .announce(
                &name,
                digests.size,
                digests.file_hash,
                digests.chunk_hashes.clone(),
            )
            .await?;
        self.share.register_whole(&digests, name, path);
        Ok(digests.file_hash)
    }

    /// Downloads a file from the swarm into `downloads/<user>/`.
    pub async fn download(&self, hash: Id32) -> anyhow::Result<PathBuf> {
        downloader::download(
            &self.client,
            &self.share,
            &self.username,
            hash,
            &self.config,
            self.score(),
        )
        .await
    }

    pub async fn send_direct_message(&self, to: &str, message: &str) -> anyhow::Result<()> {
        self.fabric
            .send_to(
                to,
                &ChatFrame::ChatMessage {
                    from: self.username.clone(),
                    message: message.to_owned(),
                },
            )
            .await
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    /// The score cached from the last heartbeat reply.
    pub fn score(&self) -> f64 {
        *self.score.lock()
    }

    /// Direct access to tracker operations (listings, membership admin).
    pub fn client(&self) -> &TrackerClient {
        &self.client
    }

    pub fn rooms(&self) -> &Arc<RoomManager> {
        &self.rooms
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PeerEvent> {
        self.events_tx.subscribe()
    }

    pub fn data_addr(&self) -> SocketAddr {
        self.data_addr
    }

    pub fn chat_addr(&self) -> SocketAddr {
        self.chat_addr
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

impl Drop for PeerSession {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn run_heartbeat_loop(
    client: Arc<TrackerClient>,
    share: Arc<ShareRegistry>,
    score: Arc<SyncMutex<f64>>,
    interval: Duration,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // interval() fires immediately; the first real beat comes one period in.
    ticker.tick().await;
    let mut last = Instant::now();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            _ = ticker.tick() => {}
        }
        let now = Instant::now();
        let metrics = HeartbeatMetrics {
            seconds_online: (now - last).as_secs_f64(),
            chunks_served: share.take_served_delta(),
        };
        last = now;
        match client.heartbeat(share.all_hashes(), metrics).await {
            Ok(new_score) => {
                trace!(score = new_score, "heartbeat ok");
                *score.lock() = new_score;
            }
            Err(e) => warn!("heartbeat failed: {e:#}"),
        }
    }
}
