use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use dashmap::DashMap;
use shoal_proto::chat::{ChatFrame, RoomMessage, SyncResponse};
use shoal_proto::framing;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, debug_span, info, trace};

use crate::client::TrackerClient;
use crate::events::PeerEvent;
use crate::rooms::RoomManager;

const DIRECT_SEND_TIMEOUT: Duration = Duration::from_secs(10);

/// Outbound side of the chat plane: cached persistent connections to other
/// peers, with one-shot sends as the fallback. Addresses always come fresh
/// from the tracker.
pub struct ChatFabric {
    client: Arc<TrackerClient>,
    connections: DashMap<String, Arc<Mutex<TcpStream>>>,
    connect_timeout: Duration,
    read_timeout: Duration,
}

impl ChatFabric {
    pub fn new(
        client: Arc<TrackerClient>,
        connect_timeout: Duration,
        read_timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            client,
            connections: DashMap::new(),
            connect_timeout,
            read_timeout,
        })
    }

    /// Delivers one frame to a peer, preferring the cached connection. A
    /// dead cached connection is dropped and a one-shot delivery attempted
    /// instead.
    pub async fn send_to(&self, username: &str, frame: &ChatFrame) -> anyhow::Result<()> {
        if let Some(conn) = self.connections.get(username).map(|e| e.value().clone()) {
            let mut stream = conn.lock().await;
            match framing::write_frame(&mut *stream, frame).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    debug!(username, "cached chat connection failed: {e:#}");
                    drop(stream);
                    self.connections.remove(username);
                }
            }
        }
        match self.connect(username).await {
            Ok(conn) => {
                let mut stream = conn.lock().await;
                framing::write_frame(&mut *stream, frame).await?;
                Ok(())
            }
            Err(e) => {
                debug!(username, "persistent chat connect failed: {e:#}");
                self.one_shot_send(username, frame).await
            }
        }
    }

    async fn connect(&self, username: &str) -> anyhow::Result<Arc<Mutex<TcpStream>>> {
        let addr = self.client.get_peer_chat_address(username).await?;
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(addr))
            .await
            .context("chat connect timed out")??;
        let conn = Arc::new(Mutex::new(stream));
        self.connections.insert(username.to_owned(), conn.clone());
        Ok(conn)
    }

    async fn one_shot_send(&self, username: &str, frame: &ChatFrame) -> anyhow::Result<()> {
        let addr = self.client.get_peer_chat_address(username).await?;
        let mut stream = tokio::time::timeout(DIRECT_SEND_TIMEOUT, TcpStream::connect(addr))
            .await
            .context("direct send connect timed out")??;
        framing::write_frame(&mut stream, frame).await?;
        stream.shutdown().await.ok();
        Ok(())
    }

    /// Pulls the full journal of a room from one member. One-shot socket:
    /// request out, one reply line back.
    pub async fn sync_from(
        &self,
        username: &str,
        room_id: &str,
        requester: &str,
    ) -> anyhow::Result<Vec<RoomMessage>> {
        let addr = self.client.get_peer_chat_address(username).await?;
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(addr))
            .await
            .context("sync connect timed out")??;
        let (read_half, mut write_half) = stream.into_split();
        framing::write_frame(
            &mut write_half,
            &ChatFrame::SyncRoomMessages {
                room_id: room_id.to_owned(),
                requester: requester.to_owned(),
            },
        )
        .await?;

        let mut reader = BufReader::new(read_half);
        let response = tokio::time::timeout(
            self.read_timeout,
            framing::read_frame::<SyncResponse>(&mut reader),
        )
        .await
        .context("sync read timed out")??
        .context("peer closed without a sync reply")?;

        if !response.status.is_success() {
            anyhow::bail!(
                "sync refused by {username}: {}",
                response.message.as_deref().unwrap_or("unknown")
            );
        }
        Ok(response.messages.unwrap_or_default())
    }
}

/// Serves the chat port: session-oriented connections carrying a stream of
/// newline-framed records. Malformed lines are skipped, the connection
/// lives on.
pub(crate) async fn run(
    listener: TcpListener,
    rooms: Arc<RoomManager>,
    events: broadcast::Sender<PeerEvent>,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    loop {
        let (stream, addr) = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            r = listener.accept() => r?,
        };
        let rooms = rooms.clone();
        let events = events.clone();
        shoal_core::spawn_utils::spawn_with_cancel(
            debug_span!("chat", %addr),
            cancel.clone(),
            async move { handle_conn(stream, &rooms, &events).await },
        );
    }
}

async fn handle_conn(
    stream: TcpStream,
    rooms: &RoomManager,
    events: &broadcast::Sender<PeerEvent>,
) -> anyhow::Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    while let Some(line) = framing::read_line(&mut reader).await? {
        let Some(frame) = ChatFrame::decode(&line) else {
            trace!("skipping malformed chat record");
            continue;
        };
        match frame {
            ChatFrame::ChatMessage { from, message } => {
                info!(%from, "direct message: {message}");
                events
                    .send(PeerEvent::DirectMessage { from, message })
                    .ok();
            }
            ChatFrame::RoomMessage(msg) => {
                rooms.receive_message(msg).await;
            }
            ChatFrame::SyncRoomMessages { room_id, requester } => {
                let response = rooms.handle_sync_request(&room_id, &requester).await;
                framing::write_frame(&mut write_half, &response).await?;
            }
        }
    }
    Ok(())
}
