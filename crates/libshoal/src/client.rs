use std::net::SocketAddr;

use shoal_core::Id32;
use shoal_proto::control::{
    ControlRequest, ControlResponse, FileMetadata, HeartbeatMetrics, PeerEntry, RoomInfo,
    RoomMemberInfo, RoomSummary,
};
use shoal_proto::framing;
use tokio::io::BufReader;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::trace;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("error talking to tracker: {0}")]
    Io(#[from] std::io::Error),
    #[error("tracker closed the connection")]
    Disconnected,
    #[error("bad reply from tracker: {0}")]
    Protocol(#[from] anyhow::Error),
    #[error("{0}")]
    Rejected(String),
    #[error("tracker reply missing expected field")]
    MissingPayload,
}

pub type Result<T> = std::result::Result<T, ClientError>;

struct ClientIo {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

/// The peer's single persistent control connection to the tracker.
///
/// Calls are strictly request -> response; the mutex keeps concurrent tasks
/// (heartbeat, downloads, room syncs) from interleaving pairs on the wire.
pub struct TrackerClient {
    io: Mutex<ClientIo>,
}

impl TrackerClient {
    pub async fn connect(addr: SocketAddr) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        let (read_half, writer) = stream.into_split();
        Ok(Self {
            io: Mutex::new(ClientIo {
                reader: BufReader::new(read_half),
                writer,
            }),
        })
    }

    pub async fn call(&self, request: &ControlRequest) -> Result<ControlResponse> {
        let mut io = self.io.lock().await;
        framing::write_frame(&mut io.writer, request)
            .await
            .map_err(ClientError::Protocol)?;
        trace!("control request sent");
        match framing::read_frame::<ControlResponse>(&mut io.reader).await {
            Ok(Some(response)) => Ok(response),
            Ok(None) => Err(ClientError::Disconnected),
            Err(e) => Err(ClientError::Protocol(e)),
        }
    }

    /// Like [`call`](Self::call), but an error status becomes `Rejected`.
    pub async fn call_ok(&self, request: &ControlRequest) -> Result<ControlResponse> {
        let response = self.call(request).await?;
        if response.is_success() {
            Ok(response)
        } else {
            Err(ClientError::Rejected(
                response
                    .message
                    .unwrap_or_else(|| "unspecified tracker error".to_owned()),
            ))
        }
    }

    pub async fn register(
        &self,
        username: &str,
        password: &str,
        addr: std::net::IpAddr,
        data_port: u16,
        chat_port: u16,
    ) -> Result<()> {
        self.call_ok(&ControlRequest::Register {
            username: username.to_owned(),
            password: password.to_owned(),
            addr,
            data_port,
            chat_port,
        })
        .await?;
        Ok(())
    }

    pub async fn login(
        &self,
        username: &str,
        password: &str,
        addr: std::net::IpAddr,
        data_port: u16,
        chat_port: u16,
    ) -> Result<()> {
        self.call_ok(&ControlRequest::Login {
            username: username.to_owned(),
            password: password.to_owned(),
            addr,
            data_port,
            chat_port,
        })
        .await?;
        Ok(())
    }

    /// Returns the recomputed score.
    pub async fn heartbeat(
        &self,
        file_hashes: Vec<Id32>,
        metrics: HeartbeatMetrics,
    ) -> Result<f64> {
        let response = self
            .call_ok(&ControlRequest::Heartbeat {
                file_hashes,
                metrics,
            })
            .await?;
        response.score.ok_or(ClientError::MissingPayload)
    }

    pub async fn announce(
        &self,
        name: &str,
        size: u64,
        hash: Id32,
        chunk_hashes: Vec<Id32>,
    ) -> Result<()> {
        self.call_ok(&ControlRequest::Announce {
            name: name.to_owned(),
            size,
            hash,
            chunk_hashes,
        })
        .await?;
        Ok(())
    }

    pub async fn partial_announce(&self, hash: Id32) -> Result<()> {
        self.call_ok(&ControlRequest::PartialAnnounce { hash })
            .await?;
        Ok(())
    }

    pub async fn get_peers(&self, hash: Id32) -> Result<Vec<PeerEntry>> {
        let response = self.call_ok(&ControlRequest::GetPeers { hash }).await?;
        response.peers.ok_or(ClientError::MissingPayload)
    }

    pub async fn get_file_metadata(&self, hash: Id32) -> Result<FileMetadata> {
        let response = self
            .call_ok(&ControlRequest::GetFileMetadata { hash })
            .await?;
        response.metadata.ok_or(ClientError::MissingPayload)
    }

    pub async fn list_files(&self) -> Result<Vec<shoal_proto::control::FileEntry>> {
        let response = self.call_ok(&ControlRequest::ListFiles).await?;
        response.files.ok_or(ClientError::MissingPayload)
    }

    pub async fn list_online_users(&self) -> Result<Vec<String>> {
        let response = self.call_ok(&ControlRequest::ListOnlineUsers).await?;
        response.users.ok_or(ClientError::MissingPayload)
    }

    pub async fn get_peer_address(&self, username: &str) -> Result<SocketAddr> {
        let response = self
            .call_ok(&ControlRequest::GetPeerAddress {
                username: username.to_owned(),
            })
            .await?;
        response.addr.ok_or(ClientError::MissingPayload)
    }

    pub async fn get_peer_chat_address(&self, username: &str) -> Result<SocketAddr> {
        let response = self
            .call_ok(&ControlRequest::GetPeerChatAddress {
                username: username.to_owned(),
            })
            .await?;
        response.addr.ok_or(ClientError::MissingPayload)
    }

    pub async fn create_room(&self, room_id: &str, max_history: Option<u32>) -> Result<()> {
        self.call_ok(&ControlRequest::CreateRoom {
            room_id: room_id.to_owned(),
            max_history,
        })
        .await?;
        Ok(())
    }

    pub async fn delete_room(&self, room_id: &str) -> Result<()> {
        self.call_ok(&ControlRequest::DeleteRoom {
            room_id: room_id.to_owned(),
        })
        .await?;
        Ok(())
    }

    pub async fn add_member(&self, room_id: &str, username: &str) -> Result<()> {
        self.call_ok(&ControlRequest::AddMember {
            room_id: room_id.to_owned(),
            username: username.to_owned(),
        })
        .await?;
        Ok(())
    }

    pub async fn remove_member(&self, room_id: &str, username: &str) -> Result<()> {
        self.call_ok(&ControlRequest::RemoveMember {
            room_id: room_id.to_owned(),
            username: username.to_owned(),
        })
        .await?;
        Ok(())
    }

    pub async fn list_rooms(&self) -> Result<Vec<RoomSummary>> {
        let response = self.call_ok(&ControlRequest::ListRooms).await?;
        response.rooms.ok_or(ClientError::MissingPayload)
    }

    pub async fn get_room_members(&self, room_id: &str) -> Result<Vec<RoomMemberInfo>> {
        let response = self
            .call_ok(&ControlRequest::GetRoomMembers {
                room_id: room_id.to_owned(),
            })
            .await?;
        response.members.ok_or(ClientError::MissingPayload)
    }

    pub async fn get_room_info(&self, room_id: &str) -> Result<RoomInfo> {
        let response = self
            .call_ok(&ControlRequest::GetRoomInfo {
                room_id: room_id.to_owned(),
            })
            .await?;
        response.room_info.ok_or(ClientError::MissingPayload)
    }
}
