use std::net::{IpAddr, SocketAddr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use shoal_core::Id32;

use crate::Status;

/// A request on the peer -> tracker control connection. One JSON line each,
/// answered by exactly one [`ControlResponse`] line.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum ControlRequest {
    Register {
        username: String,
        password: String,
        addr: IpAddr,
        data_port: u16,
        chat_port: u16,
    },
    Login {
        username: String,
        password: String,
        addr: IpAddr,
        data_port: u16,
        chat_port: u16,
    },
    Heartbeat {
        file_hashes: Vec<Id32>,
        metrics: HeartbeatMetrics,
    },
    Announce {
        name: String,
        size: u64,
        hash: Id32,
        chunk_hashes: Vec<Id32>,
    },
    PartialAnnounce {
        hash: Id32,
    },
    GetPeers {
        hash: Id32,
    },
    GetFileMetadata {
        hash: Id32,
    },
    ListFiles,
    ListOnlineUsers,
    GetPeerAddress {
        username: String,
    },
    GetPeerChatAddress {
        username: String,
    },
    CreateRoom {
        room_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_history: Option<u32>,
    },
    DeleteRoom {
        room_id: String,
    },
    AddMember {
        room_id: String,
        username: String,
    },
    RemoveMember {
        room_id: String,
        username: String,
    },
    ListRooms,
    GetRoomMembers {
        room_id: String,
    },
    GetRoomInfo {
        room_id: String,
    },
}

/// Usage accumulated by the peer since its previous heartbeat.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatMetrics {
    pub seconds_online: f64,
    pub chunks_served: u64,
}

/// An active peer serving a file, as returned by `get_peers`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerEntry {
    pub username: String,
    pub addr: IpAddr,
    pub data_port: u16,
    pub score: f64,
}

impl PeerEntry {
    pub fn data_addr(&self) -> SocketAddr {
        SocketAddr::new(self.addr, self.data_port)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileMetadata {
    pub name: String,
    pub size: u64,
    pub chunk_hashes: Vec<Id32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileEntry {
    pub hash: Id32,
    pub name: String,
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomSummary {
    pub room_id: String,
    pub moderator: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomInfo {
    pub room_id: String,
    pub moderator: String,
    pub created_at: DateTime<Utc>,
    pub max_history: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomMemberInfo {
    pub username: String,
    pub joined_at: DateTime<Utc>,
}

/// The single response shape of the control protocol. `status` is always
/// present; everything else depends on the method.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ControlResponse {
    pub status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peers: Option<Vec<PeerEntry>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<FileMetadata>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub files: Option<Vec<FileEntry>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub users: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub addr: Option<SocketAddr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rooms: Option<Vec<RoomSummary>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub members: Option<Vec<RoomMemberInfo>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room_info: Option<RoomInfo>,
}

impl ControlResponse {
    pub fn success() -> Self {
        Self {
            status: Status::Success,
            ..Default::default()
        }
    }

    pub fn success_msg(message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
            ..Self::success()
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: Status::Error,
            message: Some(message.into()),
            ..Default::default()
        }
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_method_tag() {
        let req = ControlRequest::GetPeers {
            hash: Id32::new([1; 32]),
        };
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["method"], "get_peers");
        assert_eq!(json["hash"].as_str().unwrap().len(), 64);
    }

    #[test]
    fn test_unit_method() {
        let req: ControlRequest = serde_json::from_str(r#"{"method":"list_files"}"#).unwrap();
        assert!(matches!(req, ControlRequest::ListFiles));
    }

    #[test]
    fn test_error_response_shape() {
        let resp = ControlResponse::error("login expired");
        let json = serde_json::to_value(&resp).unwrap();
        assert_eq!(json["status"], "error");
        assert_eq!(json["message"], "login expired");
        // Absent payload fields must not appear on the wire.
        assert!(json.get("peers").is_none());
    }

    #[test]
    fn test_payload_round_trip() {
        let resp = ControlResponse {
            peers: Some(vec![PeerEntry {
                username: "alice".into(),
                addr: "127.0.0.1".parse().unwrap(),
                data_port: 7001,
                score: 120.5,
            }]),
            ..ControlResponse::success()
        };
        let line = serde_json::to_string(&resp).unwrap();
        let back: ControlResponse = serde_json::from_str(&line).unwrap();
        assert!(back.is_success());
        assert_eq!(back.peers.unwrap()[0].data_addr().port(), 7001);
    }
}
