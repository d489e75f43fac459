use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

/// Tunables of a peer process. Defaults match the deployed constants:
/// 60 s heartbeats, 120 s room sync, 50 s chunk transfers.
#[derive(Debug, Clone)]
pub struct PeerConfig {
    pub tracker_addr: SocketAddr,
    /// Root under which `downloads/<user>`, `room_messages/` and
    /// `chat_logs/` are created.
    pub root_dir: PathBuf,
    /// IP to bind the data and chat listeners on.
    pub listen_ip: IpAddr,
    /// Port for the chunk server, 0 for ephemeral.
    pub data_port: u16,
    /// Port for the chat listener, 0 for ephemeral.
    pub chat_port: u16,
    /// The address other peers are told to reach us on.
    pub advertised_ip: IpAddr,

    pub heartbeat_interval: Duration,
    pub room_sync_interval: Duration,

    /// Score points per extra download worker.
    pub score_divider: f64,

    pub chunk_timeout: Duration,
    pub sync_connect_timeout: Duration,
    pub sync_read_timeout: Duration,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            tracker_addr: (Ipv4Addr::LOCALHOST, 5000).into(),
            root_dir: PathBuf::from("."),
            listen_ip: Ipv4Addr::UNSPECIFIED.into(),
            data_port: 0,
            chat_port: 0,
            advertised_ip: Ipv4Addr::LOCALHOST.into(),
            heartbeat_interval: Duration::from_secs(60),
            room_sync_interval: Duration::from_secs(120),
            score_divider: 1000.0,
            chunk_timeout: Duration::from_secs(50),
            sync_connect_timeout: Duration::from_secs(30),
            sync_read_timeout: Duration::from_secs(20),
        }
    }
}
