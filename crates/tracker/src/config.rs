use std::time::Duration;

/// Tunables of the tracker process. The score weights decide how much one
/// second of uptime vs one served chunk is worth when ranking peers.
#[derive(Debug, Clone)]
pub struct TrackerConfig {
    /// Maximum age of a peer's last heartbeat before its session is
    /// considered expired.
    pub session_ttl: Duration,
    pub score_weight_time: f64,
    pub score_weight_chunks: f64,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            session_ttl: Duration::from_secs(15 * 60),
            score_weight_time: 1.0,
            score_weight_chunks: 10.0,
        }
    }
}
