use serde::{Deserialize, Serialize};
use shoal_core::Id32;

use crate::Status;

/// A request on a peer's data port. Each connection carries exactly one of
/// these and is closed after the reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum DataRequest {
    /// Reply: one [`ListChunksResponse`] line, then close.
    ListChunks { file_hash: Id32 },
    /// Reply on success: the raw chunk bytes, unframed, until the serving
    /// peer closes the socket. Reply on failure: one [`ListChunksResponse`]
    /// error line, then close.
    GetChunk { file_hash: Id32, chunk_index: u32 },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListChunksResponse {
    pub status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunks: Option<Vec<u32>>,
}

impl ListChunksResponse {
    pub fn ok(mut chunks: Vec<u32>) -> Self {
        chunks.sort_unstable();
        Self {
            status: Status::Success,
            message: None,
            chunks: Some(chunks),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: Status::Error,
            message: Some(message.into()),
            chunks: None,
        }
    }
}
