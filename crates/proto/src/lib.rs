pub mod chat;
pub mod control;
pub mod data;
pub mod framing;

use serde::{Deserialize, Serialize};

/// Every reply in every shoal protocol carries this tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Success,
    Error,
}

impl Status {
    pub fn is_success(&self) -> bool {
        matches!(self, Status::Success)
    }
}

impl Default for Status {
    fn default() -> Self {
        Status::Error
    }
}
