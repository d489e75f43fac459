pub mod chat;
pub mod chunk_server;
pub mod client;
pub mod config;
pub mod downloader;
pub mod events;
pub mod rooms;
pub mod session;
pub mod share;

#[cfg(test)]
mod tests;

pub use client::{ClientError, TrackerClient};
pub use config::PeerConfig;
pub use events::PeerEvent;
pub use session::PeerSession;
