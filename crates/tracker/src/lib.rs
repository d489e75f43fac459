pub mod auth;
pub mod config;
pub mod service;
pub mod store;

pub use auth::{Argon2Hasher, CredentialHasher};
pub use config::TrackerConfig;
pub use service::Tracker;
pub use store::{MemStore, SqliteStore, Store};
