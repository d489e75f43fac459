pub mod chunks;
pub mod digest;
pub mod hash_id;
pub mod spawn_utils;

pub use chunks::{ChunkLayout, CHUNK_SIZE};
pub use digest::FileDigests;
pub use hash_id::Id32;
