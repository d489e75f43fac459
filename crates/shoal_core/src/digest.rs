use std::io::Read;
use std::path::Path;

use anyhow::Context;
use sha2::{Digest, Sha256};

use crate::chunks::CHUNK_SIZE;
use crate::hash_id::Id32;

/// The result of digesting a file once: its network identity plus the
/// per-chunk checksum list announced to the tracker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileDigests {
    pub file_hash: Id32,
    pub chunk_hashes: Vec<Id32>,
    pub size: u64,
}

pub fn digest_chunk(data: &[u8]) -> Id32 {
    Id32(Sha256::digest(data).into())
}

/// Digests the whole stream and every chunk in a single pass.
pub fn digest_reader(mut reader: impl Read) -> anyhow::Result<FileDigests> {
    let mut whole = Sha256::new();
    let mut chunk_hashes = Vec::new();
    let mut size = 0u64;
    let mut buf = vec![0u8; CHUNK_SIZE as usize];

    loop {
        // Fill up to one chunk; a short read is not EOF until read() returns 0.
        let mut filled = 0usize;
        while filled < buf.len() {
            let n = reader.read(&mut buf[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        if filled == 0 {
            break;
        }
        whole.update(&buf[..filled]);
        chunk_hashes.push(digest_chunk(&buf[..filled]));
        size += filled as u64;
        if filled < buf.len() {
            break;
        }
    }

    if size == 0 {
        anyhow::bail!("refusing to digest an empty stream");
    }
    debug_assert_eq!(chunk_hashes.len() as u64, size.div_ceil(CHUNK_SIZE as u64));

    Ok(FileDigests {
        file_hash: Id32(whole.finalize().into()),
        chunk_hashes,
        size,
    })
}

pub fn digest_bytes(data: &[u8]) -> anyhow::Result<FileDigests> {
    digest_reader(data)
}

pub fn digest_file(path: &Path) -> anyhow::Result<FileDigests> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("error opening {:?} for digesting", path))?;
    digest_reader(std::io::BufReader::new(file))
}
