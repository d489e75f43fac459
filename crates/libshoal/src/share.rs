use std::collections::BTreeSet;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::Context;
use dashmap::DashMap;
use shoal_core::{digest, ChunkLayout, FileDigests, Id32};
use tracing::{debug, warn};

const TEMP_DIR_PREFIX: &str = "temp_";
const CHUNK_SUFFIX: &str = ".chunk";

/// A fully owned file we can serve every chunk of.
#[derive(Debug, Clone)]
pub struct WholeFile {
    pub name: String,
    pub path: PathBuf,
    pub layout: ChunkLayout,
}

#[derive(Debug)]
struct PartialDownload {
    dir: PathBuf,
    chunks: BTreeSet<u32>,
}

/// What a whole-file scan of the download directory found.
pub struct ScanItem {
    pub digests: FileDigests,
    pub name: String,
    pub path: PathBuf,
}

/// Everything this peer can serve: whole files in `downloads/<user>/` and
/// verified chunks of in-flight downloads in `downloads/<user>/temp_<hash>/`.
pub struct ShareRegistry {
    download_dir: PathBuf,
    whole: DashMap<Id32, WholeFile>,
    partial: DashMap<Id32, PartialDownload>,
    chunks_served: AtomicU64,
}

impl ShareRegistry {
    pub fn new(root_dir: &Path, username: &str) -> anyhow::Result<Self> {
        let download_dir = root_dir.join("downloads").join(username);
        std::fs::create_dir_all(&download_dir)
            .with_context(|| format!("error creating {download_dir:?}"))?;
        Ok(Self {
            download_dir,
            whole: DashMap::new(),
            partial: DashMap::new(),
            chunks_served: AtomicU64::new(0),
        })
    }

    pub fn download_dir(&self) -> &Path {
        &self.download_dir
    }

    /// Walks the download directory, digesting whole files and picking up
    /// leftover partial downloads. Chunk files inside temp dirs are trusted
    /// by name; they were digest-verified when written.
    pub fn scan(&self) -> anyhow::Result<Vec<ScanItem>> {
        let mut items = Vec::new();
        for entry in std::fs::read_dir(&self.download_dir)? {
            let entry = entry?;
            let path = entry.path();
            let file_name = entry.file_name();
            let Some(file_name) = file_name.to_str() else {
                continue;
            };
            if path.is_dir() {
                if let Some(hex) = file_name.strip_prefix(TEMP_DIR_PREFIX) {
                    match Id32::from_str(hex) {
                        Ok(hash) => self.resume_partial(hash, &path),
                        Err(_) => warn!(dir = %path.display(), "skipping unparseable temp dir"),
                    }
                }
                continue;
            }
            match digest::digest_file(&path) {
                Ok(digests) => {
                    self.register_whole(&digests, file_name.to_owned(), path.clone());
                    items.push(ScanItem {
                        digests,
                        name: file_name.to_owned(),
                        path,
                    });
                }
                Err(e) => warn!(file = %path.display(), "skipping undigestable file: {e:#}"),
            }
        }
        Ok(items)
    }

    fn resume_partial(&self, hash: Id32, dir: &Path) {
        let mut chunks = BTreeSet::new();
        let Ok(entries) = std::fs::read_dir(dir) else {
            return;
        };
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Some(index) = name
                .strip_suffix(CHUNK_SUFFIX)
                .and_then(|stem| stem.parse::<u32>().ok())
            {
                chunks.insert(index);
            }
        }
        debug!(%hash, chunks = chunks.len(), "resumed partial download");
        self.partial.insert(
            hash,
            PartialDownload {
                dir: dir.to_owned(),
                chunks,
            },
        );
    }

    pub fn register_whole(&self, digests: &FileDigests, name: String, path: PathBuf) {
        let layout = match ChunkLayout::new(digests.size) {
            Ok(layout) => layout,
            Err(_) => return,
        };
        self.whole
            .insert(digests.file_hash, WholeFile { name, path, layout });
    }

    /// Creates (or reopens) the temp directory for a download and registers
    /// the empty partial entry so the chunk server can start serving pieces
    /// as they arrive.
    pub fn create_partial(&self, hash: Id32) -> anyhow::Result<PathBuf> {
        let dir = self
            .download_dir
            .join(format!("{TEMP_DIR_PREFIX}{}", hash.as_string()));
        std::fs::create_dir_all(&dir).with_context(|| format!("error creating {dir:?}"))?;
        self.partial.entry(hash).or_insert_with(|| PartialDownload {
            dir: dir.clone(),
            chunks: BTreeSet::new(),
        });
        Ok(dir)
    }

    /// Records a verified chunk; returns how many we now have.
    pub fn note_partial_chunk(&self, hash: &Id32, index: u32) -> usize {
        match self.partial.get_mut(hash) {
            Some(mut p) => {
                p.chunks.insert(index);
                p.chunks.len()
            }
            None => 0,
        }
    }

    /// Drops the partial entry and its temp directory.
    pub fn remove_partial(&self, hash: &Id32) {
        if let Some((_, partial)) = self.partial.remove(hash) {
            if let Err(e) = std::fs::remove_dir_all(&partial.dir) {
                warn!(dir = %partial.dir.display(), "error removing temp dir: {e:#}");
            }
        }
    }

    /// A finished download becomes a whole file; the temp state goes away.
    pub fn promote_to_whole(&self, digests: &FileDigests, name: String, path: PathBuf) {
        self.register_whole(digests, name, path);
        self.remove_partial(&digests.file_hash);
    }

    /// Sorted chunk indices we can serve for this file, or None if we know
    /// nothing about it.
    pub fn available_chunks(&self, hash: &Id32) -> Option<Vec<u32>> {
        if let Some(whole) = self.whole.get(hash) {
            return Some((0..whole.layout.chunk_count()).collect());
        }
        self.partial
            .get(hash)
            .map(|p| p.chunks.iter().copied().collect())
    }

    /// Raw bytes of one chunk, from the whole file or the temp directory.
    pub fn read_chunk(&self, hash: &Id32, index: u32) -> anyhow::Result<Vec<u8>> {
        if let Some(whole) = self.whole.get(hash) {
            let size = whole
                .layout
                .chunk_size(index)
                .with_context(|| format!("chunk index {index} out of range"))?;
            let offset = whole.layout.chunk_offset(index).unwrap();
            let mut file = std::fs::File::open(&whole.path)
                .with_context(|| format!("error opening {:?}", whole.path))?;
            file.seek(SeekFrom::Start(offset))?;
            let mut buf = vec![0u8; size as usize];
            file.read_exact(&mut buf)?;
            return Ok(buf);
        }
        if let Some(partial) = self.partial.get(hash) {
            if !partial.chunks.contains(&index) {
                anyhow::bail!("chunk {index} not downloaded yet");
            }
            let path = partial.dir.join(format!("{index}{CHUNK_SUFFIX}"));
            return std::fs::read(&path).with_context(|| format!("error reading {path:?}"));
        }
        anyhow::bail!("unknown file {hash}")
    }

    /// Whole + partial hashes, for the heartbeat's share set.
    pub fn all_hashes(&self) -> Vec<Id32> {
        let mut hashes: Vec<Id32> = self.whole.iter().map(|e| *e.key()).collect();
        hashes.extend(self.partial.iter().map(|e| *e.key()));
        hashes.sort_unstable();
        hashes.dedup();
        hashes
    }

    pub fn partial_hashes(&self) -> Vec<Id32> {
        self.partial.iter().map(|e| *e.key()).collect()
    }

    pub fn note_chunk_served(&self) {
        self.chunks_served.fetch_add(1, Ordering::Relaxed);
    }

    /// Chunks served since the last call; feeds the heartbeat metrics.
    pub fn take_served_delta(&self) -> u64 {
        self.chunks_served.swap(0, Ordering::Relaxed)
    }
}
