use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use futures::TryStreamExt;
use shoal_core::{digest, ChunkLayout, Id32};
use shoal_proto::control::PeerEntry;
use shoal_proto::data::{DataRequest, ListChunksResponse};
use shoal_proto::framing;
use tokio::io::{AsyncReadExt, BufReader};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use crate::client::TrackerClient;
use crate::config::PeerConfig;
use crate::share::ShareRegistry;

const BASE_WORKERS: usize = 2;
const MAX_WORKERS: usize = 15;
/// Distinct peers tried per chunk before the download is abandoned.
const ATTEMPTS_PER_CHUNK: usize = 2;

/// Download parallelism widens with reputation:
/// `min(15, max(2, 2 + floor(score / divider)))`.
pub fn worker_limit(score: f64, divider: f64) -> usize {
    let extra = if divider > 0.0 {
        (score / divider).floor() as i64
    } else {
        0
    };
    (BASE_WORKERS as i64 + extra.max(0))
        .clamp(BASE_WORKERS as i64, MAX_WORKERS as i64) as usize
}

/// Chunks sorted ascending by how many peers hold them; the stable sort
/// keeps index order within a rarity class. Chunks nobody has sort first so
/// the download fails before wasting transfers.
pub fn rarest_first_plan(
    chunk_count: u32,
    availability: &HashMap<u32, Vec<PeerEntry>>,
) -> Vec<u32> {
    let mut plan: Vec<u32> = (0..chunk_count).collect();
    plan.sort_by_key(|index| availability.get(index).map_or(0, |peers| peers.len()));
    plan
}

async fn list_chunks(addr: SocketAddr, hash: Id32, timeout: Duration) -> anyhow::Result<Vec<u32>> {
    let response = tokio::time::timeout(timeout, async {
        let mut stream = TcpStream::connect(addr).await?;
        framing::write_frame(&mut stream, &DataRequest::ListChunks { file_hash: hash }).await?;
        let (read_half, _) = stream.split();
        let mut reader = BufReader::new(read_half);
        framing::read_frame::<ListChunksResponse>(&mut reader).await
    })
    .await
    .context("list_chunks timed out")??
    .context("peer closed without replying")?;
    if !response.status.is_success() {
        anyhow::bail!(
            "peer refused list_chunks: {}",
            response.message.as_deref().unwrap_or("unknown")
        );
    }
    Ok(response.chunks.unwrap_or_default())
}

async fn fetch_chunk(
    addr: SocketAddr,
    hash: Id32,
    index: u32,
    expected_size: u32,
    expected_hash: &Id32,
    timeout: Duration,
) -> anyhow::Result<Vec<u8>> {
    let bytes = tokio::time::timeout(timeout, async {
        let mut stream = TcpStream::connect(addr).await?;
        framing::write_frame(
            &mut stream,
            &DataRequest::GetChunk {
                file_hash: hash,
                chunk_index: index,
            },
        )
        .await?;
        // No length framing: the chunk is everything until the peer closes.
        let mut buf = Vec::with_capacity(expected_size as usize);
        stream.read_to_end(&mut buf).await?;
        anyhow::Ok(buf)
    })
    .await
    .context("chunk transfer timed out")??;

    if bytes.len() != expected_size as usize {
        anyhow::bail!(
            "chunk {index}: expected {expected_size} bytes, got {}",
            bytes.len()
        );
    }
    if digest::digest_chunk(&bytes) != *expected_hash {
        anyhow::bail!("chunk {index}: digest mismatch");
    }
    Ok(bytes)
}

/// Downloads one file from the swarm into the peer's owned set. Returns the
/// final path. Any unrecoverable chunk failure aborts the whole download
/// and purges the temp state.
pub(crate) async fn download(
    client: &TrackerClient,
    share: &Arc<ShareRegistry>,
    username: &str,
    hash: Id32,
    config: &PeerConfig,
    score: f64,
) -> anyhow::Result<PathBuf> {
    let mut peers = client.get_peers(hash).await?;
    peers.retain(|p| p.username != username);
    if peers.is_empty() {
        anyhow::bail!("no peers are serving {hash}");
    }

    let metadata = client.get_file_metadata(hash).await?;
    let layout = ChunkLayout::new(metadata.size)?;
    if metadata.chunk_hashes.len() != layout.chunk_count() as usize {
        anyhow::bail!("tracker metadata for {hash} has a bad chunk list");
    }

    let temp_dir = share.create_partial(hash)?;

    // Ask everyone what they hold, in parallel, to build the availability
    // index.
    let sweeps = futures::future::join_all(peers.iter().map(|peer| {
        let addr = peer.data_addr();
        async move {
            match list_chunks(addr, hash, config.chunk_timeout).await {
                Ok(chunks) => Some((peer.clone(), chunks)),
                Err(e) => {
                    debug!(peer = %peer.username, "list_chunks failed: {e:#}");
                    None
                }
            }
        }
    }))
    .await;

    let mut availability: HashMap<u32, Vec<PeerEntry>> = HashMap::new();
    for (peer, chunks) in sweeps.into_iter().flatten() {
        for index in chunks {
            availability.entry(index).or_default().push(peer.clone());
        }
    }

    let plan = rarest_first_plan(layout.chunk_count(), &availability);
    let workers = worker_limit(score, config.score_divider);
    info!(
        %hash,
        chunks = plan.len(),
        workers,
        peers = peers.len(),
        "starting download"
    );

    let announced = AtomicBool::new(false);
    let run = futures::stream::iter(plan.into_iter().map(anyhow::Ok))
        .try_for_each_concurrent(workers, |index| {
            let availability = &availability;
            let announced = &announced;
            let temp_dir = &temp_dir;
            let metadata = &metadata;
            async move {
                let holders = availability
                    .get(&index)
                    .filter(|peers| !peers.is_empty())
                    .with_context(|| format!("no peer has chunk {index}"))?;
                let expected_size = layout.chunk_size(index).unwrap();
                let expected_hash = &metadata.chunk_hashes[index as usize];

                let mut last_error = None;
                for peer in holders.iter().take(ATTEMPTS_PER_CHUNK) {
                    match fetch_chunk(
                        peer.data_addr(),
                        hash,
                        index,
                        expected_size,
                        expected_hash,
                        config.chunk_timeout,
                    )
                    .await
                    {
                        Ok(bytes) => {
                            let path = temp_dir.join(format!("{index}.chunk"));
                            tokio::fs::write(&path, &bytes)
                                .await
                                .with_context(|| format!("error writing {path:?}"))?;
                            let have = share.note_partial_chunk(&hash, index);
                            // The first verified chunk makes us a seed.
                            if have == 1 && !announced.swap(true, Ordering::SeqCst) {
                                if let Err(e) = client.partial_announce(hash).await {
                                    warn!("partial announce failed: {e:#}");
                                }
                            }
                            debug!(chunk = index, peer = %peer.username, "chunk done");
                            return Ok(());
                        }
                        Err(e) => {
                            debug!(chunk = index, peer = %peer.username, "attempt failed: {e:#}");
                            last_error = Some(e);
                        }
                    }
                }
                Err(last_error
                    .unwrap_or_else(|| anyhow::anyhow!("no attempt made"))
                    .context(format!(
                        "chunk {index} failed on {} distinct peers",
                        holders.len().min(ATTEMPTS_PER_CHUNK)
                    )))
            }
        })
        .await;

    if let Err(e) = run {
        share.remove_partial(&hash);
        return Err(e.context("download aborted"));
    }

    // All chunks are on disk and verified; assembly imposes index order and
    // the final whole-file digest is the commit gate.
    let file_name = Path::new(&metadata.name)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| hash.as_string());
    let final_path = share.download_dir().join(&file_name);

    let assembled = assemble(&temp_dir, layout, &final_path).await;
    let digests = match assembled {
        Ok(()) => {
            let path = final_path.clone();
            tokio::task::spawn_blocking(move || digest::digest_file(&path)).await?
        }
        Err(e) => Err(e),
    };

    match digests {
        Ok(digests) if digests.file_hash == hash => {
            share.promote_to_whole(&digests, file_name, final_path.clone());
            info!(%hash, path = %final_path.display(), "download complete");
            Ok(final_path)
        }
        Ok(digests) => {
            tokio::fs::remove_file(&final_path).await.ok();
            share.remove_partial(&hash);
            anyhow::bail!(
                "assembled file digest {} does not match {hash}",
                digests.file_hash
            )
        }
        Err(e) => {
            tokio::fs::remove_file(&final_path).await.ok();
            share.remove_partial(&hash);
            Err(e.context("error assembling download"))
        }
    }
}

async fn assemble(temp_dir: &Path, layout: ChunkLayout, final_path: &Path) -> anyhow::Result<()> {
    use tokio::io::AsyncWriteExt;
    let mut out = tokio::fs::File::create(final_path)
        .await
        .with_context(|| format!("error creating {final_path:?}"))?;
    for index in 0..layout.chunk_count() {
        let chunk_path = temp_dir.join(format!("{index}.chunk"));
        let bytes = tokio::fs::read(&chunk_path)
            .await
            .with_context(|| format!("error reading {chunk_path:?}"))?;
        out.write_all(&bytes).await?;
    }
    out.flush().await?;
    Ok(())
}
