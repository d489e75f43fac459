use std::sync::Arc;

use shoal_proto::data::{DataRequest, ListChunksResponse};
use shoal_proto::framing;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, debug_span, trace};

use crate::share::ShareRegistry;

/// Serves the data port: one request per connection, then close.
pub(crate) async fn run(
    listener: TcpListener,
    share: Arc<ShareRegistry>,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    loop {
        let (stream, addr) = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            r = listener.accept() => r?,
        };
        let share = share.clone();
        shoal_core::spawn_utils::spawn(debug_span!("data", %addr), async move {
            handle_conn(stream, &share).await
        });
    }
}

async fn handle_conn(stream: TcpStream, share: &ShareRegistry) -> anyhow::Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    // A malformed or missing request line closes the connection, nothing
    // else to salvage on a one-shot socket.
    let Some(request) = framing::read_frame::<DataRequest>(&mut reader).await? else {
        return Ok(());
    };

    match request {
        DataRequest::ListChunks { file_hash } => {
            let response = match share.available_chunks(&file_hash) {
                Some(chunks) => ListChunksResponse::ok(chunks),
                None => ListChunksResponse::error("file not found"),
            };
            framing::write_frame(&mut write_half, &response).await?;
        }
        DataRequest::GetChunk {
            file_hash,
            chunk_index,
        } => match share.read_chunk(&file_hash, chunk_index) {
            Ok(bytes) => {
                trace!(hash = %file_hash, chunk_index, len = bytes.len(), "serving chunk");
                write_half.write_all(&bytes).await?;
                share.note_chunk_served();
            }
            Err(e) => {
                debug!(hash = %file_hash, chunk_index, "refusing chunk request: {e:#}");
                let response = ListChunksResponse::error(format!("{e:#}"));
                framing::write_frame(&mut write_half, &response).await?;
            }
        },
    }
    write_half.shutdown().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use shoal_core::{digest, Id32};
    use shoal_proto::Status;
    use tokio::io::AsyncReadExt;

    async fn start_server(share: Arc<ShareRegistry>) -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(run(listener, share, CancellationToken::new()));
        addr
    }

    #[tokio::test]
    async fn test_list_and_get() {
        let dir = tempfile::tempdir().unwrap();
        let share = Arc::new(ShareRegistry::new(dir.path(), "seed").unwrap());
        let data = b"some shared bytes".to_vec();
        let path = share.download_dir().join("s.bin");
        std::fs::write(&path, &data).unwrap();
        let digests = digest::digest_bytes(&data).unwrap();
        share.register_whole(&digests, "s.bin".into(), path);

        let addr = start_server(share.clone()).await;

        // list_chunks
        let mut stream = TcpStream::connect(addr).await.unwrap();
        framing::write_frame(
            &mut stream,
            &DataRequest::ListChunks {
                file_hash: digests.file_hash,
            },
        )
        .await
        .unwrap();
        let (read_half, _w) = stream.split();
        let mut reader = BufReader::new(read_half);
        let response: ListChunksResponse =
            framing::read_frame(&mut reader).await.unwrap().unwrap();
        assert_eq!(response.chunks.unwrap(), vec![0]);

        // get_chunk streams raw bytes until EOF.
        let mut stream = TcpStream::connect(addr).await.unwrap();
        framing::write_frame(
            &mut stream,
            &DataRequest::GetChunk {
                file_hash: digests.file_hash,
                chunk_index: 0,
            },
        )
        .await
        .unwrap();
        let mut bytes = Vec::new();
        stream.read_to_end(&mut bytes).await.unwrap();
        assert_eq!(bytes, data);
        assert_eq!(share.take_served_delta(), 1);
    }

    #[tokio::test]
    async fn test_unknown_file_is_an_error_line() {
        let dir = tempfile::tempdir().unwrap();
        let share = Arc::new(ShareRegistry::new(dir.path(), "seed").unwrap());
        let addr = start_server(share).await;

        let mut stream = TcpStream::connect(addr).await.unwrap();
        framing::write_frame(
            &mut stream,
            &DataRequest::GetChunk {
                file_hash: Id32::new([1; 32]),
                chunk_index: 0,
            },
        )
        .await
        .unwrap();
        let (read_half, _w) = stream.split();
        let mut reader = BufReader::new(read_half);
        let response: ListChunksResponse =
            framing::read_frame(&mut reader).await.unwrap().unwrap();
        assert_eq!(response.status, Status::Error);
    }
}
