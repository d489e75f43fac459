use std::future::Future;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use shoal_core::{digest, Id32, CHUNK_SIZE};
use shoal_proto::chat::{ChatFrame, SyncResponse};
use shoal_proto::framing;
use shoal_tracker::{Argon2Hasher, MemStore, Tracker, TrackerConfig};
use tokio::io::BufReader;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use crate::{PeerConfig, PeerEvent, PeerSession};

async fn start_tracker() -> (SocketAddr, CancellationToken) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let tracker = Tracker::new(
        Arc::new(MemStore::new()),
        Arc::new(Argon2Hasher),
        TrackerConfig::default(),
    );
    let cancel = CancellationToken::new();
    tokio::spawn(tracker.run(listener, cancel.clone()));
    (addr, cancel)
}

fn peer_config(tracker_addr: SocketAddr, root: &Path) -> PeerConfig {
    PeerConfig {
        tracker_addr,
        root_dir: root.to_owned(),
        listen_ip: "127.0.0.1".parse().unwrap(),
        advertised_ip: "127.0.0.1".parse().unwrap(),
        ..Default::default()
    }
}

async fn spawn_peer(tracker_addr: SocketAddr, root: &Path, name: &str) -> Arc<PeerSession> {
    let config = peer_config(tracker_addr, root);
    PeerSession::register(&config, name, "pw").await.unwrap();
    PeerSession::login(config, name, "pw").await.unwrap()
}

async fn eventually<F, Fut>(what: &str, mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..200 {
        if condition().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("timed out waiting for: {what}");
}

fn test_file_bytes() -> Vec<u8> {
    // Three chunks: two full, one single byte.
    (0..2 * CHUNK_SIZE as usize + 1)
        .map(|i| (i % 251) as u8)
        .collect()
}

#[tokio::test]
async fn test_swarm_download_from_whole_and_partial_seed() {
    let (tracker_addr, _cancel) = start_tracker().await;
    let root_a = tempfile::tempdir().unwrap();
    let root_b = tempfile::tempdir().unwrap();
    let root_c = tempfile::tempdir().unwrap();

    let data = test_file_bytes();
    let digests = digest::digest_bytes(&data).unwrap();

    // Seed A owns the whole file; its login auto-announces it.
    let a_dir = root_a.path().join("downloads").join("seed-a");
    std::fs::create_dir_all(&a_dir).unwrap();
    std::fs::write(a_dir.join("data.bin"), &data).unwrap();
    let _seed_a = spawn_peer(tracker_addr, root_a.path(), "seed-a").await;

    // Seed B holds only chunk 1, left over from an interrupted download;
    // its login issues a partial announce for it.
    let b_temp = root_b
        .path()
        .join("downloads")
        .join("seed-b")
        .join(format!("temp_{}", digests.file_hash.as_string()));
    std::fs::create_dir_all(&b_temp).unwrap();
    std::fs::write(
        b_temp.join("1.chunk"),
        &data[CHUNK_SIZE as usize..2 * CHUNK_SIZE as usize],
    )
    .unwrap();
    let _seed_b = spawn_peer(tracker_addr, root_b.path(), "seed-b").await;

    // Both seeds are visible for the file before anything is transferred.
    let downloader = spawn_peer(tracker_addr, root_c.path(), "leech").await;
    let peers = downloader.client().get_peers(digests.file_hash).await.unwrap();
    let mut names: Vec<_> = peers.iter().map(|p| p.username.as_str()).collect();
    names.sort_unstable();
    assert_eq!(names, vec!["seed-a", "seed-b"]);

    let path = downloader.download(digests.file_hash).await.unwrap();
    let downloaded = std::fs::read(&path).unwrap();
    assert_eq!(digest::digest_bytes(&downloaded).unwrap().file_hash, digests.file_hash);
    assert_eq!(downloaded, data);

    // The temp dir is gone, and the downloader now counts as a seed.
    assert!(!root_c
        .path()
        .join("downloads")
        .join("leech")
        .join(format!("temp_{}", digests.file_hash.as_string()))
        .exists());
    let peers = downloader.client().get_peers(digests.file_hash).await.unwrap();
    assert!(peers.iter().any(|p| p.username == "leech"));
}

#[tokio::test]
async fn test_download_with_no_peers_fails() {
    let (tracker_addr, _cancel) = start_tracker().await;
    let root = tempfile::tempdir().unwrap();
    let peer = spawn_peer(tracker_addr, root.path(), "alone").await;
    assert!(peer.download(Id32::new([9; 32])).await.is_err());
}

#[tokio::test]
async fn test_room_convergence_with_late_member() {
    let (tracker_addr, _cancel) = start_tracker().await;
    let root_m = tempfile::tempdir().unwrap();
    let root_a = tempfile::tempdir().unwrap();
    let root_b = tempfile::tempdir().unwrap();

    let moderator = spawn_peer(tracker_addr, root_m.path(), "mod").await;
    let alice = spawn_peer(tracker_addr, root_a.path(), "alice").await;
    // bob is registered (so he can be added) but offline for now.
    PeerSession::register(&peer_config(tracker_addr, root_b.path()), "bob", "pw")
        .await
        .unwrap();

    moderator.rooms().create_room("den", None).await.unwrap();
    moderator.client().add_member("den", "alice").await.unwrap();
    moderator.client().add_member("den", "bob").await.unwrap();
    alice.rooms().activate_room("den").await.unwrap();

    moderator.rooms().send_message("den", "m1").await.unwrap();
    // Alice sees m1 via the live broadcast before she replies.
    eventually("alice receives m1", || async {
        alice
            .rooms()
            .history("den", 0)
            .await
            .iter()
            .any(|m| m.message == "m1")
    })
    .await;
    alice.rooms().send_message("den", "m2").await.unwrap();

    // Bob comes online later and pulls the journal from the others.
    let bob = PeerSession::login(peer_config(tracker_addr, root_b.path()), "bob", "pw")
        .await
        .unwrap();
    bob.rooms().activate_room("den").await.unwrap();
    bob.rooms().sync_room("den").await.unwrap();

    let history = bob.rooms().history("den", 0).await;
    let texts: Vec<_> = history.iter().map(|m| m.message.as_str()).collect();
    assert_eq!(texts, vec!["m1", "m2"]);
    // Hashes are unique and both senders are represented.
    assert_ne!(history[0].hash, history[1].hash);
    assert_eq!(history[0].sender, "mod");
    assert_eq!(history[1].sender, "alice");

    // All three journals converge to the same contents.
    eventually("moderator has both messages", || async {
        moderator.rooms().history("den", 0).await.len() == 2
    })
    .await;
}

#[tokio::test]
async fn test_non_member_sync_is_rejected() {
    let (tracker_addr, _cancel) = start_tracker().await;
    let root_m = tempfile::tempdir().unwrap();
    let root_c = tempfile::tempdir().unwrap();

    let moderator = spawn_peer(tracker_addr, root_m.path(), "mod").await;
    let _carol = spawn_peer(tracker_addr, root_c.path(), "carol").await;

    moderator.rooms().create_room("private", None).await.unwrap();
    moderator
        .rooms()
        .send_message("private", "secret")
        .await
        .unwrap();

    // Carol is online but not a member; a raw sync request gets refused.
    let stream = TcpStream::connect(moderator.chat_addr()).await.unwrap();
    let (read_half, mut write_half) = stream.into_split();
    framing::write_frame(
        &mut write_half,
        &ChatFrame::SyncRoomMessages {
            room_id: "private".into(),
            requester: "carol".into(),
        },
    )
    .await
    .unwrap();
    let mut reader = BufReader::new(read_half);
    let response: SyncResponse = framing::read_frame(&mut reader).await.unwrap().unwrap();
    assert!(!response.status.is_success());
    assert_eq!(response.message.as_deref(), Some("access denied"));
    assert!(response.messages.is_none());
}

#[tokio::test]
async fn test_direct_message_between_peers() {
    let (tracker_addr, _cancel) = start_tracker().await;
    let root_a = tempfile::tempdir().unwrap();
    let root_b = tempfile::tempdir().unwrap();

    let alice = spawn_peer(tracker_addr, root_a.path(), "alice").await;
    let bob = spawn_peer(tracker_addr, root_b.path(), "bob").await;

    let mut events = bob.subscribe();
    alice.send_direct_message("bob", "hey bob").await.unwrap();

    let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("no event in time")
        .unwrap();
    match event {
        PeerEvent::DirectMessage { from, message } => {
            assert_eq!(from, "alice");
            assert_eq!(message, "hey bob");
        }
        other => panic!("unexpected event: {other:?}"),
    }
}
