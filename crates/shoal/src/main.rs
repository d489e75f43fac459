use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use libshoal::{PeerConfig, PeerEvent, PeerSession};
use shoal_core::Id32;
use shoal_tracker::{Argon2Hasher, MemStore, SqliteStore, Tracker, TrackerConfig};
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Parser)]
#[command(version, author, about)]
struct Opts {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the tracker.
    Tracker(TrackerOpts),
    /// Peer operations.
    #[command(subcommand)]
    Peer(PeerCommand),
}

#[derive(Args)]
struct TrackerOpts {
    /// Address to listen on.
    #[arg(long, default_value = "0.0.0.0:5000", env = "SHOAL_TRACKER_LISTEN")]
    listen: SocketAddr,

    /// SQLite database file.
    #[arg(long, default_value = "shoal-tracker.db", env = "SHOAL_TRACKER_DB")]
    db: PathBuf,

    /// Keep all state in memory instead of the database file.
    #[arg(long)]
    in_memory: bool,

    /// Seconds without a heartbeat before a peer's session expires.
    #[arg(long, default_value = "900", env = "SHOAL_SESSION_TTL")]
    session_ttl: u64,

    /// Score weight of one second online.
    #[arg(long, default_value = "1.0")]
    weight_time: f64,

    /// Score weight of one served chunk.
    #[arg(long, default_value = "10.0")]
    weight_chunks: f64,
}

#[derive(Args)]
struct PeerOpts {
    /// The tracker's address.
    #[arg(long, default_value = "127.0.0.1:5000", env = "SHOAL_TRACKER")]
    tracker: SocketAddr,

    /// Directory for downloads, room journals and chat logs.
    #[arg(long, default_value = ".", env = "SHOAL_ROOT")]
    root: PathBuf,

    #[arg(long, env = "SHOAL_USERNAME")]
    username: String,

    #[arg(long, env = "SHOAL_PASSWORD")]
    password: String,

    /// IP other peers should reach us on.
    #[arg(long, default_value = "127.0.0.1", env = "SHOAL_ADVERTISED_IP")]
    advertised_ip: IpAddr,

    /// Chunk server port (0 = ephemeral).
    #[arg(long, default_value = "0", env = "SHOAL_DATA_PORT")]
    data_port: u16,

    /// Chat port (0 = ephemeral).
    #[arg(long, default_value = "0", env = "SHOAL_CHAT_PORT")]
    chat_port: u16,
}

#[derive(Subcommand)]
enum PeerCommand {
    /// Create an account on the tracker.
    Register {
        #[command(flatten)]
        opts: PeerOpts,
    },
    /// Log in and stay online: serve chunks, heartbeat, sync rooms.
    Run {
        #[command(flatten)]
        opts: PeerOpts,

        /// Files to announce after logging in.
        #[arg(long = "announce")]
        announce: Vec<PathBuf>,

        /// File hashes to download after logging in.
        #[arg(long = "download")]
        download: Vec<Id32>,

        /// Rooms to start tracking after logging in.
        #[arg(long = "join-room")]
        join_rooms: Vec<String>,
    },
}

fn init_logging() {
    use tracing_subscriber::EnvFilter;
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
}

fn peer_config(opts: &PeerOpts) -> PeerConfig {
    PeerConfig {
        tracker_addr: opts.tracker,
        root_dir: opts.root.clone(),
        advertised_ip: opts.advertised_ip,
        data_port: opts.data_port,
        chat_port: opts.chat_port,
        ..Default::default()
    }
}

async fn run_tracker(opts: TrackerOpts) -> anyhow::Result<()> {
    let store: Arc<dyn shoal_tracker::Store> = if opts.in_memory {
        Arc::new(MemStore::new())
    } else {
        Arc::new(SqliteStore::open(&opts.db).context("error opening tracker database")?)
    };
    let tracker = Tracker::new(
        store,
        Arc::new(Argon2Hasher),
        TrackerConfig {
            session_ttl: Duration::from_secs(opts.session_ttl),
            score_weight_time: opts.weight_time,
            score_weight_chunks: opts.weight_chunks,
        },
    );
    let listener = tokio::net::TcpListener::bind(opts.listen)
        .await
        .with_context(|| format!("error binding {}", opts.listen))?;

    let cancel = CancellationToken::new();
    let run = tokio::spawn(tracker.run(listener, cancel.clone()));
    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    cancel.cancel();
    run.await??;
    Ok(())
}

async fn run_peer(
    opts: PeerOpts,
    announce: Vec<PathBuf>,
    download: Vec<Id32>,
    join_rooms: Vec<String>,
) -> anyhow::Result<()> {
    let session = PeerSession::login(peer_config(&opts), &opts.username, &opts.password).await?;

    let mut events = session.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                PeerEvent::DirectMessage { from, message } => {
                    println!("[{from}] {message}");
                }
                PeerEvent::RoomMessage {
                    room_id,
                    sender,
                    message,
                    ..
                } => {
                    println!("[{room_id}] {sender}: {message}");
                }
            }
        }
    });

    for path in announce {
        let hash = session.announce_file(&path).await?;
        println!("announced {} as {hash}", path.display());
    }
    for room_id in join_rooms {
        session.rooms().activate_room(&room_id).await?;
        println!("tracking room {room_id}");
    }
    for hash in download {
        match session.download(hash).await {
            Ok(path) => println!("downloaded {hash} to {}", path.display()),
            Err(e) => eprintln!("download of {hash} failed: {e:#}"),
        }
    }

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    session.shutdown();
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();
    let opts = Opts::parse();
    match opts.command {
        Command::Tracker(tracker_opts) => run_tracker(tracker_opts).await,
        Command::Peer(PeerCommand::Register { opts }) => {
            PeerSession::register(&peer_config(&opts), &opts.username, &opts.password).await?;
            println!("registered {}", opts.username);
            Ok(())
        }
        Command::Peer(PeerCommand::Run {
            opts,
            announce,
            download,
            join_rooms,
        }) => run_peer(opts, announce, download, join_rooms).await,
    }
}
