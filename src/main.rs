//! `mesh-room` binary.
//!
//! ```bash
//! # Run the relay
//! mesh-room relay --bind 0.0.0.0:8080
//!
//! # Join (or create) a room
//! mesh-room join --signaling-url ws://localhost:8080 --room <id>
//! ```

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use clap::{Args, Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use mesh_room::audio::CpalCapture;
use mesh_room::webrtc::RtcLinkFactory;
use mesh_room::{join_room, ClientConfig, Heartbeat, RelayConfig, RelayServer, Result};

#[derive(Parser, Debug)]
#[command(author, version, about = "Full-mesh audio/video rooms", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the signaling relay
    Relay(RelayArgs),
    /// Join a room, creating a new one when no id is given
    Join(JoinArgs),
}

#[derive(Args, Debug)]
struct RelayArgs {
    #[arg(long, default_value = "0.0.0.0:8080", env = "MESH_RELAY_BIND")]
    bind: SocketAddr,

    /// How long a dropped participant can resume before it is evicted
    #[arg(long, default_value_t = 5000, env = "MESH_DISCONNECT_GRACE_MS")]
    disconnect_grace_ms: u64,

    #[arg(long, default_value_t = 10, env = "MESH_MAX_PARTICIPANTS")]
    max_participants: usize,

    /// Ping interval on each client connection
    #[arg(long, default_value_t = 25_000, env = "MESH_HEARTBEAT_MS")]
    heartbeat_ms: u64,

    /// A client that sends nothing for this long is treated as dropped
    #[arg(long, default_value_t = 45_000, env = "MESH_IDLE_TIMEOUT_MS")]
    idle_timeout_ms: u64,
}

impl From<RelayArgs> for RelayConfig {
    fn from(args: RelayArgs) -> Self {
        RelayConfig {
            bind_addr: args.bind,
            disconnect_grace: Duration::from_millis(args.disconnect_grace_ms),
            max_participants: args.max_participants,
            heartbeat: Heartbeat {
                interval: Duration::from_millis(args.heartbeat_ms),
                idle_timeout: Duration::from_millis(args.idle_timeout_ms),
            },
        }
    }
}

#[derive(Args, Debug)]
struct JoinArgs {
    #[arg(long, default_value = "ws://127.0.0.1:8080", env = "MESH_SIGNALING_URL")]
    signaling_url: String,

    #[arg(long, env = "MESH_ROOM")]
    room: Option<String>,

    /// Token from an earlier session, to resume its identity
    #[arg(long, env = "MESH_SESSION_TOKEN")]
    session_token: Option<String>,

    /// STUN servers (comma-separated)
    #[arg(
        long,
        value_delimiter = ',',
        default_value = "stun:stun.l.google.com:19302",
        env = "MESH_STUN_SERVERS"
    )]
    stun_servers: Vec<String>,

    #[arg(long, default_value_t = mesh_room::media::MEDIA_STREAM_CAP, env = "MESH_MAX_STREAMS")]
    max_streams: usize,

    /// Index of the local stream sent to every peer
    #[arg(long, default_value_t = 0, env = "MESH_OUTBOUND_STREAM")]
    outbound_stream: usize,
}

impl From<JoinArgs> for ClientConfig {
    fn from(args: JoinArgs) -> Self {
        ClientConfig {
            signaling_url: args.signaling_url,
            room_id: args.room,
            session_token: args.session_token,
            stun_servers: args.stun_servers,
            max_streams: args.max_streams,
            outbound_stream: args.outbound_stream,
            ..Default::default()
        }
    }
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing();

    let result = match cli.command {
        Command::Relay(args) => run_relay(args.into()).await,
        Command::Join(args) => run_join(args.into()).await,
    };

    if let Err(e) = result {
        error!(error = %e, "mesh-room failed");
        std::process::exit(1);
    }
}

async fn run_relay(config: RelayConfig) -> Result<()> {
    let server = RelayServer::bind(config).await?;
    tokio::select! {
        result = server.serve() => result,
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down relay");
            Ok(())
        }
    }
}

async fn run_join(config: ClientConfig) -> Result<()> {
    let factory = Arc::new(RtcLinkFactory::new(&config.stun_servers)?);
    let handle = join_room(&config, &CpalCapture::new(), factory).await?;
    info!(room = %handle.room_id(), "Share this room id to invite others");

    let mut snapshots = handle.subscribe();
    loop {
        tokio::select! {
            changed = snapshots.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = snapshots.borrow_and_update().clone();
                info!(
                    status = %snapshot.status,
                    participant = ?snapshot.participant_id,
                    local_streams = snapshot.local_streams.len(),
                    remotes = ?snapshot.remote_ids(),
                    "Room updated"
                );
                if snapshot.status.is_terminal() {
                    return handle.closed().await;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Leaving room");
                return handle.leave().await;
            }
        }
    }
    handle.closed().await
}
