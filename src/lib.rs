//! Full-mesh audio/video rooms.
//!
//! A [`relay::RelayServer`] only forwards signaling between members of a
//! room; media flows directly between clients. Each client runs a
//! [`mesh::MeshCoordinator`] that keeps one [`peer::PeerConnection`] per
//! other member.

pub mod audio;
pub mod channel;
pub mod config;
pub mod connection;
pub mod error;
pub mod media;
pub mod mesh;
pub mod peer;
pub mod relay;
pub mod room;
pub mod signaling;
pub mod webrtc;

pub use channel::{ChannelEvent, ChannelLink, SignalChannel};
pub use config::{ClientConfig, Heartbeat, ReconnectPolicy, RelayConfig};
pub use connection::{MeshSnapshot, RemotePeer, SessionStatus};
pub use error::{AppError, Result};
pub use media::{CaptureBackend, MediaSourceSet};
pub use mesh::{join_room, MeshCoordinator, MeshHandle, SessionContext};
pub use relay::{RelayServer, RelaySession};
pub use signaling::{Signal, SignalingMessage};
