use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;
use crate::media::LocalStreamInfo;
use crate::peer::RemoteStream;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SessionStatus {
    Connecting,
    Joined,
    Reconnecting { attempt: u32 },
    /// Left the room on request.
    Left,
    /// Relay unreachable after the retry budget. Terminal.
    Disconnected,
    /// The relay answered our join with an error. Terminal.
    Rejected,
}

impl SessionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionStatus::Left | SessionStatus::Disconnected | SessionStatus::Rejected
        )
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionStatus::Connecting => write!(f, "Connecting"),
            SessionStatus::Joined => write!(f, "Joined"),
            SessionStatus::Reconnecting { attempt } => write!(f, "Reconnecting (attempt {})", attempt),
            SessionStatus::Left => write!(f, "Left"),
            SessionStatus::Disconnected => write!(f, "Disconnected"),
            SessionStatus::Rejected => write!(f, "Rejected"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemotePeer {
    pub participant_id: String,
    pub stream: RemoteStream,
}

/// What the presentation layer sees of a room session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeshSnapshot {
    pub room_id: String,
    pub participant_id: Option<String>,
    pub status: SessionStatus,
    pub local_streams: Vec<LocalStreamInfo>,
    /// Connected remotes only, in the order their connections were created.
    pub remotes: Vec<RemotePeer>,
    pub last_error: Option<String>,
}

impl MeshSnapshot {
    fn new(room_id: String) -> Self {
        Self {
            room_id,
            participant_id: None,
            status: SessionStatus::Connecting,
            local_streams: Vec::new(),
            remotes: Vec::new(),
            last_error: None,
        }
    }

    pub fn remote_ids(&self) -> Vec<&str> {
        self.remotes.iter().map(|r| r.participant_id.as_str()).collect()
    }
}

#[derive(Clone)]
pub struct SessionMonitor {
    status: Arc<watch::Sender<MeshSnapshot>>,
    receiver: watch::Receiver<MeshSnapshot>,
}

impl SessionMonitor {
    pub fn new(room_id: &str) -> Self {
        let (status, receiver) = watch::channel(MeshSnapshot::new(room_id.to_string()));
        Self {
            status: Arc::new(status),
            receiver,
        }
    }

    pub fn update_status(&self, state: SessionStatus) {
        self.status.send_modify(|snapshot| {
            snapshot.status = state;
        });
    }

    pub fn set_participant(&self, participant_id: &str) {
        self.status.send_modify(|snapshot| {
            snapshot.participant_id = Some(participant_id.to_string());
        });
    }

    pub fn set_local_streams(&self, streams: Vec<LocalStreamInfo>) {
        self.status.send_modify(|snapshot| {
            snapshot.local_streams = streams;
        });
    }

    pub fn set_remotes(&self, remotes: Vec<RemotePeer>) {
        self.status.send_if_modified(|snapshot| {
            if snapshot.remotes == remotes {
                return false;
            }
            snapshot.remotes = remotes;
            true
        });
    }

    pub fn set_error(&self, error: String) {
        self.status.send_modify(|snapshot| {
            snapshot.last_error = Some(error);
        });
    }

    pub fn snapshot(&self) -> MeshSnapshot {
        self.receiver.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<MeshSnapshot> {
        self.receiver.clone()
    }
}
