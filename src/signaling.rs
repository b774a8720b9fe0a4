//! Relay wire protocol.
//!
//! Every frame is a JSON object tagged by its `event` field. Negotiation
//! payloads travel as [`Signal`] and are never inspected by the relay.

use serde::{Deserialize, Serialize};
use crate::error::{AppError, Result};

/// Opaque negotiation blob produced and consumed by a peer link.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Signal(pub serde_json::Value);

impl Signal {
    pub fn new(value: serde_json::Value) -> Self {
        Self(value)
    }

    pub fn into_inner(self) -> serde_json::Value {
        self.0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum SignalingMessage {
    JoinRoom {
        room: String,
        #[serde(rename = "sessionToken", default, skip_serializing_if = "Option::is_none")]
        session_token: Option<String>,
    },
    Welcome {
        #[serde(rename = "participantID")]
        participant_id: String,
        #[serde(rename = "sessionToken")]
        session_token: String,
        #[serde(default)]
        resumed: bool,
    },
    AllUsers {
        #[serde(rename = "participantIDs")]
        participant_ids: Vec<String>,
    },
    UserJoined {
        #[serde(rename = "callerID")]
        caller_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        signal: Option<Signal>,
    },
    SendingSignal {
        #[serde(rename = "userToSignal")]
        user_to_signal: String,
        #[serde(rename = "callerID")]
        caller_id: String,
        signal: Signal,
    },
    ReturningSignal {
        signal: Signal,
        #[serde(rename = "callerID")]
        caller_id: String,
    },
    ReceivingReturnedSignal {
        id: String,
        signal: Signal,
    },
    UserLeft {
        id: String,
    },
    LeaveRoom,
    Error {
        message: String,
    },
}

impl SignalingMessage {
    /// Wire name of the event, for logging.
    pub fn event(&self) -> &'static str {
        match self {
            SignalingMessage::JoinRoom { .. } => "join-room",
            SignalingMessage::Welcome { .. } => "welcome",
            SignalingMessage::AllUsers { .. } => "all-users",
            SignalingMessage::UserJoined { .. } => "user-joined",
            SignalingMessage::SendingSignal { .. } => "sending-signal",
            SignalingMessage::ReturningSignal { .. } => "returning-signal",
            SignalingMessage::ReceivingReturnedSignal { .. } => "receiving-returned-signal",
            SignalingMessage::UserLeft { .. } => "user-left",
            SignalingMessage::LeaveRoom => "leave-room",
            SignalingMessage::Error { .. } => "error",
        }
    }

    /// True for events a client may send to the relay.
    pub fn is_client_originated(&self) -> bool {
        matches!(
            self,
            SignalingMessage::JoinRoom { .. }
                | SignalingMessage::SendingSignal { .. }
                | SignalingMessage::ReturningSignal { .. }
                | SignalingMessage::LeaveRoom
        )
    }

    pub fn to_frame(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_frame(text: &str) -> Result<Self> {
        serde_json::from_str(text)
            .map_err(|e| AppError::Protocol(format!("malformed frame: {}", e)))
    }
}
