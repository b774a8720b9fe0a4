use std::fmt;
use webrtc::Error as WebRTCError;
use tokio_tungstenite::tungstenite::Error as WsError;
use anyhow::Error as AnyhowError;

#[derive(Debug)]
pub enum AppError {
    /// Signaling channel dropped. Recoverable by reconnecting.
    Transport(String),
    /// Envelope addressed to a participant that is no longer in the room.
    Routing { target: String },
    /// Capture device could not be enumerated or opened.
    Device(String),
    /// Malformed or out-of-order envelope.
    Protocol(String),
    RoomFull(String),
    /// The relay refused to admit us to the room.
    Rejected(String),
    Config(String),
    WebRTC(WebRTCError),
    Ws(WsError),
    Json(serde_json::Error),
    Io(std::io::Error),
    Other(AnyhowError),
}

impl AppError {
    /// Whether the session may carry on after this error.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, AppError::Config(_) | AppError::Io(_))
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Transport(e) => write!(f, "Transport error: {}", e),
            AppError::Routing { target } => write!(f, "Routing error: {} is not in the room", target),
            AppError::Device(e) => write!(f, "Device error: {}", e),
            AppError::Protocol(e) => write!(f, "Protocol error: {}", e),
            AppError::RoomFull(room) => write!(f, "Room {} is full", room),
            AppError::Rejected(e) => write!(f, "Join refused: {}", e),
            AppError::Config(e) => write!(f, "Configuration error: {}", e),
            AppError::WebRTC(e) => write!(f, "WebRTC error: {}", e),
            AppError::Ws(e) => write!(f, "WebSocket error: {}", e),
            AppError::Json(e) => write!(f, "JSON error: {}", e),
            AppError::Io(e) => write!(f, "IO error: {}", e),
            AppError::Other(e) => write!(f, "Other error: {}", e),
        }
    }
}

impl std::error::Error for AppError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            AppError::WebRTC(e) => Some(e),
            AppError::Ws(e) => Some(e),
            AppError::Json(e) => Some(e),
            AppError::Io(e) => Some(e),
            AppError::Other(e) => Some(&**e),
            _ => None,
        }
    }
}

impl From<WebRTCError> for AppError {
    fn from(err: WebRTCError) -> Self {
        AppError::WebRTC(err)
    }
}

impl From<WsError> for AppError {
    fn from(err: WsError) -> Self {
        AppError::Ws(err)
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::Json(err)
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        AppError::Io(err)
    }
}

impl From<AnyhowError> for AppError {
    fn from(err: AnyhowError) -> Self {
        AppError::Other(err)
    }
}

pub type Result<T> = std::result::Result<T, AppError>;
