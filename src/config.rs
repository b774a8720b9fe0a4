//! Configuration for the relay and for room clients.

use std::net::SocketAddr;
use std::time::Duration;
use rand::Rng;
use crate::error::{AppError, Result};
use crate::media::MEDIA_STREAM_CAP;

/// Backoff schedule for the signaling channel.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    /// Attempts after a drop before giving up.
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// Fraction of the delay randomised in either direction (0.0 - 1.0).
    pub jitter: f64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            initial_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(5000),
            jitter: 0.5,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before the given attempt (1-based), without jitter.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let delay = self.initial_delay.saturating_mul(1u32 << exp);
        delay.min(self.max_delay)
    }

    /// Delay before the given attempt with jitter applied, never above `max_delay`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        if self.jitter <= 0.0 {
            return base;
        }
        let spread = self.jitter.min(1.0);
        let factor = rand::thread_rng().gen_range((1.0 - spread)..=(1.0 + spread));
        base.mul_f64(factor).min(self.max_delay)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(AppError::Config("max_attempts must be at least 1".into()));
        }
        if self.initial_delay > self.max_delay {
            return Err(AppError::Config("initial_delay exceeds max_delay".into()));
        }
        if !(0.0..=1.0).contains(&self.jitter) {
            return Err(AppError::Config("jitter must be within 0.0..=1.0".into()));
        }
        Ok(())
    }
}

/// Liveness checks on a signaling WebSocket.
///
/// Each side pings every `interval` and treats the link as dead when nothing
/// at all arrives for `idle_timeout`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Heartbeat {
    pub interval: Duration,
    pub idle_timeout: Duration,
}

impl Default for Heartbeat {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(25),
            idle_timeout: Duration::from_secs(45),
        }
    }
}

impl Heartbeat {
    pub fn validate(&self) -> Result<()> {
        if self.interval.is_zero() {
            return Err(AppError::Config("heartbeat interval must be positive".into()));
        }
        if self.idle_timeout <= self.interval {
            return Err(AppError::Config("idle timeout must exceed the heartbeat interval".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub bind_addr: SocketAddr,
    /// How long a dropped participant keeps its identity before eviction.
    pub disconnect_grace: Duration,
    pub max_participants: usize,
    pub heartbeat: Heartbeat,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            disconnect_grace: Duration::from_millis(5000),
            max_participants: 10,
            heartbeat: Heartbeat::default(),
        }
    }
}

impl RelayConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_participants < 2 {
            return Err(AppError::Config("a room needs room for at least 2 participants".into()));
        }
        self.heartbeat.validate()
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub signaling_url: String,
    /// Room to join; a new one is generated when absent.
    pub room_id: Option<String>,
    /// Token from a previous session, presented on the first join.
    pub session_token: Option<String>,
    pub max_streams: usize,
    /// Index of the local stream sent to every peer.
    pub outbound_stream: usize,
    pub stun_servers: Vec<String>,
    pub reconnect: ReconnectPolicy,
    pub heartbeat: Heartbeat,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            signaling_url: "ws://127.0.0.1:8080".to_string(),
            room_id: None,
            session_token: None,
            max_streams: MEDIA_STREAM_CAP,
            outbound_stream: 0,
            stun_servers: vec!["stun:stun.l.google.com:19302".to_string()],
            reconnect: ReconnectPolicy::default(),
            heartbeat: Heartbeat::default(),
        }
    }
}

impl ClientConfig {
    pub fn validate(&self) -> Result<()> {
        if !(self.signaling_url.starts_with("ws://") || self.signaling_url.starts_with("wss://")) {
            return Err(AppError::Config(format!(
                "signaling url must be ws:// or wss://, got {}",
                self.signaling_url
            )));
        }
        if let Some(room) = &self.room_id {
            if room.trim().is_empty() {
                return Err(AppError::Config("room id is empty".into()));
            }
        }
        self.reconnect.validate()?;
        self.heartbeat.validate()
    }
}
