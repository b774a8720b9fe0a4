use tokio::sync::mpsc;
use crate::error::{AppError, Result};
use crate::signaling::SignalingMessage;

/// Per-connection sink the relay writes outgoing frames to.
pub type Outbox = mpsc::UnboundedSender<SignalingMessage>;

pub struct Participant {
    pub id: String,
    pub session_token: String,
    /// Bumped on every (re)attach so a stale eviction can tell it lost the race.
    pub generation: u64,
    outbox: Option<Outbox>,
}

impl Participant {
    pub fn new(id: String, session_token: String, outbox: Outbox) -> Self {
        Self {
            id,
            session_token,
            generation: 0,
            outbox: Some(outbox),
        }
    }

    pub fn is_attached(&self) -> bool {
        self.outbox.is_some()
    }

    pub fn attach(&mut self, outbox: Outbox) {
        self.generation += 1;
        self.outbox = Some(outbox);
    }

    pub fn detach(&mut self) -> u64 {
        self.outbox = None;
        self.generation
    }

    pub fn send(&self, msg: SignalingMessage) -> bool {
        match &self.outbox {
            Some(outbox) => outbox.send(msg).is_ok(),
            None => false,
        }
    }
}

/// Membership of one room, ordered by join time.
pub struct RoomState {
    pub id: String,
    participants: Vec<Participant>,
    max_participants: usize,
    /// Set once the last participant leaves; a closed room never takes new members.
    pub closed: bool,
}

impl RoomState {
    pub fn new(id: String, max_participants: usize) -> Self {
        Self {
            id,
            participants: Vec::new(),
            max_participants,
            closed: false,
        }
    }

    pub fn add_participant(&mut self, participant: Participant) -> Result<()> {
        if self.participants.len() >= self.max_participants {
            return Err(AppError::RoomFull(self.id.clone()));
        }
        self.participants.push(participant);
        Ok(())
    }

    pub fn remove_participant(&mut self, participant_id: &str) -> Option<Participant> {
        let pos = self.participants.iter().position(|p| p.id == participant_id)?;
        Some(self.participants.remove(pos))
    }

    pub fn get(&self, participant_id: &str) -> Option<&Participant> {
        self.participants.iter().find(|p| p.id == participant_id)
    }

    pub fn get_mut(&mut self, participant_id: &str) -> Option<&mut Participant> {
        self.participants.iter_mut().find(|p| p.id == participant_id)
    }

    pub fn contains(&self, participant_id: &str) -> bool {
        self.get(participant_id).is_some()
    }

    pub fn len(&self) -> usize {
        self.participants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.participants.is_empty()
    }

    pub fn roster(&self) -> Vec<String> {
        self.participants.iter().map(|p| p.id.clone()).collect()
    }

    /// Every member other than `participant_id`, in join order.
    pub fn roster_except(&self, participant_id: &str) -> Vec<String> {
        self.participants
            .iter()
            .filter(|p| p.id != participant_id)
            .map(|p| p.id.clone())
            .collect()
    }

    /// Delivers to one attached member. False when absent or detached.
    pub fn send_to(&self, participant_id: &str, msg: SignalingMessage) -> bool {
        self.get(participant_id).map(|p| p.send(msg)).unwrap_or(false)
    }

    pub fn broadcast_except(&self, participant_id: &str, msg: &SignalingMessage) -> usize {
        self.participants
            .iter()
            .filter(|p| p.id != participant_id)
            .filter(|p| p.send(msg.clone()))
            .count()
    }
}
