//! Process-wide room membership for the relay.
//!
//! Each room is guarded by its own lock so membership changes and the
//! broadcasts they trigger are atomic per room, while different rooms never
//! wait on each other. Lock order is rooms map, then room, then directory.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};
use uuid::Uuid;
use crate::error::{AppError, Result};
use crate::room::state::{Outbox, Participant, RoomState};
use crate::signaling::SignalingMessage;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinOutcome {
    pub participant_id: String,
    pub session_token: String,
    /// Other members, in join order.
    pub roster: Vec<String>,
    pub resumed: bool,
    /// Attach generation owned by the connection that joined. Detach and
    /// leave requests carrying an older one are ignored.
    pub generation: u64,
}

/// Result of a best-effort, at-most-once forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Delivered,
    /// Target is not an attached member of the sender's room.
    Dropped,
}

struct Membership {
    room: String,
    session_token: String,
}

#[derive(Default)]
struct Directory {
    members: HashMap<String, Membership>,
    sessions: HashMap<String, String>,
}

#[derive(Debug, Clone, Copy)]
enum Removal {
    Attached(u64),
    Detached(u64),
}

pub struct RelayRegistry {
    rooms: RwLock<HashMap<String, Arc<Mutex<RoomState>>>>,
    directory: Mutex<Directory>,
    max_participants: usize,
}

impl RelayRegistry {
    pub fn new(max_participants: usize) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            directory: Mutex::new(Directory::default()),
            max_participants,
        }
    }

    /// Registers a participant in `room_id`, resuming the identity behind
    /// `session_token` when it is still a member of that room.
    ///
    /// The joiner gets `welcome` and `all-users`; every other member gets
    /// `user-joined` without a signal.
    pub async fn join(
        &self,
        room_id: &str,
        session_token: Option<&str>,
        outbox: Outbox,
    ) -> Result<JoinOutcome> {
        let resume = match session_token {
            Some(token) => {
                let dir = self.directory.lock().await;
                dir.sessions
                    .get(token)
                    .filter(|pid| dir.members.get(*pid).map(|m| m.room == room_id).unwrap_or(false))
                    .cloned()
            }
            None => None,
        };

        loop {
            let room_arc = self.room_entry(room_id).await;
            let mut room = room_arc.lock().await;
            if room.closed {
                drop(room);
                self.discard_room(room_id, &room_arc).await;
                continue;
            }

            if let Some(pid) = resume.as_deref() {
                if let Some(participant) = room.get_mut(pid) {
                    participant.attach(outbox.clone());
                    let generation = participant.generation;
                    let session_token = participant.session_token.clone();
                    let roster = room.roster_except(pid);
                    Self::greet(&room, pid, &session_token, &roster, true);
                    info!(room = %room_id, participant = %pid, members = room.len(), "Participant resumed");
                    return Ok(JoinOutcome {
                        participant_id: pid.to_string(),
                        session_token,
                        roster,
                        resumed: true,
                        generation,
                    });
                }
            }

            let participant_id = Uuid::new_v4().to_string();
            let token = Uuid::new_v4().to_string();
            let roster = room.roster_except(&participant_id);
            room.add_participant(Participant::new(participant_id.clone(), token.clone(), outbox.clone()))?;
            {
                let mut dir = self.directory.lock().await;
                dir.members.insert(
                    participant_id.clone(),
                    Membership { room: room_id.to_string(), session_token: token.clone() },
                );
                dir.sessions.insert(token.clone(), participant_id.clone());
            }
            Self::greet(&room, &participant_id, &token, &roster, false);
            info!(room = %room_id, participant = %participant_id, members = room.len(), "Participant joined");

            return Ok(JoinOutcome {
                participant_id,
                session_token: token,
                roster,
                resumed: false,
                generation: 0,
            });
        }
    }

    fn greet(room: &RoomState, participant_id: &str, token: &str, roster: &[String], resumed: bool) {
        room.send_to(
            participant_id,
            SignalingMessage::Welcome {
                participant_id: participant_id.to_string(),
                session_token: token.to_string(),
                resumed,
            },
        );
        room.send_to(
            participant_id,
            SignalingMessage::AllUsers { participant_ids: roster.to_vec() },
        );
        room.broadcast_except(
            participant_id,
            &SignalingMessage::UserJoined { caller_id: participant_id.to_string(), signal: None },
        );
    }

    /// Routes `sending-signal` and `returning-signal` from `from` to their target.
    pub async fn forward(&self, from: &str, msg: SignalingMessage) -> Result<Delivery> {
        let (target, outbound) = match msg {
            SignalingMessage::SendingSignal { user_to_signal, caller_id, signal } => {
                if caller_id != from {
                    return Err(AppError::Protocol(format!(
                        "sending-signal callerID {} does not match sender {}",
                        caller_id, from
                    )));
                }
                (user_to_signal, SignalingMessage::UserJoined { caller_id, signal: Some(signal) })
            }
            SignalingMessage::ReturningSignal { signal, caller_id } => (
                caller_id,
                SignalingMessage::ReceivingReturnedSignal { id: from.to_string(), signal },
            ),
            other => {
                return Err(AppError::Protocol(format!("{} cannot be forwarded", other.event())));
            }
        };

        if target == from {
            return Err(AppError::Protocol(format!("{} signalled itself", from)));
        }

        let room_id = self
            .room_of(from)
            .await
            .ok_or_else(|| AppError::Protocol(format!("{} is not in a room", from)))?;
        let Some(room_arc) = self.rooms.read().await.get(&room_id).cloned() else {
            return Ok(Delivery::Dropped);
        };

        let room = room_arc.lock().await;
        if !room.contains(from) {
            return Ok(Delivery::Dropped);
        }
        if room.send_to(&target, outbound) {
            Ok(Delivery::Delivered)
        } else {
            debug!(room = %room_id, from = %from, "{}", AppError::Routing { target });
            Ok(Delivery::Dropped)
        }
    }

    /// Explicit leave on behalf of the connection holding `generation`.
    /// Returns false when the participant was not a member, or when a resume
    /// on another connection superseded the caller.
    pub async fn leave(&self, participant_id: &str, generation: u64) -> bool {
        self.remove(participant_id, Removal::Attached(generation)).await
    }

    /// Marks a participant whose channel dropped. It stays a member but
    /// receives nothing until it resumes or is evicted.
    ///
    /// Only the connection that owns `generation` can detach; returns false
    /// when the participant is gone or has since resumed elsewhere.
    pub async fn detach(&self, participant_id: &str, generation: u64) -> bool {
        let Some(room_id) = self.room_of(participant_id).await else {
            return false;
        };
        let Some(room_arc) = self.rooms.read().await.get(&room_id).cloned() else {
            return false;
        };
        let mut room = room_arc.lock().await;
        match room.get_mut(participant_id) {
            Some(p) if p.is_attached() && p.generation == generation => {
                p.detach();
                debug!(room = %room_id, participant = %participant_id, generation, "Participant detached");
                true
            }
            Some(p) => {
                debug!(
                    room = %room_id,
                    participant = %participant_id,
                    stale = generation,
                    current = p.generation,
                    "Ignoring detach from a superseded connection"
                );
                false
            }
            None => false,
        }
    }

    /// Evicts a detached participant unless it re-attached since `generation`.
    pub async fn evict_if_detached(&self, participant_id: &str, generation: u64) -> bool {
        self.remove(participant_id, Removal::Detached(generation)).await
    }

    async fn remove(&self, participant_id: &str, removal: Removal) -> bool {
        let Some(room_id) = self.room_of(participant_id).await else {
            return false;
        };
        let Some(room_arc) = self.rooms.read().await.get(&room_id).cloned() else {
            return false;
        };

        let mut room = room_arc.lock().await;
        let allowed = match (removal, room.get(participant_id)) {
            (_, None) => false,
            (Removal::Attached(generation), Some(p)) => p.generation == generation,
            (Removal::Detached(generation), Some(p)) => !p.is_attached() && p.generation == generation,
        };
        if !allowed {
            return false;
        }
        let Some(removed) = room.remove_participant(participant_id) else {
            return false;
        };
        {
            let mut dir = self.directory.lock().await;
            dir.members.remove(participant_id);
            dir.sessions.remove(&removed.session_token);
        }

        room.broadcast_except(
            participant_id,
            &SignalingMessage::UserLeft { id: participant_id.to_string() },
        );
        let empty = room.is_empty();
        if empty {
            room.closed = true;
        }
        info!(
            room = %room_id,
            participant = %participant_id,
            evicted = matches!(removal, Removal::Detached(_)),
            members = room.len(),
            "Participant left"
        );
        drop(room);

        if empty {
            self.discard_room(&room_id, &room_arc).await;
        }
        true
    }

    async fn room_entry(&self, room_id: &str) -> Arc<Mutex<RoomState>> {
        if let Some(room) = self.rooms.read().await.get(room_id) {
            return room.clone();
        }
        let mut rooms = self.rooms.write().await;
        rooms
            .entry(room_id.to_string())
            .or_insert_with(|| {
                debug!(room = %room_id, "Room created");
                Arc::new(Mutex::new(RoomState::new(room_id.to_string(), self.max_participants)))
            })
            .clone()
    }

    async fn discard_room(&self, room_id: &str, room_arc: &Arc<Mutex<RoomState>>) {
        let mut rooms = self.rooms.write().await;
        if rooms.get(room_id).map(|r| Arc::ptr_eq(r, room_arc)).unwrap_or(false) {
            rooms.remove(room_id);
            debug!(room = %room_id, "Room discarded");
        }
    }

    async fn room_of(&self, participant_id: &str) -> Option<String> {
        self.directory
            .lock()
            .await
            .members
            .get(participant_id)
            .map(|m| m.room.clone())
    }

    /// Current members of a room in join order; empty when the room does not exist.
    pub async fn members(&self, room_id: &str) -> Vec<String> {
        let Some(room_arc) = self.rooms.read().await.get(room_id).cloned() else {
            return Vec::new();
        };
        let room = room_arc.lock().await;
        room.roster()
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn session_of(&self, participant_id: &str) -> Option<String> {
        self.directory
            .lock()
            .await
            .members
            .get(participant_id)
            .map(|m| m.session_token.clone())
    }
}

impl Default for RelayRegistry {
    fn default() -> Self {
        Self::new(crate::config::RelayConfig::default().max_participants)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signaling::Signal;
    use serde_json::json;
    use tokio::sync::mpsc;

    type Inbox = mpsc::UnboundedReceiver<SignalingMessage>;

    fn outbox() -> (Outbox, Inbox) {
        mpsc::unbounded_channel()
    }

    fn drain(rx: &mut Inbox) -> Vec<SignalingMessage> {
        let mut out = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            out.push(msg);
        }
        out
    }

    fn offer() -> Signal {
        Signal::new(json!({"type": "offer"}))
    }

    #[tokio::test]
    async fn first_joiner_sees_empty_roster_second_sees_first() {
        let registry = RelayRegistry::new(10);
        let (a_tx, mut a_rx) = outbox();
        let a = registry.join("abc", None, a_tx).await.unwrap();
        assert!(a.roster.is_empty());
        assert!(!a.resumed);

        let (b_tx, mut b_rx) = outbox();
        let b = registry.join("abc", None, b_tx).await.unwrap();
        assert_eq!(b.roster, vec![a.participant_id.clone()]);

        let a_msgs = drain(&mut a_rx);
        assert!(matches!(&a_msgs[0], SignalingMessage::Welcome { .. }));
        assert_eq!(a_msgs[1], SignalingMessage::AllUsers { participant_ids: vec![] });
        assert_eq!(
            a_msgs[2],
            SignalingMessage::UserJoined { caller_id: b.participant_id.clone(), signal: None }
        );

        let b_msgs = drain(&mut b_rx);
        assert_eq!(
            b_msgs[1],
            SignalingMessage::AllUsers { participant_ids: vec![a.participant_id.clone()] }
        );
    }

    #[tokio::test]
    async fn forwards_rewrite_into_delivery_events() {
        let registry = RelayRegistry::new(10);
        let (a_tx, mut a_rx) = outbox();
        let (b_tx, mut b_rx) = outbox();
        let a = registry.join("abc", None, a_tx).await.unwrap().participant_id;
        let b = registry.join("abc", None, b_tx).await.unwrap().participant_id;
        drain(&mut a_rx);
        drain(&mut b_rx);

        let sent = registry
            .forward(
                &b,
                SignalingMessage::SendingSignal { user_to_signal: a.clone(), caller_id: b.clone(), signal: offer() },
            )
            .await
            .unwrap();
        assert_eq!(sent, Delivery::Delivered);
        assert_eq!(
            drain(&mut a_rx),
            vec![SignalingMessage::UserJoined { caller_id: b.clone(), signal: Some(offer()) }]
        );

        let answer = Signal::new(json!({"type": "answer"}));
        registry
            .forward(&a, SignalingMessage::ReturningSignal { signal: answer.clone(), caller_id: b.clone() })
            .await
            .unwrap();
        assert_eq!(
            drain(&mut b_rx),
            vec![SignalingMessage::ReceivingReturnedSignal { id: a.clone(), signal: answer }]
        );
    }

    #[tokio::test]
    async fn forward_to_departed_member_is_dropped_without_cross_talk() {
        let registry = RelayRegistry::new(10);
        let (a_tx, mut a_rx) = outbox();
        let (b_tx, _b_rx) = outbox();
        let (c_tx, mut c_rx) = outbox();
        let a = registry.join("abc", None, a_tx).await.unwrap().participant_id;
        let b = registry.join("abc", None, b_tx).await.unwrap().participant_id;
        let c = registry.join("abc", None, c_tx).await.unwrap().participant_id;
        assert!(registry.leave(&b, 0).await);
        drain(&mut a_rx);
        drain(&mut c_rx);

        let dropped = registry
            .forward(&a, SignalingMessage::SendingSignal { user_to_signal: b.clone(), caller_id: a.clone(), signal: offer() })
            .await
            .unwrap();
        assert_eq!(dropped, Delivery::Dropped);
        assert!(drain(&mut c_rx).is_empty());

        let delivered = registry
            .forward(&a, SignalingMessage::SendingSignal { user_to_signal: c.clone(), caller_id: a.clone(), signal: offer() })
            .await
            .unwrap();
        assert_eq!(delivered, Delivery::Delivered);
        assert_eq!(drain(&mut c_rx).len(), 1);
    }

    #[tokio::test]
    async fn rooms_are_isolated() {
        let registry = RelayRegistry::new(10);
        let (a_tx, _a_rx) = outbox();
        let (x_tx, mut x_rx) = outbox();
        let a = registry.join("abc", None, a_tx).await.unwrap().participant_id;
        let x = registry.join("xyz", None, x_tx).await.unwrap();
        assert!(x.roster.is_empty());
        drain(&mut x_rx);

        let result = registry
            .forward(&a, SignalingMessage::SendingSignal { user_to_signal: x.participant_id, caller_id: a.clone(), signal: offer() })
            .await
            .unwrap();
        assert_eq!(result, Delivery::Dropped);
        assert!(drain(&mut x_rx).is_empty());
        assert_eq!(registry.room_count().await, 2);
    }

    #[tokio::test]
    async fn spoofed_caller_and_self_signal_are_protocol_errors() {
        let registry = RelayRegistry::new(10);
        let (a_tx, _a_rx) = outbox();
        let (b_tx, _b_rx) = outbox();
        let a = registry.join("abc", None, a_tx).await.unwrap().participant_id;
        let b = registry.join("abc", None, b_tx).await.unwrap().participant_id;

        let spoofed = registry
            .forward(&a, SignalingMessage::SendingSignal { user_to_signal: a.clone(), caller_id: b.clone(), signal: offer() })
            .await;
        assert!(matches!(spoofed, Err(AppError::Protocol(_))));

        let to_self = registry
            .forward(&a, SignalingMessage::ReturningSignal { signal: offer(), caller_id: a.clone() })
            .await;
        assert!(matches!(to_self, Err(AppError::Protocol(_))));

        let wrong_kind = registry.forward(&a, SignalingMessage::LeaveRoom).await;
        assert!(matches!(wrong_kind, Err(AppError::Protocol(_))));
    }

    #[tokio::test]
    async fn leave_broadcasts_and_empty_room_is_discarded() {
        let registry = RelayRegistry::new(10);
        let (a_tx, mut a_rx) = outbox();
        let (b_tx, _b_rx) = outbox();
        let a = registry.join("abc", None, a_tx).await.unwrap().participant_id;
        let b = registry.join("abc", None, b_tx).await.unwrap().participant_id;
        drain(&mut a_rx);

        assert!(registry.leave(&b, 0).await);
        assert_eq!(drain(&mut a_rx), vec![SignalingMessage::UserLeft { id: b.clone() }]);
        assert!(!registry.leave(&b, 0).await);

        assert!(registry.leave(&a, 0).await);
        assert_eq!(registry.room_count().await, 0);

        let (c_tx, _c_rx) = outbox();
        let c = registry.join("abc", None, c_tx).await.unwrap();
        assert!(c.roster.is_empty());
        assert_eq!(registry.members("abc").await, vec![c.participant_id]);
    }

    #[tokio::test]
    async fn resume_keeps_identity_and_roster_size() {
        let registry = RelayRegistry::new(10);
        let (a_tx, mut a_rx) = outbox();
        let (b_tx, _b_rx) = outbox();
        let a = registry.join("abc", None, a_tx).await.unwrap();
        let b = registry.join("abc", None, b_tx).await.unwrap();

        assert!(registry.detach(&b.participant_id, b.generation).await);
        drain(&mut a_rx);

        let (b2_tx, mut b2_rx) = outbox();
        let resumed = registry.join("abc", Some(&b.session_token), b2_tx).await.unwrap();
        assert!(resumed.resumed);
        assert_eq!(resumed.generation, b.generation + 1);
        assert_eq!(resumed.participant_id, b.participant_id);
        assert_eq!(resumed.roster, vec![a.participant_id.clone()]);
        assert_eq!(registry.members("abc").await.len(), 2);
        assert!(matches!(drain(&mut b2_rx)[0], SignalingMessage::Welcome { resumed: true, .. }));
        assert_eq!(
            drain(&mut a_rx),
            vec![SignalingMessage::UserJoined { caller_id: b.participant_id.clone(), signal: None }]
        );

        // The eviction scheduled for the old channel lost the race.
        assert!(!registry.evict_if_detached(&b.participant_id, b.generation).await);
        assert_eq!(registry.members("abc").await.len(), 2);
    }

    #[tokio::test]
    async fn superseded_connection_cannot_detach_or_remove_resumed_participant() {
        let registry = RelayRegistry::new(10);
        let (a_tx, mut a_rx) = outbox();
        let (b_tx, _b_rx) = outbox();
        let a = registry.join("abc", None, a_tx).await.unwrap();
        let b = registry.join("abc", None, b_tx).await.unwrap();

        // B resumes on a new connection before the relay noticed the old one died.
        let (b2_tx, mut b2_rx) = outbox();
        let resumed = registry.join("abc", Some(&b.session_token), b2_tx).await.unwrap();
        assert!(resumed.resumed);
        drain(&mut a_rx);
        drain(&mut b2_rx);

        // The old connection's teardown arrives late.
        assert!(!registry.detach(&b.participant_id, b.generation).await);
        assert!(!registry.leave(&b.participant_id, b.generation).await);
        assert!(!registry.evict_if_detached(&b.participant_id, b.generation).await);

        let sent = registry
            .forward(
                &a.participant_id,
                SignalingMessage::SendingSignal {
                    user_to_signal: b.participant_id.clone(),
                    caller_id: a.participant_id.clone(),
                    signal: offer(),
                },
            )
            .await
            .unwrap();
        assert_eq!(sent, Delivery::Delivered);
        assert_eq!(drain(&mut b2_rx).len(), 1);
        assert!(drain(&mut a_rx).is_empty());
        assert_eq!(registry.members("abc").await.len(), 2);

        // The live connection still owns the identity.
        assert!(registry.leave(&b.participant_id, resumed.generation).await);
        assert_eq!(drain(&mut a_rx), vec![SignalingMessage::UserLeft { id: b.participant_id.clone() }]);
    }

    #[tokio::test]
    async fn evicted_token_joins_as_fresh_participant() {
        let registry = RelayRegistry::new(10);
        let (a_tx, mut a_rx) = outbox();
        let (b_tx, _b_rx) = outbox();
        let _a = registry.join("abc", None, a_tx).await.unwrap();
        let b = registry.join("abc", None, b_tx).await.unwrap();
        drain(&mut a_rx);

        assert!(registry.detach(&b.participant_id, b.generation).await);
        assert!(registry.evict_if_detached(&b.participant_id, b.generation).await);
        assert_eq!(drain(&mut a_rx), vec![SignalingMessage::UserLeft { id: b.participant_id.clone() }]);

        let (d_tx, _d_rx) = outbox();
        let d = registry.join("abc", Some(&b.session_token), d_tx).await.unwrap();
        assert!(!d.resumed);
        assert_ne!(d.participant_id, b.participant_id);
        assert_ne!(d.session_token, b.session_token);
    }

    #[tokio::test]
    async fn token_for_another_room_is_not_resumed() {
        let registry = RelayRegistry::new(10);
        let (a_tx, _a_rx) = outbox();
        let a = registry.join("abc", None, a_tx).await.unwrap();
        let (b_tx, _b_rx) = outbox();
        let b = registry.join("xyz", Some(&a.session_token), b_tx).await.unwrap();
        assert!(!b.resumed);
        assert_ne!(b.participant_id, a.participant_id);
    }

    #[tokio::test]
    async fn full_room_refuses_join() {
        let registry = RelayRegistry::new(2);
        for _ in 0..2 {
            let (tx, _rx) = outbox();
            registry.join("abc", None, tx).await.unwrap();
        }
        let (tx, _rx) = outbox();
        assert!(matches!(registry.join("abc", None, tx).await, Err(AppError::RoomFull(_))));
        assert_eq!(registry.members("abc").await.len(), 2);
    }

    #[tokio::test]
    async fn concurrent_joins_each_see_a_consistent_roster() {
        let registry = Arc::new(RelayRegistry::new(64));
        let mut handles = Vec::new();
        for _ in 0..16 {
            let registry = registry.clone();
            handles.push(tokio::spawn(async move {
                let (tx, rx) = outbox();
                let outcome = registry.join("abc", None, tx).await.unwrap();
                (outcome, rx)
            }));
        }
        let mut rosters = Vec::new();
        for handle in handles {
            let (outcome, _rx) = handle.await.unwrap();
            rosters.push(outcome.roster.len());
        }
        rosters.sort();
        assert_eq!(rosters, (0..16).collect::<Vec<_>>());
    }
}
