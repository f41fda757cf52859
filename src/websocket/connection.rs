//! Room registry: which live sessions are subscribed to which conversation.
//!
//! All maps are sharded `DashMap`s. `join` is the only path that holds a
//! session guard and a room guard together, always in that order; every other
//! path takes one guard at a time. Sends are `try_send` on a bounded channel,
//! so nothing here ever waits on a slow client.

use dashmap::DashMap;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use uuid::Uuid;

use crate::error::{AppError, Result};
use super::types::ServerEvent;

pub type WsSender = mpsc::Sender<ServerEvent>;
pub type SessionId = Uuid;

struct SessionEntry {
    user_id: Uuid,
    tx: WsSender,
    rooms: HashSet<Uuid>,
}

#[derive(Clone)]
struct RoomMember {
    user_id: Uuid,
    tx: WsSender,
}

/// Outcome of one fan-out.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryReport {
    pub delivered: usize,
    pub dropped: usize,
}

#[derive(Clone, Default)]
pub struct RoomRegistry {
    sessions: Arc<DashMap<SessionId, SessionEntry>>,
    rooms: Arc<DashMap<Uuid, HashMap<SessionId, RoomMember>>>,
    /// user id -> that user's live sessions
    users: Arc<DashMap<Uuid, HashSet<SessionId>>>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new session with no joined rooms.
    pub fn connect(&self, user_id: Uuid, tx: WsSender) -> SessionId {
        let session_id = Uuid::new_v4();
        self.sessions.insert(
            session_id,
            SessionEntry {
                user_id,
                tx,
                rooms: HashSet::new(),
            },
        );
        self.users.entry(user_id).or_default().insert(session_id);
        tracing::debug!("Session {} connected for user {}", session_id, user_id);
        session_id
    }

    pub fn session_user(&self, session_id: SessionId) -> Option<Uuid> {
        self.sessions.get(&session_id).map(|s| s.user_id)
    }

    /// Adds the session to the room. Returns false if it was already there.
    pub fn join(&self, session_id: SessionId, conversation_id: Uuid) -> Result<bool> {
        let mut session = self
            .sessions
            .get_mut(&session_id)
            .ok_or(AppError::NotFound("Session not connected".to_string()))?;

        if !session.rooms.insert(conversation_id) {
            return Ok(false);
        }

        let member = RoomMember {
            user_id: session.user_id,
            tx: session.tx.clone(),
        };
        self.rooms
            .entry(conversation_id)
            .or_default()
            .insert(session_id, member);

        tracing::debug!("Session {} joined room {}", session_id, conversation_id);
        Ok(true)
    }

    /// Removes the session from the room. Returns false if it wasn't there.
    pub fn leave(&self, session_id: SessionId, conversation_id: Uuid) -> bool {
        let was_joined = self
            .sessions
            .get_mut(&session_id)
            .map(|mut s| s.rooms.remove(&conversation_id))
            .unwrap_or(false);

        self.remove_from_room(conversation_id, &[session_id]);

        if was_joined {
            tracing::debug!("Session {} left room {}", session_id, conversation_id);
        }
        was_joined
    }

    /// Destroys the session and drops it from every room it joined.
    pub fn disconnect(&self, session_id: SessionId) -> Vec<Uuid> {
        let (user_id, rooms): (Uuid, Vec<Uuid>) = match self.sessions.remove(&session_id) {
            Some((_, entry)) => (entry.user_id, entry.rooms.into_iter().collect()),
            None => return Vec::new(),
        };

        if let Some(mut sessions) = self.users.get_mut(&user_id) {
            sessions.remove(&session_id);
        }
        self.users.remove_if(&user_id, |_, sessions| sessions.is_empty());

        for conversation_id in &rooms {
            self.remove_from_room(*conversation_id, &[session_id]);
        }

        tracing::debug!(
            "Session {} disconnected, left {} room(s)",
            session_id,
            rooms.len()
        );
        rooms
    }

    /// Removes every session of `user_id` from the room, e.g. after the user
    /// stops being a participant. Returns how many sessions were evicted.
    pub fn evict_user(&self, conversation_id: Uuid, user_id: Uuid) -> usize {
        let evicted: Vec<SessionId> = match self.rooms.get_mut(&conversation_id) {
            Some(mut room) => {
                let ids: Vec<SessionId> = room
                    .iter()
                    .filter(|(_, member)| member.user_id == user_id)
                    .map(|(id, _)| *id)
                    .collect();
                for id in &ids {
                    room.remove(id);
                }
                ids
            }
            None => return 0,
        };

        for session_id in &evicted {
            if let Some(mut session) = self.sessions.get_mut(session_id) {
                session.rooms.remove(&conversation_id);
            }
        }

        evicted.len()
    }

    pub fn joined_rooms(&self, session_id: SessionId) -> Vec<Uuid> {
        self.sessions
            .get(&session_id)
            .map(|s| s.rooms.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn room_size(&self, conversation_id: Uuid) -> usize {
        self.rooms.get(&conversation_id).map(|r| r.len()).unwrap_or(0)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Sends directly to one session.
    pub fn send_to_session(&self, session_id: SessionId, event: ServerEvent) -> Result<()> {
        let tx = self
            .sessions
            .get(&session_id)
            .map(|s| s.tx.clone())
            .ok_or(AppError::NotFound("Session not connected".to_string()))?;

        deliver(&tx, event)
    }

    /// Fans an event out to the room.
    ///
    /// `also_user` adds that user's other sessions even if they haven't joined
    /// the room; `exclude` skips one session. Each session receives the event
    /// at most once. Failed deliveries are logged and skipped, closed sessions
    /// are pruned from the room.
    pub fn broadcast(
        &self,
        conversation_id: Uuid,
        event: &ServerEvent,
        also_user: Option<Uuid>,
        exclude: Option<SessionId>,
    ) -> DeliveryReport {
        let mut targets: HashMap<SessionId, WsSender> = self
            .rooms
            .get(&conversation_id)
            .map(|room| {
                room.iter()
                    .map(|(id, member)| (*id, member.tx.clone()))
                    .collect()
            })
            .unwrap_or_default();

        if let Some(user_id) = also_user {
            let own: Vec<SessionId> = self
                .users
                .get(&user_id)
                .map(|sessions| sessions.iter().copied().collect())
                .unwrap_or_default();
            for session_id in own {
                if targets.contains_key(&session_id) {
                    continue;
                }
                if let Some(session) = self.sessions.get(&session_id) {
                    targets.insert(session_id, session.tx.clone());
                }
            }
        }

        if let Some(excluded) = exclude {
            targets.remove(&excluded);
        }

        let mut report = DeliveryReport::default();
        let mut closed = Vec::new();

        for (session_id, tx) in targets {
            match deliver(&tx, event.clone()) {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    tracing::warn!(
                        "Dropping event for session {} in room {}: {}",
                        session_id,
                        conversation_id,
                        e
                    );
                    report.dropped += 1;
                    if tx.is_closed() {
                        closed.push(session_id);
                    }
                }
            }
        }

        if !closed.is_empty() {
            self.remove_from_room(conversation_id, &closed);
        }

        report
    }

    fn remove_from_room(&self, conversation_id: Uuid, session_ids: &[SessionId]) {
        let now_empty = match self.rooms.get_mut(&conversation_id) {
            Some(mut room) => {
                for id in session_ids {
                    room.remove(id);
                }
                room.is_empty()
            }
            None => false,
        };

        if now_empty {
            self.rooms.remove_if(&conversation_id, |_, room| room.is_empty());
        }
    }
}

fn deliver(tx: &WsSender, event: ServerEvent) -> Result<()> {
    tx.try_send(event).map_err(|e| match e {
        TrySendError::Full(_) => AppError::Transport("send buffer full".to_string()),
        TrySendError::Closed(_) => AppError::Transport("connection closed".to_string()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel() -> (WsSender, mpsc::Receiver<ServerEvent>) {
        mpsc::channel(8)
    }

    #[test]
    fn test_join_leave_disconnect() {
        let registry = RoomRegistry::new();
        let (tx, _rx) = channel();
        let user = Uuid::new_v4();
        let room_a = Uuid::new_v4();
        let room_b = Uuid::new_v4();

        let session = registry.connect(user, tx);
        assert!(registry.joined_rooms(session).is_empty());

        assert!(registry.join(session, room_a).unwrap());
        assert!(!registry.join(session, room_a).unwrap());
        assert!(registry.join(session, room_b).unwrap());
        assert_eq!(registry.room_size(room_a), 1);

        assert!(registry.leave(session, room_a));
        assert!(!registry.leave(session, room_a));
        assert_eq!(registry.room_size(room_a), 0);

        let left = registry.disconnect(session);
        assert_eq!(left, vec![room_b]);
        assert_eq!(registry.room_size(room_b), 0);
        assert_eq!(registry.session_count(), 0);
        assert!(registry.join(session, room_a).is_err());
    }

    #[test]
    fn test_broadcast_reaches_each_session_once() {
        let registry = RoomRegistry::new();
        let room = Uuid::new_v4();
        let user = Uuid::new_v4();
        let other = Uuid::new_v4();

        let (tx1, mut rx1) = channel();
        let (tx2, mut rx2) = channel();
        let (tx3, mut rx3) = channel();

        let phone = registry.connect(user, tx1);
        let laptop = registry.connect(user, tx2);
        let friend = registry.connect(other, tx3);

        registry.join(phone, room).unwrap();
        registry.join(friend, room).unwrap();

        // laptop hasn't joined but belongs to the sender
        let report = registry.broadcast(room, &ServerEvent::Ping, Some(user), None);
        assert_eq!(report, DeliveryReport { delivered: 3, dropped: 0 });

        assert!(matches!(rx1.try_recv(), Ok(ServerEvent::Ping)));
        assert!(rx1.try_recv().is_err());
        assert!(matches!(rx2.try_recv(), Ok(ServerEvent::Ping)));
        assert!(matches!(rx3.try_recv(), Ok(ServerEvent::Ping)));

        let report = registry.broadcast(room, &ServerEvent::Pong, None, Some(friend));
        assert_eq!(report.delivered, 1);
        assert!(rx3.try_recv().is_err());
        let _ = laptop;
    }

    #[test]
    fn test_user_sessions_tracked_across_disconnect() {
        let registry = RoomRegistry::new();
        let room = Uuid::new_v4();
        let user = Uuid::new_v4();

        let (tx1, _rx1) = channel();
        let (tx2, mut rx2) = channel();
        let phone = registry.connect(user, tx1);
        let laptop = registry.connect(user, tx2);
        assert_eq!(registry.users.get(&user).map(|s| s.len()), Some(2));

        registry.disconnect(phone);
        assert_eq!(registry.users.get(&user).map(|s| s.len()), Some(1));

        let report = registry.broadcast(room, &ServerEvent::Ping, Some(user), None);
        assert_eq!(report, DeliveryReport { delivered: 1, dropped: 0 });
        assert!(matches!(rx2.try_recv(), Ok(ServerEvent::Ping)));

        registry.disconnect(laptop);
        assert!(registry.users.is_empty());
        let report = registry.broadcast(room, &ServerEvent::Ping, Some(user), None);
        assert_eq!(report, DeliveryReport::default());
    }

    #[test]
    fn test_full_or_closed_sessions_are_skipped() {
        let registry = RoomRegistry::new();
        let room = Uuid::new_v4();

        let (slow_tx, _slow_rx) = mpsc::channel(1);
        let (gone_tx, gone_rx) = channel();
        let (ok_tx, mut ok_rx) = channel();

        let slow = registry.connect(Uuid::new_v4(), slow_tx);
        let gone = registry.connect(Uuid::new_v4(), gone_tx);
        let ok = registry.connect(Uuid::new_v4(), ok_tx);
        for session in [slow, gone, ok] {
            registry.join(session, room).unwrap();
        }
        drop(gone_rx);

        let first = registry.broadcast(room, &ServerEvent::Ping, None, None);
        assert_eq!(first, DeliveryReport { delivered: 2, dropped: 1 });
        // closed session is pruned
        assert_eq!(registry.room_size(room), 2);

        let second = registry.broadcast(room, &ServerEvent::Pong, None, None);
        assert_eq!(second, DeliveryReport { delivered: 1, dropped: 1 });
        assert_eq!(registry.room_size(room), 2);

        assert!(matches!(ok_rx.try_recv(), Ok(ServerEvent::Ping)));
        assert!(matches!(ok_rx.try_recv(), Ok(ServerEvent::Pong)));
    }

    #[test]
    fn test_evict_user() {
        let registry = RoomRegistry::new();
        let room = Uuid::new_v4();
        let user = Uuid::new_v4();
        let (tx, _rx) = channel();
        let (tx2, _rx2) = channel();

        let s1 = registry.connect(user, tx);
        let s2 = registry.connect(Uuid::new_v4(), tx2);
        registry.join(s1, room).unwrap();
        registry.join(s2, room).unwrap();

        assert_eq!(registry.evict_user(room, user), 1);
        assert_eq!(registry.room_size(room), 1);
        assert!(registry.joined_rooms(s1).is_empty());
    }
}
