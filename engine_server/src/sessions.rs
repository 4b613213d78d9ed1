//! Client sessions.
//!
//! Sessions live in an arena indexed by [`SessionId`]. Other components keep
//! ids, never references, and look sessions up when they need to act on one.
//! A slot's generation changes every time it is reused, so a stale id cannot
//! reach the session that took its place.
//!
//! Lifecycle: `Connecting -> Connected -> Spawned -> Disconnecting -> removed`.
//! `Disconnecting` is reachable from every state (explicit drop, timeout,
//! refused negotiation).

use std::{
    collections::HashMap,
    fmt,
    net::SocketAddr,
    time::{Duration, Instant},
};

use engine_shared::{net::ServerMessage, transport::DatagramSocket};
use tracing::{info, warn};

use crate::channel::OutgoingQueue;

/// Arena key of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId {
    index: u32,
    generation: u32,
}

impl SessionId {
    /// Slot index, stable for the session's lifetime and reused afterwards.
    pub fn index(&self) -> usize {
        self.index as usize
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}v{}", self.index, self.generation)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Admitted; descriptor negotiation in progress.
    Connecting,
    /// Descriptors agreed, string lists sent.
    Connected,
    /// Receiving snapshots.
    Spawned,
    /// Being dropped; removed once the disconnect notice is flushed.
    Disconnecting,
}

impl ConnectionState {
    fn can_become(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Connecting, Connected) | (Connected, Spawned) | (_, Disconnecting)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("unknown session {0}")]
    UnknownSession(SessionId),
    #[error("drop reason cannot be empty")]
    EmptyReason,
    #[error("session {id} cannot go from {from:?} to {to:?}")]
    InvalidTransition {
        id: SessionId,
        from: ConnectionState,
        to: ConnectionState,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AdmissionError {
    #[error("server is full ({0} clients)")]
    ServerFull(usize),
    #[error("{0} already has a session")]
    AlreadyConnected(SocketAddr),
}

/// Server-side record of one client.
#[derive(Debug)]
pub struct ClientSession {
    pub id: SessionId,
    pub user_id: u32,
    pub endpoint: SocketAddr,
    pub name: String,
    pub state: ConnectionState,
    pub connected_at: Instant,
    last_received_sequence: u32,
    last_received: Instant,
    pub(crate) outgoing: OutgoingQueue,
}

impl ClientSession {
    pub fn last_received_sequence(&self) -> u32 {
        self.last_received_sequence
    }

    pub fn last_received(&self) -> Instant {
        self.last_received
    }

    pub fn outgoing(&self) -> &OutgoingQueue {
        &self.outgoing
    }
}

#[derive(Debug, Default)]
struct Slot {
    generation: u32,
    session: Option<ClientSession>,
}

/// Owns every connected client.
#[derive(Debug)]
pub struct ClientSessionManager {
    slots: Vec<Slot>,
    free: Vec<u32>,
    by_endpoint: HashMap<SocketAddr, SessionId>,
    next_user_id: u32,
    max_clients: usize,
    timeout: Duration,
    resend_interval: Duration,
}

impl ClientSessionManager {
    pub fn new(max_clients: usize, timeout: Duration, resend_interval: Duration) -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            by_endpoint: HashMap::new(),
            next_user_id: 1,
            max_clients,
            timeout,
            resend_interval,
        }
    }

    pub fn resolve(&self, endpoint: SocketAddr) -> Option<SessionId> {
        self.by_endpoint.get(&endpoint).copied()
    }

    /// Creates a `Connecting` session with a fresh user id.
    pub fn admit(
        &mut self,
        endpoint: SocketAddr,
        name: &str,
        now: Instant,
    ) -> Result<SessionId, AdmissionError> {
        if self.by_endpoint.contains_key(&endpoint) {
            return Err(AdmissionError::AlreadyConnected(endpoint));
        }
        if self.len() >= self.max_clients {
            return Err(AdmissionError::ServerFull(self.max_clients));
        }

        let index = match self.free.pop() {
            Some(i) => i,
            None => {
                self.slots.push(Slot::default());
                (self.slots.len() - 1) as u32
            }
        };
        let slot = &mut self.slots[index as usize];
        let id = SessionId {
            index,
            generation: slot.generation,
        };
        let user_id = self.next_user_id;
        self.next_user_id += 1;

        slot.session = Some(ClientSession {
            id,
            user_id,
            endpoint,
            name: name.to_string(),
            state: ConnectionState::Connecting,
            connected_at: now,
            last_received_sequence: 0,
            last_received: now,
            outgoing: OutgoingQueue::new(self.resend_interval),
        });
        self.by_endpoint.insert(endpoint, id);

        info!(session = %id, user_id, %endpoint, name, "Client admitted");
        Ok(id)
    }

    pub fn get(&self, id: SessionId) -> Option<&ClientSession> {
        self.slots
            .get(id.index as usize)
            .filter(|s| s.generation == id.generation)
            .and_then(|s| s.session.as_ref())
    }

    pub fn get_mut(&mut self, id: SessionId) -> Option<&mut ClientSession> {
        self.slots
            .get_mut(id.index as usize)
            .filter(|s| s.generation == id.generation)
            .and_then(|s| s.session.as_mut())
    }

    pub fn by_user_id(&self, user_id: u32) -> Option<SessionId> {
        self.iter().find(|s| s.user_id == user_id).map(|s| s.id)
    }

    pub fn state(&self, id: SessionId) -> Option<ConnectionState> {
        self.get(id).map(|s| s.state)
    }

    /// Moves a session along its state machine.
    pub fn promote(&mut self, id: SessionId, next: ConnectionState) -> Result<(), SessionError> {
        let session = self.get_mut(id).ok_or(SessionError::UnknownSession(id))?;
        if !session.state.can_become(next) {
            return Err(SessionError::InvalidTransition {
                id,
                from: session.state,
                to: next,
            });
        }
        session.state = next;
        Ok(())
    }

    /// Records an inbound datagram sequence.
    ///
    /// Returns false for duplicates and datagrams older than the newest one
    /// seen; only accepted datagrams count as traffic for the timeout.
    pub fn accept_sequence(&mut self, id: SessionId, sequence: u32, now: Instant) -> bool {
        let Some(session) = self.get_mut(id) else {
            return false;
        };
        if sequence <= session.last_received_sequence {
            return false;
        }
        session.last_received_sequence = sequence;
        session.last_received = now;
        true
    }

    /// Sessions that have been silent for longer than the timeout, or that
    /// have left a reliable message unacknowledged for that long.
    pub fn timed_out(&self, now: Instant) -> Vec<SessionId> {
        let expired = |since: Instant| now.saturating_duration_since(since) > self.timeout;
        self.iter()
            .filter(|s| {
                expired(s.last_received) || s.outgoing.oldest_unacknowledged().is_some_and(expired)
            })
            .map(|s| s.id)
            .collect()
    }

    /// Drops a client.
    ///
    /// The disconnect notice is queued behind everything already queued for
    /// the client and flushed before the session is removed, so the client
    /// sees it before its session stops existing.
    pub fn drop(
        &mut self,
        id: SessionId,
        reason: &str,
        socket: &dyn DatagramSocket,
        now: Instant,
    ) -> Result<ClientSession, SessionError> {
        if reason.is_empty() {
            return Err(SessionError::EmptyReason);
        }
        let session = self.get_mut(id).ok_or(SessionError::UnknownSession(id))?;
        session.state = ConnectionState::Disconnecting;

        let notice = ServerMessage::Disconnect {
            reason: reason.to_string(),
        };
        match notice.encode() {
            Ok(payload) => {
                if let Err(e) = session.outgoing.push(notice.message_type(), payload, true) {
                    warn!(session = %id, error = %e, "Could not queue disconnect notice");
                }
            }
            Err(e) => warn!(session = %id, error = %e, "Could not encode disconnect notice"),
        }

        match session.outgoing.flush(session.endpoint, socket, now) {
            Ok(stats) if stats.blocked => {
                warn!(session = %id, "Socket busy, disconnect notice may not be delivered")
            }
            Ok(_) => {}
            Err(e) => warn!(session = %id, error = %e, "Failed to flush disconnect notice"),
        }

        info!(
            session = %id,
            user_id = session.user_id,
            name = %session.name,
            reason,
            "Dropped client from server"
        );
        self.remove(id).ok_or(SessionError::UnknownSession(id))
    }

    /// Removes a session without notifying the client.
    pub fn remove(&mut self, id: SessionId) -> Option<ClientSession> {
        let slot = self
            .slots
            .get_mut(id.index as usize)
            .filter(|s| s.generation == id.generation)?;
        let session = slot.session.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index);
        self.by_endpoint.remove(&session.endpoint);
        Some(session)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ClientSession> {
        self.slots.iter().filter_map(|s| s.session.as_ref())
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut ClientSession> {
        self.slots.iter_mut().filter_map(|s| s.session.as_mut())
    }

    /// Ids of sessions in any of `states`.
    pub fn ids_in(&self, states: &[ConnectionState]) -> Vec<SessionId> {
        self.iter()
            .filter(|s| states.contains(&s.state))
            .map(|s| s.id)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.by_endpoint.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_endpoint.is_empty()
    }

    pub fn max_clients(&self) -> usize {
        self.max_clients
    }
}
