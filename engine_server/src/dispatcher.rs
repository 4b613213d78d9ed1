//! Message dispatch.
//!
//! Inbound: a registration table maps every client -> server message type to
//! one handler. [`MessageDispatcher::decode_and_dispatch`] walks the frames of
//! a datagram, checks each payload length against the type's schema, decodes
//! and calls the handler. Bad frames are logged and skipped; only a truncated
//! frame ends the datagram early.
//!
//! Outbound: [`SendMappings`] maps every server -> client type to its
//! reliability and enqueues onto the per-client queues.

use std::{collections::HashMap, io, net::SocketAddr, time::Instant};

use bytes::Bytes;
use engine_shared::{
    net::{ClientMessage, ClientMessageType, ServerMessage, ServerMessageType},
    snapshot::SnapshotError,
    transport::DatagramSocket,
    wire::{self, Frames, WireError},
};
use tracing::{debug, warn};

use crate::{
    channel::FlushStats,
    object_lists::TransmitError,
    sessions::{ClientSessionManager, ConnectionState, SessionError, SessionId},
};

/// Handler for one client -> server message type.
///
/// `C` is the state handlers operate on (the server core).
pub type MessageHandler<C> =
    Box<dyn Fn(&mut C, SessionId, ClientMessage) -> Result<(), ProtocolError> + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    #[error("a handler for {0:?} is already registered")]
    DuplicateHandler(ClientMessageType),
    #[error("{0:?} is already mapped")]
    DuplicateMapping(ServerMessageType),
}

#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("{0:?} has no send mapping")]
    Unmapped(ServerMessageType),
    #[error("unknown session {0}")]
    UnknownSession(SessionId),
    #[error(transparent)]
    Encode(#[from] WireError),
}

/// Why a handler refused a message. The message is discarded; the session
/// carries on unless the handler dropped it.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("{message:?} is not valid in state {state:?}")]
    UnexpectedMessage {
        message: ClientMessageType,
        state: ConnectionState,
    },
    #[error("handler for {0:?} received another message type")]
    UnexpectedPayload(ClientMessageType),
    #[error("session {0} no longer exists")]
    SessionGone(SessionId),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Send(#[from] SendError),
    #[error(transparent)]
    Transmit(#[from] TransmitError),
    #[error(transparent)]
    Snapshot(#[from] SnapshotError),
}

/// Outcome of dispatching one datagram.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub handled: usize,
    pub discarded: usize,
}

pub struct MessageDispatcher<C> {
    handlers: HashMap<ClientMessageType, MessageHandler<C>>,
}

impl<C> Default for MessageDispatcher<C> {
    fn default() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }
}

impl<C> MessageDispatcher<C> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_handler<F>(&mut self, ty: ClientMessageType, handler: F) -> Result<(), DispatchError>
    where
        F: Fn(&mut C, SessionId, ClientMessage) -> Result<(), ProtocolError> + Send + Sync + 'static,
    {
        if self.handlers.contains_key(&ty) {
            return Err(DispatchError::DuplicateHandler(ty));
        }
        self.handlers.insert(ty, Box::new(handler));
        Ok(())
    }

    pub fn has_handler(&self, ty: ClientMessageType) -> bool {
        self.handlers.contains_key(&ty)
    }

    /// Decodes every frame of a datagram body and runs its handler.
    pub fn decode_and_dispatch(&self, ctx: &mut C, session: SessionId, body: &[u8]) -> DispatchReport {
        let mut report = DispatchReport::default();

        for frame in Frames::new(body) {
            let frame = match frame {
                Ok(frame) => frame,
                Err(e) => {
                    debug!(%session, error = %e, "Malformed frame, rest of datagram discarded");
                    report.discarded += 1;
                    break;
                }
            };

            let Some(ty) = ClientMessageType::from_u8(frame.tag) else {
                debug!(%session, tag = frame.tag, "Unknown message tag");
                report.discarded += 1;
                continue;
            };
            let expected = ty.expected_len();
            if !expected.accepts(frame.payload.len()) {
                debug!(
                    %session,
                    message = ?ty,
                    %expected,
                    actual = frame.payload.len(),
                    "Bad payload length"
                );
                report.discarded += 1;
                continue;
            }
            let Some(handler) = self.handlers.get(&ty) else {
                debug!(%session, message = ?ty, "No handler registered");
                report.discarded += 1;
                continue;
            };
            let message = match ClientMessage::decode(ty, frame.payload) {
                Ok(m) => m,
                Err(e) => {
                    debug!(%session, message = ?ty, error = %e, "Could not decode message");
                    report.discarded += 1;
                    continue;
                }
            };

            match handler(ctx, session, message) {
                Ok(()) => report.handled += 1,
                Err(e) => {
                    warn!(%session, message = ?ty, error = %e, "Message discarded");
                    report.discarded += 1;
                }
            }
        }
        report
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reliability {
    Reliable,
    Unreliable,
}

/// Server -> client registration table.
#[derive(Debug, Clone, Default)]
pub struct SendMappings {
    table: HashMap<ServerMessageType, Reliability>,
}

impl SendMappings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything the engine sends over a session. `Reject` is absent: it
    /// is sent before a session exists.
    pub fn engine_default() -> Self {
        let mut mappings = Self::new();
        for ty in ServerMessageType::ALL {
            let reliability = match ty {
                ServerMessageType::Reject => continue,
                ServerMessageType::Snapshot => Reliability::Unreliable,
                _ => Reliability::Reliable,
            };
            mappings.table.insert(ty, reliability);
        }
        mappings
    }

    pub fn map(&mut self, ty: ServerMessageType, reliability: Reliability) -> Result<(), DispatchError> {
        if self.table.contains_key(&ty) {
            return Err(DispatchError::DuplicateMapping(ty));
        }
        self.table.insert(ty, reliability);
        Ok(())
    }

    pub fn reliability(&self, ty: ServerMessageType) -> Option<Reliability> {
        self.table.get(&ty).copied()
    }

    /// Queues an already encoded payload. Returns the reliable id (0 when
    /// unreliable).
    pub fn enqueue(
        &self,
        sessions: &mut ClientSessionManager,
        id: SessionId,
        ty: ServerMessageType,
        payload: Bytes,
    ) -> Result<u32, SendError> {
        let reliability = self.reliability(ty).ok_or(SendError::Unmapped(ty))?;
        let session = sessions.get_mut(id).ok_or(SendError::UnknownSession(id))?;
        Ok(session
            .outgoing
            .push(ty, payload, reliability == Reliability::Reliable)?)
    }

    pub fn send(
        &self,
        sessions: &mut ClientSessionManager,
        id: SessionId,
        message: &ServerMessage,
    ) -> Result<u32, SendError> {
        let ty = message.message_type();
        if self.reliability(ty).is_none() {
            return Err(SendError::Unmapped(ty));
        }
        self.enqueue(sessions, id, ty, message.encode()?)
    }

    /// Queues `message` for every session in one of `states`. Returns the
    /// number of recipients.
    pub fn broadcast(
        &self,
        sessions: &mut ClientSessionManager,
        states: &[ConnectionState],
        message: &ServerMessage,
    ) -> Result<usize, SendError> {
        let ty = message.message_type();
        let reliability = self.reliability(ty).ok_or(SendError::Unmapped(ty))?;
        let payload = message.encode()?;
        wire::check_payload_len(payload.len())?;
        let mut sent = 0;
        for session in sessions.iter_mut().filter(|s| states.contains(&s.state)) {
            session
                .outgoing
                .push(ty, payload.clone(), reliability == Reliability::Reliable)?;
            sent += 1;
        }
        Ok(sent)
    }

    /// Flushes one client's queue.
    pub fn flush(
        &self,
        sessions: &mut ClientSessionManager,
        id: SessionId,
        socket: &dyn DatagramSocket,
        now: Instant,
    ) -> Result<FlushStats, FlushFailure> {
        let session = sessions.get_mut(id).ok_or(FlushFailure::UnknownSession(id))?;
        let endpoint = session.endpoint;
        session
            .outgoing
            .flush(endpoint, socket, now)
            .map_err(|source| FlushFailure::Io { endpoint, source })
    }

    /// Flushes every queue. Returns the sessions whose socket send failed
    /// with something other than `WouldBlock`.
    pub fn flush_all(
        &self,
        sessions: &mut ClientSessionManager,
        socket: &dyn DatagramSocket,
        now: Instant,
    ) -> Vec<(SessionId, io::Error)> {
        let mut failed = Vec::new();
        for session in sessions.iter_mut() {
            let endpoint = session.endpoint;
            match session.outgoing.flush(endpoint, socket, now) {
                Ok(stats) if stats.blocked => {
                    debug!(session = %session.id, "Socket busy, flush deferred")
                }
                Ok(_) => {}
                Err(e) => failed.push((session.id, e)),
            }
        }
        failed
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FlushFailure {
    #[error("unknown session {0}")]
    UnknownSession(SessionId),
    #[error("send to {endpoint} failed: {source}")]
    Io {
        endpoint: SocketAddr,
        #[source]
        source: io::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::{BufMut, BytesMut};
    use engine_shared::{
        transport::MemoryNetwork,
        wire::{self, Frames, PacketHeader},
    };
    use std::time::Duration;

    #[derive(Default)]
    struct Recorder {
        seen: Vec<(SessionId, ClientMessage)>,
    }

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    fn session() -> (ClientSessionManager, SessionId) {
        let mut m = ClientSessionManager::new(4, Duration::from_secs(5), Duration::from_millis(100));
        let id = m.admit(addr(10), "a", Instant::now()).unwrap();
        (m, id)
    }

    fn recording_dispatcher() -> MessageDispatcher<Recorder> {
        let mut d = MessageDispatcher::new();
        for ty in [
            ClientMessageType::FrameAck,
            ClientMessageType::Heartbeat,
            ClientMessageType::Spawn,
        ] {
            d.register_handler(ty, |ctx: &mut Recorder, id, msg| {
                ctx.seen.push((id, msg));
                Ok(())
            })
            .unwrap();
        }
        d
    }

    fn frame(buf: &mut BytesMut, msg: &ClientMessage) {
        let payload = msg.encode().unwrap();
        wire::write_frame(buf, msg.message_type() as u8, 0, &payload).unwrap();
    }

    #[test]
    fn duplicate_handler_is_refused() {
        let mut d = recording_dispatcher();
        let err = d
            .register_handler(ClientMessageType::Spawn, |_: &mut Recorder, _, _| Ok(()))
            .unwrap_err();
        assert_eq!(err, DispatchError::DuplicateHandler(ClientMessageType::Spawn));
    }

    #[test]
    fn bad_frames_are_skipped_and_processing_continues() {
        let (_, id) = session();
        let d = recording_dispatcher();
        let mut body = BytesMut::new();
        frame(&mut body, &ClientMessage::Heartbeat);
        // Unknown tag.
        wire::write_frame(&mut body, 200, 0, b"xx").unwrap();
        // FrameAck must be exactly 4 bytes.
        wire::write_frame(&mut body, ClientMessageType::FrameAck as u8, 0, &[1, 2]).unwrap();
        // Connect has no handler here.
        frame(
            &mut body,
            &ClientMessage::Connect {
                protocol: 2,
                app_id: "x".into(),
                name: "y".into(),
            },
        );
        frame(&mut body, &ClientMessage::FrameAck { frame: 9 });

        let mut ctx = Recorder::default();
        let report = d.decode_and_dispatch(&mut ctx, id, &body);
        assert_eq!(report, DispatchReport { handled: 2, discarded: 3 });
        assert_eq!(
            ctx.seen,
            vec![(id, ClientMessage::Heartbeat), (id, ClientMessage::FrameAck { frame: 9 })]
        );
    }

    #[test]
    fn truncated_frame_ends_the_datagram() {
        let (_, id) = session();
        let d = recording_dispatcher();
        let mut body = BytesMut::new();
        frame(&mut body, &ClientMessage::Spawn);
        body.put_u8(ClientMessageType::Heartbeat as u8);
        body.put_u16(7);

        let mut ctx = Recorder::default();
        let report = d.decode_and_dispatch(&mut ctx, id, &body);
        assert_eq!(report, DispatchReport { handled: 1, discarded: 1 });
    }

    #[test]
    fn handler_errors_do_not_stop_the_datagram() {
        let (_, id) = session();
        let mut d: MessageDispatcher<Recorder> = MessageDispatcher::new();
        d.register_handler(ClientMessageType::Spawn, |_, id, _| Err(ProtocolError::SessionGone(id)))
            .unwrap();
        d.register_handler(ClientMessageType::Heartbeat, |ctx: &mut Recorder, id, m| {
            ctx.seen.push((id, m));
            Ok(())
        })
        .unwrap();

        let mut body = BytesMut::new();
        frame(&mut body, &ClientMessage::Spawn);
        frame(&mut body, &ClientMessage::Heartbeat);
        let mut ctx = Recorder::default();
        let report = d.decode_and_dispatch(&mut ctx, id, &body);
        assert_eq!(report, DispatchReport { handled: 1, discarded: 1 });
    }

    #[test]
    fn unmapped_types_cannot_be_sent() {
        let (mut sessions, id) = session();
        let mappings = SendMappings::engine_default();
        let err = mappings
            .send(&mut sessions, id, &ServerMessage::Reject { reason: "no".into() })
            .unwrap_err();
        assert!(matches!(err, SendError::Unmapped(ServerMessageType::Reject)));
        assert!(sessions.get(id).unwrap().outgoing().is_idle());
    }

    #[test]
    fn only_snapshots_are_unreliable() {
        let mappings = SendMappings::engine_default();
        assert_eq!(
            mappings.reliability(ServerMessageType::Snapshot),
            Some(Reliability::Unreliable)
        );
        assert_eq!(
            mappings.reliability(ServerMessageType::StringListAppend),
            Some(Reliability::Reliable)
        );
        assert_eq!(mappings.reliability(ServerMessageType::Reject), None);
    }

    #[test]
    fn broadcast_then_flush_delivers_in_order() {
        let net = MemoryNetwork::new();
        let socket = net.bind(addr(1)).unwrap();
        let _client = net.bind(addr(10)).unwrap();
        let (mut sessions, id) = session();
        sessions.promote(id, ConnectionState::Connected).unwrap();
        let mappings = SendMappings::engine_default();

        mappings
            .send(&mut sessions, id, &ServerMessage::Accept { user_id: 1 })
            .unwrap();
        let n = mappings
            .broadcast(
                &mut sessions,
                &[ConnectionState::Connected],
                &ServerMessage::NewMap { name: "c1a1".into() },
            )
            .unwrap();
        assert_eq!(n, 1);
        let failed = mappings.flush_all(&mut sessions, &socket, Instant::now());
        assert!(failed.is_empty());

        let datagrams = net.take_pending(addr(10));
        let (_, body) = PacketHeader::read(&datagrams[0].1).unwrap();
        let ids: Vec<(u8, u32)> = Frames::new(body)
            .map(|f| f.map(|f| (f.tag, f.reliable_id)).unwrap())
            .collect();
        assert_eq!(
            ids,
            vec![
                (ServerMessageType::Accept as u8, 1),
                (ServerMessageType::NewMap as u8, 2)
            ]
        );
    }
}
