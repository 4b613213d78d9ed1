//! Transport server.
//!
//! Owns the socket and drives the per-tick cycle:
//! - drain a bounded number of datagrams, resolve their sessions and
//!   dispatch their messages,
//! - let the game record the frame's object states,
//! - encode per-client snapshots and flush every outgoing queue.
//!
//! Connection flow:
//! `Connect` (connectionless) -> `Accept` + `DescriptorList` ->
//! `DescriptorAck` -> `NewMap` + string lists -> `Spawn` -> snapshots.
//!
//! Everything runs on the caller's task; nothing here waits on a client.

use std::{
    io,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::Arc,
    time::Instant,
};

use anyhow::Context;
use bytes::BytesMut;
use engine_shared::{
    binary_data::{BinaryDataDescriptorSet, FieldValue},
    config::EngineConfig,
    net::{ClientMessage, ClientMessageType, ServerMessage, ServerMessageType, APP_IDENTIFIER, PROTOCOL_VERSION},
    snapshot::{ObjectId, ObjectState, ObjectTable},
    string_lists::{NetworkStringListRegistry, StringListError},
    transport::DatagramSocket,
    wire::{self, Frames, PacketHeader},
};
use tokio::{net::UdpSocket, sync::mpsc};
use tracing::{debug, info, warn};

use crate::{
    dispatcher::{MessageDispatcher, ProtocolError, SendMappings},
    object_lists::{AckOutcome, ObjectListTransmitter, TransmitError},
    sessions::{ClientSession, ClientSessionManager, ConnectionState, SessionError, SessionId},
};

/// Sessions that receive string list updates.
const LIST_RECIPIENTS: [ConnectionState; 2] = [ConnectionState::Connected, ConnectionState::Spawned];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    /// No map started; connections are refused.
    Idle,
    /// Map running, accepting clients.
    Running,
}

/// What one [`TransportServer::poll`] did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollStats {
    pub datagrams: usize,
    pub handled: usize,
    pub discarded: usize,
    pub admitted: usize,
    pub rejected: usize,
    pub timed_out: usize,
}

/// State the message handlers work on.
pub struct ServerCore {
    pub cfg: EngineConfig,
    socket: Box<dyn DatagramSocket>,
    sessions: ClientSessionManager,
    mappings: SendMappings,
    descriptors: Arc<BinaryDataDescriptorSet>,
    string_lists: NetworkStringListRegistry,
    transmitter: ObjectListTransmitter,
    state: ServerState,
    map_name: Option<String>,
    now: Instant,
}

impl ServerCore {
    fn drop_client(&mut self, id: SessionId, reason: &str) -> Result<ClientSession, SessionError> {
        let session = self.sessions.drop(id, reason, self.socket.as_ref(), self.now)?;
        self.transmitter.remove_client(id);
        Ok(session)
    }

    /// Queues the current map and every string list for one client.
    fn send_world(&mut self, id: SessionId) -> Result<(), ProtocolError> {
        if let Some(name) = &self.map_name {
            let new_map = ServerMessage::NewMap { name: name.clone() };
            self.mappings.send(&mut self.sessions, id, &new_map)?;
        }
        for message in self.string_lists.full_transfer() {
            self.mappings.send(&mut self.sessions, id, &message)?;
        }
        Ok(())
    }

    fn replicate_string_lists(&mut self) {
        for change in self.string_lists.drain_changes() {
            let Some(message) = self.string_lists.change_message(change) else {
                continue;
            };
            if let Err(e) = self.mappings.broadcast(&mut self.sessions, &LIST_RECIPIENTS, &message) {
                warn!(error = %e, "Failed to replicate string list change");
            }
        }
    }

    fn flush_all(&mut self) {
        self.replicate_string_lists();
        let failed = self
            .mappings
            .flush_all(&mut self.sessions, self.socket.as_ref(), self.now);
        for (id, e) in failed {
            self.transmitter.remove_client(id);
            if let Some(session) = self.sessions.remove(id) {
                warn!(
                    session = %id,
                    user_id = session.user_id,
                    endpoint = %session.endpoint,
                    error = %e,
                    "Send failed, client removed"
                );
            }
        }
    }

    fn session_state(&self, id: SessionId) -> Result<ConnectionState, ProtocolError> {
        self.sessions.state(id).ok_or(ProtocolError::SessionGone(id))
    }

    fn send_connectionless(&self, to: SocketAddr, message: &ServerMessage) {
        let payload = match message.encode() {
            Ok(p) => p,
            Err(e) => {
                warn!(%to, error = %e, "Could not encode connectionless message");
                return;
            }
        };
        let mut packet = BytesMut::with_capacity(wire::PACKET_HEADER_LEN + wire::frame_len(payload.len()));
        PacketHeader {
            sequence: 0,
            reliable_ack: 0,
        }
        .write(&mut packet);
        if let Err(e) = wire::write_frame(&mut packet, message.message_type() as u8, 0, &payload) {
            warn!(%to, error = %e, "Could not frame connectionless message");
            return;
        }
        if let Err(e) = self.socket.try_send_to(&packet, to) {
            debug!(%to, error = %e, "Connectionless send failed");
        }
    }

    /// Handles a datagram from an endpoint without a session.
    ///
    /// Only a `Connect` can open a session; every refusal is answered with
    /// a `Reject` and leaves no state behind.
    fn handle_connectionless(&mut self, from: SocketAddr, header: PacketHeader, body: &[u8], stats: &mut PollStats) {
        let connect = Frames::new(body).find_map(|frame| {
            let frame = frame.ok()?;
            (frame.tag == ClientMessageType::Connect as u8)
                .then(|| ClientMessage::decode(ClientMessageType::Connect, frame.payload).ok())
                .flatten()
        });
        let Some(ClientMessage::Connect {
            protocol,
            app_id,
            name,
        }) = connect
        else {
            debug!(%from, "Ignoring traffic from unknown endpoint");
            stats.discarded += 1;
            return;
        };

        let refusal = if app_id != APP_IDENTIFIER {
            Some(format!("unknown application '{app_id}'"))
        } else if protocol != PROTOCOL_VERSION {
            Some(format!(
                "protocol mismatch: server {PROTOCOL_VERSION}, client {protocol}"
            ))
        } else if self.state != ServerState::Running {
            Some("server is not running a map".to_string())
        } else {
            None
        };

        let admitted = match refusal {
            Some(reason) => Err(reason),
            None => self
                .sessions
                .admit(from, &name, self.now)
                .map_err(|e| e.to_string()),
        };

        let id = match admitted {
            Ok(id) => id,
            Err(reason) => {
                warn!(%from, name = %name, %reason, "Connection refused");
                self.send_connectionless(from, &ServerMessage::Reject { reason });
                stats.rejected += 1;
                return;
            }
        };

        self.sessions.accept_sequence(id, header.sequence, self.now);
        let user_id = self.sessions.get(id).map(|s| s.user_id).unwrap_or_default();
        let greeting = [
            ServerMessage::Accept { user_id },
            ServerMessage::DescriptorList(self.descriptors.descriptors().to_vec()),
        ];
        for message in &greeting {
            if let Err(e) = self.mappings.send(&mut self.sessions, id, message) {
                warn!(session = %id, error = %e, "Failed to queue handshake");
            }
        }
        stats.admitted += 1;
    }
}

fn on_connect(_core: &mut ServerCore, id: SessionId, _message: ClientMessage) -> Result<(), ProtocolError> {
    // The Accept is reliable and already queued.
    debug!(session = %id, "Duplicate connect ignored");
    Ok(())
}

fn on_descriptor_ack(core: &mut ServerCore, id: SessionId, message: ClientMessage) -> Result<(), ProtocolError> {
    let ClientMessage::DescriptorAck(remote) = message else {
        return Err(ProtocolError::UnexpectedPayload(ClientMessageType::DescriptorAck));
    };
    match core.session_state(id)? {
        ConnectionState::Connecting => {}
        // A retry that crossed our answer.
        ConnectionState::Connected | ConnectionState::Spawned => return Ok(()),
        state => {
            return Err(ProtocolError::UnexpectedMessage {
                message: ClientMessageType::DescriptorAck,
                state,
            })
        }
    }

    if let Err(mismatch) = core.descriptors.compare(&remote) {
        warn!(session = %id, %mismatch, "Descriptor negotiation failed");
        core.drop_client(id, &format!("descriptor mismatch: {mismatch}"))?;
        return Ok(());
    }

    core.sessions.promote(id, ConnectionState::Connected)?;
    core.send_world(id)?;
    if let Some(session) = core.sessions.get(id) {
        info!(
            session = %id,
            user_id = session.user_id,
            name = %session.name,
            endpoint = %session.endpoint,
            "Client connected"
        );
    }
    Ok(())
}

fn on_spawn(core: &mut ServerCore, id: SessionId, _message: ClientMessage) -> Result<(), ProtocolError> {
    match core.session_state(id)? {
        ConnectionState::Connected => {
            core.sessions.promote(id, ConnectionState::Spawned)?;
            core.transmitter.add_client(id);
            info!(session = %id, "Client spawned");
            Ok(())
        }
        ConnectionState::Spawned => Ok(()),
        state => Err(ProtocolError::UnexpectedMessage {
            message: ClientMessageType::Spawn,
            state,
        }),
    }
}

fn on_frame_ack(core: &mut ServerCore, id: SessionId, message: ClientMessage) -> Result<(), ProtocolError> {
    let ClientMessage::FrameAck { frame } = message else {
        return Err(ProtocolError::UnexpectedPayload(ClientMessageType::FrameAck));
    };
    match core.transmitter.acknowledge(id, frame) {
        AckOutcome::Advanced => {}
        outcome => debug!(session = %id, frame, ?outcome, "Frame ack ignored"),
    }
    Ok(())
}

fn on_disconnect(core: &mut ServerCore, id: SessionId, message: ClientMessage) -> Result<(), ProtocolError> {
    let ClientMessage::Disconnect { reason } = message else {
        return Err(ProtocolError::UnexpectedPayload(ClientMessageType::Disconnect));
    };
    core.transmitter.remove_client(id);
    let session = core.sessions.remove(id).ok_or(ProtocolError::SessionGone(id))?;
    info!(
        session = %id,
        user_id = session.user_id,
        name = %session.name,
        %reason,
        "Client disconnected"
    );
    Ok(())
}

fn on_heartbeat(_core: &mut ServerCore, _id: SessionId, _message: ClientMessage) -> Result<(), ProtocolError> {
    Ok(())
}

/// Replication server.
pub struct TransportServer {
    dispatcher: MessageDispatcher<ServerCore>,
    core: ServerCore,
    tick: u64,
    quit_requested: bool,
    /// Channel for console commands from stdin.
    console_rx: Option<mpsc::Receiver<String>>,
}

impl TransportServer {
    /// Binds a UDP socket on the configured address.
    pub async fn bind(cfg: EngineConfig, descriptors: Arc<BinaryDataDescriptorSet>) -> anyhow::Result<Self> {
        let addr = cfg.listen_addr()?;
        let socket = UdpSocket::bind(addr)
            .await
            .with_context(|| format!("udp bind {addr}"))?;
        Self::with_socket(cfg, descriptors, Box::new(socket))
    }

    /// Builds a server on any datagram socket.
    pub fn with_socket(
        cfg: EngineConfig,
        descriptors: Arc<BinaryDataDescriptorSet>,
        socket: Box<dyn DatagramSocket>,
    ) -> anyhow::Result<Self> {
        let mut dispatcher = MessageDispatcher::new();
        dispatcher.register_handler(ClientMessageType::Connect, on_connect)?;
        dispatcher.register_handler(ClientMessageType::DescriptorAck, on_descriptor_ack)?;
        dispatcher.register_handler(ClientMessageType::Spawn, on_spawn)?;
        dispatcher.register_handler(ClientMessageType::FrameAck, on_frame_ack)?;
        dispatcher.register_handler(ClientMessageType::Disconnect, on_disconnect)?;
        dispatcher.register_handler(ClientMessageType::Heartbeat, on_heartbeat)?;

        let sessions = ClientSessionManager::new(cfg.max_clients, cfg.timeout(), cfg.resend_interval());
        let transmitter = ObjectListTransmitter::new(descriptors.clone(), cfg.max_snapshot_lag);

        Ok(Self {
            dispatcher,
            core: ServerCore {
                cfg,
                socket,
                sessions,
                mappings: SendMappings::engine_default(),
                descriptors,
                string_lists: NetworkStringListRegistry::new(),
                transmitter,
                state: ServerState::Idle,
                map_name: None,
                now: Instant::now(),
            },
            tick: 0,
            quit_requested: false,
            console_rx: None,
        })
    }

    pub fn set_console_input(&mut self, rx: mpsc::Receiver<String>) {
        self.console_rx = Some(rx);
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        self.core.socket.local_addr().context("local_addr")
    }

    pub fn config(&self) -> &EngineConfig {
        &self.core.cfg
    }

    pub fn state(&self) -> ServerState {
        self.core.state
    }

    pub fn map_name(&self) -> Option<&str> {
        self.core.map_name.as_deref()
    }

    pub fn tick(&self) -> u64 {
        self.tick
    }

    /// A console `quit` was executed; the owner should stop stepping.
    pub fn quit_requested(&self) -> bool {
        self.quit_requested
    }

    pub fn sessions(&self) -> &ClientSessionManager {
        &self.core.sessions
    }

    pub fn descriptors(&self) -> &Arc<BinaryDataDescriptorSet> {
        &self.core.descriptors
    }

    pub fn string_lists(&self) -> &NetworkStringListRegistry {
        &self.core.string_lists
    }

    /// Appends go out to connected clients on the next flush.
    pub fn string_lists_mut(&mut self) -> &mut NetworkStringListRegistry {
        &mut self.core.string_lists
    }

    pub fn transmitter(&self) -> &ObjectListTransmitter {
        &self.core.transmitter
    }

    pub fn client_by_user_id(&self, user_id: u32) -> Option<&ClientSession> {
        let id = self.core.sessions.by_user_id(user_id)?;
        self.core.sessions.get(id)
    }

    /// Starts a map, or changes to another one.
    ///
    /// A map change starts a new string list generation, forgets every
    /// snapshot baseline, and sends `NewMap` followed by the new lists to
    /// every connected client before returning.
    pub fn start_map<F>(&mut self, name: &str, build_lists: F) -> anyhow::Result<()>
    where
        F: FnOnce(&mut NetworkStringListRegistry) -> Result<(), StringListError>,
    {
        anyhow::ensure!(!name.is_empty(), "map name cannot be empty");
        let changing = self.core.state == ServerState::Running;

        self.core.string_lists.reset();
        self.core.transmitter.reset();
        build_lists(&mut self.core.string_lists).context("build string lists")?;
        // New lists reach clients through send_world, not as changes.
        self.core.string_lists.drain_changes();

        self.core.map_name = Some(name.to_string());
        self.core.state = ServerState::Running;
        info!(
            map = %name,
            lists = self.core.string_lists.len(),
            generation = self.core.string_lists.generation(),
            "Map started"
        );

        if changing {
            for id in self.core.sessions.ids_in(&LIST_RECIPIENTS) {
                if let Err(e) = self.core.send_world(id) {
                    warn!(session = %id, error = %e, "Failed to queue map change");
                }
            }
            self.core.flush_all();
        }
        Ok(())
    }

    /// Drains pending datagrams (at most `max_datagrams_per_tick`), then
    /// drops clients that went silent.
    pub fn poll(&mut self, now: Instant) -> anyhow::Result<PollStats> {
        self.core.now = now;
        let mut stats = PollStats::default();
        let mut buf = vec![0u8; 64 * 1024];

        while stats.datagrams < self.core.cfg.max_datagrams_per_tick {
            let (n, from) = match self.core.socket.try_recv_from(&mut buf) {
                Ok(r) => r,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::ConnectionReset => {
                    stats.datagrams += 1;
                    continue;
                }
                Err(e) => return Err(e).context("udp recv"),
            };
            stats.datagrams += 1;
            self.handle_datagram(from, &buf[..n], &mut stats);
        }

        for id in self.core.sessions.timed_out(now) {
            match self.core.drop_client(id, "timed out") {
                Ok(_) => stats.timed_out += 1,
                Err(e) => warn!(session = %id, error = %e, "Failed to drop timed out client"),
            }
        }
        Ok(stats)
    }

    fn handle_datagram(&mut self, from: SocketAddr, datagram: &[u8], stats: &mut PollStats) {
        let (header, body) = match PacketHeader::read(datagram) {
            Ok(r) => r,
            Err(e) => {
                debug!(%from, error = %e, "Malformed datagram");
                stats.discarded += 1;
                return;
            }
        };

        let Some(id) = self.core.sessions.resolve(from) else {
            self.core.handle_connectionless(from, header, body, stats);
            return;
        };

        if !self.core.sessions.accept_sequence(id, header.sequence, self.core.now) {
            debug!(session = %id, sequence = header.sequence, "Duplicate or out-of-order datagram");
            stats.discarded += 1;
            return;
        }
        if let Some(session) = self.core.sessions.get_mut(id) {
            session.outgoing.acknowledge(header.reliable_ack);
        }

        let report = self.dispatcher.decode_and_dispatch(&mut self.core, id, body);
        stats.handled += report.handled;
        stats.discarded += report.discarded;
    }

    pub fn begin_frame(&mut self) -> Result<(), TransmitError> {
        self.core.transmitter.begin_frame()
    }

    pub fn record_object_state(&mut self, id: ObjectId, state: ObjectState) -> Result<(), TransmitError> {
        self.core.transmitter.record_object_state(id, state)
    }

    pub fn record_field(&mut self, id: ObjectId, index: u8, value: FieldValue) -> Result<(), TransmitError> {
        self.core.transmitter.record_field(id, index, value)
    }

    /// Closes the frame and queues a snapshot for every spawned client.
    /// Returns the number of snapshots queued.
    pub fn end_frame(&mut self) -> Result<usize, TransmitError> {
        let snapshots = self.core.transmitter.end_frame()?;
        let mut queued = 0;
        for snapshot in snapshots {
            match self.core.mappings.enqueue(
                &mut self.core.sessions,
                snapshot.session,
                ServerMessageType::Snapshot,
                snapshot.payload,
            ) {
                Ok(_) => queued += 1,
                Err(e) => warn!(session = %snapshot.session, error = %e, "Failed to queue snapshot"),
            }
        }
        Ok(queued)
    }

    /// Replicates string list changes, then flushes every client queue.
    pub fn flush_all(&mut self, now: Instant) {
        self.core.now = now;
        self.core.flush_all();
    }

    /// Drops a client: the disconnect notice is flushed before the session
    /// is removed.
    pub fn drop_client(&mut self, id: SessionId, reason: &str) -> Result<ClientSession, SessionError> {
        self.core.drop_client(id, reason)
    }

    /// Drops every client.
    pub fn shutdown(&mut self, reason: &str) {
        let ids: Vec<SessionId> = self.core.sessions.iter().map(|s| s.id).collect();
        for id in ids {
            if let Err(e) = self.core.drop_client(id, reason) {
                warn!(session = %id, error = %e, "Failed to drop client");
            }
        }
    }

    /// One tick: console, receive, replicate `objects`, send.
    ///
    /// Replication faults are logged; queues are flushed regardless. Only a
    /// socket receive failure is returned.
    pub fn step(&mut self, now: Instant, objects: &ObjectTable) -> anyhow::Result<PollStats> {
        self.process_console_commands();
        let stats = self.poll(now)?;
        if self.core.state == ServerState::Running {
            if let Err(e) = self.replicate(objects) {
                warn!(tick = self.tick, error = %e, "Frame not replicated");
            }
        }
        self.flush_all(now);
        self.tick += 1;
        Ok(stats)
    }

    fn replicate(&mut self, objects: &ObjectTable) -> Result<usize, TransmitError> {
        self.begin_frame()?;
        for (id, state) in objects {
            if let Err(e) = self.record_object_state(*id, state.clone()) {
                warn!(object = id.0, error = %e, "Object not replicated");
            }
        }
        self.end_frame()
    }

    fn process_console_commands(&mut self) {
        let lines: Vec<String> = if let Some(ref mut rx) = self.console_rx {
            let mut collected = Vec::new();
            while let Ok(line) = rx.try_recv() {
                collected.push(line);
            }
            collected
        } else {
            Vec::new()
        };

        for line in lines {
            match self.exec_console(&line) {
                Ok(out) => {
                    for l in out {
                        println!("{l}");
                    }
                }
                Err(e) => warn!(command = %line, error = %e, "Console command failed"),
            }
        }
    }

    /// Executes a console command.
    pub fn exec_console(&mut self, line: &str) -> anyhow::Result<Vec<String>> {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        let Some(&command) = tokens.first() else {
            return Ok(Vec::new());
        };

        match command {
            "status" => {
                let mut out = vec![
                    format!("Server state: {:?}", self.core.state),
                    format!("Tick: {}", self.tick),
                ];
                if let Some(map) = &self.core.map_name {
                    out.push(format!("Map: {map}"));
                }
                out.push(format!(
                    "Clients: {}/{}",
                    self.core.sessions.len(),
                    self.core.sessions.max_clients()
                ));
                for s in self.core.sessions.iter() {
                    out.push(format!(
                        "  #{} \"{}\" {} {:?} in_flight={}",
                        s.user_id,
                        s.name,
                        s.endpoint,
                        s.state,
                        s.outgoing().in_flight()
                    ));
                }
                Ok(out)
            }
            "kick" => {
                let Some(user_id) = tokens.get(1).and_then(|t| t.trim_start_matches('#').parse::<u32>().ok()) else {
                    return Ok(vec!["Usage: kick <userid> [reason]".to_string()]);
                };
                let Some(id) = self.core.sessions.by_user_id(user_id) else {
                    return Ok(vec![format!("No client with user id {user_id}")]);
                };
                let reason = if tokens.len() > 2 {
                    tokens[2..].join(" ")
                } else {
                    "Kicked by console".to_string()
                };
                let session = self.core.drop_client(id, &reason)?;
                Ok(vec![format!("Kicked {} ({reason})", session.name)])
            }
            "map" => {
                let Some(name) = tokens.get(1) else {
                    return Ok(vec!["Usage: map <mapname>".to_string()]);
                };
                // A map change keeps the list names, emptied.
                let names: Vec<String> = self
                    .core
                    .string_lists
                    .iter()
                    .map(|(_, l)| l.name().to_string())
                    .collect();
                self.start_map(name, |lists| {
                    for n in &names {
                        lists.create_list(n)?;
                    }
                    Ok(())
                })?;
                Ok(vec![format!("Map '{name}' started")])
            }
            "quit" | "exit" => {
                info!("Server shutting down");
                self.shutdown("Server shutting down");
                self.quit_requested = true;
                Ok(vec!["Shutting down".to_string()])
            }
            other => Ok(vec![format!("Unknown command '{other}'")]),
        }
    }
}

/// Helper for tests: binds to an ephemeral localhost port.
pub async fn bind_ephemeral(
    mut cfg: EngineConfig,
    descriptors: Arc<BinaryDataDescriptorSet>,
) -> anyhow::Result<(TransportServer, EngineConfig)> {
    cfg.ip = IpAddr::V4(Ipv4Addr::LOCALHOST).to_string();
    cfg.hostport = 0;
    cfg.defport = 0;
    let server = TransportServer::bind(cfg.clone(), descriptors).await?;
    cfg.hostport = server.local_addr()?.port();
    Ok((server, cfg))
}
