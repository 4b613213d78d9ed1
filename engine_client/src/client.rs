//! Client implementation.
//!
//! The client maintains:
//! - The handshake (connect, descriptor negotiation, spawn), retried until
//!   the server answers
//! - In-order delivery of reliable server messages, acknowledged in every
//!   outgoing packet header
//! - A mirror of the server's string lists
//! - Snapshot baselines, so deltas can be applied and acknowledged

use std::{
    collections::VecDeque,
    io,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::Arc,
    time::{Duration, Instant},
};

use anyhow::Context;
use bytes::BytesMut;
use engine_shared::{
    binary_data::BinaryDataDescriptorSet,
    net::{ClientMessage, ServerMessage, ServerMessageType, APP_IDENTIFIER, PROTOCOL_VERSION},
    snapshot::{ObjectTable, SnapshotDelta},
    transport::DatagramSocket,
    wire::{self, Frames, PacketHeader, MAX_PACKET_SIZE},
};
use tokio::net::UdpSocket;
use tracing::{debug, info, warn};

use crate::baselines::BaselineHistory;

/// Handshake messages are repeated this often until answered.
const RETRY_INTERVAL: Duration = Duration::from_millis(250);
/// An empty heartbeat goes out when nothing else has for this long.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);
/// Acknowledged frames kept as delta baselines.
const BASELINE_HISTORY: usize = 64;

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    /// Not connected, or dropped by the server.
    Disconnected,
    /// Waiting for the server to accept.
    Connecting,
    /// Accepted; descriptor negotiation in progress.
    Negotiating,
    /// Map and string lists received.
    Connected,
    /// Spawn requested, waiting for the first snapshot.
    Spawning,
    /// Receiving snapshots.
    Spawned,
}

/// Something the server told the client, in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    Accepted { user_id: u32 },
    Rejected { reason: String },
    NewMap { name: String },
    StringListChanged { list: u16 },
    Snapshot { frame: u32, baseline: Option<u32> },
    Disconnected { reason: String },
}

#[derive(Debug, Clone, Default)]
struct MirroredList {
    name: String,
    values: Vec<String>,
}

/// Game client peer.
pub struct GameClient {
    socket: Box<dyn DatagramSocket>,
    server: SocketAddr,
    name: String,
    descriptors: Arc<BinaryDataDescriptorSet>,

    state: ClientState,
    user_id: Option<u32>,
    map_name: Option<String>,

    sequence: u32,
    /// Highest reliable id processed; every earlier one was processed too.
    reliable_ack: u32,
    ack_pending: bool,
    outbox: VecDeque<ClientMessage>,
    last_sent: Option<Instant>,
    last_retry: Option<Instant>,

    string_lists: Vec<MirroredList>,
    baselines: BaselineHistory,
    objects: ObjectTable,
    latest_frame: u32,

    events: Vec<ClientEvent>,
}

impl GameClient {
    /// Binds a UDP socket and starts connecting to `server`.
    ///
    /// Returns at once; [`poll`](Self::poll) drives the handshake.
    pub async fn connect(
        server: SocketAddr,
        name: &str,
        descriptors: Arc<BinaryDataDescriptorSet>,
    ) -> anyhow::Result<Self> {
        let bind_ip = if server.ip().is_loopback() {
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        } else {
            IpAddr::V4(Ipv4Addr::UNSPECIFIED)
        };
        let socket = UdpSocket::bind(SocketAddr::new(bind_ip, 0))
            .await
            .context("udp bind")?;
        info!(%server, name, local = %socket.local_addr()?, "Connecting to server");
        Ok(Self::with_socket(Box::new(socket), server, name, descriptors))
    }

    pub fn with_socket(
        socket: Box<dyn DatagramSocket>,
        server: SocketAddr,
        name: &str,
        descriptors: Arc<BinaryDataDescriptorSet>,
    ) -> Self {
        let mut client = Self {
            socket,
            server,
            name: name.to_string(),
            descriptors,
            state: ClientState::Connecting,
            user_id: None,
            map_name: None,
            sequence: 0,
            reliable_ack: 0,
            ack_pending: false,
            outbox: VecDeque::new(),
            last_sent: None,
            last_retry: None,
            string_lists: Vec::new(),
            baselines: BaselineHistory::new(BASELINE_HISTORY),
            objects: ObjectTable::new(),
            latest_frame: 0,
            events: Vec::new(),
        };
        client.outbox.push_back(client.connect_message());
        client
    }

    pub fn state(&self) -> ClientState {
        self.state
    }

    pub fn user_id(&self) -> Option<u32> {
        self.user_id
    }

    pub fn map_name(&self) -> Option<&str> {
        self.map_name.as_deref()
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        self.socket.local_addr().context("local_addr")
    }

    /// Values of the named string list, as replicated so far.
    pub fn string_list(&self, name: &str) -> Option<&[String]> {
        self.string_lists
            .iter()
            .find(|l| l.name == name)
            .map(|l| l.values.as_slice())
    }

    /// Object states of the newest applied snapshot.
    pub fn objects(&self) -> &ObjectTable {
        &self.objects
    }

    pub fn latest_frame(&self) -> u32 {
        self.latest_frame
    }

    pub fn events(&self) -> &[ClientEvent] {
        &self.events
    }

    pub fn take_events(&mut self) -> Vec<ClientEvent> {
        std::mem::take(&mut self.events)
    }

    /// Asks for snapshots. Only valid once the map is known.
    pub fn spawn(&mut self) -> anyhow::Result<()> {
        anyhow::ensure!(
            self.state == ClientState::Connected,
            "cannot spawn in state {:?}",
            self.state
        );
        self.state = ClientState::Spawning;
        self.outbox.push_back(ClientMessage::Spawn);
        self.last_retry = None;
        Ok(())
    }

    /// Tells the server we are leaving and stops talking to it.
    pub fn disconnect(&mut self, reason: &str, now: Instant) -> anyhow::Result<()> {
        if self.state == ClientState::Disconnected {
            return Ok(());
        }
        self.outbox.clear();
        self.outbox.push_back(ClientMessage::Disconnect {
            reason: reason.to_string(),
        });
        self.send_outbox(now)?;
        self.state = ClientState::Disconnected;
        info!(reason, "Disconnected from server");
        Ok(())
    }

    /// Receives everything pending, then sends what is due.
    ///
    /// Returns the number of datagrams received.
    pub fn poll(&mut self, now: Instant) -> anyhow::Result<usize> {
        let mut received = 0;
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            match self.socket.try_recv_from(&mut buf) {
                Ok((n, from)) => {
                    received += 1;
                    if from != self.server {
                        debug!(%from, "Ignoring datagram from unknown sender");
                        continue;
                    }
                    self.handle_datagram(&buf[..n]);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::ConnectionReset => continue,
                Err(e) => return Err(e).context("udp recv"),
            }
        }

        if self.state != ClientState::Disconnected {
            self.queue_retries(now);
            let heartbeat_due = self
                .last_sent
                .map_or(true, |t| now.saturating_duration_since(t) >= HEARTBEAT_INTERVAL);
            if self.outbox.is_empty() && (self.ack_pending || heartbeat_due) {
                self.outbox.push_back(ClientMessage::Heartbeat);
            }
            self.send_outbox(now)?;
        }
        Ok(received)
    }

    /// Polls every couple of milliseconds until `done` holds or `timeout`
    /// passes. Returns whether `done` held.
    pub async fn poll_until<F>(&mut self, timeout: Duration, mut done: F) -> anyhow::Result<bool>
    where
        F: FnMut(&GameClient) -> bool,
    {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            self.poll(Instant::now())?;
            if done(self) {
                return Ok(true);
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(false);
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    }

    fn connect_message(&self) -> ClientMessage {
        ClientMessage::Connect {
            protocol: PROTOCOL_VERSION,
            app_id: APP_IDENTIFIER.to_string(),
            name: self.name.clone(),
        }
    }

    /// Repeats the current handshake step while the server has not moved
    /// us forward.
    fn queue_retries(&mut self, now: Instant) {
        let due = self
            .last_retry
            .map_or(true, |t| now.saturating_duration_since(t) >= RETRY_INTERVAL);
        if !due {
            return;
        }
        let retry = match self.state {
            ClientState::Connecting => Some(self.connect_message()),
            ClientState::Negotiating => Some(ClientMessage::DescriptorAck(
                self.descriptors.descriptors().to_vec(),
            )),
            ClientState::Spawning => Some(ClientMessage::Spawn),
            _ => None,
        };
        if let Some(message) = retry {
            if self.last_retry.is_some() {
                debug!(state = ?self.state, "Retrying handshake step");
                self.outbox.push_back(message);
            }
            self.last_retry = Some(now);
        }
    }

    fn send_outbox(&mut self, now: Instant) -> anyhow::Result<()> {
        while !self.outbox.is_empty() {
            let mut packet = BytesMut::with_capacity(MAX_PACKET_SIZE);
            PacketHeader {
                sequence: self.sequence + 1,
                reliable_ack: self.reliable_ack,
            }
            .write(&mut packet);

            let mut taken = 0;
            for message in &self.outbox {
                let payload = message.encode().context("encode message")?;
                if taken > 0 && packet.len() + wire::frame_len(payload.len()) > MAX_PACKET_SIZE {
                    break;
                }
                wire::write_frame(&mut packet, message.message_type() as u8, 0, &payload)
                    .context("frame message")?;
                taken += 1;
            }

            match self.socket.try_send_to(&packet, self.server) {
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) => return Err(e).context("udp send"),
            }
            self.sequence += 1;
            self.outbox.drain(..taken);
            self.ack_pending = false;
            self.last_sent = Some(now);
        }
        Ok(())
    }

    fn handle_datagram(&mut self, datagram: &[u8]) {
        let (_, body) = match PacketHeader::read(datagram) {
            Ok(r) => r,
            Err(e) => {
                debug!(error = %e, "Malformed datagram");
                return;
            }
        };

        for frame in Frames::new(body) {
            let frame = match frame {
                Ok(f) => f,
                Err(e) => {
                    debug!(error = %e, "Malformed frame");
                    break;
                }
            };
            if frame.reliable_id != 0 {
                if frame.reliable_id != self.reliable_ack + 1 {
                    // Duplicate, or a gap the server will fill by resending.
                    self.ack_pending = true;
                    continue;
                }
                self.reliable_ack = frame.reliable_id;
                self.ack_pending = true;
            }

            let Some(ty) = ServerMessageType::from_u8(frame.tag) else {
                debug!(tag = frame.tag, "Unknown message tag");
                continue;
            };
            match ServerMessage::decode(ty, frame.payload) {
                Ok(message) => self.handle_message(message),
                Err(e) => debug!(message = ?ty, error = %e, "Could not decode message"),
            }
        }
    }

    fn handle_message(&mut self, message: ServerMessage) {
        match message {
            ServerMessage::Accept { user_id } => {
                if self.state == ClientState::Connecting {
                    info!(user_id, "Accepted by server");
                    self.user_id = Some(user_id);
                    self.state = ClientState::Negotiating;
                    self.events.push(ClientEvent::Accepted { user_id });
                }
            }
            ServerMessage::Reject { reason } => {
                if self.state == ClientState::Connecting {
                    warn!(%reason, "Connection rejected");
                    self.state = ClientState::Disconnected;
                    self.events.push(ClientEvent::Rejected { reason });
                }
            }
            ServerMessage::DescriptorList(remote) => {
                if let Err(mismatch) = self.descriptors.compare(&remote) {
                    warn!(%mismatch, "Server descriptors differ from ours");
                }
                self.outbox.push_back(ClientMessage::DescriptorAck(
                    self.descriptors.descriptors().to_vec(),
                ));
                self.last_retry = None;
            }
            ServerMessage::NewMap { name } => {
                info!(map = %name, "New map");
                self.string_lists.clear();
                self.baselines.clear();
                self.objects.clear();
                self.latest_frame = 0;
                self.map_name = Some(name.clone());
                if self.state == ClientState::Negotiating {
                    self.state = ClientState::Connected;
                }
                self.events.push(ClientEvent::NewMap { name });
            }
            ServerMessage::StringListFull {
                list,
                name,
                first_index,
                values,
            } => {
                let index = list as usize;
                if self.string_lists.len() <= index {
                    self.string_lists.resize_with(index + 1, MirroredList::default);
                }
                let mirror = &mut self.string_lists[index];
                if first_index == 0 {
                    *mirror = MirroredList { name, values };
                } else if first_index as usize == mirror.values.len() {
                    mirror.values.extend(values);
                } else {
                    warn!(list, first_index, have = mirror.values.len(), "String list chunk out of order");
                    return;
                }
                self.events.push(ClientEvent::StringListChanged { list });
            }
            ServerMessage::StringListAppend { list, index, value } => {
                match self.string_lists.get_mut(list as usize) {
                    Some(mirror) if mirror.values.len() == index as usize => {
                        mirror.values.push(value);
                        self.events.push(ClientEvent::StringListChanged { list });
                    }
                    _ => warn!(list, index, "String list append out of order"),
                }
            }
            ServerMessage::Snapshot(payload) => self.handle_snapshot(&payload),
            ServerMessage::Disconnect { reason } => {
                info!(%reason, "Server dropped us");
                self.state = ClientState::Disconnected;
                self.outbox.clear();
                self.events.push(ClientEvent::Disconnected { reason });
            }
        }
    }

    fn handle_snapshot(&mut self, payload: &[u8]) {
        let delta = match SnapshotDelta::decode(payload, &self.descriptors) {
            Ok(d) => d,
            Err(e) => {
                debug!(error = %e, "Bad snapshot");
                return;
            }
        };
        if delta.frame <= self.latest_frame {
            debug!(frame = delta.frame, latest = self.latest_frame, "Stale snapshot");
            return;
        }

        let empty = ObjectTable::new();
        let baseline = match delta.baseline {
            None => &empty,
            Some(frame) => match self.baselines.get(frame) {
                Some(table) => table,
                None => {
                    debug!(frame = delta.frame, baseline = frame, "Snapshot baseline not held");
                    return;
                }
            },
        };
        let table = match delta.apply(baseline) {
            Ok(t) => t,
            Err(e) => {
                warn!(frame = delta.frame, error = %e, "Snapshot did not apply");
                return;
            }
        };

        if self.state == ClientState::Spawning {
            info!(frame = delta.frame, "Spawned");
            self.state = ClientState::Spawned;
        }
        self.latest_frame = delta.frame;
        self.objects = table.clone();
        self.baselines.push(delta.frame, table);
        self.outbox.push_back(ClientMessage::FrameAck { frame: delta.frame });
        self.events.push(ClientEvent::Snapshot {
            frame: delta.frame,
            baseline: delta.baseline,
        });
    }
}
