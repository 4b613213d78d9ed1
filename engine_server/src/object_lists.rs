//! Per-client delta snapshots.
//!
//! Every frame the game records the authoritative state of each replicated
//! object. At the end of the frame the transmitter diffs it against each
//! spawned client's last acknowledged frame and hands back one encoded
//! snapshot per client.
//!
//! Frames are kept in a bounded history of shared tables. The history starts
//! at the oldest baseline a client could still acknowledge and never holds
//! more than `max_lag + 1` frames; a client whose baseline fell out of it is
//! resynchronised with a full snapshot.

use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
};

use bytes::Bytes;
use engine_shared::{
    binary_data::{BinaryDataDescriptorSet, DescriptorError, FieldValue},
    snapshot::{ObjectId, ObjectState, ObjectTable, SnapshotDelta, SnapshotError},
    wire,
};
use tracing::{debug, warn};

use crate::sessions::SessionId;

#[derive(Debug, thiserror::Error)]
pub enum TransmitError {
    #[error("a frame is already in progress")]
    FrameInProgress,
    #[error("no frame in progress")]
    NoFrameInProgress,
    #[error("object {0:?} was not recorded this frame")]
    UnknownObject(ObjectId),
    #[error("object {id:?}: {source}")]
    InvalidState {
        id: ObjectId,
        #[source]
        source: DescriptorError,
    },
    #[error("snapshot of {0} bytes does not fit in a message")]
    SnapshotTooLarge(usize),
    #[error(transparent)]
    Snapshot(#[from] SnapshotError),
}

/// Encoded snapshot for one client.
#[derive(Debug, Clone)]
pub struct OutgoingSnapshot {
    pub session: SessionId,
    pub frame: u32,
    /// `None` for a full snapshot.
    pub baseline: Option<u32>,
    pub payload: Bytes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    /// The client's baseline moved to the acknowledged frame.
    Advanced,
    /// Same frame as the current baseline.
    Duplicate,
    /// Older than the current baseline.
    Stale,
    /// Frame not sent yet, or already evicted from history.
    Unavailable,
    /// Session is not receiving snapshots.
    UnknownClient,
}

#[derive(Debug, Clone, Copy)]
struct ClientBaseline {
    session: SessionId,
    acked: Option<u32>,
    /// First full snapshot frame of the current (re)synchronisation.
    first_sent: Option<u32>,
}

impl ClientBaseline {
    /// Oldest frame this client may still acknowledge usefully.
    fn floor(&self) -> Option<u32> {
        self.acked.or(self.first_sent)
    }
}

pub struct ObjectListTransmitter {
    descriptors: Arc<BinaryDataDescriptorSet>,
    max_lag: u32,
    last_frame: u32,
    pending: Option<ObjectTable>,
    history: VecDeque<(u32, Arc<ObjectTable>)>,
    clients: Vec<Option<ClientBaseline>>,
}

impl ObjectListTransmitter {
    pub fn new(descriptors: Arc<BinaryDataDescriptorSet>, max_lag: u32) -> Self {
        Self {
            descriptors,
            max_lag: max_lag.max(1),
            last_frame: 0,
            pending: None,
            history: VecDeque::new(),
            clients: Vec::new(),
        }
    }

    /// Starts receiving snapshots for `session`, beginning with a full one.
    pub fn add_client(&mut self, session: SessionId) {
        let index = session.index();
        if self.clients.len() <= index {
            self.clients.resize(index + 1, None);
        }
        self.clients[index] = Some(ClientBaseline {
            session,
            acked: None,
            first_sent: None,
        });
    }

    pub fn remove_client(&mut self, session: SessionId) {
        if let Some(slot) = self.clients.get_mut(session.index()) {
            if slot.is_some_and(|c| c.session == session) {
                *slot = None;
            }
        }
    }

    pub fn has_client(&self, session: SessionId) -> bool {
        self.client(session).is_some()
    }

    /// Last frame acknowledged by `session`.
    pub fn acknowledged(&self, session: SessionId) -> Option<u32> {
        self.client(session).and_then(|c| c.acked)
    }

    /// Number of the most recently completed frame (0 before the first).
    pub fn last_frame(&self) -> u32 {
        self.last_frame
    }

    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    pub fn in_frame(&self) -> bool {
        self.pending.is_some()
    }

    pub fn begin_frame(&mut self) -> Result<(), TransmitError> {
        if self.pending.is_some() {
            return Err(TransmitError::FrameInProgress);
        }
        self.pending = Some(ObjectTable::new());
        Ok(())
    }

    /// Records the whole state of one object; a later write in the same
    /// frame replaces it.
    pub fn record_object_state(&mut self, id: ObjectId, state: ObjectState) -> Result<(), TransmitError> {
        let table = self.pending.as_mut().ok_or(TransmitError::NoFrameInProgress)?;
        self.descriptors
            .get(state.type_id)
            .and_then(|d| d.validate(&state.fields))
            .map_err(|source| TransmitError::InvalidState { id, source })?;
        table.insert(id, state);
        Ok(())
    }

    /// Overwrites one field of an object recorded earlier in this frame.
    pub fn record_field(&mut self, id: ObjectId, index: u8, value: FieldValue) -> Result<(), TransmitError> {
        let table = self.pending.as_mut().ok_or(TransmitError::NoFrameInProgress)?;
        let state = table.get_mut(&id).ok_or(TransmitError::UnknownObject(id))?;
        self.descriptors
            .get(state.type_id)
            .and_then(|d| d.check_field(index, &value))
            .map_err(|source| TransmitError::InvalidState { id, source })?;
        if let Some(slot) = state.fields.get_mut(index as usize) {
            *slot = value;
        }
        Ok(())
    }

    /// Closes the frame and encodes a snapshot for every client.
    ///
    /// Clients sharing a baseline share one encoded payload. A client whose
    /// snapshot cannot be encoded gets none this frame; the frame itself is
    /// always recorded.
    pub fn end_frame(&mut self) -> Result<Vec<OutgoingSnapshot>, TransmitError> {
        let table = self.pending.take().ok_or(TransmitError::NoFrameInProgress)?;
        let current = Arc::new(table);
        self.last_frame += 1;
        let frame = self.last_frame;

        let mut encoded: HashMap<Option<u32>, Option<Bytes>> = HashMap::new();
        let mut out = Vec::new();

        for slot in self.clients.iter_mut() {
            let Some(client) = slot.as_mut() else {
                continue;
            };
            let baseline = client
                .acked
                .filter(|acked| frame - acked <= self.max_lag)
                .and_then(|acked| {
                    self.history
                        .iter()
                        .find(|(f, _)| *f == acked)
                        .map(|(f, t)| (*f, t.clone()))
                });
            let key = baseline.as_ref().map(|(f, _)| *f);
            if baseline.is_none() {
                let stale_first = client
                    .first_sent
                    .map_or(true, |first| frame - first > self.max_lag);
                if client.acked.is_some() || stale_first {
                    if client.acked.is_some() {
                        debug!(session = %client.session, frame, "Client too far behind, sending full snapshot");
                    }
                    client.first_sent = Some(frame);
                }
                client.acked = None;
            }

            let payload = encoded
                .entry(key)
                .or_insert_with(|| {
                    let delta = SnapshotDelta::compute(
                        frame,
                        baseline.as_ref().map(|(f, t)| (*f, t.as_ref())),
                        &current,
                    );
                    match encode_snapshot(&delta, &self.descriptors) {
                        Ok(payload) => Some(payload),
                        Err(e) => {
                            warn!(frame, baseline = ?key, error = %e, "Snapshot not sent");
                            None
                        }
                    }
                })
                .clone();
            let Some(payload) = payload else {
                continue;
            };
            out.push(OutgoingSnapshot {
                session: client.session,
                frame,
                baseline: key,
                payload,
            });
        }

        self.history.push_back((frame, current));
        self.trim_history();
        Ok(out)
    }

    /// Moves a client's baseline to `frame`. Duplicate, stale and unknown
    /// frames leave it untouched.
    pub fn acknowledge(&mut self, session: SessionId, frame: u32) -> AckOutcome {
        let in_history = self.history.iter().any(|(f, _)| *f == frame);
        let Some(client) = self
            .clients
            .get_mut(session.index())
            .and_then(|s| s.as_mut())
            .filter(|c| c.session == session)
        else {
            return AckOutcome::UnknownClient;
        };

        match client.acked {
            Some(acked) if frame == acked => return AckOutcome::Duplicate,
            Some(acked) if frame < acked => return AckOutcome::Stale,
            _ => {}
        }
        if !in_history || client.first_sent.map_or(true, |first| frame < first) {
            return AckOutcome::Unavailable;
        }
        client.acked = Some(frame);
        self.trim_history();
        AckOutcome::Advanced
    }

    /// Forgets every frame. All clients get a full snapshot next.
    pub fn reset(&mut self) {
        self.pending = None;
        self.history.clear();
        for client in self.clients.iter_mut().flatten() {
            client.acked = None;
            client.first_sent = None;
        }
    }

    fn client(&self, session: SessionId) -> Option<&ClientBaseline> {
        self.clients
            .get(session.index())
            .and_then(|s| s.as_ref())
            .filter(|c| c.session == session)
    }

    fn trim_history(&mut self) {
        let floor = self
            .clients
            .iter()
            .flatten()
            .filter_map(|c| c.floor())
            .min()
            .unwrap_or(self.last_frame);
        let max_len = self.max_lag as usize + 1;
        while let Some((f, _)) = self.history.front() {
            if *f < floor || self.history.len() > max_len {
                self.history.pop_front();
            } else {
                break;
            }
        }
    }

    fn frame_table(&self, frame: u32) -> Option<&Arc<ObjectTable>> {
        self.history.iter().find(|(f, _)| *f == frame).map(|(_, t)| t)
    }

    /// State of `id` in a retained frame.
    pub fn object_at(&self, frame: u32, id: ObjectId) -> Option<&ObjectState> {
        self.frame_table(frame).and_then(|t| t.get(&id))
    }
}

fn encode_snapshot(delta: &SnapshotDelta, descriptors: &BinaryDataDescriptorSet) -> Result<Bytes, TransmitError> {
    let payload = delta.encode(descriptors)?;
    if payload.len() > wire::MAX_PAYLOAD_LEN {
        return Err(TransmitError::SnapshotTooLarge(payload.len()));
    }
    Ok(payload)
}
