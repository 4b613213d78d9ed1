//! Protocol messages.
//!
//! Goals:
//! - Two statically known tag sets, one per direction.
//! - Every payload has an expected length checked before decoding.
//! - Serialization is explicit (see [`crate::wire`]) and versionable.

use bytes::{BufMut, Bytes, BytesMut};

use crate::{
    binary_data::{BinaryDataDescriptor, DescriptorId, FieldDescriptor, FieldKind},
    wire::{self, PayloadLen, WireError},
};

/// Protocol version for compatibility checks.
pub const PROTOCOL_VERSION: u32 = 2;

/// Application identifier every connecting peer must present.
pub const APP_IDENTIFIER: &str = "PlatinumSource";

/// Client -> server message tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum ClientMessageType {
    Connect = 1,
    DescriptorAck = 2,
    Spawn = 3,
    FrameAck = 4,
    Disconnect = 5,
    Heartbeat = 6,
}

impl ClientMessageType {
    pub const ALL: [ClientMessageType; 6] = [
        ClientMessageType::Connect,
        ClientMessageType::DescriptorAck,
        ClientMessageType::Spawn,
        ClientMessageType::FrameAck,
        ClientMessageType::Disconnect,
        ClientMessageType::Heartbeat,
    ];

    pub fn from_u8(tag: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|t| *t as u8 == tag)
    }

    /// Payload length the schema allows.
    pub fn expected_len(self) -> PayloadLen {
        match self {
            // protocol + two empty strings
            ClientMessageType::Connect => PayloadLen::AtLeast(8),
            ClientMessageType::DescriptorAck => PayloadLen::AtLeast(2),
            ClientMessageType::Spawn => PayloadLen::Exact(0),
            ClientMessageType::FrameAck => PayloadLen::Exact(4),
            ClientMessageType::Disconnect => PayloadLen::AtLeast(2),
            ClientMessageType::Heartbeat => PayloadLen::Exact(0),
        }
    }
}

/// Server -> client message tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum ServerMessageType {
    Accept = 1,
    Reject = 2,
    DescriptorList = 3,
    StringListFull = 4,
    StringListAppend = 5,
    Snapshot = 6,
    Disconnect = 7,
    NewMap = 8,
}

impl ServerMessageType {
    pub const ALL: [ServerMessageType; 8] = [
        ServerMessageType::Accept,
        ServerMessageType::Reject,
        ServerMessageType::DescriptorList,
        ServerMessageType::StringListFull,
        ServerMessageType::StringListAppend,
        ServerMessageType::Snapshot,
        ServerMessageType::Disconnect,
        ServerMessageType::NewMap,
    ];

    pub fn from_u8(tag: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|t| *t as u8 == tag)
    }

    pub fn expected_len(self) -> PayloadLen {
        match self {
            ServerMessageType::Accept => PayloadLen::Exact(4),
            ServerMessageType::Reject => PayloadLen::AtLeast(2),
            ServerMessageType::DescriptorList => PayloadLen::AtLeast(2),
            ServerMessageType::StringListFull => PayloadLen::AtLeast(12),
            ServerMessageType::StringListAppend => PayloadLen::AtLeast(8),
            ServerMessageType::Snapshot => PayloadLen::AtLeast(10),
            ServerMessageType::Disconnect => PayloadLen::AtLeast(2),
            ServerMessageType::NewMap => PayloadLen::AtLeast(2),
        }
    }
}

/// Decoded client -> server message.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    Connect {
        protocol: u32,
        app_id: String,
        name: String,
    },
    /// The client's own descriptor list, answering `DescriptorList`.
    DescriptorAck(Vec<BinaryDataDescriptor>),
    /// Client finished loading and wants snapshots.
    Spawn,
    FrameAck {
        frame: u32,
    },
    Disconnect {
        reason: String,
    },
    Heartbeat,
}

impl ClientMessage {
    pub fn message_type(&self) -> ClientMessageType {
        match self {
            ClientMessage::Connect { .. } => ClientMessageType::Connect,
            ClientMessage::DescriptorAck(_) => ClientMessageType::DescriptorAck,
            ClientMessage::Spawn => ClientMessageType::Spawn,
            ClientMessage::FrameAck { .. } => ClientMessageType::FrameAck,
            ClientMessage::Disconnect { .. } => ClientMessageType::Disconnect,
            ClientMessage::Heartbeat => ClientMessageType::Heartbeat,
        }
    }

    pub fn encode(&self) -> Result<Bytes, WireError> {
        let mut buf = BytesMut::new();
        match self {
            ClientMessage::Connect {
                protocol,
                app_id,
                name,
            } => {
                buf.put_u32(*protocol);
                wire::put_str(&mut buf, app_id)?;
                wire::put_str(&mut buf, name)?;
            }
            ClientMessage::DescriptorAck(list) => encode_descriptors(&mut buf, list)?,
            ClientMessage::Spawn | ClientMessage::Heartbeat => {}
            ClientMessage::FrameAck { frame } => buf.put_u32(*frame),
            ClientMessage::Disconnect { reason } => wire::put_str(&mut buf, reason)?,
        }
        wire::check_payload_len(buf.len())?;
        Ok(buf.freeze())
    }

    /// Decodes a payload whose length was already checked against
    /// [`ClientMessageType::expected_len`].
    pub fn decode(ty: ClientMessageType, payload: &[u8]) -> Result<Self, WireError> {
        let mut buf = payload;
        let msg = match ty {
            ClientMessageType::Connect => ClientMessage::Connect {
                protocol: wire::read_u32(&mut buf)?,
                app_id: wire::read_str(&mut buf)?,
                name: wire::read_str(&mut buf)?,
            },
            ClientMessageType::DescriptorAck => {
                ClientMessage::DescriptorAck(decode_descriptors(&mut buf)?)
            }
            ClientMessageType::Spawn => ClientMessage::Spawn,
            ClientMessageType::FrameAck => ClientMessage::FrameAck {
                frame: wire::read_u32(&mut buf)?,
            },
            ClientMessageType::Disconnect => ClientMessage::Disconnect {
                reason: wire::read_str(&mut buf)?,
            },
            ClientMessageType::Heartbeat => ClientMessage::Heartbeat,
        };
        wire::finish(buf)?;
        Ok(msg)
    }
}

/// Decoded server -> client message.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage {
    Accept {
        user_id: u32,
    },
    /// Connectionless refusal; no session exists.
    Reject {
        reason: String,
    },
    DescriptorList(Vec<BinaryDataDescriptor>),
    /// Full transfer (or one chunk of it) of a string list.
    /// `first_index == 0` starts the list over.
    StringListFull {
        list: u16,
        name: String,
        first_index: u32,
        values: Vec<String>,
    },
    StringListAppend {
        list: u16,
        index: u32,
        value: String,
    },
    /// Encoded [`crate::snapshot::SnapshotDelta`]; decoding needs the
    /// descriptor set.
    Snapshot(Bytes),
    Disconnect {
        reason: String,
    },
    NewMap {
        name: String,
    },
}

impl ServerMessage {
    pub fn message_type(&self) -> ServerMessageType {
        match self {
            ServerMessage::Accept { .. } => ServerMessageType::Accept,
            ServerMessage::Reject { .. } => ServerMessageType::Reject,
            ServerMessage::DescriptorList(_) => ServerMessageType::DescriptorList,
            ServerMessage::StringListFull { .. } => ServerMessageType::StringListFull,
            ServerMessage::StringListAppend { .. } => ServerMessageType::StringListAppend,
            ServerMessage::Snapshot(_) => ServerMessageType::Snapshot,
            ServerMessage::Disconnect { .. } => ServerMessageType::Disconnect,
            ServerMessage::NewMap { .. } => ServerMessageType::NewMap,
        }
    }

    pub fn encode(&self) -> Result<Bytes, WireError> {
        let mut buf = BytesMut::new();
        match self {
            ServerMessage::Accept { user_id } => buf.put_u32(*user_id),
            ServerMessage::Reject { reason } | ServerMessage::Disconnect { reason } => {
                wire::put_str(&mut buf, reason)?
            }
            ServerMessage::DescriptorList(list) => encode_descriptors(&mut buf, list)?,
            ServerMessage::StringListFull {
                list,
                name,
                first_index,
                values,
            } => {
                buf.put_u16(*list);
                wire::put_str(&mut buf, name)?;
                buf.put_u32(*first_index);
                buf.put_u32(values.len() as u32);
                for v in values {
                    wire::put_str(&mut buf, v)?;
                }
            }
            ServerMessage::StringListAppend { list, index, value } => {
                buf.put_u16(*list);
                buf.put_u32(*index);
                wire::put_str(&mut buf, value)?;
            }
            ServerMessage::Snapshot(payload) => {
                wire::check_payload_len(payload.len())?;
                return Ok(payload.clone());
            }
            ServerMessage::NewMap { name } => wire::put_str(&mut buf, name)?,
        }
        wire::check_payload_len(buf.len())?;
        Ok(buf.freeze())
    }

    pub fn decode(ty: ServerMessageType, payload: &[u8]) -> Result<Self, WireError> {
        if !ty.expected_len().accepts(payload.len()) {
            return Err(WireError::BadLength {
                tag: ty as u8,
                expected: ty.expected_len(),
                actual: payload.len(),
            });
        }
        let mut buf = payload;
        let msg = match ty {
            ServerMessageType::Accept => ServerMessage::Accept {
                user_id: wire::read_u32(&mut buf)?,
            },
            ServerMessageType::Reject => ServerMessage::Reject {
                reason: wire::read_str(&mut buf)?,
            },
            ServerMessageType::DescriptorList => {
                ServerMessage::DescriptorList(decode_descriptors(&mut buf)?)
            }
            ServerMessageType::StringListFull => {
                let list = wire::read_u16(&mut buf)?;
                let name = wire::read_str(&mut buf)?;
                let first_index = wire::read_u32(&mut buf)?;
                let count = wire::read_u32(&mut buf)? as usize;
                // Each entry is at least its 2-byte length prefix.
                if count > buf.len() / 2 {
                    return Err(WireError::Truncated {
                        needed: count * 2,
                        remaining: buf.len(),
                    });
                }
                let values = (0..count)
                    .map(|_| wire::read_str(&mut buf))
                    .collect::<Result<Vec<_>, _>>()?;
                ServerMessage::StringListFull {
                    list,
                    name,
                    first_index,
                    values,
                }
            }
            ServerMessageType::StringListAppend => ServerMessage::StringListAppend {
                list: wire::read_u16(&mut buf)?,
                index: wire::read_u32(&mut buf)?,
                value: wire::read_str(&mut buf)?,
            },
            ServerMessageType::Snapshot => {
                let msg = ServerMessage::Snapshot(Bytes::copy_from_slice(buf));
                buf = &[];
                msg
            }
            ServerMessageType::Disconnect => ServerMessage::Disconnect {
                reason: wire::read_str(&mut buf)?,
            },
            ServerMessageType::NewMap => ServerMessage::NewMap {
                name: wire::read_str(&mut buf)?,
            },
        };
        wire::finish(buf)?;
        Ok(msg)
    }
}

/// `[count u16] { [name str][field_count u8] { [name str][kind u8] } }`
pub fn encode_descriptors(
    buf: &mut BytesMut,
    list: &[BinaryDataDescriptor],
) -> Result<(), WireError> {
    buf.put_u16(list.len() as u16);
    for d in list {
        wire::put_str(buf, &d.name)?;
        buf.put_u8(d.fields.len() as u8);
        for f in &d.fields {
            wire::put_str(buf, &f.name)?;
            buf.put_u8(f.kind as u8);
        }
    }
    Ok(())
}

pub fn decode_descriptors(buf: &mut &[u8]) -> Result<Vec<BinaryDataDescriptor>, WireError> {
    let count = wire::read_u16(buf)?;
    let mut list = Vec::new();
    for id in 0..count {
        let name = wire::read_str(buf)?;
        let field_count = wire::read_u8(buf)?;
        let mut fields = Vec::with_capacity(field_count as usize);
        for _ in 0..field_count {
            let field_name = wire::read_str(buf)?;
            let raw = wire::read_u8(buf)?;
            let kind = FieldKind::from_u8(raw).ok_or(WireError::InvalidValue {
                what: "field kind",
                value: u32::from(raw),
            })?;
            fields.push(FieldDescriptor {
                name: field_name,
                kind,
            });
        }
        list.push(BinaryDataDescriptor {
            id: DescriptorId(id),
            name,
            fields,
        });
    }
    Ok(list)
}
