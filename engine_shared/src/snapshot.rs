//! Object snapshots and field-granular deltas.
//!
//! A frame is an [`ObjectTable`]: the authoritative state of every replicated
//! object at one simulation step. A [`SnapshotDelta`] turns a baseline table
//! into the current one:
//! - objects absent from the baseline are sent whole (`CREATED`),
//! - objects present in both carry only the fields that changed,
//! - objects missing from the current table are flagged `DESTROYED`.
//!
//! A delta without a baseline is a full snapshot: every object is `CREATED`
//! and the receiver replaces its table.
//!
//! Payload layout:
//!
//! ```text
//! [frame u32][baseline u32, 0 = full][count u16]
//!   { [object u32][flags u8] created:   [type u16][all fields]
//!                            changed:   [type u16][n u8] { [index u8][value] }
//!                            destroyed: nothing }
//! ```

use std::collections::BTreeMap;

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::{
    binary_data::{BinaryDataDescriptorSet, DescriptorError, DescriptorId, FieldValue},
    wire::{self, WireError},
};

/// Replicated object id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectId(pub u32);

/// State of one object, fields aligned with its descriptor layout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectState {
    pub type_id: DescriptorId,
    pub fields: Vec<FieldValue>,
}

impl ObjectState {
    pub fn new(type_id: DescriptorId, fields: Vec<FieldValue>) -> Self {
        Self { type_id, fields }
    }
}

/// One frame's objects; `BTreeMap` keeps iteration (and encoding) stable.
pub type ObjectTable = BTreeMap<ObjectId, ObjectState>;

bitflags::bitflags! {
    /// Per-object delta flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ObjectFlags: u8 {
        const CREATED = 1 << 0;
        const DESTROYED = 1 << 1;
    }
}

/// Change to one object between two frames.
#[derive(Debug, Clone, PartialEq)]
pub enum ObjectDelta {
    Created {
        id: ObjectId,
        state: ObjectState,
    },
    Changed {
        id: ObjectId,
        type_id: DescriptorId,
        fields: Vec<(u8, FieldValue)>,
    },
    Destroyed {
        id: ObjectId,
    },
}

impl ObjectDelta {
    pub fn id(&self) -> ObjectId {
        match self {
            ObjectDelta::Created { id, .. }
            | ObjectDelta::Changed { id, .. }
            | ObjectDelta::Destroyed { id } => *id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SnapshotError {
    #[error(transparent)]
    Descriptor(#[from] DescriptorError),
    #[error("invalid object flags {0:#04x}")]
    InvalidFlags(u8),
    #[error("delta changes object {0:?} which is not in the baseline")]
    MissingObject(ObjectId),
    #[error("delta changes object {id:?} as {delta:?}, baseline has {baseline:?}")]
    TypeMismatch {
        id: ObjectId,
        delta: DescriptorId,
        baseline: DescriptorId,
    },
    #[error("field {index} out of range for object {id:?}")]
    FieldOutOfRange { id: ObjectId, index: u8 },
    #[error("too many objects in one snapshot: {0}")]
    TooManyObjects(usize),
}

impl From<WireError> for SnapshotError {
    fn from(e: WireError) -> Self {
        SnapshotError::Descriptor(DescriptorError::Wire(e))
    }
}

/// Delta from `baseline` (or nothing) to `frame`.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SnapshotDelta {
    pub frame: u32,
    pub baseline: Option<u32>,
    pub objects: Vec<ObjectDelta>,
}

impl SnapshotDelta {
    /// Computes the delta from `baseline` to `current`.
    pub fn compute(frame: u32, baseline: Option<(u32, &ObjectTable)>, current: &ObjectTable) -> Self {
        let mut objects = Vec::new();
        let base = baseline.map(|(_, table)| table);

        for (id, state) in current {
            match base.and_then(|b| b.get(id)) {
                Some(old) if old.type_id == state.type_id && old.fields.len() == state.fields.len() => {
                    let fields: Vec<(u8, FieldValue)> = old
                        .fields
                        .iter()
                        .zip(&state.fields)
                        .enumerate()
                        .filter(|(_, (a, b))| a != b)
                        .map(|(i, (_, b))| (i as u8, b.clone()))
                        .collect();
                    if !fields.is_empty() {
                        objects.push(ObjectDelta::Changed {
                            id: *id,
                            type_id: state.type_id,
                            fields,
                        });
                    }
                }
                _ => objects.push(ObjectDelta::Created {
                    id: *id,
                    state: state.clone(),
                }),
            }
        }

        if let Some(base) = base {
            for id in base.keys().filter(|id| !current.contains_key(id)) {
                objects.push(ObjectDelta::Destroyed { id: *id });
            }
        }

        Self {
            frame,
            baseline: baseline.map(|(frame, _)| frame),
            objects,
        }
    }

    pub fn is_full(&self) -> bool {
        self.baseline.is_none()
    }

    pub fn encode(&self, set: &BinaryDataDescriptorSet) -> Result<Bytes, SnapshotError> {
        let count = u16::try_from(self.objects.len())
            .map_err(|_| SnapshotError::TooManyObjects(self.objects.len()))?;
        let mut buf = BytesMut::new();
        buf.put_u32(self.frame);
        buf.put_u32(self.baseline.unwrap_or(0));
        buf.put_u16(count);

        for object in &self.objects {
            buf.put_u32(object.id().0);
            match object {
                ObjectDelta::Created { state, .. } => {
                    buf.put_u8(ObjectFlags::CREATED.bits());
                    buf.put_u16(state.type_id.0);
                    set.encode(state.type_id, &state.fields, &mut buf)?;
                }
                ObjectDelta::Changed {
                    type_id, fields, ..
                } => {
                    let descriptor = set.get(*type_id)?;
                    buf.put_u8(ObjectFlags::empty().bits());
                    buf.put_u16(type_id.0);
                    buf.put_u8(fields.len() as u8);
                    for (index, value) in fields {
                        buf.put_u8(*index);
                        descriptor.encode_field(*index, value, &mut buf)?;
                    }
                }
                ObjectDelta::Destroyed { .. } => buf.put_u8(ObjectFlags::DESTROYED.bits()),
            }
        }
        Ok(buf.freeze())
    }

    pub fn decode(payload: &[u8], set: &BinaryDataDescriptorSet) -> Result<Self, SnapshotError> {
        let mut buf = payload;
        let frame = wire::read_u32(&mut buf)?;
        let baseline = match wire::read_u32(&mut buf)? {
            0 => None,
            b => Some(b),
        };
        let count = wire::read_u16(&mut buf)?;
        let mut objects = Vec::with_capacity(count.min(1024) as usize);

        for _ in 0..count {
            let id = ObjectId(wire::read_u32(&mut buf)?);
            let raw = wire::read_u8(&mut buf)?;
            let flags = ObjectFlags::from_bits(raw).ok_or(SnapshotError::InvalidFlags(raw))?;

            if flags == ObjectFlags::DESTROYED {
                objects.push(ObjectDelta::Destroyed { id });
            } else if flags == ObjectFlags::CREATED {
                let type_id = DescriptorId(wire::read_u16(&mut buf)?);
                let fields = set.decode(type_id, &mut buf)?;
                objects.push(ObjectDelta::Created {
                    id,
                    state: ObjectState { type_id, fields },
                });
            } else if flags.is_empty() {
                let type_id = DescriptorId(wire::read_u16(&mut buf)?);
                let descriptor = set.get(type_id)?;
                let n = wire::read_u8(&mut buf)?;
                let mut fields = Vec::with_capacity(n as usize);
                for _ in 0..n {
                    let index = wire::read_u8(&mut buf)?;
                    fields.push((index, descriptor.decode_field(index, &mut buf)?));
                }
                objects.push(ObjectDelta::Changed {
                    id,
                    type_id,
                    fields,
                });
            } else {
                return Err(SnapshotError::InvalidFlags(raw));
            }
        }
        wire::finish(buf)?;

        Ok(Self {
            frame,
            baseline,
            objects,
        })
    }

    /// Applies the delta to `baseline`, producing the table of `self.frame`.
    ///
    /// A full snapshot ignores `baseline`.
    pub fn apply(&self, baseline: &ObjectTable) -> Result<ObjectTable, SnapshotError> {
        let mut table = if self.is_full() {
            ObjectTable::new()
        } else {
            baseline.clone()
        };

        for object in &self.objects {
            match object {
                ObjectDelta::Created { id, state } => {
                    table.insert(*id, state.clone());
                }
                ObjectDelta::Changed {
                    id,
                    type_id,
                    fields,
                } => {
                    let state = table.get_mut(id).ok_or(SnapshotError::MissingObject(*id))?;
                    if state.type_id != *type_id {
                        return Err(SnapshotError::TypeMismatch {
                            id: *id,
                            delta: *type_id,
                            baseline: state.type_id,
                        });
                    }
                    for (index, value) in fields {
                        let slot = state
                            .fields
                            .get_mut(*index as usize)
                            .ok_or(SnapshotError::FieldOutOfRange { id: *id, index: *index })?;
                        *slot = value.clone();
                    }
                }
                ObjectDelta::Destroyed { id } => {
                    table.remove(id);
                }
            }
        }
        Ok(table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binary_data::{BinaryDataSetBuilder, FieldKind};

    fn set() -> BinaryDataDescriptorSet {
        let mut b = BinaryDataSetBuilder::new();
        b.register(
            "Npc",
            &[("health", FieldKind::Int32), ("name", FieldKind::String)],
        )
        .unwrap();
        b.build()
    }

    fn npc(health: i32, name: &str) -> ObjectState {
        ObjectState::new(
            DescriptorId(0),
            vec![FieldValue::Int32(health), FieldValue::String(name.into())],
        )
    }

    #[test]
    fn only_changed_fields_are_sent() {
        let mut a = ObjectTable::new();
        a.insert(ObjectId(1), npc(100, "barney"));
        let mut b = ObjectTable::new();
        b.insert(ObjectId(1), npc(80, "barney"));

        let delta = SnapshotDelta::compute(2, Some((1, &a)), &b);
        assert_eq!(
            delta.objects,
            vec![ObjectDelta::Changed {
                id: ObjectId(1),
                type_id: DescriptorId(0),
                fields: vec![(0, FieldValue::Int32(80))],
            }]
        );
    }

    #[test]
    fn unchanged_objects_are_omitted_and_removed_ones_destroyed() {
        let mut a = ObjectTable::new();
        a.insert(ObjectId(1), npc(100, "barney"));
        a.insert(ObjectId(2), npc(50, "scientist"));
        let mut b = ObjectTable::new();
        b.insert(ObjectId(1), npc(100, "barney"));
        b.insert(ObjectId(3), npc(10, "headcrab"));

        let delta = SnapshotDelta::compute(5, Some((4, &a)), &b);
        assert_eq!(delta.objects.len(), 2);
        assert!(matches!(delta.objects[0], ObjectDelta::Created { id: ObjectId(3), .. }));
        assert_eq!(delta.objects[1], ObjectDelta::Destroyed { id: ObjectId(2) });
        assert_eq!(delta.apply(&a).unwrap(), b);
    }

    #[test]
    fn encoded_delta_applies_on_peer() {
        let set = set();
        let mut a = ObjectTable::new();
        a.insert(ObjectId(7), npc(100, "otis"));
        let mut b = a.clone();
        b.get_mut(&ObjectId(7)).unwrap().fields[1] = FieldValue::String("gman".into());

        let bytes = SnapshotDelta::compute(9, Some((8, &a)), &b).encode(&set).unwrap();
        let decoded = SnapshotDelta::decode(&bytes, &set).unwrap();
        assert_eq!(decoded.frame, 9);
        assert_eq!(decoded.baseline, Some(8));
        assert_eq!(decoded.apply(&a).unwrap(), b);
    }

    #[test]
    fn full_snapshot_replaces_table() {
        let set = set();
        let mut stale = ObjectTable::new();
        stale.insert(ObjectId(99), npc(1, "old"));
        let mut cur = ObjectTable::new();
        cur.insert(ObjectId(1), npc(100, "new"));

        let bytes = SnapshotDelta::compute(3, None, &cur).encode(&set).unwrap();
        let decoded = SnapshotDelta::decode(&bytes, &set).unwrap();
        assert!(decoded.is_full());
        assert_eq!(decoded.apply(&stale).unwrap(), cur);
    }

    #[test]
    fn change_to_missing_object_fails() {
        let delta = SnapshotDelta {
            frame: 2,
            baseline: Some(1),
            objects: vec![ObjectDelta::Changed {
                id: ObjectId(4),
                type_id: DescriptorId(0),
                fields: vec![(0, FieldValue::Int32(1))],
            }],
        };
        assert_eq!(
            delta.apply(&ObjectTable::new()),
            Err(SnapshotError::MissingObject(ObjectId(4)))
        );
    }

    #[test]
    fn bad_flags_are_rejected() {
        let set = set();
        let payload = [0, 0, 0, 1, 0, 0, 0, 0, 0, 1, 0, 0, 0, 1, 0xff];
        assert_eq!(
            SnapshotDelta::decode(&payload, &set),
            Err(SnapshotError::InvalidFlags(0xff))
        );
    }
}
