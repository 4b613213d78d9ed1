//! Binary data descriptors.
//!
//! A descriptor is a named, ordered field layout used to encode structured
//! payloads (entity state blocks) on the wire. Descriptors are registered on a
//! [`BinaryDataSetBuilder`] while the server is being wired up, then frozen
//! into an immutable [`BinaryDataDescriptorSet`]. Server and client must hold
//! identical sets, in identical order, before any typed payload is exchanged;
//! [`BinaryDataDescriptorSet::compare`] is the negotiation check.

use std::collections::HashMap;

use bytes::{BufMut, BytesMut};
use serde::{Deserialize, Serialize};

use crate::wire::{self, WireError};

/// Maximum number of fields in one descriptor (field indices are a `u8`).
pub const MAX_FIELDS: usize = u8::MAX as usize;

/// Stable descriptor id, equal to registration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DescriptorId(pub u16);

/// Wire kind of a single field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum FieldKind {
    Bool = 0,
    Int32 = 1,
    UInt32 = 2,
    Float32 = 3,
    Vec3 = 4,
    String = 5,
}

impl FieldKind {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(FieldKind::Bool),
            1 => Some(FieldKind::Int32),
            2 => Some(FieldKind::UInt32),
            3 => Some(FieldKind::Float32),
            4 => Some(FieldKind::Vec3),
            5 => Some(FieldKind::String),
            _ => None,
        }
    }
}

/// A field value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FieldValue {
    Bool(bool),
    Int32(i32),
    UInt32(u32),
    Float32(f32),
    Vec3([f32; 3]),
    String(String),
}

impl FieldValue {
    pub fn kind(&self) -> FieldKind {
        match self {
            FieldValue::Bool(_) => FieldKind::Bool,
            FieldValue::Int32(_) => FieldKind::Int32,
            FieldValue::UInt32(_) => FieldKind::UInt32,
            FieldValue::Float32(_) => FieldKind::Float32,
            FieldValue::Vec3(_) => FieldKind::Vec3,
            FieldValue::String(_) => FieldKind::String,
        }
    }

    /// Zero value of a kind.
    pub fn default_for(kind: FieldKind) -> Self {
        match kind {
            FieldKind::Bool => FieldValue::Bool(false),
            FieldKind::Int32 => FieldValue::Int32(0),
            FieldKind::UInt32 => FieldValue::UInt32(0),
            FieldKind::Float32 => FieldValue::Float32(0.0),
            FieldKind::Vec3 => FieldValue::Vec3([0.0; 3]),
            FieldKind::String => FieldValue::String(String::new()),
        }
    }

    fn write(&self, buf: &mut BytesMut) -> Result<(), WireError> {
        match self {
            FieldValue::Bool(v) => buf.put_u8(u8::from(*v)),
            FieldValue::Int32(v) => buf.put_i32(*v),
            FieldValue::UInt32(v) => buf.put_u32(*v),
            FieldValue::Float32(v) => buf.put_f32(*v),
            FieldValue::Vec3(v) => {
                for c in v {
                    buf.put_f32(*c);
                }
            }
            FieldValue::String(v) => wire::put_str(buf, v)?,
        }
        Ok(())
    }

    fn read(kind: FieldKind, buf: &mut &[u8]) -> Result<Self, WireError> {
        Ok(match kind {
            FieldKind::Bool => match wire::read_u8(buf)? {
                0 => FieldValue::Bool(false),
                1 => FieldValue::Bool(true),
                v => {
                    return Err(WireError::InvalidValue {
                        what: "bool",
                        value: u32::from(v),
                    })
                }
            },
            FieldKind::Int32 => FieldValue::Int32(wire::read_i32(buf)?),
            FieldKind::UInt32 => FieldValue::UInt32(wire::read_u32(buf)?),
            FieldKind::Float32 => FieldValue::Float32(wire::read_f32(buf)?),
            FieldKind::Vec3 => FieldValue::Vec3([
                wire::read_f32(buf)?,
                wire::read_f32(buf)?,
                wire::read_f32(buf)?,
            ]),
            FieldKind::String => FieldValue::String(wire::read_str(buf)?),
        })
    }
}

/// Descriptor errors.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DescriptorError {
    #[error("descriptor '{0}' is already registered")]
    DuplicateName(String),
    #[error("descriptor name cannot be empty")]
    EmptyName,
    #[error("descriptor '{name}' has {count} fields, at most 255 are allowed")]
    TooManyFields { name: String, count: usize },
    #[error("descriptor set is full")]
    TooManyDescriptors,
    #[error("unknown descriptor id {0:?}")]
    UnknownType(DescriptorId),
    #[error("descriptor '{name}' has no field {index}")]
    UnknownField { name: String, index: u8 },
    #[error("field {index} of '{name}' is {expected:?}, got {actual:?}")]
    KindMismatch {
        name: String,
        index: u8,
        expected: FieldKind,
        actual: FieldKind,
    },
    #[error("'{name}' expects {expected} fields, got {actual}")]
    FieldCount {
        name: String,
        expected: usize,
        actual: usize,
    },
    #[error(transparent)]
    Wire(#[from] WireError),
}

/// Why a remote descriptor list does not match the local set.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DescriptorMismatch {
    #[error("descriptor count mismatch: expected {expected}, got {actual}")]
    Count { expected: usize, actual: usize },
    #[error("descriptor order mismatch at {index}: expected '{expected}', got '{actual}'")]
    Order {
        index: usize,
        expected: String,
        actual: String,
    },
    #[error("unknown descriptor '{0}'")]
    UnknownType(String),
    #[error("descriptor '{0}' has a different field layout")]
    Layout(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDescriptor {
    pub name: String,
    pub kind: FieldKind,
}

/// One registered payload layout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BinaryDataDescriptor {
    pub id: DescriptorId,
    pub name: String,
    pub fields: Vec<FieldDescriptor>,
}

impl BinaryDataDescriptor {
    pub fn field_index(&self, name: &str) -> Option<u8> {
        self.fields
            .iter()
            .position(|f| f.name == name)
            .map(|i| i as u8)
    }

    fn field(&self, index: u8) -> Result<&FieldDescriptor, DescriptorError> {
        self.fields
            .get(index as usize)
            .ok_or_else(|| DescriptorError::UnknownField {
                name: self.name.clone(),
                index,
            })
    }

    /// Checks that `index` exists and `value` has its kind.
    pub fn check_field(&self, index: u8, value: &FieldValue) -> Result<(), DescriptorError> {
        let field = self.field(index)?;
        if field.kind != value.kind() {
            return Err(DescriptorError::KindMismatch {
                name: self.name.clone(),
                index,
                expected: field.kind,
                actual: value.kind(),
            });
        }
        Ok(())
    }

    /// Checks a complete value against the layout.
    pub fn validate(&self, values: &[FieldValue]) -> Result<(), DescriptorError> {
        if values.len() != self.fields.len() {
            return Err(DescriptorError::FieldCount {
                name: self.name.clone(),
                expected: self.fields.len(),
                actual: values.len(),
            });
        }
        for (i, v) in values.iter().enumerate() {
            self.check_field(i as u8, v)?;
        }
        Ok(())
    }

    pub fn encode_field(
        &self,
        index: u8,
        value: &FieldValue,
        buf: &mut BytesMut,
    ) -> Result<(), DescriptorError> {
        self.check_field(index, value)?;
        value.write(buf)?;
        Ok(())
    }

    pub fn decode_field(&self, index: u8, buf: &mut &[u8]) -> Result<FieldValue, DescriptorError> {
        let kind = self.field(index)?.kind;
        Ok(FieldValue::read(kind, buf)?)
    }

    /// Encodes every field in layout order.
    pub fn encode(&self, values: &[FieldValue], buf: &mut BytesMut) -> Result<(), DescriptorError> {
        self.validate(values)?;
        for v in values {
            v.write(buf)?;
        }
        Ok(())
    }

    /// Decodes every field in layout order.
    pub fn decode(&self, buf: &mut &[u8]) -> Result<Vec<FieldValue>, DescriptorError> {
        self.fields
            .iter()
            .map(|f| FieldValue::read(f.kind, buf).map_err(DescriptorError::from))
            .collect()
    }

    fn same_layout(&self, other: &BinaryDataDescriptor) -> bool {
        self.fields == other.fields
    }
}

/// Collects descriptors during server wiring.
#[derive(Debug, Default)]
pub struct BinaryDataSetBuilder {
    descriptors: Vec<BinaryDataDescriptor>,
    by_name: HashMap<String, DescriptorId>,
}

impl BinaryDataSetBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a descriptor; ids follow registration order.
    pub fn register(
        &mut self,
        name: &str,
        fields: &[(&str, FieldKind)],
    ) -> Result<DescriptorId, DescriptorError> {
        if name.is_empty() {
            return Err(DescriptorError::EmptyName);
        }
        if self.by_name.contains_key(name) {
            return Err(DescriptorError::DuplicateName(name.to_string()));
        }
        if fields.len() > MAX_FIELDS {
            return Err(DescriptorError::TooManyFields {
                name: name.to_string(),
                count: fields.len(),
            });
        }
        let id = u16::try_from(self.descriptors.len())
            .map(DescriptorId)
            .map_err(|_| DescriptorError::TooManyDescriptors)?;

        self.descriptors.push(BinaryDataDescriptor {
            id,
            name: name.to_string(),
            fields: fields
                .iter()
                .map(|(n, k)| FieldDescriptor {
                    name: n.to_string(),
                    kind: *k,
                })
                .collect(),
        });
        self.by_name.insert(name.to_string(), id);
        Ok(id)
    }

    /// Freezes the set.
    pub fn build(self) -> BinaryDataDescriptorSet {
        BinaryDataDescriptorSet {
            descriptors: self.descriptors,
            by_name: self.by_name,
        }
    }
}

/// Frozen, ordered descriptor set.
#[derive(Debug, Clone, Default)]
pub struct BinaryDataDescriptorSet {
    descriptors: Vec<BinaryDataDescriptor>,
    by_name: HashMap<String, DescriptorId>,
}

impl BinaryDataDescriptorSet {
    pub fn get(&self, id: DescriptorId) -> Result<&BinaryDataDescriptor, DescriptorError> {
        self.descriptors
            .get(id.0 as usize)
            .ok_or(DescriptorError::UnknownType(id))
    }

    pub fn find(&self, name: &str) -> Option<&BinaryDataDescriptor> {
        self.by_name
            .get(name)
            .and_then(|id| self.descriptors.get(id.0 as usize))
    }

    pub fn descriptors(&self) -> &[BinaryDataDescriptor] {
        &self.descriptors
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    /// Compares a peer's descriptor list against this set.
    ///
    /// Any difference in count, order, names or field layouts is a mismatch;
    /// there is no partial agreement.
    pub fn compare(&self, remote: &[BinaryDataDescriptor]) -> Result<(), DescriptorMismatch> {
        if remote.len() != self.descriptors.len() {
            return Err(DescriptorMismatch::Count {
                expected: self.descriptors.len(),
                actual: remote.len(),
            });
        }
        for (index, (local, other)) in self.descriptors.iter().zip(remote).enumerate() {
            if local.name != other.name {
                if !self.by_name.contains_key(&other.name) {
                    return Err(DescriptorMismatch::UnknownType(other.name.clone()));
                }
                return Err(DescriptorMismatch::Order {
                    index,
                    expected: local.name.clone(),
                    actual: other.name.clone(),
                });
            }
            if !local.same_layout(other) {
                return Err(DescriptorMismatch::Layout(local.name.clone()));
            }
        }
        Ok(())
    }

    /// Encodes a complete value of type `id`.
    pub fn encode(
        &self,
        id: DescriptorId,
        values: &[FieldValue],
        buf: &mut BytesMut,
    ) -> Result<(), DescriptorError> {
        self.get(id)?.encode(values, buf)
    }

    /// Decodes a complete value of type `id`.
    pub fn decode(&self, id: DescriptorId, buf: &mut &[u8]) -> Result<Vec<FieldValue>, DescriptorError> {
        self.get(id)?.decode(buf)
    }
}

/// Name of the engine's built-in entity state block.
pub const ENTITY_STATE: &str = "EntityState";

/// Registers the descriptors every engine build carries.
pub fn register_engine_types(builder: &mut BinaryDataSetBuilder) -> Result<(), DescriptorError> {
    builder.register(
        ENTITY_STATE,
        &[
            ("origin", FieldKind::Vec3),
            ("angles", FieldKind::Vec3),
            ("model_index", FieldKind::UInt32),
            ("health", FieldKind::Int32),
            ("effects", FieldKind::UInt32),
            ("visible", FieldKind::Bool),
        ],
    )?;
    Ok(())
}
