//! Network string lists.
//!
//! Named, append-only tables of strings (model precache, sound precache,
//! ...) replicated identically to every client. An entry's index is fixed
//! once appended; lists only go away when the registry starts a new
//! generation (map change).
//!
//! The registry records every creation and append so the server can forward
//! them to connected clients; clients connecting later get the full lists.

use tracing::debug;

use crate::{net::ServerMessage, wire};

/// Values per `StringListFull` chunk are capped at this many encoded bytes.
pub const FULL_TRANSFER_CHUNK: usize = 1024;

/// Encoded size of a `StringListFull` carrying one value of
/// `value_len` bytes for a list called `name`. Appends are smaller.
fn single_value_transfer_len(name: &str, value_len: usize) -> usize {
    2 + wire::str_len(name) + 4 + 4 + 2 + value_len
}

/// Handle to a list in one registry generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListHandle {
    generation: u32,
    index: u16,
}

impl ListHandle {
    /// Position of the list in the registry; this is the list id on the wire.
    pub fn index(&self) -> u16 {
        self.index
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StringListError {
    #[error("string list '{0}' already exists")]
    DuplicateName(String),
    #[error("string list name cannot be empty")]
    EmptyName,
    #[error("string list handle from generation {handle} used in generation {current}")]
    StaleHandle { handle: u32, current: u32 },
    #[error("unknown string list {0}")]
    UnknownList(u16),
    #[error("too many string lists")]
    TooManyLists,
    #[error("string list '{0}' is full")]
    ListFull(String),
    #[error("value of {len} bytes is too long for string list '{list}'")]
    ValueTooLong { list: String, len: usize },
}

/// Change recorded for replication.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StringListChange {
    Created(ListHandle),
    Appended { list: ListHandle, index: u32 },
}

/// One append-only list.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NetworkStringList {
    name: String,
    values: Vec<String>,
}

impl NetworkStringList {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn get(&self, index: u32) -> Option<&str> {
        self.values.get(index as usize).map(String::as_str)
    }

    pub fn index_of(&self, value: &str) -> Option<u32> {
        self.values.iter().position(|v| v == value).map(|i| i as u32)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn values(&self) -> &[String] {
        &self.values
    }

    /// Messages transferring this whole list, in order.
    ///
    /// Small lists fit one message; large ones are split into consecutive
    /// chunks, the first of which has `first_index == 0`.
    pub fn full_transfer(&self, list: u16) -> Vec<ServerMessage> {
        let mut messages = Vec::new();
        let mut first_index = 0u32;
        let mut chunk: Vec<String> = Vec::new();
        let mut chunk_bytes = 0usize;

        for value in &self.values {
            let len = wire::str_len(value);
            if !chunk.is_empty() && chunk_bytes + len > FULL_TRANSFER_CHUNK {
                let values = std::mem::take(&mut chunk);
                let n = values.len() as u32;
                messages.push(ServerMessage::StringListFull {
                    list,
                    name: self.name.clone(),
                    first_index,
                    values,
                });
                first_index += n;
                chunk_bytes = 0;
            }
            chunk_bytes += len;
            chunk.push(value.clone());
        }

        if !chunk.is_empty() || messages.is_empty() {
            messages.push(ServerMessage::StringListFull {
                list,
                name: self.name.clone(),
                first_index,
                values: chunk,
            });
        }
        messages
    }
}

/// All string lists of the current session generation.
#[derive(Debug, Default)]
pub struct NetworkStringListRegistry {
    generation: u32,
    lists: Vec<NetworkStringList>,
    changes: Vec<StringListChange>,
}

impl NetworkStringListRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }

    /// Drops every list and starts a new generation. Old handles stop working.
    pub fn reset(&mut self) {
        self.generation += 1;
        debug!(generation = self.generation, dropped = self.lists.len(), "String lists reset");
        self.lists.clear();
        self.changes.clear();
    }

    pub fn create_list(&mut self, name: &str) -> Result<ListHandle, StringListError> {
        if name.is_empty() {
            return Err(StringListError::EmptyName);
        }
        if self.lists.iter().any(|l| l.name == name) {
            return Err(StringListError::DuplicateName(name.to_string()));
        }
        let index = u16::try_from(self.lists.len()).map_err(|_| StringListError::TooManyLists)?;
        self.lists.push(NetworkStringList {
            name: name.to_string(),
            values: Vec::new(),
        });
        let handle = ListHandle {
            generation: self.generation,
            index,
        };
        self.changes.push(StringListChange::Created(handle));
        debug!(name, index, "String list created");
        Ok(handle)
    }

    pub fn find(&self, name: &str) -> Option<ListHandle> {
        self.lists
            .iter()
            .position(|l| l.name == name)
            .map(|i| ListHandle {
                generation: self.generation,
                index: i as u16,
            })
    }

    pub fn list(&self, handle: ListHandle) -> Result<&NetworkStringList, StringListError> {
        self.check(handle)?;
        self.lists
            .get(handle.index as usize)
            .ok_or(StringListError::UnknownList(handle.index))
    }

    /// Appends `value` and returns its permanent index.
    pub fn append(&mut self, handle: ListHandle, value: &str) -> Result<u32, StringListError> {
        self.check(handle)?;
        let list = self
            .lists
            .get_mut(handle.index as usize)
            .ok_or(StringListError::UnknownList(handle.index))?;
        // Every value must travel alone in one message, appended or in a
        // full transfer.
        if single_value_transfer_len(&list.name, value.len()) > wire::MAX_PAYLOAD_LEN {
            return Err(StringListError::ValueTooLong {
                list: list.name.clone(),
                len: value.len(),
            });
        }
        let index =
            u32::try_from(list.values.len()).map_err(|_| StringListError::ListFull(list.name.clone()))?;
        list.values.push(value.to_string());
        self.changes.push(StringListChange::Appended {
            list: handle,
            index,
        });
        Ok(index)
    }

    /// Iterates lists in creation order.
    pub fn iter(&self) -> impl Iterator<Item = (ListHandle, &NetworkStringList)> {
        let generation = self.generation;
        self.lists.iter().enumerate().map(move |(i, l)| {
            (
                ListHandle {
                    generation,
                    index: i as u16,
                },
                l,
            )
        })
    }

    pub fn len(&self) -> usize {
        self.lists.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lists.is_empty()
    }

    /// Full transfer of every list, for a client that just connected.
    pub fn full_transfer(&self) -> Vec<ServerMessage> {
        self.iter()
            .flat_map(|(h, l)| l.full_transfer(h.index))
            .collect()
    }

    /// Takes the changes recorded since the last call.
    pub fn drain_changes(&mut self) -> Vec<StringListChange> {
        std::mem::take(&mut self.changes)
    }

    /// Message replicating one recorded change.
    pub fn change_message(&self, change: StringListChange) -> Option<ServerMessage> {
        match change {
            StringListChange::Created(handle) => {
                let list = self.list(handle).ok()?;
                Some(ServerMessage::StringListFull {
                    list: handle.index,
                    name: list.name.clone(),
                    first_index: 0,
                    values: Vec::new(),
                })
            }
            StringListChange::Appended { list, index } => {
                let value = self.list(list).ok()?.get(index)?;
                Some(ServerMessage::StringListAppend {
                    list: list.index,
                    index,
                    value: value.to_string(),
                })
            }
        }
    }

    fn check(&self, handle: ListHandle) -> Result<(), StringListError> {
        if handle.generation != self.generation {
            return Err(StringListError::StaleHandle {
                handle: handle.generation,
                current: self.generation,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_returns_sequential_indices() {
        let mut reg = NetworkStringListRegistry::new();
        let models = reg.create_list("ModelPrecache").unwrap();
        assert_eq!(reg.append(models, "v1").unwrap(), 0);
        assert_eq!(reg.append(models, "v2").unwrap(), 1);
        assert_eq!(reg.append(models, "v3").unwrap(), 2);
        assert_eq!(reg.list(models).unwrap().values(), ["v1", "v2", "v3"]);
    }

    #[test]
    fn duplicate_name_fails() {
        let mut reg = NetworkStringListRegistry::new();
        reg.create_list("ModelPrecache").unwrap();
        assert_eq!(
            reg.create_list("ModelPrecache"),
            Err(StringListError::DuplicateName("ModelPrecache".into()))
        );
    }

    #[test]
    fn reset_invalidates_handles_and_allows_names_again() {
        let mut reg = NetworkStringListRegistry::new();
        let old = reg.create_list("ModelPrecache").unwrap();
        reg.append(old, "models/a.mdl").unwrap();
        reg.reset();

        assert!(matches!(
            reg.append(old, "models/b.mdl"),
            Err(StringListError::StaleHandle { .. })
        ));
        let new = reg.create_list("ModelPrecache").unwrap();
        assert!(reg.list(new).unwrap().is_empty());
        assert!(reg.drain_changes().len() == 1);
    }

    #[test]
    fn changes_are_recorded_in_order() {
        let mut reg = NetworkStringListRegistry::new();
        let h = reg.create_list("SoundPrecache").unwrap();
        reg.append(h, "a.wav").unwrap();

        let changes = reg.drain_changes();
        assert_eq!(
            changes,
            vec![
                StringListChange::Created(h),
                StringListChange::Appended { list: h, index: 0 }
            ]
        );
        assert_eq!(
            reg.change_message(changes[1]),
            Some(ServerMessage::StringListAppend {
                list: 0,
                index: 0,
                value: "a.wav".into()
            })
        );
        assert!(reg.drain_changes().is_empty());
    }

    #[test]
    fn values_that_cannot_be_replicated_are_refused() {
        let mut reg = NetworkStringListRegistry::new();
        let h = reg.create_list("ModelPrecache").unwrap();
        reg.drain_changes();

        let huge = "x".repeat(u16::MAX as usize);
        assert_eq!(
            reg.append(h, &huge),
            Err(StringListError::ValueTooLong {
                list: "ModelPrecache".into(),
                len: huge.len(),
            })
        );
        assert!(reg.list(h).unwrap().is_empty());
        assert!(reg.drain_changes().is_empty());

        // The largest accepted value still encodes, appended and in full.
        let max = wire::MAX_PAYLOAD_LEN - single_value_transfer_len("ModelPrecache", 0);
        let largest = "y".repeat(max);
        assert_eq!(reg.append(h, &largest).unwrap(), 0);
        for change in reg.drain_changes() {
            reg.change_message(change).unwrap().encode().unwrap();
        }
        for message in reg.full_transfer() {
            message.encode().unwrap();
        }
    }

    #[test]
    fn full_transfer_small_list_is_one_message() {
        let mut reg = NetworkStringListRegistry::new();
        let h = reg.create_list("ModelPrecache").unwrap();
        for v in ["v1", "v2", "v3"] {
            reg.append(h, v).unwrap();
        }
        assert_eq!(
            reg.full_transfer(),
            vec![ServerMessage::StringListFull {
                list: 0,
                name: "ModelPrecache".into(),
                first_index: 0,
                values: vec!["v1".into(), "v2".into(), "v3".into()],
            }]
        );
    }

    #[test]
    fn full_transfer_large_list_is_chunked_in_order() {
        let mut reg = NetworkStringListRegistry::new();
        let h = reg.create_list("ModelPrecache").unwrap();
        for i in 0..200 {
            reg.append(h, &format!("models/props/crate{i:03}.mdl")).unwrap();
        }

        let messages = reg.full_transfer();
        assert!(messages.len() > 1);

        let mut rebuilt = Vec::new();
        for m in messages {
            let ServerMessage::StringListFull {
                first_index, values, ..
            } = m
            else {
                panic!("unexpected message");
            };
            assert_eq!(first_index as usize, rebuilt.len());
            rebuilt.extend(values);
        }
        assert_eq!(rebuilt, reg.list(h).unwrap().values());
    }
}
