//! Snapshot baselines.
//!
//! The server encodes deltas against frames the client acknowledged, so the
//! client keeps the object tables of its most recent frames.

use std::collections::VecDeque;

use engine_shared::snapshot::ObjectTable;

/// Bounded history of applied frames, oldest first.
#[derive(Debug, Default)]
pub struct BaselineHistory {
    history: VecDeque<(u32, ObjectTable)>,
    max: usize,
}

impl BaselineHistory {
    pub fn new(max: usize) -> Self {
        Self {
            history: VecDeque::new(),
            max,
        }
    }

    pub fn push(&mut self, frame: u32, table: ObjectTable) {
        self.history.push_back((frame, table));
        while self.history.len() > self.max {
            self.history.pop_front();
        }
    }

    pub fn get(&self, frame: u32) -> Option<&ObjectTable> {
        self.history
            .iter()
            .rev()
            .find(|(f, _)| *f == frame)
            .map(|(_, t)| t)
    }

    pub fn latest(&self) -> Option<(u32, &ObjectTable)> {
        self.history.back().map(|(f, t)| (*f, t))
    }

    pub fn clear(&mut self) {
        self.history.clear();
    }

    /// Returns the number of buffered frames.
    pub fn len(&self) -> usize {
        self.history.len()
    }

    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use engine_shared::{
        binary_data::{DescriptorId, FieldValue},
        snapshot::{ObjectId, ObjectState},
    };

    fn table(health: i32) -> ObjectTable {
        let mut t = ObjectTable::new();
        t.insert(
            ObjectId(1),
            ObjectState::new(DescriptorId(0), vec![FieldValue::Int32(health)]),
        );
        t
    }

    #[test]
    fn oldest_frames_are_evicted() {
        let mut h = BaselineHistory::new(2);
        h.push(1, table(1));
        h.push(2, table(2));
        h.push(3, table(3));
        assert_eq!(h.len(), 2);
        assert!(h.get(1).is_none());
        assert_eq!(h.get(2), Some(&table(2)));
        assert_eq!(h.latest().map(|(f, _)| f), Some(3));
    }
}
