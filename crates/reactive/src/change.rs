//! Keyed change messages.
//!
//! The external unit of change on both sides of the engine: source
//! collections deliver them, the result collection receives them. An
//! update is semantically a delete of the previous value plus an insert
//! of the new one and is split into that pair at the boundary.

use alloc::vec::Vec;
use vela_core::{Key, Value};
use vela_incremental::{Delta, Tuple};

/// A change to one row of a collection.
#[derive(Clone, Debug, PartialEq)]
pub enum ChangeMessage {
    Insert {
        key: Key,
        value: Value,
    },
    Update {
        key: Key,
        previous: Value,
        value: Value,
    },
    Delete {
        key: Key,
        value: Value,
    },
}

impl ChangeMessage {
    /// The key of the changed row.
    pub fn key(&self) -> &Key {
        match self {
            ChangeMessage::Insert { key, .. }
            | ChangeMessage::Update { key, .. }
            | ChangeMessage::Delete { key, .. } => key,
        }
    }

    /// The row value after the change (the deleted value for deletes).
    pub fn value(&self) -> &Value {
        match self {
            ChangeMessage::Insert { value, .. }
            | ChangeMessage::Update { value, .. }
            | ChangeMessage::Delete { value, .. } => value,
        }
    }

    /// Appends this change as deltas, splitting updates into a
    /// retraction plus an insertion.
    pub fn append_deltas(self, out: &mut Vec<Delta<Tuple>>) {
        match self {
            ChangeMessage::Insert { key, value } => {
                out.push(Delta::insert(Tuple::new(key, value)));
            }
            ChangeMessage::Update {
                key,
                previous,
                value,
            } => {
                out.push(Delta::delete(Tuple::new(key.clone(), previous)));
                out.push(Delta::insert(Tuple::new(key, value)));
            }
            ChangeMessage::Delete { key, value } => {
                out.push(Delta::delete(Tuple::new(key, value)));
            }
        }
    }
}
