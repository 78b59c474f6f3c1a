//! Multiset primitives.
//!
//! A `Delta` pairs a piece of data with a signed multiplicity. The unit
//! flowing through query graphs is `Delta<Tuple>`: a keyed payload plus an
//! optional order-by position. A batch is an unordered bag of deltas whose
//! meaning is additive; `consolidate` reduces a batch to canonical form.

use alloc::string::String;
use alloc::vec::Vec;
use hashbrown::HashMap;
use vela_core::{Key, Value};

/// A differential change to a data item.
///
/// The `diff` field is the multiplicity of the change: positive for
/// insertions, negative for retractions.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Delta<T> {
    /// The data being changed
    pub data: T,
    /// Signed multiplicity
    pub diff: i32,
}

impl<T> Delta<T> {
    /// Creates a new delta with the given data and diff.
    #[inline]
    pub fn new(data: T, diff: i32) -> Self {
        Self { data, diff }
    }

    /// Creates an insertion delta (+1).
    #[inline]
    pub fn insert(data: T) -> Self {
        Self { data, diff: 1 }
    }

    /// Creates a retraction delta (-1).
    #[inline]
    pub fn delete(data: T) -> Self {
        Self { data, diff: -1 }
    }

    /// Returns true if this is an insertion (diff > 0).
    #[inline]
    pub fn is_insert(&self) -> bool {
        self.diff > 0
    }

    /// Returns true if this is a retraction (diff < 0).
    #[inline]
    pub fn is_delete(&self) -> bool {
        self.diff < 0
    }

    /// Maps the data to a new type, preserving the diff.
    #[inline]
    pub fn map<U, F>(self, f: F) -> Delta<U>
    where
        F: FnOnce(T) -> U,
    {
        Delta {
            data: f(self.data),
            diff: self.diff,
        }
    }

    /// Flips the sign of the diff.
    #[inline]
    pub fn negate(self) -> Self {
        Self {
            data: self.data,
            diff: -self.diff,
        }
    }
}

/// The keyed element flowing through a query graph.
///
/// `position` is the fractional order-by index stamped by the top-k
/// operator, `None` everywhere upstream of it. It participates in
/// equality and hashing: a position change must survive consolidation as
/// a retract/insert pair, otherwise the materializer could never observe
/// reorderings of unchanged payloads.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Tuple {
    /// Row identity within the stream
    pub key: Key,
    /// The row payload
    pub payload: Value,
    /// Fractional order-by index, if stamped
    pub position: Option<String>,
}

impl Tuple {
    /// Creates an unstamped tuple.
    pub fn new(key: Key, payload: Value) -> Self {
        Self {
            key,
            payload,
            position: None,
        }
    }

    /// Creates a tuple carrying an order-by position.
    pub fn with_position(key: Key, payload: Value, position: String) -> Self {
        Self {
            key,
            payload,
            position: Some(position),
        }
    }
}

/// A batch of tuple deltas.
pub type DeltaBatch = Vec<Delta<Tuple>>;

/// Consolidates a batch: groups by tuple identity, sums diffs, and drops
/// tuples whose net multiplicity is zero. Output order is unspecified.
pub fn consolidate(batch: DeltaBatch) -> DeltaBatch {
    if batch.len() <= 1 {
        return batch;
    }
    let mut net: HashMap<Tuple, i32> = HashMap::with_capacity(batch.len());
    for delta in batch {
        *net.entry(delta.data).or_insert(0) += delta.diff;
    }
    net.into_iter()
        .filter(|(_, diff)| *diff != 0)
        .map(|(data, diff)| Delta::new(data, diff))
        .collect()
}
