//! Result materialization.
//!
//! The materializer folds the terminal multiset stream into keyed
//! insert/update/delete messages for the result collection and keeps the
//! fractional-index table that gives the result set its external order.
//!
//! Per batch and per key the fold counts insertions and deletions; the
//! legal combinations are exactly:
//!
//! - only insertions, key absent → insert
//! - insertions and deletions balance, key present → update in place
//! - more insertions than deletions → upsert
//! - only deletions, key present → delete
//!
//! Anything else is a runtime invariant violation and aborts the query.

use alloc::rc::Rc;
use alloc::string::String;
use alloc::vec::Vec;
use core::cell::{Cell, RefCell};
use core::cmp::Ordering;
use hashbrown::HashMap;
use vela_core::{Error, Key, Result, Value};
use vela_incremental::{consolidate, DeltaBatch};

use crate::change::ChangeMessage;

/// The write half of a result collection.
pub trait ResultSink {
    fn begin(&self);
    fn write(&self, change: ChangeMessage);
    fn commit(&self);
    /// Called once, after the initial full state is materialized.
    fn mark_ready(&self);
}

#[derive(Default)]
struct KeyFold {
    inserts: i64,
    deletes: i64,
    latest: Option<(Value, Option<String>)>,
}

/// Folds terminal batches into result mutations.
pub struct Materializer {
    sink: Rc<dyn ResultSink>,
    /// Current result rows: value plus fractional index.
    state: HashMap<Key, (Value, Option<String>)>,
    ready: bool,
}

impl Materializer {
    pub fn new(sink: Rc<dyn ResultSink>) -> Self {
        Self {
            sink,
            state: HashMap::new(),
            ready: false,
        }
    }

    /// Applies one terminal batch, emitting a result transaction when
    /// anything changed.
    pub fn apply(&mut self, batch: DeltaBatch) -> Result<()> {
        let batch = consolidate(batch);
        if batch.is_empty() {
            return Ok(());
        }

        let mut folds: HashMap<Key, KeyFold> = HashMap::new();
        for delta in batch {
            let fold = folds.entry(delta.data.key.clone()).or_default();
            if delta.diff > 0 {
                fold.inserts += delta.diff as i64;
                fold.latest = Some((delta.data.payload, delta.data.position));
            } else {
                fold.deletes += (-delta.diff) as i64;
            }
        }

        let mut writes = Vec::new();
        for (key, fold) in folds {
            match (fold.inserts, fold.deletes) {
                (0, 0) => {
                    return Err(Error::invariant("materializer fold with no net change"));
                }
                (i, d) if i > 0 && i == d => {
                    // Balanced retract/insert: an in-place update.
                    let (value, position) = fold.latest.expect("insert carries a value");
                    let Some((previous, _)) = self
                        .state
                        .insert(key.clone(), (value.clone(), position))
                    else {
                        return Err(Error::invariant("materializer update for an absent key"));
                    };
                    writes.push(ChangeMessage::Update {
                        key,
                        previous,
                        value,
                    });
                }
                (i, d) if i > d => {
                    let (value, position) = fold.latest.expect("insert carries a value");
                    match self.state.insert(key.clone(), (value.clone(), position)) {
                        Some((previous, _)) => writes.push(ChangeMessage::Update {
                            key,
                            previous,
                            value,
                        }),
                        None => writes.push(ChangeMessage::Insert { key, value }),
                    }
                }
                (0, d) if d > 0 => {
                    let Some((value, _)) = self.state.remove(&key) else {
                        return Err(Error::invariant(
                            "materializer delete for an absent key",
                        ));
                    };
                    writes.push(ChangeMessage::Delete { key, value });
                }
                _ => {
                    return Err(Error::invariant(
                        "materializer fold outside the legal insert/delete table",
                    ));
                }
            }
        }

        if !writes.is_empty() {
            log::trace!("materializer commit: {} writes", writes.len());
            self.sink.begin();
            for write in writes {
                self.sink.write(write);
            }
            self.sink.commit();
        }
        Ok(())
    }

    /// Marks the result collection ready exactly once.
    pub fn mark_ready(&mut self) {
        if !self.ready {
            self.ready = true;
            self.sink.mark_ready();
        }
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }

    /// Number of materialized rows.
    pub fn len(&self) -> usize {
        self.state.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.is_empty()
    }

    /// External ordering over materialized keys: fractional index order,
    /// unstamped rows after stamped ones, ties by key.
    pub fn compare(&self, a: &Key, b: &Key) -> Ordering {
        let pos = |k: &Key| self.state.get(k).and_then(|(_, p)| p.clone());
        match (pos(a), pos(b)) {
            (Some(x), Some(y)) => x.cmp(&y).then_with(|| a.cmp(b)),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => a.cmp(b),
        }
    }

    /// The materialized rows in external order.
    pub fn rows(&self) -> Vec<(Key, Value)> {
        let mut keys: Vec<&Key> = self.state.keys().collect();
        keys.sort_by(|a, b| self.compare(a, b));
        keys.into_iter()
            .map(|k| (k.clone(), self.state[k].0.clone()))
            .collect()
    }
}

/// A plain batching result collection: applies committed transactions to
/// a row map and records readiness. Doubles as the reference `ResultSink`.
#[derive(Default)]
pub struct ResultCollection {
    rows: RefCell<HashMap<Key, Value>>,
    pending: RefCell<Vec<ChangeMessage>>,
    committed: RefCell<Vec<ChangeMessage>>,
    ready: Cell<bool>,
}

impl ResultCollection {
    pub fn new() -> Rc<Self> {
        Rc::new(Self::default())
    }

    pub fn len(&self) -> usize {
        self.rows.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.borrow().is_empty()
    }

    pub fn is_ready(&self) -> bool {
        self.ready.get()
    }

    pub fn get(&self, key: &Key) -> Option<Value> {
        self.rows.borrow().get(key).cloned()
    }

    /// Every change committed so far, in commit order.
    pub fn change_log(&self) -> Vec<ChangeMessage> {
        self.committed.borrow().clone()
    }
}

impl ResultSink for ResultCollection {
    fn begin(&self) {
        self.pending.borrow_mut().clear();
    }

    fn write(&self, change: ChangeMessage) {
        self.pending.borrow_mut().push(change);
    }

    fn commit(&self) {
        let pending: Vec<ChangeMessage> = self.pending.borrow_mut().drain(..).collect();
        let mut rows = self.rows.borrow_mut();
        for change in &pending {
            match change {
                ChangeMessage::Insert { key, value }
                | ChangeMessage::Update { key, value, .. } => {
                    rows.insert(key.clone(), value.clone());
                }
                ChangeMessage::Delete { key, .. } => {
                    rows.remove(key);
                }
            }
        }
        self.committed.borrow_mut().extend(pending);
    }

    fn mark_ready(&self) {
        self.ready.set(true);
    }
}
