//! Order-by / top-k operator.
//!
//! Maintains the slice `[offset, offset + limit)` of its input ordered by
//! the configured sort keys (ties broken by row key) and stamps every
//! window row with a fractional index so downstream consumers can order
//! results with a plain string compare.
//!
//! The operator keeps every admitted row in a sorted buffer; the window
//! is the slice of that buffer. After each batch the previous window is
//! diffed against the new one: rows that left are retracted, rows that
//! entered are inserted, and rows whose fractional index can no longer
//! sit between its neighbours are restamped with a retract/insert pair.
//!
//! `TopKHandle` exposes `data_needed()` so the subscription driver knows
//! how many more rows the window could absorb, and `window_full()` so the
//! driver can assert that its drop-above-max optimization is safe.

use alloc::boxed::Box;
use alloc::rc::Rc;
use alloc::string::String;
use alloc::vec::Vec;
use core::cell::RefCell;
use core::cmp::Ordering;
use hashbrown::HashMap;
use vela_core::{compare_key_rows, Error, Key, Result, SortSpec, Value};

use crate::delta::{consolidate, Delta, DeltaBatch, Tuple};
use crate::fractional;
use crate::graph::Operator;

/// Extracts the order-key values from a tuple.
pub type SortKeyFn = Box<dyn Fn(&Tuple) -> Vec<Value>>;

/// Configuration for a top-k node.
pub struct TopKConfig {
    pub specs: Vec<SortSpec>,
    pub sort_key: SortKeyFn,
    pub offset: usize,
    /// `None` means no LIMIT: the window is everything past the offset.
    pub limit: Option<usize>,
}

#[derive(Default)]
struct Shared {
    data_needed: usize,
    window_full: bool,
}

/// Shared view of a top-k operator's pull state, held by the
/// subscription driver.
#[derive(Clone)]
pub struct TopKHandle {
    shared: Rc<RefCell<Shared>>,
}

impl TopKHandle {
    /// How many more rows the operator would currently accept before the
    /// window (plus its offset prefix) is saturated.
    pub fn data_needed(&self) -> usize {
        self.shared.borrow().data_needed
    }

    /// True when the window holds exactly `limit` rows. The driver's
    /// drop-above-max optimization is only sound in this state.
    pub fn window_full(&self) -> bool {
        self.shared.borrow().window_full
    }
}

struct BufferEntry {
    sort_key: Vec<Value>,
    key: Key,
    payload: Value,
    count: i32,
}

/// Top-k operator.
pub struct TopKOp {
    config: TopKConfig,
    /// Every admitted, unretracted row, ordered by (sort keys, row key).
    buffer: Vec<BufferEntry>,
    /// The window as last emitted: (key, payload, fractional index).
    emitted: Vec<(Key, Value, String)>,
    shared: Rc<RefCell<Shared>>,
}

impl TopKOp {
    pub fn new(config: TopKConfig) -> Self {
        let op = Self {
            config,
            buffer: Vec::new(),
            emitted: Vec::new(),
            shared: Rc::new(RefCell::new(Shared::default())),
        };
        op.publish_shared();
        op
    }

    /// Handle for the subscription driver.
    pub fn handle(&self) -> TopKHandle {
        TopKHandle {
            shared: self.shared.clone(),
        }
    }

    fn compare(&self, sort_key: &[Value], key: &Key, entry: &BufferEntry) -> Ordering {
        compare_key_rows(sort_key, &entry.sort_key, &self.config.specs)
            .then_with(|| key.cmp(&entry.key))
    }

    fn apply_delta(&mut self, tuple: Tuple, diff: i32) -> Result<()> {
        let sort_key = (self.config.sort_key)(&tuple);
        // Position of some entry with equal (sort_key, key), if any.
        let probe = self
            .buffer
            .binary_search_by(|entry| self.compare(&sort_key, &tuple.key, entry).reverse());

        match probe {
            Ok(mut pos) => {
                // Several entries may tie on (sort_key, key) with distinct
                // payloads; scan the equal run for the payload match.
                let mut start = pos;
                while start > 0 && self.compare(&sort_key, &tuple.key, &self.buffer[start - 1]) == Ordering::Equal {
                    start -= 1;
                }
                pos = start;
                let mut found = None;
                while pos < self.buffer.len()
                    && self.compare(&sort_key, &tuple.key, &self.buffer[pos]) == Ordering::Equal
                {
                    if self.buffer[pos].payload == tuple.payload {
                        found = Some(pos);
                        break;
                    }
                    pos += 1;
                }
                match found {
                    Some(pos) => {
                        self.buffer[pos].count += diff;
                        if self.buffer[pos].count < 0 {
                            return Err(Error::invariant(
                                "top-k retraction exceeds stored multiplicity",
                            ));
                        }
                        if self.buffer[pos].count == 0 {
                            self.buffer.remove(pos);
                        }
                    }
                    None if diff > 0 => {
                        self.buffer.insert(
                            start,
                            BufferEntry {
                                sort_key,
                                key: tuple.key,
                                payload: tuple.payload,
                                count: diff,
                            },
                        );
                    }
                    None => {
                        return Err(Error::invariant(
                            "top-k received a retraction for an absent row",
                        ));
                    }
                }
            }
            Err(pos) => {
                if diff < 0 {
                    return Err(Error::invariant(
                        "top-k received a retraction for an absent row",
                    ));
                }
                self.buffer.insert(
                    pos,
                    BufferEntry {
                        sort_key,
                        key: tuple.key,
                        payload: tuple.payload,
                        count: diff,
                    },
                );
            }
        }
        Ok(())
    }

    fn window_range(&self) -> (usize, usize) {
        let len = self.buffer.len();
        let start = self.config.offset.min(len);
        let end = match self.config.limit {
            Some(limit) => (self.config.offset + limit).min(len),
            None => len,
        };
        (start, end.max(start))
    }

    /// Computes the new emitted window, reusing fractional indexes that
    /// still sit correctly between their neighbours.
    fn restamp(&self) -> Vec<(Key, Value, String)> {
        let (start, end) = self.window_range();
        let window = &self.buffer[start..end];

        let old: HashMap<&Key, (&Value, &String)> = self
            .emitted
            .iter()
            .map(|(k, v, f)| (k, (v, f)))
            .collect();

        // Pass 1: greedily keep existing indexes that still form a
        // strictly increasing sequence over unchanged payloads.
        let mut retained: Vec<Option<&String>> = Vec::with_capacity(window.len());
        let mut last: Option<&String> = None;
        for entry in window {
            let keep = old.get(&entry.key).and_then(|(value, frac)| {
                if **value == entry.payload && last.map_or(true, |l| l < *frac) {
                    Some(*frac)
                } else {
                    None
                }
            });
            if let Some(frac) = keep {
                last = Some(frac);
            }
            retained.push(keep);
        }

        // Pass 2: assign fresh indexes between the nearest retained
        // neighbours.
        let mut next_hi: Vec<Option<&String>> = alloc::vec![None; window.len()];
        let mut upcoming: Option<&String> = None;
        for i in (0..window.len()).rev() {
            next_hi[i] = upcoming;
            if let Some(frac) = retained[i] {
                upcoming = Some(frac);
            }
        }

        let mut result = Vec::with_capacity(window.len());
        let mut prev: Option<String> = None;
        let mut rebalance = false;
        for (i, entry) in window.iter().enumerate() {
            let frac = match retained[i] {
                Some(frac) => frac.clone(),
                None => {
                    let assigned =
                        fractional::between(prev.as_deref(), next_hi[i].map(String::as_str));
                    if fractional::needs_rebalance(&assigned) {
                        rebalance = true;
                    }
                    assigned
                }
            };
            prev = Some(frac.clone());
            result.push((entry.key.clone(), entry.payload.clone(), frac));
        }

        if rebalance {
            log::debug!("top-k window rebalance over {} rows", window.len());
            let spaced = fractional::evenly_spaced(window.len());
            result = window
                .iter()
                .zip(spaced)
                .map(|(entry, frac)| (entry.key.clone(), entry.payload.clone(), frac))
                .collect();
        }
        result
    }

    fn publish_shared(&self) {
        let mut shared = self.shared.borrow_mut();
        let (start, end) = self.window_range();
        match self.config.limit {
            None | Some(0) => {
                shared.data_needed = 0;
                shared.window_full = self.config.limit == Some(0);
            }
            Some(limit) => {
                shared.data_needed =
                    (self.config.offset + limit).saturating_sub(self.buffer.len());
                shared.window_full = end - start == limit;
            }
        }
    }
}

impl Operator for TopKOp {
    fn on_batch(&mut self, _port: usize, batch: DeltaBatch, out: &mut DeltaBatch) -> Result<()> {
        for delta in consolidate(batch) {
            self.apply_delta(delta.data, delta.diff)?;
        }

        let next = self.restamp();

        // Emit the difference between the previously emitted window and
        // the new one.
        {
            let new_keys: HashMap<&Key, (&Value, &String)> =
                next.iter().map(|(k, v, f)| (k, (v, f))).collect();
            for (key, value, frac) in &self.emitted {
                let unchanged = new_keys
                    .get(key)
                    .map_or(false, |(v, f)| *v == value && *f == frac);
                if !unchanged {
                    out.push(Delta::delete(Tuple::with_position(
                        key.clone(),
                        value.clone(),
                        frac.clone(),
                    )));
                }
            }
        }
        {
            let old_keys: HashMap<&Key, (&Value, &String)> = self
                .emitted
                .iter()
                .map(|(k, v, f)| (k, (v, f)))
                .collect();
            for (key, value, frac) in &next {
                let unchanged = old_keys
                    .get(key)
                    .map_or(false, |(v, f)| *v == value && *f == frac);
                if !unchanged {
                    out.push(Delta::insert(Tuple::with_position(
                        key.clone(),
                        value.clone(),
                        frac.clone(),
                    )));
                }
            }
        }

        self.emitted = next;
        self.publish_shared();
        Ok(())
    }

    fn name(&self) -> &'static str {
        "topk"
    }
}
