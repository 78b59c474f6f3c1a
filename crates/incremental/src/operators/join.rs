//! Incremental hash equi-join.
//!
//! Both sides keep an index from join-key value to the rows carrying that
//! value, with consolidated multiplicities. A batch on either side probes
//! the opposite index and emits the cross product with multiplicities
//! `mL · mR`, then folds the batch into its own index.
//!
//! Outer kinds additionally emit null-padded rows while the opposite
//! side's count for a key is zero, and retract them on the 0 → positive
//! transition (and re-emit on positive → 0).

use alloc::boxed::Box;
use alloc::rc::Rc;
use alloc::vec::Vec;
use core::cell::RefCell;
use hashbrown::HashMap;
use vela_core::{Error, Key, Result, Value};

use crate::delta::{consolidate, Delta, DeltaBatch, Tuple};
use crate::graph::Operator;

/// Join kinds supported by the engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JoinKind {
    Inner,
    Left,
    Right,
    Full,
    Cross,
}

impl JoinKind {
    /// Left rows without a match survive as padded rows.
    #[inline]
    fn pads_left(&self) -> bool {
        matches!(self, JoinKind::Left | JoinKind::Full)
    }

    /// Right rows without a match survive as padded rows.
    #[inline]
    fn pads_right(&self) -> bool {
        matches!(self, JoinKind::Right | JoinKind::Full)
    }
}

/// Extracts the join-key value from a tuple; `None` means the row can
/// never match (a null join key).
pub type JoinKeyFn = Box<dyn Fn(&Tuple) -> Option<Value>>;

/// Builds the joined output tuple from the two sides. `None` marks the
/// absent side of a padded outer row. The implementation must produce a
/// stable composite key, typically via `Key::composite`.
pub type JoinMergeFn = Box<dyn Fn(Option<&Tuple>, Option<&Tuple>) -> Tuple>;

/// Configuration for a join node.
pub struct JoinConfig {
    pub kind: JoinKind,
    pub left_key: JoinKeyFn,
    pub right_key: JoinKeyFn,
    pub merge: JoinMergeFn,
}

#[derive(Clone, Debug)]
struct SideRow {
    key: Key,
    payload: Value,
    mult: i32,
}

impl SideRow {
    fn as_tuple(&self) -> Tuple {
        Tuple::new(self.key.clone(), self.payload.clone())
    }
}

type SideIndex = HashMap<Value, Vec<SideRow>>;

fn side_count(rows: &[SideRow]) -> i32 {
    rows.iter().map(|r| r.mult).sum()
}

/// Folds `(key, payload, mult)` into a side index, consolidating per row
/// identity. Errors if any row's multiplicity would go negative.
fn fold_into(index: &mut SideIndex, join_key: Value, tuple: &Tuple, mult: i32) -> Result<()> {
    let rows = index.entry(join_key.clone()).or_default();
    if let Some(row) = rows
        .iter_mut()
        .find(|r| r.key == tuple.key && r.payload == tuple.payload)
    {
        row.mult += mult;
        if row.mult < 0 {
            return Err(Error::invariant("join retraction exceeds stored multiplicity"));
        }
        if row.mult == 0 {
            rows.retain(|r| r.mult != 0);
        }
    } else {
        if mult < 0 {
            return Err(Error::invariant("join received a retraction for an absent row"));
        }
        rows.push(SideRow {
            key: tuple.key.clone(),
            payload: tuple.payload.clone(),
            mult,
        });
    }
    if rows.is_empty() {
        index.remove(&join_key);
    }
    Ok(())
}

/// Join-key values the left side probed without finding right rows.
///
/// The subscription driver's lazy-matching mode drains this after each
/// run and loads the missing inner rows by key.
#[derive(Clone, Default)]
pub struct JoinDemand {
    keys: Rc<RefCell<Vec<Value>>>,
}

impl JoinDemand {
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&self, key: Value) {
        self.keys.borrow_mut().push(key);
    }

    /// Takes all recorded keys.
    pub fn drain(&self) -> Vec<Value> {
        core::mem::take(&mut *self.keys.borrow_mut())
    }
}

/// Hash equi-join operator. Port 0 is the left input, port 1 the right.
pub struct JoinOp {
    config: JoinConfig,
    left: SideIndex,
    right: SideIndex,
    demand: Option<JoinDemand>,
}

impl JoinOp {
    pub fn new(config: JoinConfig) -> Self {
        Self {
            config,
            left: SideIndex::new(),
            right: SideIndex::new(),
            demand: None,
        }
    }

    /// Records right-side misses into `demand` for lazy loading.
    pub fn with_demand(mut self, demand: JoinDemand) -> Self {
        self.demand = Some(demand);
        self
    }

    /// Join-key values the left side has probed for which the right side
    /// holds no rows. The subscription driver's lazy-matching mode loads
    /// these on demand.
    pub fn unmatched_right_keys(&self) -> Vec<Value> {
        self.left
            .keys()
            .filter(|k| !self.right.contains_key(*k))
            .cloned()
            .collect()
    }

    fn on_side(&mut self, left_side: bool, batch: DeltaBatch, out: &mut DeltaBatch) -> Result<()> {
        for delta in consolidate(batch) {
            let tuple = delta.data;
            let m = delta.diff;
            let key_fn = if left_side {
                &self.config.left_key
            } else {
                &self.config.right_key
            };
            let Some(join_key) = key_fn(&tuple) else {
                // Null join key: never matches, but outer kinds still
                // surface the row padded.
                let pads = if left_side {
                    self.config.kind.pads_left()
                } else {
                    self.config.kind.pads_right()
                };
                if pads {
                    out.push(Delta::new(self.merge_one(left_side, &tuple), m));
                }
                continue;
            };

            let (own, other) = if left_side {
                (&mut self.left, &mut self.right)
            } else {
                (&mut self.right, &mut self.left)
            };

            let own_count_before = own.get(&join_key).map(|r| side_count(r)).unwrap_or(0);

            // Probe the opposite side.
            let other_rows: Vec<SideRow> = other.get(&join_key).cloned().unwrap_or_default();
            if left_side && m > 0 && other_rows.is_empty() {
                if let Some(demand) = &self.demand {
                    demand.record(join_key.clone());
                }
            }
            for other_row in &other_rows {
                let other_tuple = other_row.as_tuple();
                let (l, r) = if left_side {
                    (Some(&tuple), Some(&other_tuple))
                } else {
                    (Some(&other_tuple), Some(&tuple))
                };
                out.push(Delta::new((self.config.merge)(l, r), m * other_row.mult));
            }

            // Own-side padding: no opposite rows at all.
            let own_pads = if left_side {
                self.config.kind.pads_left()
            } else {
                self.config.kind.pads_right()
            };
            if own_pads && other_rows.is_empty() {
                out.push(Delta::new(self.merge_one(left_side, &tuple), m));
            }

            // Fold the delta into our own index, then handle the opposite
            // side's padding transition if our count crossed zero.
            let (own, _) = if left_side {
                (&mut self.left, ())
            } else {
                (&mut self.right, ())
            };
            fold_into(own, join_key.clone(), &tuple, m)?;
            let own_count_after = if left_side {
                self.left.get(&join_key).map(|r| side_count(r)).unwrap_or(0)
            } else {
                self.right.get(&join_key).map(|r| side_count(r)).unwrap_or(0)
            };

            let other_pads = if left_side {
                self.config.kind.pads_right()
            } else {
                self.config.kind.pads_left()
            };
            if other_pads && !other_rows.is_empty() {
                let appeared = own_count_before == 0 && own_count_after > 0;
                let vanished = own_count_before > 0 && own_count_after == 0;
                if appeared || vanished {
                    let sign = if appeared { -1 } else { 1 };
                    for other_row in &other_rows {
                        let other_tuple = other_row.as_tuple();
                        out.push(Delta::new(
                            self.merge_one(!left_side, &other_tuple),
                            sign * other_row.mult,
                        ));
                    }
                }
            }
        }
        Ok(())
    }

    fn merge_one(&self, left_side: bool, tuple: &Tuple) -> Tuple {
        if left_side {
            (self.config.merge)(Some(tuple), None)
        } else {
            (self.config.merge)(None, Some(tuple))
        }
    }
}

impl Operator for JoinOp {
    fn on_batch(&mut self, port: usize, batch: DeltaBatch, out: &mut DeltaBatch) -> Result<()> {
        match port {
            0 => self.on_side(true, batch, out),
            1 => self.on_side(false, batch, out),
            _ => Err(Error::invariant("join received a batch on an unknown port")),
        }
    }

    fn name(&self) -> &'static str {
        "join"
    }
}
