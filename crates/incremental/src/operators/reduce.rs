//! Incremental group-by with aggregates.
//!
//! Each group holds enough aggregate state to apply additions and
//! removals without rescanning: count/sum/avg are commutative groups,
//! min/max keep a sorted multiset of contributions so retracting the
//! current extreme promotes the next one.
//!
//! Whenever a group's output changes, the operator retracts the previous
//! group row and inserts the new one; a group whose net row count drops
//! to zero simply retracts.

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::vec::Vec;
use hashbrown::{HashMap, HashSet};
use vela_core::{Error, Key, Record, Result, Value};

use crate::delta::{consolidate, Delta, DeltaBatch, Tuple};
use crate::graph::Operator;

/// Aggregate functions supported by `reduce`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AggregateKind {
    Count,
    Sum,
    Avg,
    Min,
    Max,
}

/// One aggregate column of a group-by.
pub struct AggregateSpec {
    /// Output field name.
    pub name: String,
    pub kind: AggregateKind,
    /// Extracts the contribution from an input tuple. `Null`
    /// contributions are skipped by every kind except `Count`.
    pub value: Box<dyn Fn(&Tuple) -> Value>,
}

/// Derives the group identity from an input tuple: a group key plus the
/// named group-by output fields.
pub type GroupKeyFn = Box<dyn Fn(&Tuple) -> (Key, Vec<(String, Value)>)>;

/// Configuration for a reduce node.
pub struct ReduceConfig {
    pub group_key: GroupKeyFn,
    pub aggregates: Vec<AggregateSpec>,
}

/// Per-aggregate incremental state.
enum AggState {
    Count {
        count: i64,
    },
    Sum {
        sum: f64,
        count: i64,
    },
    Avg {
        sum: f64,
        count: i64,
    },
    /// Sorted multiset of contributions; also used for Max (read from
    /// the other end).
    Extremes {
        values: BTreeMap<Value, i64>,
    },
}

impl AggState {
    fn new(kind: AggregateKind) -> Self {
        match kind {
            AggregateKind::Count => AggState::Count { count: 0 },
            AggregateKind::Sum => AggState::Sum { sum: 0.0, count: 0 },
            AggregateKind::Avg => AggState::Avg { sum: 0.0, count: 0 },
            AggregateKind::Min | AggregateKind::Max => AggState::Extremes {
                values: BTreeMap::new(),
            },
        }
    }

    fn apply(&mut self, contribution: &Value, diff: i32) {
        match self {
            AggState::Count { count } => *count += diff as i64,
            AggState::Sum { sum, count } | AggState::Avg { sum, count } => {
                if let Some(v) = contribution.as_numeric() {
                    *sum += v * diff as f64;
                    *count += diff as i64;
                }
            }
            AggState::Extremes { values } => {
                if !contribution.is_null() {
                    let entry = values.entry(contribution.clone()).or_insert(0);
                    *entry += diff as i64;
                    if *entry <= 0 {
                        values.remove(contribution);
                    }
                }
            }
        }
    }

    fn output(&self, kind: AggregateKind) -> Value {
        match self {
            AggState::Count { count } => Value::Int(*count),
            AggState::Sum { sum, count } => {
                if *count == 0 {
                    Value::Null
                } else {
                    Value::Float(*sum)
                }
            }
            AggState::Avg { sum, count } => {
                if *count == 0 {
                    Value::Null
                } else {
                    Value::Float(*sum / *count as f64)
                }
            }
            AggState::Extremes { values } => {
                let extreme = match kind {
                    AggregateKind::Min => values.keys().next(),
                    AggregateKind::Max => values.keys().next_back(),
                    _ => None,
                };
                extreme.cloned().unwrap_or(Value::Null)
            }
        }
    }
}

struct GroupState {
    fields: Vec<(String, Value)>,
    /// Net number of input rows in the group.
    rows: i64,
    aggs: Vec<AggState>,
    /// The tuple last emitted for this group, retracted on change.
    emitted: Option<Tuple>,
}

/// Group-by + aggregates operator.
pub struct ReduceOp {
    config: ReduceConfig,
    groups: HashMap<Key, GroupState>,
}

impl ReduceOp {
    pub fn new(config: ReduceConfig) -> Self {
        Self {
            config,
            groups: HashMap::new(),
        }
    }

    fn group_output(&self, key: &Key, state: &GroupState) -> Tuple {
        let mut record = Record::new();
        for (name, value) in &state.fields {
            record.set(name.clone(), value.clone());
        }
        for (spec, agg) in self.config.aggregates.iter().zip(&state.aggs) {
            record.set(spec.name.clone(), agg.output(spec.kind));
        }
        Tuple::new(key.clone(), Value::Record(record))
    }
}

impl Operator for ReduceOp {
    fn on_batch(&mut self, _port: usize, batch: DeltaBatch, out: &mut DeltaBatch) -> Result<()> {
        let mut touched: HashSet<Key> = HashSet::new();

        for delta in consolidate(batch) {
            let (group_key, fields) = (self.config.group_key)(&delta.data);
            let state = self.groups.entry(group_key.clone()).or_insert_with(|| GroupState {
                fields,
                rows: 0,
                aggs: self
                    .config
                    .aggregates
                    .iter()
                    .map(|spec| AggState::new(spec.kind))
                    .collect(),
                emitted: None,
            });
            state.rows += delta.diff as i64;
            if state.rows < 0 {
                return Err(Error::invariant(
                    "reduce received retractions exceeding group membership",
                ));
            }
            for (spec, agg) in self.config.aggregates.iter().zip(state.aggs.iter_mut()) {
                let contribution = (spec.value)(&delta.data);
                agg.apply(&contribution, delta.diff);
            }
            touched.insert(group_key);
        }

        for key in touched {
            let state = self.groups.get(&key).expect("touched group exists");
            let next = if state.rows > 0 {
                Some(self.group_output(&key, state))
            } else {
                None
            };
            let state = self.groups.get_mut(&key).expect("touched group exists");
            if state.emitted == next {
                continue;
            }
            if let Some(previous) = state.emitted.take() {
                out.push(Delta::delete(previous));
            }
            if let Some(tuple) = next.clone() {
                out.push(Delta::insert(tuple));
            }
            state.emitted = next;
            if state.rows == 0 {
                self.groups.remove(&key);
            }
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "reduce"
    }
}
