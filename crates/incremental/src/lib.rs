//! Vela Incremental - the multiset dataflow runtime.
//!
//! Queries compile into an acyclic graph of operators over signed-
//! multiplicity batches (`Delta<Tuple>`). Deltas with positive diffs are
//! insertions, negative diffs retractions; operators are multiset-semantic,
//! so the consolidated meaning of the terminal stream always equals a full
//! re-evaluation of the query.
//!
//! # Pieces
//!
//! - `delta`: `Delta`, `Tuple` and batch consolidation
//! - `graph`: the operator DAG and its run-to-quiescence scheduler
//! - `operators`: stateless (map/filter/negate/concat/consolidate) and
//!   stateful (join/distinct/reduce/top-k) operators
//! - `fractional`: lexicographic fractional indexes stamped by the top-k
//!   operator so consumers can order results with a plain string compare

#![no_std]

extern crate alloc;

pub mod delta;
pub mod fractional;
pub mod graph;
pub mod operators;

pub use delta::{consolidate, Delta, DeltaBatch, Tuple};
pub use graph::{Graph, InputHandle, NodeId, Operator};
pub use operators::join::{JoinConfig, JoinDemand, JoinKind, JoinOp};
pub use operators::reduce::{AggregateKind, AggregateSpec, ReduceConfig, ReduceOp};
pub use operators::stateless::{ConcatOp, ConsolidateOp, FilterOp, MapOp, NegateOp};
pub use operators::topk::{TopKConfig, TopKHandle, TopKOp};
pub use operators::DistinctOp;
