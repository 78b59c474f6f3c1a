//! Incremental operators.
//!
//! Stateless operators relabel or drop tuples without remembering
//! anything; stateful operators (join, distinct, reduce, top-k) maintain
//! the working state that makes their output a correct delta against the
//! full re-evaluation.

mod distinct;
pub mod join;
pub mod reduce;
pub mod stateless;
pub mod topk;

pub use distinct::DistinctOp;
