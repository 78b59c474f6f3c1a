//! Vela Query - the query IR and its compiler.
//!
//! The engine consumes a pre-built relational IR (`QueryIr`): one query
//! block with a driving collection, equi-joins, a WHERE expression,
//! optional group-by with aggregates, projection, order-by and
//! limit/offset. `compile` turns the IR into a dataflow graph plus the
//! per-collection subscription plans the driver needs:
//!
//! - the WHERE fragment each source collection can evaluate by itself
//!   (pushdown),
//! - which join-inner collections may be loaded lazily by key,
//! - whether the order-by can be fed bounded, in sort order, from a
//!   single collection's sorted index.

#![no_std]

extern crate alloc;

pub mod ast;
pub mod compiler;
pub mod ir;

pub use ast::{BinaryOp, Expr};
pub use compiler::{compile, CompiledQuery, LazyPlan, OrderedPlan};
pub use ir::{
    AggregateExpr, CollectionId, CollectionRef, GroupBy, JoinClause, OrderByKey, QueryIr,
};
