//! The query IR consumed by the compiler.
//!
//! One relational block: a driving collection, a chain of equi-joins,
//! an optional WHERE expression, optional group-by with aggregates, a
//! projection, order-by keys and limit/offset. The surface query builder
//! that produces this IR lives outside the engine.

use alloc::string::String;
use alloc::vec::Vec;
use vela_core::SortSpec;
use vela_incremental::{AggregateKind, JoinKind};

use crate::ast::Expr;

/// Identifies a source collection.
pub type CollectionId = String;

/// A collection together with the alias its columns are addressed by.
#[derive(Clone, Debug)]
pub struct CollectionRef {
    pub collection: CollectionId,
    pub alias: String,
}

impl CollectionRef {
    pub fn new(collection: impl Into<CollectionId>, alias: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            alias: alias.into(),
        }
    }
}

/// One join clause: the joined collection plus the equi-join keys.
/// `left` evaluates over the context accumulated so far, `right` over
/// the joined collection alone.
#[derive(Clone, Debug)]
pub struct JoinClause {
    pub collection: CollectionRef,
    pub kind: JoinKind,
    pub left: Expr,
    pub right: Expr,
}

/// An aggregate output column.
#[derive(Clone, Debug)]
pub struct AggregateExpr {
    /// Output field name.
    pub name: String,
    pub kind: AggregateKind,
    /// Aggregated expression; `None` only for `Count`.
    pub arg: Option<Expr>,
}

/// Group-by clause: named grouping keys plus aggregate columns.
#[derive(Clone, Debug)]
pub struct GroupBy {
    pub keys: Vec<(String, Expr)>,
    pub aggregates: Vec<AggregateExpr>,
}

/// One order-by key.
#[derive(Clone, Debug)]
pub struct OrderByKey {
    pub expr: Expr,
    pub spec: SortSpec,
}

impl OrderByKey {
    pub fn new(expr: Expr, spec: SortSpec) -> Self {
        Self { expr, spec }
    }
}

/// A complete query block.
#[derive(Clone, Debug)]
pub struct QueryIr {
    pub from: CollectionRef,
    pub joins: Vec<JoinClause>,
    pub where_clause: Option<Expr>,
    pub group_by: Option<GroupBy>,
    /// Projected output columns. `None` keeps the natural row shape:
    /// the driving row for single-collection queries, the alias context
    /// for joins, the flat group record for grouped queries.
    pub select: Option<Vec<(String, Expr)>>,
    pub distinct: bool,
    pub order_by: Vec<OrderByKey>,
    pub limit: Option<usize>,
    pub offset: usize,
}

impl QueryIr {
    /// A bare `SELECT * FROM collection` block to build on.
    pub fn from_collection(collection: impl Into<CollectionId>, alias: impl Into<String>) -> Self {
        Self {
            from: CollectionRef::new(collection, alias),
            joins: Vec::new(),
            where_clause: None,
            group_by: None,
            select: None,
            distinct: false,
            order_by: Vec::new(),
            limit: None,
            offset: 0,
        }
    }
}
