//! IR → dataflow compiler.
//!
//! One walk over the query block wires the operator graph and derives the
//! subscription plans:
//!
//! - the maximal single-collection conjunction of the WHERE clause per
//!   source (pushdown); the graph keeps the full WHERE as a filter, so a
//!   source that honors the pushdown only approximately is re-filtered,
//! - join-inner collections whose rows can be point-loaded on key demand
//!   instead of scanned (lazy plans),
//! - whether the order-by can be fed bounded and in sort order from one
//!   collection's sorted index (ordered plan).
//!
//! `LIMIT`/`OFFSET` without `ORDER BY` is rejected here.

use alloc::boxed::Box;
use alloc::string::String;
use alloc::vec::Vec;
use hashbrown::{HashMap, HashSet};
use vela_core::{Error, Key, Record, Result, SortSpec, Value};
use vela_incremental::{
    ConsolidateOp, DistinctOp, FilterOp, Graph, InputHandle, JoinConfig, JoinDemand, JoinKind,
    JoinOp, MapOp, NodeId, ReduceConfig, ReduceOp, TopKConfig, TopKHandle, TopKOp, Tuple,
};
use vela_incremental::{AggregateKind, AggregateSpec};

use crate::ast::Expr;
use crate::ir::{CollectionId, QueryIr};

/// A join-inner collection eligible for lazy, on-demand loading.
pub struct LazyPlan {
    pub collection: CollectionId,
    pub alias: String,
    /// The inner-collection field the join probes. Point loading applies
    /// when this is the collection's key field; otherwise the driver
    /// falls back to loading the full filtered state.
    pub key_field: String,
    /// Drained after each run for join keys that found no inner rows.
    pub demand: JoinDemand,
}

/// An order-by that can be fed bounded, in sort order, from one
/// collection's sorted index.
pub struct OrderedPlan {
    pub collection: CollectionId,
    pub alias: String,
    pub offset: usize,
    pub limit: usize,
    pub specs: Vec<SortSpec>,
    /// Pure projections over the collection; the driver evaluates them
    /// on raw source values to decide what a change can affect.
    pub sort_exprs: Vec<Expr>,
}

/// A compiled query: the graph plus everything the subscription driver
/// needs to feed it.
pub struct CompiledQuery {
    pub graph: Graph,
    /// Sink node carrying the terminal (consolidated) stream.
    pub terminal: NodeId,
    /// Alias → send handle for that collection's input.
    pub inputs: HashMap<String, InputHandle>,
    /// Alias → collection, in FROM-then-JOIN order.
    pub sources: Vec<(String, CollectionId)>,
    /// Alias → WHERE fragment the source may evaluate by itself.
    pub pushdown: HashMap<String, Expr>,
    pub lazy: Vec<LazyPlan>,
    pub ordered: Option<OrderedPlan>,
    /// Present when the query has an ORDER BY.
    pub topk: Option<TopKHandle>,
}

impl core::fmt::Debug for CompiledQuery {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("CompiledQuery")
            .field("terminal", &self.terminal)
            .field("sources", &self.sources)
            .finish()
    }
}

/// Compiles a query block into a dataflow graph.
pub fn compile(ir: &QueryIr) -> Result<CompiledQuery> {
    if (ir.limit.is_some() || ir.offset > 0) && ir.order_by.is_empty() {
        return Err(Error::compile("LIMIT/OFFSET requires ORDER BY"));
    }
    if let Some(group) = &ir.group_by {
        if group.keys.is_empty() && group.aggregates.is_empty() {
            return Err(Error::compile("GROUP BY requires keys or aggregates"));
        }
        for agg in &group.aggregates {
            if agg.arg.is_none() && agg.kind != AggregateKind::Count {
                return Err(Error::compile("only COUNT may omit its argument"));
            }
        }
    }

    let mut graph = Graph::new();
    let mut inputs = HashMap::new();
    let mut sources = Vec::new();
    let mut lazy = Vec::new();

    // Driving collection: wrap raw rows into an alias-scoped context.
    let mut stream = add_source(&mut graph, &mut inputs, &mut sources, &ir.from)?;

    // Join chain.
    for join in &ir.joins {
        let inner = add_source(&mut graph, &mut inputs, &mut sources, &join.collection)?;
        let alias = join.collection.alias.clone();

        let (left_key, right_key): (
            Box<dyn Fn(&Tuple) -> Option<Value>>,
            Box<dyn Fn(&Tuple) -> Option<Value>>,
        ) = if join.kind == JoinKind::Cross {
            (
                Box::new(|_: &Tuple| Some(Value::Bool(true))),
                Box::new(|_: &Tuple| Some(Value::Bool(true))),
            )
        } else {
            let left_expr = join.left.clone();
            let right_expr = join.right.clone();
            (
                Box::new(move |t: &Tuple| scoped_key(&left_expr, t)),
                Box::new(move |t: &Tuple| scoped_key(&right_expr, t)),
            )
        };

        let merge = Box::new(|l: Option<&Tuple>, r: Option<&Tuple>| {
            let mut ctx = Record::new();
            for side in [l, r].into_iter().flatten() {
                if let Some(record) = side.payload.as_record() {
                    for (name, value) in record.iter() {
                        ctx.set(name, value.clone());
                    }
                }
            }
            Tuple::new(
                Key::composite(l.map(|t| &t.key), r.map(|t| &t.key)),
                Value::Record(ctx),
            )
        });

        let mut op = JoinOp::new(JoinConfig {
            kind: join.kind,
            left_key,
            right_key,
            merge,
        });

        // Lazy loading applies when the inner side of an inner or left
        // join is probed by a single inner column.
        if matches!(join.kind, JoinKind::Inner | JoinKind::Left) {
            if let Expr::Column { collection, name } = &join.right {
                if *collection == alias {
                    let demand = JoinDemand::new();
                    op = op.with_demand(demand.clone());
                    lazy.push(LazyPlan {
                        collection: join.collection.collection.clone(),
                        alias: alias.clone(),
                        key_field: name.clone(),
                        demand,
                    });
                }
            }
        }

        stream = graph.add_node(Box::new(op), &[stream, inner])?;
    }

    // Full WHERE stays in the graph; sources may deliver supersets.
    let mut pushdown = HashMap::new();
    if let Some(where_clause) = &ir.where_clause {
        let mut per_alias: HashMap<String, Vec<Expr>> = HashMap::new();
        for conjunct in where_clause.clone().conjuncts() {
            let mut refs = HashSet::new();
            conjunct.referenced_collections(&mut refs);
            if refs.len() == 1 {
                let alias = refs.into_iter().next().expect("one reference");
                per_alias.entry(alias).or_default().push(conjunct);
            }
        }
        for (alias, conjuncts) in per_alias {
            if let Some(expr) = Expr::conjoin(conjuncts) {
                pushdown.insert(alias, expr);
            }
        }

        let predicate = where_clause.clone();
        stream = graph.add_node(
            Box::new(FilterOp::new(move |t: &Tuple| {
                t.payload
                    .as_record()
                    .map(|ctx| predicate.matches_scoped(ctx))
                    .unwrap_or(false)
            })),
            &[stream],
        )?;
    }

    // Group-by: the stream switches to flat group records.
    let grouped = ir.group_by.is_some();
    if let Some(group) = &ir.group_by {
        let key_exprs: Vec<(String, Expr)> = group.keys.clone();
        let group_key = Box::new(move |t: &Tuple| {
            let ctx = t.payload.as_record();
            let mut fields = Vec::with_capacity(key_exprs.len());
            let mut values = Vec::with_capacity(key_exprs.len());
            for (name, expr) in &key_exprs {
                let value = ctx
                    .map(|c| expr.eval_scoped(c))
                    .unwrap_or(Value::Null);
                fields.push((name.clone(), value.clone()));
                values.push(value);
            }
            (group_key_of(&values), fields)
        });

        let aggregates = group
            .aggregates
            .iter()
            .map(|agg| {
                let arg = agg.arg.clone();
                AggregateSpec {
                    name: agg.name.clone(),
                    kind: agg.kind,
                    value: Box::new(move |t: &Tuple| match (&arg, t.payload.as_record()) {
                        (Some(expr), Some(ctx)) => expr.eval_scoped(ctx),
                        (None, _) => Value::Int(1),
                        _ => Value::Null,
                    }),
                }
            })
            .collect();

        stream = graph.add_node(
            Box::new(ReduceOp::new(ReduceConfig {
                group_key,
                aggregates,
            })),
            &[stream],
        )?;
    }

    // Projection of the result value, shared by both tails below.
    let project = result_projection(ir, grouped);

    let mut topk_handle = None;
    if ir.order_by.is_empty() {
        stream = graph.add_node(
            Box::new(MapOp::new(move |t: &Tuple| {
                Tuple::new(t.key.clone(), project(t))
            })),
            &[stream],
        )?;
        if ir.distinct {
            stream = graph.add_node(Box::new(DistinctOp::new()), &[stream])?;
        }
    } else {
        // Pair the projected value with its evaluated sort keys so the
        // top-k can order rows the projection no longer exposes.
        let order_exprs: Vec<Expr> = ir.order_by.iter().map(|k| k.expr.clone()).collect();
        let pair_grouped = grouped;
        stream = graph.add_node(
            Box::new(MapOp::new(move |t: &Tuple| {
                let sort_values: Vec<Value> = order_exprs
                    .iter()
                    .map(|expr| eval_in_stream(expr, t, pair_grouped))
                    .collect();
                Tuple::new(
                    t.key.clone(),
                    Value::Array(alloc::vec![project(t), Value::Array(sort_values)]),
                )
            })),
            &[stream],
        )?;
        if ir.distinct {
            stream = graph.add_node(Box::new(DistinctOp::new()), &[stream])?;
        }

        let specs: Vec<SortSpec> = ir.order_by.iter().map(|k| k.spec).collect();
        let topk = TopKOp::new(TopKConfig {
            specs,
            sort_key: Box::new(|t: &Tuple| match &t.payload {
                Value::Array(parts) => match parts.get(1) {
                    Some(Value::Array(keys)) => keys.clone(),
                    _ => Vec::new(),
                },
                _ => Vec::new(),
            }),
            offset: ir.offset,
            limit: ir.limit,
        });
        topk_handle = Some(topk.handle());
        stream = graph.add_node(Box::new(topk), &[stream])?;

        // Strip the sort keys, keeping the stamped position.
        stream = graph.add_node(
            Box::new(MapOp::new(|t: &Tuple| {
                let value = match &t.payload {
                    Value::Array(parts) => parts.first().cloned().unwrap_or(Value::Null),
                    other => other.clone(),
                };
                Tuple {
                    key: t.key.clone(),
                    payload: value,
                    position: t.position.clone(),
                }
            })),
            &[stream],
        )?;
    }

    let terminal = graph.add_node(Box::new(ConsolidateOp), &[stream])?;
    graph.finalize();

    let ordered = detect_ordered(ir);
    if let Some(plan) = &ordered {
        log::debug!(
            "order-by over `{}` compiled as bounded index scan (offset {}, limit {})",
            plan.collection,
            plan.offset,
            plan.limit
        );
    }

    Ok(CompiledQuery {
        graph,
        terminal,
        inputs,
        sources,
        pushdown,
        lazy,
        ordered,
        topk: topk_handle,
    })
}

fn add_source(
    graph: &mut Graph,
    inputs: &mut HashMap<String, InputHandle>,
    sources: &mut Vec<(String, CollectionId)>,
    source: &crate::ir::CollectionRef,
) -> Result<NodeId> {
    if inputs.contains_key(&source.alias) {
        return Err(Error::compile("duplicate collection alias"));
    }
    let (input, handle) = graph.add_input()?;
    inputs.insert(source.alias.clone(), handle);
    sources.push((source.alias.clone(), source.collection.clone()));

    let alias = source.alias.clone();
    graph.add_node(
        Box::new(MapOp::new(move |t: &Tuple| {
            let mut ctx = Record::new();
            ctx.set(alias.clone(), t.payload.clone());
            Tuple::new(t.key.clone(), Value::Record(ctx))
        })),
        &[input],
    )
}

/// Join-key extraction: a null key never matches.
fn scoped_key(expr: &Expr, tuple: &Tuple) -> Option<Value> {
    let ctx = tuple.payload.as_record()?;
    let value = expr.eval_scoped(ctx);
    if value.is_null() {
        None
    } else {
        Some(value)
    }
}

/// Evaluates an expression in the current stream shape: alias-scoped
/// context before grouping, flat group record after.
fn eval_in_stream(expr: &Expr, tuple: &Tuple, grouped: bool) -> Value {
    match tuple.payload.as_record() {
        Some(record) if grouped => expr.eval_flat(record),
        Some(record) => expr.eval_scoped(record),
        None => Value::Null,
    }
}

/// Builds the result-value projection for the query.
fn result_projection(ir: &QueryIr, grouped: bool) -> Box<dyn Fn(&Tuple) -> Value> {
    match &ir.select {
        Some(columns) => {
            let columns = columns.clone();
            Box::new(move |t: &Tuple| {
                let mut out = Record::new();
                for (name, expr) in &columns {
                    out.set(name.clone(), eval_in_stream(expr, t, grouped));
                }
                Value::Record(out)
            })
        }
        None if grouped => Box::new(|t: &Tuple| t.payload.clone()),
        None => {
            let single = ir.joins.is_empty();
            let alias = ir.from.alias.clone();
            Box::new(move |t: &Tuple| {
                if single {
                    t.payload
                        .as_record()
                        .and_then(|ctx| ctx.get(&alias))
                        .cloned()
                        .unwrap_or(Value::Null)
                } else {
                    t.payload.clone()
                }
            })
        }
    }
}

/// Canonical group key from the evaluated grouping values.
fn group_key_of(values: &[Value]) -> Key {
    if values.len() == 1 {
        if let Some(key) = values[0].to_key() {
            return key;
        }
    }
    let mut encoded = String::new();
    for value in values {
        encode_value(value, &mut encoded);
        encoded.push('\u{1f}');
    }
    Key::Str(encoded)
}

fn encode_value(value: &Value, out: &mut String) {
    use core::fmt::Write;
    match value {
        Value::Null => out.push('n'),
        Value::Bool(b) => {
            out.push('b');
            out.push(if *b { '1' } else { '0' });
        }
        Value::Int(i) => {
            let _ = write!(out, "i{}", i);
        }
        Value::Float(f) => {
            let _ = write!(out, "f{:016x}", f.to_bits());
        }
        Value::String(s) => {
            let _ = write!(out, "s{}", s);
        }
        Value::DateTime(d) => {
            let _ = write!(out, "d{}", d);
        }
        Value::Bytes(b) => {
            out.push('x');
            for byte in b {
                let _ = write!(out, "{:02x}", byte);
            }
        }
        Value::Array(items) => {
            out.push('[');
            for item in items {
                encode_value(item, out);
                out.push(',');
            }
            out.push(']');
        }
        Value::Record(record) => {
            out.push('{');
            for (name, item) in record.iter() {
                let _ = write!(out, "{}:", name);
                encode_value(item, out);
                out.push(',');
            }
            out.push('}');
        }
    }
}

/// A query is ordered-bounded when the whole order-by is a pure
/// projection of the single driving collection and a limit bounds it.
fn detect_ordered(ir: &QueryIr) -> Option<OrderedPlan> {
    let limit = ir.limit?;
    if ir.order_by.is_empty()
        || !ir.joins.is_empty()
        || ir.group_by.is_some()
        || ir.distinct
    {
        return None;
    }
    if !ir
        .order_by
        .iter()
        .all(|k| k.expr.references_only(&ir.from.alias))
    {
        return None;
    }
    Some(OrderedPlan {
        collection: ir.from.collection.clone(),
        alias: ir.from.alias.clone(),
        offset: ir.offset,
        limit,
        specs: ir.order_by.iter().map(|k| k.spec).collect(),
        sort_exprs: ir.order_by.iter().map(|k| k.expr.clone()).collect(),
    })
}
