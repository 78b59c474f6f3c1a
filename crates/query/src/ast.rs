//! Expression AST.
//!
//! The basic-expression tree shared by WHERE clauses, join keys,
//! projections and order-by keys. Expressions evaluate against either a
//! *scoped* context (a record of collection alias → row value, used
//! upstream of grouping) or a *flat* record (a group-by output row,
//! where columns resolve by name alone).
//!
//! Comparison and boolean operators follow SQL three-valued logic:
//! an operand of `Null` yields `Null`, and WHERE treats anything but
//! `Bool(true)` as non-matching.

use alloc::boxed::Box;
use alloc::string::String;
use alloc::vec::Vec;
use hashbrown::HashSet;
use vela_core::{Record, Value};

/// Binary operators.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BinaryOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
    Add,
    Sub,
    Mul,
}

/// An expression over one or more collections.
#[derive(Clone, Debug, PartialEq)]
pub enum Expr {
    /// A column of a collection, addressed by alias and field name.
    Column { collection: String, name: String },
    /// A literal value.
    Literal(Value),
    /// A binary operation.
    Binary {
        op: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    /// Logical negation (three-valued).
    Not(Box<Expr>),
    /// Null test; never yields `Null` itself.
    IsNull(Box<Expr>),
}

impl Expr {
    /// Column reference.
    pub fn col(collection: impl Into<String>, name: impl Into<String>) -> Self {
        Expr::Column {
            collection: collection.into(),
            name: name.into(),
        }
    }

    /// Literal.
    pub fn lit(value: impl Into<Value>) -> Self {
        Expr::Literal(value.into())
    }

    fn binary(op: BinaryOp, left: Expr, right: Expr) -> Self {
        Expr::Binary {
            op,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    pub fn eq(self, other: Expr) -> Self {
        Expr::binary(BinaryOp::Eq, self, other)
    }

    pub fn ne(self, other: Expr) -> Self {
        Expr::binary(BinaryOp::Ne, self, other)
    }

    pub fn lt(self, other: Expr) -> Self {
        Expr::binary(BinaryOp::Lt, self, other)
    }

    pub fn le(self, other: Expr) -> Self {
        Expr::binary(BinaryOp::Le, self, other)
    }

    pub fn gt(self, other: Expr) -> Self {
        Expr::binary(BinaryOp::Gt, self, other)
    }

    pub fn ge(self, other: Expr) -> Self {
        Expr::binary(BinaryOp::Ge, self, other)
    }

    pub fn and(self, other: Expr) -> Self {
        Expr::binary(BinaryOp::And, self, other)
    }

    pub fn or(self, other: Expr) -> Self {
        Expr::binary(BinaryOp::Or, self, other)
    }

    pub fn is_null(self) -> Self {
        Expr::IsNull(Box::new(self))
    }

    /// Evaluates against a scoped context: `ctx` maps collection alias
    /// to that collection's row value.
    pub fn eval_scoped(&self, ctx: &Record) -> Value {
        self.eval_with(&|collection, name| {
            ctx.get(collection)
                .and_then(Value::as_record)
                .and_then(|r| r.get(name))
                .cloned()
                .unwrap_or(Value::Null)
        })
    }

    /// Evaluates against a flat record: columns resolve by field name,
    /// ignoring the collection qualifier. Used for group-by outputs.
    pub fn eval_flat(&self, record: &Record) -> Value {
        self.eval_with(&|_, name| record.get(name).cloned().unwrap_or(Value::Null))
    }

    fn eval_with(&self, resolve: &dyn Fn(&str, &str) -> Value) -> Value {
        match self {
            Expr::Column { collection, name } => resolve(collection, name),
            Expr::Literal(value) => value.clone(),
            Expr::Binary { op, left, right } => {
                eval_binary(*op, left.eval_with(resolve), right.eval_with(resolve))
            }
            Expr::Not(inner) => match inner.eval_with(resolve) {
                Value::Bool(b) => Value::Bool(!b),
                Value::Null => Value::Null,
                _ => Value::Null,
            },
            Expr::IsNull(inner) => Value::Bool(inner.eval_with(resolve).is_null()),
        }
    }

    /// Evaluates as a WHERE predicate: only `Bool(true)` matches.
    pub fn matches_scoped(&self, ctx: &Record) -> bool {
        self.eval_scoped(ctx) == Value::Bool(true)
    }

    /// Collects the collection aliases this expression references.
    pub fn referenced_collections(&self, out: &mut HashSet<String>) {
        match self {
            Expr::Column { collection, .. } => {
                out.insert(collection.clone());
            }
            Expr::Literal(_) => {}
            Expr::Binary { left, right, .. } => {
                left.referenced_collections(out);
                right.referenced_collections(out);
            }
            Expr::Not(inner) | Expr::IsNull(inner) => inner.referenced_collections(out),
        }
    }

    /// Returns true if every column reference targets `collection`.
    pub fn references_only(&self, collection: &str) -> bool {
        let mut refs = HashSet::new();
        self.referenced_collections(&mut refs);
        refs.iter().all(|c| c == collection)
    }

    /// Flattens a top-level AND chain into its conjuncts.
    pub fn conjuncts(self) -> Vec<Expr> {
        match self {
            Expr::Binary {
                op: BinaryOp::And,
                left,
                right,
            } => {
                let mut out = left.conjuncts();
                out.extend(right.conjuncts());
                out
            }
            other => alloc::vec![other],
        }
    }

    /// Rebuilds an AND chain from conjuncts; `None` for an empty list.
    pub fn conjoin(conjuncts: Vec<Expr>) -> Option<Expr> {
        conjuncts.into_iter().reduce(|acc, e| acc.and(e))
    }
}

fn eval_binary(op: BinaryOp, left: Value, right: Value) -> Value {
    match op {
        BinaryOp::And => match (truth(&left), truth(&right)) {
            (Some(false), _) | (_, Some(false)) => Value::Bool(false),
            (Some(true), Some(true)) => Value::Bool(true),
            _ => Value::Null,
        },
        BinaryOp::Or => match (truth(&left), truth(&right)) {
            (Some(true), _) | (_, Some(true)) => Value::Bool(true),
            (Some(false), Some(false)) => Value::Bool(false),
            _ => Value::Null,
        },
        BinaryOp::Eq | BinaryOp::Ne | BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => {
            if left.is_null() || right.is_null() {
                return Value::Null;
            }
            let ord = left.cmp(&right);
            let result = match op {
                BinaryOp::Eq => ord.is_eq(),
                BinaryOp::Ne => ord.is_ne(),
                BinaryOp::Lt => ord.is_lt(),
                BinaryOp::Le => ord.is_le(),
                BinaryOp::Gt => ord.is_gt(),
                BinaryOp::Ge => ord.is_ge(),
                _ => unreachable!(),
            };
            Value::Bool(result)
        }
        BinaryOp::Add | BinaryOp::Sub | BinaryOp::Mul => {
            match (left.as_numeric(), right.as_numeric()) {
                (Some(a), Some(b)) => {
                    let result = match op {
                        BinaryOp::Add => a + b,
                        BinaryOp::Sub => a - b,
                        BinaryOp::Mul => a * b,
                        _ => unreachable!(),
                    };
                    // Integer inputs keep integer results when exact.
                    if left.as_int().is_some() && right.as_int().is_some() {
                        Value::Int(result as i64)
                    } else {
                        Value::Float(result)
                    }
                }
                _ => Value::Null,
            }
        }
    }
}

fn truth(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        _ => None,
    }
}
