//! Order-by key comparison.
//!
//! Sorting in the engine is always driven by a list of `SortSpec`s applied
//! lexicographically, with the row key as the final tiebreak. Each spec
//! controls direction, null placement, and string collation.
//!
//! Collation notes:
//! - `Locale` is numeric-aware: digit runs compare as integers, so
//!   `"a2" < "a10"`. This is the default.
//! - `Lexical` is plain code-point order.
//!
//! A sort value whose kind has no total order against its peers (bytes,
//! arrays, records, or genuinely mixed kinds) ranks as `Null`.

use core::cmp::Ordering;

use crate::value::Value;

/// Sort direction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SortOrder {
    /// Ascending order (smallest first)
    Asc,
    /// Descending order (largest first)
    Desc,
}

impl SortOrder {
    /// Applies this direction to a comparison result.
    #[inline]
    pub fn apply(&self, ord: Ordering) -> Ordering {
        match self {
            SortOrder::Asc => ord,
            SortOrder::Desc => ord.reverse(),
        }
    }
}

/// Where nulls rank relative to non-null values.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NullsOrder {
    First,
    Last,
}

/// String collation for sort keys.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StringSort {
    /// Numeric-aware collation (default): digit runs compare as integers.
    Locale,
    /// Plain code-point order.
    Lexical,
}

/// One key of an order-by clause.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SortSpec {
    pub order: SortOrder,
    pub nulls: NullsOrder,
    pub string_sort: StringSort,
}

impl SortSpec {
    /// Creates a spec with the default null placement for the direction
    /// (`First` for ascending, `Last` for descending) and locale collation.
    pub fn new(order: SortOrder) -> Self {
        let nulls = match order {
            SortOrder::Asc => NullsOrder::First,
            SortOrder::Desc => NullsOrder::Last,
        };
        Self {
            order,
            nulls,
            string_sort: StringSort::Locale,
        }
    }

    /// Ascending with defaults.
    pub fn asc() -> Self {
        Self::new(SortOrder::Asc)
    }

    /// Descending with defaults.
    pub fn desc() -> Self {
        Self::new(SortOrder::Desc)
    }

    /// Overrides null placement.
    pub fn nulls(mut self, nulls: NullsOrder) -> Self {
        self.nulls = nulls;
        self
    }

    /// Overrides string collation.
    pub fn string_sort(mut self, string_sort: StringSort) -> Self {
        self.string_sort = string_sort;
        self
    }
}

impl Default for SortSpec {
    fn default() -> Self {
        Self::asc()
    }
}

/// Returns true if the value kind participates in sort-key ordering.
fn orderable(value: &Value) -> bool {
    matches!(
        value,
        Value::Null
            | Value::Bool(_)
            | Value::Int(_)
            | Value::Float(_)
            | Value::String(_)
            | Value::DateTime(_)
    )
}

/// Compares two sort values under a spec.
///
/// Null routing happens before direction is applied, so `NULLS FIRST`
/// means first in the emitted order regardless of asc/desc.
pub fn compare_sort_values(a: &Value, b: &Value, spec: &SortSpec) -> Ordering {
    let a_null = a.is_null() || !orderable(a);
    let b_null = b.is_null() || !orderable(b);

    match (a_null, b_null) {
        (true, true) => return Ordering::Equal,
        (true, false) => {
            return match spec.nulls {
                NullsOrder::First => Ordering::Less,
                NullsOrder::Last => Ordering::Greater,
            }
        }
        (false, true) => {
            return match spec.nulls {
                NullsOrder::First => Ordering::Greater,
                NullsOrder::Last => Ordering::Less,
            }
        }
        (false, false) => {}
    }

    let ord = match (a, b) {
        (Value::String(a), Value::String(b)) => match spec.string_sort {
            StringSort::Locale => compare_numeric_strings(a, b),
            StringSort::Lexical => a.cmp(b),
        },
        _ => a.cmp(b),
    };
    spec.order.apply(ord)
}

/// Compares two full key rows lexicographically.
///
/// `specs` must be at least as long as the shorter row; missing trailing
/// values rank equal, leaving the tiebreak to the caller's row key.
pub fn compare_key_rows(a: &[Value], b: &[Value], specs: &[SortSpec]) -> Ordering {
    for (i, spec) in specs.iter().enumerate() {
        let av = a.get(i).unwrap_or(&Value::Null);
        let bv = b.get(i).unwrap_or(&Value::Null);
        let ord = compare_sort_values(av, bv, spec);
        if ord != Ordering::Equal {
            return ord;
        }
    }
    Ordering::Equal
}

/// Numeric-aware string comparison: maximal digit runs compare as
/// integers (longer run of equal numeric value loses to avoid ties:
/// leading zeros compare shorter-first), everything else by code point.
pub fn compare_numeric_strings(a: &str, b: &str) -> Ordering {
    let mut ab = a.as_bytes();
    let mut bb = b.as_bytes();

    loop {
        match (ab.first(), bb.first()) {
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(&ca), Some(&cb)) => {
                if ca.is_ascii_digit() && cb.is_ascii_digit() {
                    let (a_run, a_rest) = split_digit_run(ab);
                    let (b_run, b_rest) = split_digit_run(bb);
                    let ord = compare_digit_runs(a_run, b_run);
                    if ord != Ordering::Equal {
                        return ord;
                    }
                    ab = a_rest;
                    bb = b_rest;
                } else {
                    if ca != cb {
                        return ca.cmp(&cb);
                    }
                    ab = &ab[1..];
                    bb = &bb[1..];
                }
            }
        }
    }
}

fn split_digit_run(s: &[u8]) -> (&[u8], &[u8]) {
    let end = s.iter().position(|b| !b.is_ascii_digit()).unwrap_or(s.len());
    s.split_at(end)
}

fn compare_digit_runs(a: &[u8], b: &[u8]) -> Ordering {
    let a_trim = trim_leading_zeros(a);
    let b_trim = trim_leading_zeros(b);
    // More significant digits wins; equal length compares digit by digit.
    a_trim
        .len()
        .cmp(&b_trim.len())
        .then_with(|| a_trim.cmp(b_trim))
        // Equal numeric value: fewer leading zeros sorts first.
        .then_with(|| a.len().cmp(&b.len()))
}

fn trim_leading_zeros(s: &[u8]) -> &[u8] {
    let start = s.iter().position(|&b| b != b'0').unwrap_or(s.len());
    &s[start..]
}
