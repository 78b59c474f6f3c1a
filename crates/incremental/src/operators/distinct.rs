//! Incremental distinct operator.

use hashbrown::HashMap;
use vela_core::{Error, Result};

use crate::delta::{consolidate, Delta, DeltaBatch, Tuple};
use crate::graph::Operator;

/// Collapses multiplicities to set semantics.
///
/// Per tuple identity the operator holds the current net multiplicity and
/// emits exactly one copy on the 0 → positive transition and one
/// retraction on the positive → 0 transition. Everything in between is
/// silent.
pub struct DistinctOp {
    counts: HashMap<Tuple, i32>,
}

impl Default for DistinctOp {
    fn default() -> Self {
        Self::new()
    }
}

impl DistinctOp {
    pub fn new() -> Self {
        Self {
            counts: HashMap::new(),
        }
    }
}

impl Operator for DistinctOp {
    fn on_batch(&mut self, _port: usize, batch: DeltaBatch, out: &mut DeltaBatch) -> Result<()> {
        // Consolidate first so an in-batch delete+insert of the same tuple
        // cannot masquerade as a retraction of unknown state.
        for delta in consolidate(batch) {
            let entry = self.counts.entry(delta.data.clone()).or_insert(0);
            let old = *entry;
            let new = old + delta.diff;
            if new < 0 {
                return Err(Error::invariant(
                    "distinct received a retraction for an absent tuple",
                ));
            }
            *entry = new;

            if old == 0 && new > 0 {
                out.push(Delta::insert(delta.data));
            } else if old > 0 && new == 0 {
                self.counts.remove(&delta.data);
                out.push(Delta::delete(delta.data));
            }
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "distinct"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;
    use vela_core::{Key, Value};

    fn t(key: i64, v: i64) -> Tuple {
        Tuple::new(Key::Int(key), Value::Int(v))
    }

    fn feed(op: &mut DistinctOp, batch: DeltaBatch) -> DeltaBatch {
        let mut out = DeltaBatch::new();
        op.on_batch(0, batch, &mut out).unwrap();
        out
    }

    #[test]
    fn test_duplicate_insert_emits_once() {
        let mut op = DistinctOp::new();
        let out = feed(
            &mut op,
            vec![Delta::insert(t(1, 1)), Delta::insert(t(1, 1))],
        );
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].diff, 1);
    }

    #[test]
    fn test_retraction_only_on_last_copy() {
        let mut op = DistinctOp::new();
        feed(
            &mut op,
            vec![Delta::insert(t(1, 1)), Delta::insert(t(1, 1))],
        );
        // First delete: still one copy left, nothing emitted.
        let out = feed(&mut op, vec![Delta::delete(t(1, 1))]);
        assert!(out.is_empty());
        // Second delete: transition to zero.
        let out = feed(&mut op, vec![Delta::delete(t(1, 1))]);
        assert_eq!(out.len(), 1);
        assert!(out[0].is_delete());
    }

    #[test]
    fn test_idempotence_two_inserts_one_delete() {
        let mut op = DistinctOp::new();
        let all = feed(
            &mut op,
            vec![
                Delta::insert(t(1, 1)),
                Delta::insert(t(1, 1)),
                Delta::delete(t(1, 1)),
            ],
        );
        // Net effect equals a single insert.
        let net: i32 = all.iter().map(|d| d.diff).sum();
        assert_eq!(net, 1);
    }

    #[test]
    fn test_unknown_retraction_is_fatal() {
        let mut op = DistinctOp::new();
        let mut out = DeltaBatch::new();
        let err = op
            .on_batch(0, vec![Delta::delete(t(9, 9))], &mut out)
            .unwrap_err();
        assert!(matches!(err, Error::InvariantViolation { .. }));
    }
}
