//! Stateless operators: map, filter, negate, concat, consolidate.

use alloc::boxed::Box;

use crate::delta::{consolidate, Delta, DeltaBatch, Tuple};
use crate::graph::Operator;
use vela_core::Result;

/// Relabels tuples; keys and multiplicities are preserved by convention
/// (the mapper may change the key when an operator genuinely re-keys the
/// stream, e.g. projecting a join product).
pub struct MapOp {
    mapper: Box<dyn Fn(&Tuple) -> Tuple>,
}

impl MapOp {
    pub fn new(mapper: impl Fn(&Tuple) -> Tuple + 'static) -> Self {
        Self {
            mapper: Box::new(mapper),
        }
    }
}

impl Operator for MapOp {
    fn on_batch(&mut self, _port: usize, batch: DeltaBatch, out: &mut DeltaBatch) -> Result<()> {
        out.extend(
            batch
                .into_iter()
                .map(|d| Delta::new((self.mapper)(&d.data), d.diff)),
        );
        Ok(())
    }

    fn name(&self) -> &'static str {
        "map"
    }
}

/// Drops tuples whose payload fails the predicate; multiplicities of
/// survivors are preserved.
pub struct FilterOp {
    predicate: Box<dyn Fn(&Tuple) -> bool>,
}

impl FilterOp {
    pub fn new(predicate: impl Fn(&Tuple) -> bool + 'static) -> Self {
        Self {
            predicate: Box::new(predicate),
        }
    }
}

impl Operator for FilterOp {
    fn on_batch(&mut self, _port: usize, batch: DeltaBatch, out: &mut DeltaBatch) -> Result<()> {
        out.extend(batch.into_iter().filter(|d| (self.predicate)(&d.data)));
        Ok(())
    }

    fn name(&self) -> &'static str {
        "filter"
    }
}

/// Flips multiplicity signs; used to derive retractions.
pub struct NegateOp;

impl Operator for NegateOp {
    fn on_batch(&mut self, _port: usize, batch: DeltaBatch, out: &mut DeltaBatch) -> Result<()> {
        out.extend(batch.into_iter().map(Delta::negate));
        Ok(())
    }

    fn name(&self) -> &'static str {
        "negate"
    }
}

/// Multiset union: forwards every input port unchanged.
pub struct ConcatOp;

impl Operator for ConcatOp {
    fn on_batch(&mut self, _port: usize, batch: DeltaBatch, out: &mut DeltaBatch) -> Result<()> {
        out.extend(batch);
        Ok(())
    }

    fn name(&self) -> &'static str {
        "concat"
    }
}

/// Consolidates each batch to canonical form: per-tuple net diffs, zeros
/// dropped. Inserted wherever an observer requires canonical batches.
pub struct ConsolidateOp;

impl Operator for ConsolidateOp {
    fn on_batch(&mut self, _port: usize, batch: DeltaBatch, out: &mut DeltaBatch) -> Result<()> {
        out.extend(consolidate(batch));
        Ok(())
    }

    fn name(&self) -> &'static str {
        "consolidate"
    }
}
