//! Dataflow graph and scheduler.
//!
//! Operators form an acyclic graph. Edges are created when a node is
//! added: every input must already exist, so node ids are topologically
//! ordered by construction and one in-order sweep per pass suffices.
//!
//! `run()` drains all pending batches to quiescence on the caller's
//! thread. Batches delivered through an `InputHandle` *during* a run are
//! picked up in the same run (the scheduler re-polls external queues
//! between sweeps); there are no timers and no internal threads.

use alloc::boxed::Box;
use alloc::rc::Rc;
use alloc::vec::Vec;
use core::cell::RefCell;
use hashbrown::HashMap;
use vela_core::{Error, Result};

use crate::delta::{Delta, DeltaBatch, Tuple};

/// Unique identifier for a node in the dataflow graph.
pub type NodeId = u32;

/// A dataflow operator.
///
/// Operators receive whole batches on a numbered input port and append
/// output deltas to `out`. They may keep arbitrary internal state; the
/// graph owns them exclusively.
pub trait Operator {
    /// Processes one input batch. An `Err` aborts the run; the query
    /// owning the graph must be torn down.
    fn on_batch(&mut self, port: usize, batch: DeltaBatch, out: &mut DeltaBatch) -> Result<()>;

    /// Operator name for diagnostics.
    fn name(&self) -> &'static str {
        "operator"
    }
}

/// Root input operator: forwards whatever arrives.
struct InputOp;

impl Operator for InputOp {
    fn on_batch(&mut self, _port: usize, batch: DeltaBatch, out: &mut DeltaBatch) -> Result<()> {
        out.extend(batch);
        Ok(())
    }

    fn name(&self) -> &'static str {
        "input"
    }
}

/// Handle for feeding batches into a graph input node.
///
/// Cloneable; sends enqueue work that the next (or current) `run()`
/// drains.
#[derive(Clone)]
pub struct InputHandle {
    queue: Rc<RefCell<Vec<DeltaBatch>>>,
}

impl InputHandle {
    /// Enqueues a batch of deltas.
    pub fn send(&self, batch: DeltaBatch) {
        if !batch.is_empty() {
            self.queue.borrow_mut().push(batch);
        }
    }

    /// Enqueues a single delta.
    pub fn send_one(&self, delta: Delta<Tuple>) {
        self.queue.borrow_mut().push(alloc::vec![delta]);
    }
}

struct NodeSlot {
    operator: Box<dyn Operator>,
    /// (target node, target port) pairs fed by this node's output.
    downstream: Vec<(NodeId, usize)>,
    /// Batches waiting to be processed, tagged with their input port.
    pending: Vec<(usize, DeltaBatch)>,
}

/// An acyclic graph of operators with a run-to-quiescence scheduler.
pub struct Graph {
    nodes: Vec<NodeSlot>,
    /// External input queues, one per input node.
    inputs: Vec<(NodeId, Rc<RefCell<Vec<DeltaBatch>>>)>,
    /// Accumulated output of sink nodes (nodes with no downstream edges).
    outputs: HashMap<NodeId, DeltaBatch>,
    finalized: bool,
}

impl Default for Graph {
    fn default() -> Self {
        Self::new()
    }
}

impl Graph {
    /// Creates an empty graph.
    pub fn new() -> Self {
        Self {
            nodes: Vec::new(),
            inputs: Vec::new(),
            outputs: HashMap::new(),
            finalized: false,
        }
    }

    /// Adds a root input node, returning its id and a send handle.
    pub fn add_input(&mut self) -> Result<(NodeId, InputHandle)> {
        let id = self.push_node(Box::new(InputOp), &[])?;
        let queue = Rc::new(RefCell::new(Vec::new()));
        self.inputs.push((id, queue.clone()));
        Ok((id, InputHandle { queue }))
    }

    /// Adds an operator node fed by `inputs` (port i is `inputs[i]`).
    pub fn add_node(&mut self, operator: Box<dyn Operator>, inputs: &[NodeId]) -> Result<NodeId> {
        self.push_node(operator, inputs)
    }

    fn push_node(&mut self, operator: Box<dyn Operator>, inputs: &[NodeId]) -> Result<NodeId> {
        if self.finalized {
            return Err(Error::invariant("graph topology is frozen"));
        }
        let id = self.nodes.len() as NodeId;
        for (port, &input) in inputs.iter().enumerate() {
            let slot = self
                .nodes
                .get_mut(input as usize)
                .ok_or_else(|| Error::compile("operator wired to an unknown input node"))?;
            slot.downstream.push((id, port));
        }
        self.nodes.push(NodeSlot {
            operator,
            downstream: Vec::new(),
            pending: Vec::new(),
        });
        Ok(id)
    }

    /// Freezes the topology. Required before the first `run()`.
    pub fn finalize(&mut self) {
        self.finalized = true;
    }

    /// Returns true if any work is queued.
    pub fn has_pending(&self) -> bool {
        self.inputs.iter().any(|(_, q)| !q.borrow().is_empty())
            || self.nodes.iter().any(|n| !n.pending.is_empty())
    }

    /// Processes pending batches until every edge is drained.
    ///
    /// Node ids are topological, so each sweep visits nodes in id order;
    /// the outer loop re-polls external input queues so deliveries made
    /// from inside operator callbacks join the same run.
    pub fn run(&mut self) -> Result<()> {
        if !self.finalized {
            return Err(Error::invariant("graph must be finalized before running"));
        }
        loop {
            self.drain_external_inputs();
            if !self.nodes.iter().any(|n| !n.pending.is_empty()) {
                break;
            }
            for id in 0..self.nodes.len() {
                let pending = core::mem::take(&mut self.nodes[id].pending);
                for (port, batch) in pending {
                    let mut out = DeltaBatch::new();
                    self.nodes[id].operator.on_batch(port, batch, &mut out)?;
                    if !out.is_empty() {
                        self.route(id as NodeId, out);
                    }
                }
            }
        }
        Ok(())
    }

    fn drain_external_inputs(&mut self) {
        for (node, queue) in &self.inputs {
            let batches = core::mem::take(&mut *queue.borrow_mut());
            for batch in batches {
                self.nodes[*node as usize].pending.push((0, batch));
            }
        }
    }

    fn route(&mut self, from: NodeId, mut out: DeltaBatch) {
        let targets = self.nodes[from as usize].downstream.clone();
        if targets.is_empty() {
            self.outputs.entry(from).or_default().extend(out);
            return;
        }
        let last = targets.len() - 1;
        for (i, (target, port)) in targets.into_iter().enumerate() {
            let batch = if i == last {
                core::mem::take(&mut out)
            } else {
                out.clone()
            };
            self.nodes[target as usize].pending.push((port, batch));
        }
    }

    /// Takes the accumulated output of a sink node.
    pub fn take_output(&mut self, node: NodeId) -> DeltaBatch {
        self.outputs.remove(&node).unwrap_or_default()
    }

    /// Number of nodes in the graph.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Returns true if the graph has no nodes.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operators::stateless::{FilterOp, MapOp};
    use alloc::vec;
    use vela_core::{Key, Value};

    fn t(key: i64, v: i64) -> Tuple {
        Tuple::new(Key::Int(key), Value::Int(v))
    }

    #[test]
    fn test_input_to_sink() {
        let mut graph = Graph::new();
        let (input, handle) = graph.add_input().unwrap();
        graph.finalize();

        handle.send(vec![Delta::insert(t(1, 10)), Delta::insert(t(2, 20))]);
        graph.run().unwrap();

        let out = graph.take_output(input);
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn test_chain_runs_in_topo_order() {
        let mut graph = Graph::new();
        let (input, handle) = graph.add_input().unwrap();
        let filtered = graph
            .add_node(
                Box::new(FilterOp::new(|t: &Tuple| {
                    t.payload.as_int().map(|v| v > 10).unwrap_or(false)
                })),
                &[input],
            )
            .unwrap();
        let mapped = graph
            .add_node(
                Box::new(MapOp::new(|t: &Tuple| {
                    Tuple::new(t.key.clone(), Value::Int(t.payload.as_int().unwrap() * 2))
                })),
                &[filtered],
            )
            .unwrap();
        graph.finalize();

        handle.send(vec![Delta::insert(t(1, 5)), Delta::insert(t(2, 20))]);
        graph.run().unwrap();

        let out = graph.take_output(mapped);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].data.payload, Value::Int(40));
    }

    #[test]
    fn test_send_during_run_is_processed() {
        // A second batch queued before run() drains in the same call.
        let mut graph = Graph::new();
        let (input, handle) = graph.add_input().unwrap();
        graph.finalize();

        handle.send(vec![Delta::insert(t(1, 1))]);
        handle.send(vec![Delta::insert(t(2, 2))]);
        graph.run().unwrap();
        assert_eq!(graph.take_output(input).len(), 2);
        assert!(!graph.has_pending());
    }

    #[test]
    fn test_unknown_input_rejected() {
        let mut graph = Graph::new();
        let err = graph
            .add_node(Box::new(FilterOp::new(|_: &Tuple| true)), &[7])
            .unwrap_err();
        assert!(err.is_compile());
    }

    #[test]
    fn test_run_requires_finalize() {
        let mut graph = Graph::new();
        let _ = graph.add_input().unwrap();
        assert!(graph.run().is_err());
    }

    #[test]
    fn test_add_after_finalize_rejected() {
        let mut graph = Graph::new();
        let _ = graph.add_input().unwrap();
        graph.finalize();
        assert!(graph.add_input().is_err());
    }
}
