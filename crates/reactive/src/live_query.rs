//! The live query front door.
//!
//! `LiveQuery::new` compiles the IR, wires one driver per source
//! collection, subscribes, performs the initial load and refill loop,
//! and marks the result ready. From then on every source change batch
//! runs the graph to quiescence on the caller's thread and commits the
//! resulting mutations to the sink. `close` (or drop) unsubscribes
//! everything and discards operator state; a closed query must be
//! recompiled from the IR to run again.

use alloc::rc::{Rc, Weak};
use alloc::string::ToString;
use alloc::vec::Vec;
use core::cell::RefCell;
use core::cmp::Ordering;
use hashbrown::HashMap;
use vela_core::{Error, Key, Result, Value};
use vela_incremental::{DeltaBatch, Graph, NodeId, TopKHandle};
use vela_query::{compile, CollectionId, QueryIr};

use crate::change::ChangeMessage;
use crate::driver::CollectionDriver;
use crate::materialize::{Materializer, ResultSink};
use crate::source::{SourceCollection, SubscriptionId};

struct Inner {
    graph: Graph,
    terminal: NodeId,
    topk: Option<TopKHandle>,
    drivers: Vec<CollectionDriver>,
    materializer: Materializer,
    /// True once every subscription is established; readiness is only
    /// reported after that.
    activated: bool,
    /// Set on the first fatal error; the query is dead afterwards.
    failed: Option<Error>,
}

impl Inner {
    fn on_source_changes(&mut self, index: usize, messages: &[ChangeMessage]) {
        if self.failed.is_some() {
            return;
        }
        let window_full = self
            .topk
            .as_ref()
            .map(|handle| handle.window_full())
            .unwrap_or(false);
        self.drivers[index].ingest(messages, window_full);
        if let Err(error) = self.pump() {
            log::error!("live query aborted: {}", error);
            self.failed = Some(error);
        }
    }

    /// Runs the graph to quiescence, interleaving the top-k refill loop
    /// and lazy join loading, then commits the accumulated output.
    fn pump(&mut self) -> Result<()> {
        let mut output = DeltaBatch::new();
        loop {
            self.graph.run()?;
            output.extend(self.graph.take_output(self.terminal));

            let mut injected = false;
            if let Some(topk) = &self.topk {
                let needed = topk.data_needed();
                if needed > 0 {
                    for driver in &mut self.drivers {
                        injected |= driver.refill(needed);
                    }
                }
            }
            for driver in &mut self.drivers {
                injected |= driver.load_demanded();
            }
            // Each iteration either injects at least one row or stops.
            if !injected {
                break;
            }
        }
        self.materializer.apply(output)?;
        self.maybe_mark_ready();
        Ok(())
    }

    /// Ready once every source has its initial state and the refill
    /// loop (already run to exhaustion by `pump`) has nothing left to
    /// pull.
    fn maybe_mark_ready(&mut self) {
        if self.materializer.is_ready() || !self.activated {
            return;
        }
        if self.drivers.iter().all(|driver| driver.source_ready()) {
            self.materializer.mark_ready();
        }
    }
}

/// A materialized, incrementally maintained query.
pub struct LiveQuery {
    inner: Rc<RefCell<Inner>>,
    subscriptions: Vec<(Rc<dyn SourceCollection>, SubscriptionId)>,
    closed: bool,
}

impl core::fmt::Debug for LiveQuery {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("LiveQuery")
            .field("closed", &self.closed)
            .finish()
    }
}

impl LiveQuery {
    /// Compiles `ir`, subscribes to every source collection in
    /// `sources`, materializes the initial state into `sink`, and keeps
    /// the result maintained until `close`.
    pub fn new(
        ir: &QueryIr,
        sources: &HashMap<CollectionId, Rc<dyn SourceCollection>>,
        sink: Rc<dyn ResultSink>,
    ) -> Result<Self> {
        let mut compiled = compile(ir)?;

        let mut drivers = Vec::new();
        let mut driver_sources = Vec::new();
        for (alias, collection) in &compiled.sources {
            let source = sources
                .get(collection)
                .ok_or_else(|| {
                    Error::compile(alloc::format!("unknown collection `{}`", collection))
                })?
                .clone();
            let input = compiled.inputs[alias].clone();
            let lazy_index = compiled.lazy.iter().position(|p| &p.alias == alias);
            let lazy = lazy_index.map(|i| compiled.lazy.remove(i));
            let ordered = if compiled
                .ordered
                .as_ref()
                .map_or(false, |plan| &plan.alias == alias)
            {
                compiled.ordered.take()
            } else {
                None
            };
            drivers.push(CollectionDriver::new(
                alias.clone(),
                source.clone(),
                input,
                compiled.pushdown.get(alias).cloned(),
                lazy,
                ordered,
            ));
            driver_sources.push(source);
        }

        let inner = Rc::new(RefCell::new(Inner {
            graph: compiled.graph,
            terminal: compiled.terminal,
            topk: compiled.topk,
            drivers,
            materializer: Materializer::new(sink),
            activated: false,
            failed: None,
        }));

        // Subscribe after the core exists: all-changes subscriptions
        // deliver their initial burst synchronously through the
        // listener.
        let mut subscriptions: Vec<(Rc<dyn SourceCollection>, SubscriptionId)> = Vec::new();
        for (index, source) in driver_sources.iter().enumerate() {
            let options = inner.borrow().drivers[index].subscribe_options();
            let weak: Weak<RefCell<Inner>> = Rc::downgrade(&inner);
            let listener = Rc::new(move |messages: &[ChangeMessage]| {
                if let Some(inner) = weak.upgrade() {
                    inner.borrow_mut().on_source_changes(index, messages);
                }
            });
            match source.subscribe_changes(listener, options) {
                Ok(id) => subscriptions.push((source.clone(), id)),
                Err(error) => {
                    // Partially built state is torn down before the
                    // error surfaces.
                    for (source, id) in subscriptions {
                        source.unsubscribe(id);
                    }
                    return Err(Error::upstream(error.to_string()));
                }
            }
        }

        // Ordered initial loads, then one pump to quiescence; this also
        // fires mark_ready for empty sources.
        let initial = {
            let mut core = inner.borrow_mut();
            core.activated = true;
            for driver in &mut core.drivers {
                driver.initial_load();
            }
            core.pump()
        };
        if let Err(error) = initial {
            for (source, id) in subscriptions {
                source.unsubscribe(id);
            }
            return Err(error);
        }

        Ok(Self {
            inner,
            subscriptions,
            closed: false,
        })
    }

    /// The materialized rows in external (fractional-index) order.
    pub fn results(&self) -> Vec<(Key, Value)> {
        self.inner.borrow().materializer.rows()
    }

    /// External ordering over result keys.
    pub fn compare(&self, a: &Key, b: &Key) -> Ordering {
        self.inner.borrow().materializer.compare(a, b)
    }

    /// True once the initial state is fully materialized.
    pub fn is_ready(&self) -> bool {
        self.inner.borrow().materializer.is_ready()
    }

    /// The fatal error that aborted this query, if any.
    pub fn error(&self) -> Option<Error> {
        self.inner.borrow().failed.clone()
    }

    /// Number of materialized rows.
    pub fn len(&self) -> usize {
        self.inner.borrow().materializer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.borrow().materializer.is_empty()
    }

    /// Unsubscribes from every source and discards operator state.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        for (source, id) in self.subscriptions.drain(..) {
            source.unsubscribe(id);
        }
    }
}

impl Drop for LiveQuery {
    fn drop(&mut self) {
        self.close();
    }
}
