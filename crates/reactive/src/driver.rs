//! Per-collection subscription driving.
//!
//! Each source collection feeds its graph input in one of three modes:
//!
//! 1. **All changes**: subscribe with the initial state included; every
//!    change is forwarded (updates split into retract + insert).
//! 2. **Lazy matching** (join inners): no initial burst. The join
//!    operator records the keys it probed without finding rows; the
//!    driver point-loads those after every run. When the probed column
//!    is not the collection's key field, a one-time fallback loads the
//!    full filtered state instead, after which updates of unseen keys
//!    count as inserts and deletes of unseen keys are dropped.
//! 3. **Ordered bounded** (top-k): the initial `offset + limit` rows come
//!    from the sorted index; changes ranking past the biggest row sent
//!    are dropped while the window is full; after every run the driver
//!    pulls however many more rows the top-k reports needing.
//!
//! The driver tracks `sent` (key → last forwarded value) and
//! `biggest_sent` to implement the masking, the authoritative-retraction
//! rule, and the index resume point.

use alloc::rc::Rc;
use alloc::string::String;
use hashbrown::{HashMap, HashSet};
use vela_core::{Key, Value};
use vela_incremental::{Delta, DeltaBatch, InputHandle, Tuple};
use vela_query::{Expr, LazyPlan, OrderedPlan};

use crate::change::ChangeMessage;
use crate::source::{IndexPosition, SourceCollection, SubscribeOptions};

/// How a collection is fed into the graph.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DriverMode {
    AllChanges,
    LazyMatching,
    OrderedBounded,
}

/// Drives one source collection's subscription.
pub struct CollectionDriver {
    alias: String,
    source: Rc<dyn SourceCollection>,
    input: InputHandle,
    mode: DriverMode,
    pushdown: Option<Expr>,
    lazy: Option<LazyPlan>,
    ordered: Option<OrderedPlan>,
    /// Key → last value forwarded into the graph.
    sent: HashMap<Key, Value>,
    /// Keys the join demanded but the source did not (yet) hold.
    wanted: HashSet<Key>,
    biggest_sent: Option<IndexPosition>,
    /// Lazy fallback happened: the full filtered state is in the graph.
    loaded_all: bool,
}

impl CollectionDriver {
    pub fn new(
        alias: String,
        source: Rc<dyn SourceCollection>,
        input: InputHandle,
        pushdown: Option<Expr>,
        lazy: Option<LazyPlan>,
        ordered: Option<OrderedPlan>,
    ) -> Self {
        let mode = if ordered.is_some() {
            DriverMode::OrderedBounded
        } else if lazy.is_some() {
            DriverMode::LazyMatching
        } else {
            DriverMode::AllChanges
        };
        Self {
            alias,
            source,
            input,
            mode,
            pushdown,
            lazy,
            ordered,
            sent: HashMap::new(),
            wanted: HashSet::new(),
            biggest_sent: None,
            loaded_all: false,
        }
    }

    pub fn alias(&self) -> &str {
        &self.alias
    }

    pub fn mode(&self) -> DriverMode {
        self.mode
    }

    pub fn source_ready(&self) -> bool {
        self.source.is_ready()
    }

    /// Subscription options for this mode.
    pub fn subscribe_options(&self) -> SubscribeOptions {
        SubscribeOptions {
            include_initial_state: self.mode == DriverMode::AllChanges,
            where_expression: self.pushdown.clone(),
        }
    }

    /// Performs the mode's initial load. All-changes mode needs none
    /// (the subscription burst covers it).
    pub fn initial_load(&mut self) {
        if self.mode != DriverMode::OrderedBounded {
            return;
        }
        let plan = self.ordered.as_ref().expect("ordered mode has a plan");
        let take = plan.offset + plan.limit;
        let keys =
            self.source
                .index_take(&plan.specs, &plan.sort_exprs, take, None);
        match keys {
            Some(keys) => {
                log::debug!("`{}`: initial ordered load of {} keys", self.alias, keys.len());
                self.inject_keys(&keys);
            }
            None => {
                // No usable sorted index after all: degrade to a full
                // scan and plain forwarding.
                log::debug!("`{}`: no sorted index, degrading to all-changes", self.alias);
                self.mode = DriverMode::AllChanges;
                self.ordered = None;
                let state = self
                    .source
                    .current_state_as_changes(self.pushdown.as_ref());
                self.ingest(&state, false);
            }
        }
    }

    /// Converts and forwards a batch of source changes.
    pub fn ingest(&mut self, messages: &[ChangeMessage], window_full: bool) {
        let mut batch = DeltaBatch::new();
        for message in messages {
            match self.mode {
                DriverMode::AllChanges => self.ingest_plain(message, &mut batch),
                DriverMode::LazyMatching => self.ingest_lazy(message, &mut batch),
                DriverMode::OrderedBounded => {
                    self.ingest_ordered(message, window_full, &mut batch)
                }
            }
        }
        self.input.send(batch);
    }

    fn ingest_plain(&mut self, message: &ChangeMessage, batch: &mut DeltaBatch) {
        match message {
            ChangeMessage::Insert { key, value } => {
                self.forward_upsert(key, value, batch);
            }
            ChangeMessage::Update { key, value, .. } => {
                self.forward_upsert(key, value, batch);
            }
            ChangeMessage::Delete { key, value } => {
                // Retract what the engine actually holds; the engine's
                // copy is authoritative over the message's.
                let held = self.sent.remove(key).unwrap_or_else(|| value.clone());
                batch.push(Delta::delete(Tuple::new(key.clone(), held)));
            }
        }
    }

    /// Insert-or-update forwarding with the authoritative-retraction
    /// rule: if the engine holds a previous value, retract that copy.
    fn forward_upsert(&mut self, key: &Key, value: &Value, batch: &mut DeltaBatch) {
        if let Some(previous) = self.sent.insert(key.clone(), value.clone()) {
            batch.push(Delta::delete(Tuple::new(key.clone(), previous)));
        }
        batch.push(Delta::insert(Tuple::new(key.clone(), value.clone())));
    }

    fn ingest_lazy(&mut self, message: &ChangeMessage, batch: &mut DeltaBatch) {
        let key = message.key().clone();
        let seen = self.sent.contains_key(&key);

        if self.loaded_all {
            // Post-fallback masking: unseen updates become inserts,
            // unseen deletes vanish.
            match message {
                ChangeMessage::Insert { key, value }
                | ChangeMessage::Update { key, value, .. } => {
                    self.forward_upsert(key, value, batch);
                }
                ChangeMessage::Delete { key, value } => {
                    if seen {
                        let held = self.sent.remove(key).unwrap_or_else(|| value.clone());
                        batch.push(Delta::delete(Tuple::new(key.clone(), held)));
                    }
                }
            }
            return;
        }

        match message {
            ChangeMessage::Insert { key, value }
            | ChangeMessage::Update { key, value, .. } => {
                if seen || self.wanted.contains(key) {
                    self.wanted.remove(key);
                    self.forward_upsert(key, value, batch);
                }
            }
            ChangeMessage::Delete { key, value } => {
                if seen {
                    let held = self.sent.remove(key).unwrap_or_else(|| value.clone());
                    batch.push(Delta::delete(Tuple::new(key.clone(), held)));
                }
            }
        }
    }

    fn ingest_ordered(
        &mut self,
        message: &ChangeMessage,
        window_full: bool,
        batch: &mut DeltaBatch,
    ) {
        // Updates split at the boundary; each half follows its own rule.
        match message {
            ChangeMessage::Insert { key, value } => {
                self.ordered_insert(key, value, window_full, batch);
            }
            ChangeMessage::Update { key, value, .. } => {
                self.ordered_delete(key, batch);
                self.ordered_insert(key, value, window_full, batch);
            }
            ChangeMessage::Delete { key, .. } => {
                self.ordered_delete(key, batch);
            }
        }
    }

    fn ordered_delete(&mut self, key: &Key, batch: &mut DeltaBatch) {
        // A row never sent is not in the engine; nothing to retract.
        if let Some(held) = self.sent.remove(key) {
            batch.push(Delta::delete(Tuple::new(key.clone(), held)));
        }
    }

    fn ordered_insert(
        &mut self,
        key: &Key,
        value: &Value,
        window_full: bool,
        batch: &mut DeltaBatch,
    ) {
        let position = self.index_position(key, value);
        let beyond = match (&self.biggest_sent, &position) {
            (Some(biggest), Some(position)) => self.position_gt(position, biggest),
            _ => false,
        };
        if beyond && window_full {
            // Cannot affect the window until earlier rows retract; the
            // refill loop will pull it back from the index if needed.
            return;
        }
        self.sent.insert(key.clone(), value.clone());
        if let Some(position) = position {
            let bigger = match &self.biggest_sent {
                Some(biggest) => self.position_gt(&position, biggest),
                None => true,
            };
            if bigger {
                self.biggest_sent = Some(position);
            }
        }
        batch.push(Delta::insert(Tuple::new(key.clone(), value.clone())));
    }

    fn index_position(&self, key: &Key, value: &Value) -> Option<IndexPosition> {
        let plan = self.ordered.as_ref()?;
        let record = value.as_record()?;
        let sort_values = plan
            .sort_exprs
            .iter()
            .map(|expr| expr.eval_flat(record))
            .collect();
        Some((sort_values, key.clone()))
    }

    fn position_gt(&self, a: &IndexPosition, b: &IndexPosition) -> bool {
        let plan = self.ordered.as_ref().expect("ordered mode has a plan");
        vela_core::compare_key_rows(&a.0, &b.0, &plan.specs)
            .then_with(|| a.1.cmp(&b.1))
            .is_gt()
    }

    /// Pulls up to `needed` more rows from the sorted index. Returns
    /// true if anything was injected.
    pub fn refill(&mut self, needed: usize) -> bool {
        if self.mode != DriverMode::OrderedBounded || needed == 0 {
            return false;
        }
        let plan = self.ordered.as_ref().expect("ordered mode has a plan");
        let keys = match self.source.index_take(
            &plan.specs,
            &plan.sort_exprs,
            needed,
            self.biggest_sent.as_ref(),
        ) {
            Some(keys) => keys,
            None => return false,
        };
        if keys.is_empty() {
            return false;
        }
        log::trace!("`{}`: refill of {} keys", self.alias, keys.len());
        self.inject_keys(&keys)
    }

    /// Point-loads rows demanded by the join. Returns true if anything
    /// was injected.
    pub fn load_demanded(&mut self) -> bool {
        if self.mode != DriverMode::LazyMatching || self.loaded_all {
            if let Some(plan) = &self.lazy {
                // Demands keep accumulating; keep the queue drained.
                let _ = plan.demand.drain();
            }
            return false;
        }
        let plan = self.lazy.as_ref().expect("lazy mode has a plan");
        let demanded = plan.demand.drain();
        if demanded.is_empty() {
            return false;
        }

        // Point lookups need the probed column to be the key field.
        let point_loadable = self.source.key_field() == Some(plan.key_field.as_str());
        if !point_loadable {
            log::debug!(
                "`{}`: no point index on `{}`, loading full filtered state",
                self.alias,
                plan.key_field
            );
            self.loaded_all = true;
            let state = self
                .source
                .current_state_as_changes(self.pushdown.as_ref());
            let mut batch = DeltaBatch::new();
            for message in &state {
                self.ingest_lazy_loaded(message, &mut batch);
            }
            let injected = !batch.is_empty();
            self.input.send(batch);
            return injected;
        }

        let mut batch = DeltaBatch::new();
        for join_key in demanded {
            let Some(key) = join_key.to_key() else {
                continue;
            };
            if self.sent.contains_key(&key) {
                continue;
            }
            match self.source.get(&key) {
                Some(value) => {
                    self.sent.insert(key.clone(), value.clone());
                    batch.push(Delta::insert(Tuple::new(key, value)));
                }
                None => {
                    // Remember the miss: a later insert must pass.
                    self.wanted.insert(key);
                }
            }
        }
        let injected = !batch.is_empty();
        self.input.send(batch);
        injected
    }

    fn ingest_lazy_loaded(&mut self, message: &ChangeMessage, batch: &mut DeltaBatch) {
        if let ChangeMessage::Insert { key, value } = message {
            if !self.sent.contains_key(key) {
                self.sent.insert(key.clone(), value.clone());
                batch.push(Delta::insert(Tuple::new(key.clone(), value.clone())));
            }
        }
    }

    /// Injects the rows behind `keys` as inserts (ordered mode).
    ///
    /// The resume point advances past every returned key, including ones
    /// skipped because the engine already holds them; returning true for
    /// any non-empty read keeps the pull loop walking a finite index
    /// even when a whole read is skipped.
    fn inject_keys(&mut self, keys: &[Key]) -> bool {
        let mut batch = DeltaBatch::new();
        for key in keys {
            let Some(value) = self.source.get(key) else {
                continue;
            };
            if let Some(position) = self.index_position(key, &value) {
                let bigger = match &self.biggest_sent {
                    Some(biggest) => self.position_gt(&position, biggest),
                    None => true,
                };
                if bigger {
                    self.biggest_sent = Some(position);
                }
            }
            if self.sent.contains_key(key) {
                continue;
            }
            self.sent.insert(key.clone(), value.clone());
            batch.push(Delta::insert(Tuple::new(key.clone(), value.clone())));
        }
        self.input.send(batch);
        !keys.is_empty()
    }
}
