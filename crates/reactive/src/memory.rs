//! In-memory reference source collection.
//!
//! Implements the whole source contract: keyed rows, change
//! subscriptions with optional WHERE filtering, filtered state
//! snapshots, and an on-demand sorted index. Used by tests, benches and
//! as the model for host-side adapters.

use alloc::rc::Rc;
use alloc::string::String;
use alloc::vec::Vec;
use core::cell::{Cell, RefCell};
use core::cmp::Ordering;
use hashbrown::HashMap;
use vela_core::{compare_key_rows, Key, Result, SortSpec, Value};
use vela_query::Expr;

use crate::change::ChangeMessage;
use crate::source::{
    ChangeListener, IndexPosition, SourceCollection, SubscribeOptions, SubscriptionId,
};

struct ListenerEntry {
    listener: ChangeListener,
    where_expression: Option<Expr>,
}

/// An in-memory keyed collection with change subscriptions.
pub struct MemoryCollection {
    id: String,
    key_field: Option<String>,
    /// Whether the collection offers a sorted index to the engine.
    sorted: bool,
    rows: RefCell<HashMap<Key, Value>>,
    listeners: RefCell<HashMap<SubscriptionId, ListenerEntry>>,
    next_subscription: Cell<SubscriptionId>,
}

impl MemoryCollection {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            key_field: None,
            sorted: true,
            rows: RefCell::new(HashMap::new()),
            listeners: RefCell::new(HashMap::new()),
            next_subscription: Cell::new(1),
        }
    }

    /// Declares which row field holds the key, enabling lazy join
    /// loading against that field.
    pub fn with_key_field(mut self, field: impl Into<String>) -> Self {
        self.key_field = Some(field.into());
        self
    }

    /// Disables the sorted index (order-by queries fall back to the
    /// all-changes mode).
    pub fn without_sorted_index(mut self) -> Self {
        self.sorted = false;
        self
    }

    /// Inserts or replaces a row, notifying subscribers.
    pub fn insert(&self, key: Key, value: Value) {
        let previous = self.rows.borrow_mut().insert(key.clone(), value.clone());
        let message = match previous {
            Some(previous) => ChangeMessage::Update {
                key,
                previous,
                value,
            },
            None => ChangeMessage::Insert { key, value },
        };
        self.notify(message);
    }

    /// Updates an existing row, notifying subscribers. Missing keys are
    /// ignored.
    pub fn update(&self, key: Key, value: Value) {
        let previous = match self.rows.borrow().get(&key) {
            Some(v) => v.clone(),
            None => return,
        };
        self.rows.borrow_mut().insert(key.clone(), value.clone());
        self.notify(ChangeMessage::Update {
            key,
            previous,
            value,
        });
    }

    /// Deletes a row, notifying subscribers. Missing keys are ignored.
    pub fn delete(&self, key: &Key) {
        let Some(value) = self.rows.borrow_mut().remove(key) else {
            return;
        };
        self.notify(ChangeMessage::Delete {
            key: key.clone(),
            value,
        });
    }

    /// Number of rows.
    pub fn len(&self) -> usize {
        self.rows.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.borrow().is_empty()
    }

    fn notify(&self, message: ChangeMessage) {
        // Collect listeners first: a callback may subscribe/unsubscribe.
        let entries: Vec<(SubscriptionId, ChangeListener, Option<Expr>)> = self
            .listeners
            .borrow()
            .iter()
            .map(|(id, e)| (*id, e.listener.clone(), e.where_expression.clone()))
            .collect();
        for (_, listener, where_expression) in entries {
            if Self::visible(&message, where_expression.as_ref()) {
                listener(core::slice::from_ref(&message));
            }
        }
    }

    /// A filtered subscription sees a change when either side of it
    /// matches: a conservative superset, the engine re-filters.
    fn visible(message: &ChangeMessage, where_expression: Option<&Expr>) -> bool {
        let Some(expr) = where_expression else {
            return true;
        };
        let matches = |value: &Value| {
            value
                .as_record()
                .map(|r| expr.eval_flat(r) == Value::Bool(true))
                .unwrap_or(false)
        };
        match message {
            ChangeMessage::Insert { value, .. } | ChangeMessage::Delete { value, .. } => {
                matches(value)
            }
            ChangeMessage::Update {
                previous, value, ..
            } => matches(previous) || matches(value),
        }
    }
}

impl SourceCollection for MemoryCollection {
    fn id(&self) -> &str {
        &self.id
    }

    fn subscribe_changes(
        &self,
        listener: ChangeListener,
        options: SubscribeOptions,
    ) -> Result<SubscriptionId> {
        let id = self.next_subscription.get();
        self.next_subscription.set(id + 1);

        if options.include_initial_state {
            let initial = self.current_state_as_changes(options.where_expression.as_ref());
            if !initial.is_empty() {
                listener(&initial);
            }
        }

        self.listeners.borrow_mut().insert(
            id,
            ListenerEntry {
                listener,
                where_expression: options.where_expression,
            },
        );
        Ok(id)
    }

    fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.listeners.borrow_mut().remove(&id).is_some()
    }

    fn get(&self, key: &Key) -> Option<Value> {
        self.rows.borrow().get(key).cloned()
    }

    fn has(&self, key: &Key) -> bool {
        self.rows.borrow().contains_key(key)
    }

    fn current_state_as_changes(&self, where_expression: Option<&Expr>) -> Vec<ChangeMessage> {
        self.rows
            .borrow()
            .iter()
            .filter(|(_, value)| match where_expression {
                Some(expr) => value
                    .as_record()
                    .map(|r| expr.eval_flat(r) == Value::Bool(true))
                    .unwrap_or(false),
                None => true,
            })
            .map(|(key, value)| ChangeMessage::Insert {
                key: key.clone(),
                value: value.clone(),
            })
            .collect()
    }

    fn key_field(&self) -> Option<&str> {
        self.key_field.as_deref()
    }

    fn index_take(
        &self,
        specs: &[SortSpec],
        sort_exprs: &[Expr],
        n: usize,
        after: Option<&IndexPosition>,
    ) -> Option<Vec<Key>> {
        if !self.sorted {
            return None;
        }
        let rows = self.rows.borrow();
        let mut entries: Vec<(Vec<Value>, Key)> = rows
            .iter()
            .map(|(key, value)| {
                let sort_values = sort_exprs
                    .iter()
                    .map(|expr| match value.as_record() {
                        Some(record) => expr.eval_flat(record),
                        None => Value::Null,
                    })
                    .collect();
                (sort_values, key.clone())
            })
            .collect();

        let compare = |a: &(Vec<Value>, Key), b: &(Vec<Value>, Key)| -> Ordering {
            compare_key_rows(&a.0, &b.0, specs).then_with(|| a.1.cmp(&b.1))
        };
        entries.sort_by(compare);

        let skipped = match after {
            Some(position) => entries
                .iter()
                .position(|e| compare(e, position) == Ordering::Greater)
                .unwrap_or(entries.len()),
            None => 0,
        };
        Some(
            entries
                .into_iter()
                .skip(skipped)
                .take(n)
                .map(|(_, key)| key)
                .collect(),
        )
    }
}

/// Convenience for passing a collection to `LiveQuery`.
pub fn shared(collection: MemoryCollection) -> Rc<MemoryCollection> {
    Rc::new(collection)
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;
    use vela_core::Record;

    fn emp(salary: i64) -> Value {
        let mut r = Record::new();
        r.set("salary", Value::Int(salary));
        Value::Record(r)
    }

    #[test]
    fn test_insert_update_delete_messages() {
        let coll = MemoryCollection::new("employees");
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = seen.clone();
        coll.subscribe_changes(
            Rc::new(move |messages: &[ChangeMessage]| {
                sink.borrow_mut().extend(messages.to_vec());
            }),
            SubscribeOptions::default(),
        )
        .unwrap();

        coll.insert(Key::Int(1), emp(50_000));
        coll.update(Key::Int(1), emp(60_000));
        coll.delete(&Key::Int(1));

        let seen = seen.borrow();
        assert_eq!(seen.len(), 3);
        assert!(matches!(seen[0], ChangeMessage::Insert { .. }));
        assert!(matches!(seen[1], ChangeMessage::Update { .. }));
        assert!(matches!(seen[2], ChangeMessage::Delete { .. }));
    }

    #[test]
    fn test_include_initial_state() {
        let coll = MemoryCollection::new("employees");
        coll.insert(Key::Int(1), emp(50_000));
        coll.insert(Key::Int(2), emp(30_000));

        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = seen.clone();
        coll.subscribe_changes(
            Rc::new(move |messages: &[ChangeMessage]| {
                sink.borrow_mut().extend(messages.to_vec());
            }),
            SubscribeOptions {
                include_initial_state: true,
                where_expression: Some(Expr::col("emp", "salary").gt(Expr::lit(40_000i64))),
            },
        )
        .unwrap();

        // Only the matching row arrives in the burst.
        assert_eq!(seen.borrow().len(), 1);
        assert_eq!(seen.borrow()[0].key(), &Key::Int(1));
    }

    #[test]
    fn test_filtered_subscription_sees_updates_leaving_the_set() {
        let coll = MemoryCollection::new("employees");
        coll.insert(Key::Int(1), emp(50_000));

        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = seen.clone();
        coll.subscribe_changes(
            Rc::new(move |messages: &[ChangeMessage]| {
                sink.borrow_mut().extend(messages.to_vec());
            }),
            SubscribeOptions {
                include_initial_state: false,
                where_expression: Some(Expr::col("emp", "salary").gt(Expr::lit(40_000i64))),
            },
        )
        .unwrap();

        // New value fails the filter, but the old one matched: the
        // update is still delivered (superset semantics).
        coll.update(Key::Int(1), emp(30_000));
        assert_eq!(seen.borrow().len(), 1);
    }

    #[test]
    fn test_index_take_resumes_after_position() {
        let coll = MemoryCollection::new("employees");
        coll.insert(Key::Int(1), emp(50_000));
        coll.insert(Key::Int(2), emp(60_000));
        coll.insert(Key::Int(3), emp(55_000));

        let exprs = vec![Expr::col("emp", "salary")];
        let specs = vec![SortSpec::desc()];

        let first = coll.index_take(&specs, &exprs, 2, None).unwrap();
        assert_eq!(first, vec![Key::Int(2), Key::Int(3)]);

        let position = (vec![Value::Int(55_000)], Key::Int(3));
        let rest = coll.index_take(&specs, &exprs, 2, Some(&position)).unwrap();
        assert_eq!(rest, vec![Key::Int(1)]);
    }

    #[test]
    fn test_without_sorted_index() {
        let coll = MemoryCollection::new("employees").without_sorted_index();
        assert!(coll
            .index_take(&[SortSpec::asc()], &[Expr::col("e", "salary")], 1, None)
            .is_none());
    }
}
