//! The source collection contract.
//!
//! The engine consumes collections through this trait only. A source may
//! honor the WHERE pushdown precisely or deliver a conservative superset;
//! the compiled graph re-filters either way. The sorted index is optional
//! and only consulted for order-by-optimized queries; a source without
//! one simply degrades that query to the all-changes mode.

use alloc::rc::Rc;
use alloc::vec::Vec;
use vela_core::{Key, Result, SortSpec, Value};
use vela_query::Expr;

use crate::change::ChangeMessage;

/// Identifier of an active change subscription.
pub type SubscriptionId = u64;

/// Callback receiving change-message batches.
pub type ChangeListener = Rc<dyn Fn(&[ChangeMessage])>;

/// Options for a change subscription.
#[derive(Clone, Default)]
pub struct SubscribeOptions {
    /// Deliver the current (filtered) state as a burst of inserts before
    /// ongoing changes.
    pub include_initial_state: bool,
    /// WHERE fragment restricted to this collection. Columns resolve by
    /// field name against the row value.
    pub where_expression: Option<Expr>,
}

/// Resume point for sorted-index reads: the order-key values and row key
/// of the last row already taken.
pub type IndexPosition = (Vec<Value>, Key);

/// A change-subscribable collection of keyed rows.
pub trait SourceCollection {
    /// Collection identifier (matches the query IR's collection ids).
    fn id(&self) -> &str;

    /// Subscribes to changes. When `include_initial_state` is set the
    /// current filtered state is delivered synchronously as inserts
    /// before the call returns.
    fn subscribe_changes(
        &self,
        listener: ChangeListener,
        options: SubscribeOptions,
    ) -> Result<SubscriptionId>;

    /// Cancels a subscription. Returns false if it was already gone.
    fn unsubscribe(&self, id: SubscriptionId) -> bool;

    /// Point lookup.
    fn get(&self, key: &Key) -> Option<Value>;

    /// Key presence test.
    fn has(&self, key: &Key) -> bool {
        self.get(key).is_some()
    }

    /// The current state, filtered, as insert messages.
    fn current_state_as_changes(&self, where_expression: Option<&Expr>) -> Vec<ChangeMessage>;

    /// Name of the field holding the row key, when rows embed it. Lazy
    /// join loading requires the probed column to be this field.
    fn key_field(&self) -> Option<&str> {
        None
    }

    /// Reads up to `n` keys from a sorted index over the given sort
    /// expressions, strictly after `after`. `None` when no usable index
    /// exists.
    fn index_take(
        &self,
        specs: &[SortSpec],
        sort_exprs: &[Expr],
        n: usize,
        after: Option<&IndexPosition>,
    ) -> Option<Vec<Key>> {
        let _ = (specs, sort_exprs, n, after);
        None
    }

    /// True once the collection has its initial state.
    fn is_ready(&self) -> bool {
        true
    }
}
