//! Vela Reactive - live queries over change-subscribable collections.
//!
//! This crate connects compiled query graphs to the outside world:
//!
//! - `change`: keyed insert/update/delete messages, the external unit of
//!   change on both sides of the engine
//! - `source`: the contract a source collection implements (change
//!   subscriptions with optional WHERE pushdown, point lookups, filtered
//!   state snapshots, a sorted index)
//! - `memory`: an in-memory reference implementation of that contract
//! - `driver`: per-collection subscription driving in three modes
//!   (all-changes, lazy-matching for join inners, ordered-bounded for
//!   top-k)
//! - `materialize`: folds the terminal stream into result mutations and
//!   keeps the fractional-index ordering table
//! - `live_query`: compile + subscribe + run + teardown

#![no_std]

extern crate alloc;

pub mod change;
pub mod driver;
pub mod live_query;
pub mod materialize;
pub mod memory;
pub mod source;

pub use change::ChangeMessage;
pub use live_query::LiveQuery;
pub use materialize::{Materializer, ResultCollection, ResultSink};
pub use memory::MemoryCollection;
pub use source::{SourceCollection, SubscribeOptions, SubscriptionId};
