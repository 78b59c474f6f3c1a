//! Vela Core - foundational types for the vela live query engine.
//!
//! This crate defines the data model shared by every layer of the engine:
//!
//! - `Key`: the identity of a row within a collection (string or integer)
//! - `Value` / `Record`: deeply comparable payloads with canonical
//!   structural equality, hashing and a total order
//! - `SortSpec` and friends: order-by key comparison semantics
//!   (direction, null placement, string collation)
//! - `Error` / `Result`: the engine-wide error surface

#![no_std]

extern crate alloc;

pub mod compare;
pub mod error;
pub mod key;
pub mod value;

pub use compare::{
    compare_key_rows, compare_sort_values, NullsOrder, SortOrder, SortSpec, StringSort,
};
pub use error::{Error, Result};
pub use key::Key;
pub use value::{Record, Value};
