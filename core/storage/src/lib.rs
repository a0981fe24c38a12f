//! Persistence ports for fieldkeep.
//!
//! This module provides the two storage-facing seams the durability core
//! depends on:
//! - [`KeyValueStore`]: where components persist their own records under the
//!   logical keys in [`keys`]
//! - [`DataProvider`]: the application data that snapshots are taken from
//!   and restored into
//!
//! # Design Principles
//! - Keys are independent: there is no cross-key transaction
//! - Writes replace whole values, never patch them
//! - A record that fails to decode is treated as absent

pub mod keys;
pub mod local;
pub mod memory;
pub mod provider;
pub mod store;

pub use local::{JsonFileProvider, LocalStore};
pub use memory::{MemoryDataProvider, MemoryStore};
pub use provider::{CollectionShape, CollectionSpec, DataProvider};
pub use store::{load_record, save_record, KeyValueStore};
