//! Common utilities and types shared across fieldkeep modules.
//!
//! This module provides the error taxonomy and the small value types that
//! every durability component speaks in, ensuring consistency and type safety.

pub mod error;
pub mod types;

pub use error::{Error, Result};
pub use types::{CollectionName, Payload, SchemaVersion};
