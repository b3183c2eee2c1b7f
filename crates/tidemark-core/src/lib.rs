//! # tidemark-core
//!
//! Shared primitives for the tidemark asset reconciliation engine.
//!
//! This crate provides the foundational types used across tidemark components:
//!
//! - **Asset Keys**: Hierarchical, immutable asset identifiers with a stable
//!   string encoding suitable for persisted cursors
//! - **Identifiers**: Strongly-typed run and storage identifiers
//! - **Error Types**: Shared error definitions and result types
//! - **Observability**: Logging initialization and span helpers
//!
//! ## Example
//!
//! ```rust
//! use tidemark_core::prelude::*;
//!
//! let key = AssetKey::from_path(["warehouse", "orders"]).unwrap();
//! assert_eq!(key.to_string(), "warehouse/orders");
//!
//! let run = RunId::generate();
//! assert_ne!(run, RunId::generate());
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod asset_key;
pub mod error;
pub mod id;
pub mod observability;

pub use asset_key::AssetKey;
pub use error::{Error, Result};
pub use id::{RunId, StorageId};

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::asset_key::AssetKey;
    pub use crate::error::{Error, Result};
    pub use crate::id::{RunId, StorageId};
    pub use crate::observability::{LogFormat, init_logging, reconciliation_span};
}
