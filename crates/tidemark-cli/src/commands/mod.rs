//! CLI command implementations.

pub mod freshness;
pub mod tick;
