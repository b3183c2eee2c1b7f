//! Error types and result aliases shared by tidemark crates.

/// The result type used throughout tidemark-core.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur when constructing shared primitives.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An invalid identifier was provided.
    #[error("invalid identifier: {message}")]
    InvalidId {
        /// Description of what made the ID invalid.
        message: String,
    },

    /// An asset key could not be built or parsed.
    #[error("invalid asset key '{input}': {reason}")]
    InvalidAssetKey {
        /// The rejected input, as given.
        input: String,
        /// Why the input was rejected.
        reason: String,
    },
}

impl Error {
    /// Creates an invalid asset key error.
    #[must_use]
    pub fn invalid_asset_key(input: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidAssetKey {
            input: input.into(),
            reason: reason.into(),
        }
    }
}
