//! Error types for the reconciliation domain.

/// The result type used throughout tidemark-flow.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while evaluating a reconciliation tick.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A cycle was detected in the upstream map.
    #[error("cycle detected in dependency graph: {cycle:?}")]
    CycleDetected {
        /// Asset keys participating in (or blocked by) the cycle.
        cycle: Vec<String>,
    },

    /// A DAG node was not found (internal graph operation error).
    #[error("DAG node not found: {node}")]
    DagNodeNotFound {
        /// The node identifier (index or value).
        node: String,
    },

    /// A selection referenced an asset the graph does not define.
    #[error("dependency not found: {asset_key}")]
    DependencyNotFound {
        /// The asset key that could not be resolved.
        asset_key: String,
    },

    /// The persisted cursor could not be decoded.
    #[error("cursor decode failed: {message}")]
    CursorDecode {
        /// Description of the decode failure.
        message: String,
    },

    /// The persisted cursor carries a version this build cannot read.
    #[error("unsupported cursor version {version} (supported: {supported})")]
    UnsupportedCursorVersion {
        /// Version found in the cursor.
        version: u32,
        /// Latest version this build understands.
        supported: u32,
    },

    /// A fact-store query failed.
    #[error("storage error: {message}")]
    Storage {
        /// Description of the storage failure.
        message: String,
        /// The underlying cause, if any.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// A sensor or policy was configured with invalid values.
    #[error("invalid configuration: {message}")]
    InvalidConfiguration {
        /// Description of the problem.
        message: String,
    },

    /// A cron expression could not be parsed.
    #[error("invalid cron schedule '{expression}': {message}")]
    InvalidCronSchedule {
        /// The rejected expression.
        expression: String,
        /// Parser message.
        message: String,
    },

    /// A serialization error occurred.
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of the serialization failure.
        message: String,
    },

    /// An error from tidemark-core.
    #[error("core error: {0}")]
    Core(#[from] tidemark_core::Error),
}

impl Error {
    /// Creates a new storage error.
    #[must_use]
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a new storage error with a source.
    #[must_use]
    pub fn storage_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Storage {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Creates a new configuration error.
    #[must_use]
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::InvalidConfiguration {
            message: message.into(),
        }
    }

    /// Creates a new cursor decode error.
    #[must_use]
    pub fn cursor_decode(message: impl Into<String>) -> Self {
        Self::CursorDecode {
            message: message.into(),
        }
    }
}
