//! Error types for the template-and-pool coordinator.

use thiserror::Error;

use crate::templates::TemplateState;

/// Result type for coordinator operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type covering the full coordinator contract.
#[derive(Error, Debug)]
pub enum Error {
    /// The manager is not connected (or has begun shutting down).
    #[error("manager is not ready")]
    NotReady,

    /// A template for this hash has already been registered.
    #[error("template '{hash}' is already initialized")]
    AlreadyInitialized {
        /// The template hash
        hash: String,
    },

    /// No template is registered under this hash.
    #[error("template '{hash}' not found")]
    TemplateNotFound {
        /// The template hash
        hash: String,
    },

    /// The template is not in the state the operation requires.
    #[error("template '{hash}' is in an unexpected state: {state:?}")]
    InvalidTemplateState {
        /// The template hash
        hash: String,
        /// The state the template was observed in
        state: TemplateState,
    },

    /// The template has been discarded and cannot be used again.
    #[error("template '{hash}' has been discarded")]
    TemplateDiscarded {
        /// The template hash
        hash: String,
    },

    /// The per-template pool has reached its configured capacity.
    #[error("test database pool for template '{hash}' is full ({max} instances)")]
    PoolFull {
        /// The template hash
        hash: String,
        /// The configured capacity
        max: usize,
    },

    /// No ready instance is available but capacity remains.
    ///
    /// Internal: the coordinator converts this into a creation attempt and
    /// never surfaces it to callers.
    #[error("no test database ready for template '{hash}'")]
    NoDbReady {
        /// The template hash
        hash: String,
    },

    /// The given test database id is not currently checked out.
    #[error("test database {id} for template '{hash}' is not checked out")]
    UnknownTestDatabase {
        /// The template hash
        hash: String,
        /// The test database ordinal
        id: usize,
    },

    /// The operation's cancellation token fired.
    #[error("operation cancelled")]
    Cancelled,

    /// A hash or prefix contains characters outside `[A-Za-z0-9_]`.
    #[error("invalid identifier '{value}': only [A-Za-z0-9_] is allowed")]
    InvalidIdentifier {
        /// The offending value
        value: String,
    },

    /// Invalid configuration or manager lifecycle misuse.
    #[error("configuration error: {message}")]
    Configuration {
        /// The error message
        message: String,
    },

    /// An error surfaced by the database gateway.
    #[error("gateway error: {message}")]
    Gateway {
        /// The error message
        message: String,
        /// The underlying cause, when available
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl Error {
    /// Create a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create a gateway error from a message alone.
    pub fn gateway(message: impl Into<String>) -> Self {
        Self::Gateway {
            message: message.into(),
            source: None,
        }
    }

    /// Create a gateway error wrapping an underlying cause.
    pub fn gateway_from<E>(source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Gateway {
            message: source.to_string(),
            source: Some(Box::new(source)),
        }
    }

    /// Whether this is the internal no-instance-ready marker.
    #[must_use]
    pub fn is_no_db_ready(&self) -> bool {
        matches!(self, Self::NoDbReady { .. })
    }

    /// Whether this error came from a fired cancellation token.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// The template hash associated with this error (if any).
    #[must_use]
    pub fn template_hash(&self) -> Option<&str> {
        match self {
            Self::AlreadyInitialized { hash }
            | Self::TemplateNotFound { hash }
            | Self::InvalidTemplateState { hash, .. }
            | Self::TemplateDiscarded { hash }
            | Self::PoolFull { hash, .. }
            | Self::NoDbReady { hash }
            | Self::UnknownTestDatabase { hash, .. } => Some(hash),
            _ => None,
        }
    }
}
