//! Error types for the experiment run controller
//!
//! Errors carry the Run key (`namespace/name`) where one is known so that every
//! logged failure names the object it happened on.

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for Run reconciliation
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// A work queue key that is not of the form `namespace/name`
    #[error("invalid resource key '{key}': {message}")]
    InvalidKey {
        /// The key as it was dequeued
        key: String,
        /// What is wrong with it
        message: String,
    },

    /// A Run whose pod selector cannot be turned into a label query
    #[error("invalid pod selector for run {run}: {message}")]
    InvalidSelector {
        /// Key of the Run carrying the selector
        run: String,
        /// Parser error
        message: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
    },

    /// A state write that kept failing until the attempt budget ran out
    #[error("run {run} update failed, no save attempts left after {attempts}: {source}")]
    RetriesExhausted {
        /// Key of the Run being written
        run: String,
        /// How many patch attempts were made
        attempts: u32,
        /// The error returned by the last attempt
        #[source]
        source: Box<Error>,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "queue", "informer")
        context: String,
    },
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::serialization(e.to_string())
    }
}

impl Error {
    /// Create an invalid key error
    pub fn invalid_key(key: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::InvalidKey {
            key: key.into(),
            message: msg.into(),
        }
    }

    /// Create an invalid selector error for the given Run key
    pub fn invalid_selector(run: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::InvalidSelector {
            run: run.into(),
            message: msg.into(),
        }
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
        }
    }

    /// Wrap the last write failure of a Run once its attempt budget is spent
    pub fn retries_exhausted(run: impl Into<String>, attempts: u32, last: Error) -> Self {
        Self::RetriesExhausted {
            run: run.into(),
            attempts,
            source: Box::new(last),
        }
    }

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: UNKNOWN_CONTEXT.to_string(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Check if this error is retryable
    ///
    /// Malformed keys, selectors and payloads will fail the same way every
    /// time, so requeueing them only burns the rate limiter.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => match source {
                // Conflicts and throttling resolve on their own; other 4xx need a spec change
                kube::Error::Api(ae) => {
                    !(400..500).contains(&ae.code) || ae.code == 409 || ae.code == 429
                }
                _ => true,
            },
            Error::InvalidKey { .. } => false,
            Error::InvalidSelector { .. } => false,
            Error::Serialization { .. } => false,
            Error::RetriesExhausted { .. } => true,
            Error::Internal { .. } => true,
        }
    }
}
