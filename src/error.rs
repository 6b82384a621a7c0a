//! Error types for the Consul KV operator
//!
//! Every failure aborts the current reconciliation cycle and is surfaced to
//! the controller runtime, which requeues with backoff. Variants carry the
//! key or resource they concern so operator logs point at the culprit.

use thiserror::Error;

/// Main error type for the Consul KV operator
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The Consul endpoint could not be reached (connect failure, timeout, broken body)
    #[error("transport error for {url}: {message}")]
    Transport {
        /// Request URL
        url: String,
        /// Underlying failure
        message: String,
    },

    /// Consul answered with a non-success status
    #[error("lookup of key '{key}' failed with HTTP status {status}")]
    RemoteLookup {
        /// Source key that was requested
        key: String,
        /// HTTP status code
        status: u16,
    },

    /// Consul returned a record array without exactly one entry
    #[error("expected exactly one entry for key '{key}', got {count}")]
    Shape {
        /// Source key that was requested
        key: String,
        /// Number of records in the response
        count: usize,
    },

    /// The response body or the base64 value could not be decoded
    #[error("failed to decode value for key '{key}': {message}")]
    Decode {
        /// Source key that was requested
        key: String,
        /// What went wrong
        message: String,
    },

    /// Reading or writing a Kubernetes object failed
    #[error("kubernetes store error: {0}")]
    Store(#[from] kube::Error),

    /// The KVSecret spec is invalid
    #[error("validation error: {0}")]
    Validation(String),

    /// The target Secret is controlled by a different object
    #[error("secret '{secret}' is already controlled by {owner}")]
    OwnershipConflict {
        /// Target Secret name
        secret: String,
        /// Kind/name of the existing controller
        owner: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl Error {
    /// Create a transport error for the given URL
    pub fn transport(url: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Transport {
            url: url.into(),
            message: msg.into(),
        }
    }

    /// Create a remote lookup error for a key and HTTP status
    pub fn remote_lookup(key: impl Into<String>, status: u16) -> Self {
        Self::RemoteLookup {
            key: key.into(),
            status,
        }
    }

    /// Create a shape error for a key and the observed record count
    pub fn shape(key: impl Into<String>, count: usize) -> Self {
        Self::Shape {
            key: key.into(),
            count,
        }
    }

    /// Create a decode error for a key
    pub fn decode(key: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Decode {
            key: key.into(),
            message: msg.into(),
        }
    }

    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create an ownership conflict error
    pub fn ownership_conflict(secret: impl Into<String>, owner: impl Into<String>) -> Self {
        Self::OwnershipConflict {
            secret: secret.into(),
            owner: owner.into(),
        }
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    /// Whether a later cycle can succeed without anyone editing the KVSecret
    ///
    /// Remote data can change and endpoints come back, so fetch errors are
    /// retryable. Store errors are retryable unless the API rejected the
    /// request outright (4xx other than conflicts).
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Transport { .. } => true,
            Error::RemoteLookup { .. } => true,
            Error::Shape { .. } => true,
            Error::Decode { .. } => true,
            Error::Store(source) => !matches!(
                source,
                kube::Error::Api(ae) if (400..500).contains(&ae.code) && ae.code != 409
            ),
            Error::Validation(_) => false,
            Error::OwnershipConflict { .. } => false,
            Error::Serialization(_) => false,
        }
    }

    /// The Consul key this error concerns, if any
    pub fn source_key(&self) -> Option<&str> {
        match self {
            Error::RemoteLookup { key, .. } => Some(key),
            Error::Shape { key, .. } => Some(key),
            Error::Decode { key, .. } => Some(key),
            _ => None,
        }
    }
}
