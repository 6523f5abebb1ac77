//! Error taxonomy for the knowledge base.
//!
//! Every fallible knowledge-base operation returns [`KbError`]. Variants
//! fall into four classes, see [`KbError::kind`]:
//!
//! | Kind | Variants |
//! |------|----------|
//! | validation | `InvalidCategory`, `InvalidSeverity`, `InvalidStatus`, `EmptyEmbedding`, `InvalidEmbedding`, `Validation` |
//! | not found | `NotFound` |
//! | persistence | `Persistence` |
//! | concurrency | `LockTimeout` |

use std::time::Duration;

use thiserror::Error;

/// Errors raised by the opportunity store.
#[derive(Debug, Error)]
pub enum KbError {
    /// Category string outside `pain_point | improvement_opportunity | feature_request`.
    #[error("invalid category: '{0}'")]
    InvalidCategory(String),

    /// Severity string outside `low | medium | high | critical`.
    #[error("invalid severity: '{0}'")]
    InvalidSeverity(String),

    /// Status string outside the workflow states.
    #[error("invalid status: '{0}'")]
    InvalidStatus(String),

    /// No embedding vector was supplied, so similarity cannot be computed.
    #[error("embedding must not be empty")]
    EmptyEmbedding,

    /// The embedding contains NaN or infinite components.
    #[error("invalid embedding: {0}")]
    InvalidEmbedding(String),

    /// Any other rejected input (empty title, empty source id, bad threshold).
    #[error("invalid input: {0}")]
    Validation(String),

    /// Lookup of an unknown opportunity id.
    #[error("opportunity not found: {0}")]
    NotFound(String),

    /// The backing store failed; no partial state was written.
    #[error("persistence error: {0:#}")]
    Persistence(#[source] anyhow::Error),

    /// The writer lock was not acquired within the configured wait.
    #[error("knowledge base is busy: writer lock not acquired within {0:?}")]
    LockTimeout(Duration),
}

/// Coarse error class, used for exit codes and HTTP status mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    NotFound,
    Persistence,
    Concurrency,
}

impl KbError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidCategory(_)
            | Self::InvalidSeverity(_)
            | Self::InvalidStatus(_)
            | Self::EmptyEmbedding
            | Self::InvalidEmbedding(_)
            | Self::Validation(_) => ErrorKind::Validation,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Persistence(_) => ErrorKind::Persistence,
            Self::LockTimeout(_) => ErrorKind::Concurrency,
        }
    }

    pub fn is_validation(&self) -> bool {
        self.kind() == ErrorKind::Validation
    }
}
