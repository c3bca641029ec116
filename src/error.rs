//! Error types.
//!
//! Errors fall into three grades:
//!
//! | Category | Variants | Recovery |
//! |----------|----------|----------|
//! | **Validation** | `InvalidArgument`, `NotImplemented` | Fix the call |
//! | **Domain rule** | `NotCompleted`, `NotFound` | Complete the job, force, or re-create |
//! | **Store** | `Store`, `Serialization` | Surface to the caller, never retried here |

use thiserror::Error;

use crate::store::StoreError;

/// Errors that can occur while recording or querying job statuses.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StatusError {
    // ── Validation errors (fix the call) ─────────────────────────────
    /// Malformed predicate, unknown state or timestamp name, missing
    /// required pair, blank id, out-of-range progress.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// A collection mutation was requested without the predicate it needs.
    #[error("Not implemented: {0}")]
    NotImplemented(String),

    // ── Domain-rule errors ───────────────────────────────────────────
    /// Deletion attempted while the job is still incomplete.
    #[error("Job not completed: {0}")]
    NotCompleted(String),

    /// A record that was loaded earlier no longer exists.
    #[error("Job not found: {0}")]
    NotFound(String),

    // ── Store errors ─────────────────────────────────────────────────
    /// Failure reported by the key-value store.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// A stored field could not be decoded.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StatusError {
    /// Returns `true` if the call was rejected before touching the store.
    pub fn is_validation(&self) -> bool {
        matches!(self, Self::InvalidArgument(_) | Self::NotImplemented(_))
    }

    /// Returns `true` if the failure came from the store or its data.
    pub fn is_store(&self) -> bool {
        matches!(self, Self::Store(_) | Self::Serialization(_))
    }

    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }
}

/// Result type for status operations.
pub type StatusResult<T> = Result<T, StatusError>;
