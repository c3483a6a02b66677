#![forbid(unsafe_code)]
//! Error types for the cachet block-cache stack.
//!
//! One user-facing enum covers every layer. The variants are chosen so
//! that callers can tell apart the three outcomes that demand different
//! reactions: retry the I/O (`Device`), remount or give up
//! (`MediaNotPresent`), and back off or flush (`ResourceExhausted`).
//!
//! Policy notes:
//!
//! - This layer never retries I/O itself. Retry, if any, belongs to the
//!   subordinate device; this crate only classifies.
//! - A detected media change always wins over a block-specific error:
//!   once the ready-changed flag is up, every operation on the instance
//!   returns `MediaNotPresent` until an explicit reset.
//! - All string payloads are owned to keep the error `'static`.

use thiserror::Error;

/// Unified error type for all cachet operations.
#[derive(Debug, Error)]
pub enum CachetError {
    /// Operating system I/O error from a leaf device.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The medium was removed or swapped (subordinate report, anchor
    /// signature mismatch, or failed status check). Sticky until reset.
    #[error("media not present or changed")]
    MediaNotPresent,

    /// Raw device failure with no more specific classification.
    #[error("device error at block {block}: {detail}")]
    Device {
        /// Block on which the failure was observed.
        block: u64,
        /// Driver-level detail, best effort.
        detail: String,
    },

    /// No descriptor could be freed after bounded eviction retries, or
    /// allocating the cache region itself failed.
    #[error("cache resources exhausted: {0}")]
    ResourceExhausted(String),

    /// Range, geometry, or mode arguments out of bounds.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Enable/disable called when the instance is already in that state.
    #[error("already {0}")]
    AlreadyInState(&'static str),
}

impl CachetError {
    /// Whether the error indicates the medium itself is gone, as opposed
    /// to a fault on an otherwise-present device.
    #[must_use]
    pub fn is_media_change(&self) -> bool {
        matches!(self, Self::MediaNotPresent)
    }

    /// Construct a `Device` error for a failure observed at `block`.
    #[must_use]
    pub fn device(block: u64, detail: impl Into<String>) -> Self {
        Self::Device {
            block,
            detail: detail.into(),
        }
    }
}

/// Result alias using `CachetError`.
pub type Result<T> = std::result::Result<T, CachetError>;
