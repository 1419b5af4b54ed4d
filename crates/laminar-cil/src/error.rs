//! Error types for the sharded committed item list.

use std::collections::TryReserveError;

use crate::context::TransactionDelta;

/// Errors that can occur while building or using a [`ScaleController`](crate::ScaleController).
///
/// Only recoverable conditions are reported here. Broken invariants (a
/// generation drained twice, teardown with pending items) panic instead,
/// because continuing would silently lose log items.
#[derive(Debug, thiserror::Error)]
pub enum CilError {
    /// Per-core or generation storage could not be allocated.
    #[error("Failed to allocate {what}: {source}")]
    Allocation {
        /// What was being allocated.
        what: &'static str,
        /// The underlying reservation error.
        #[source]
        source: TryReserveError,
    },

    /// Invalid configuration.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Core ID outside the range allocated at initialization.
    #[error("Invalid core ID {core_id}: max is {max_core_id}")]
    InvalidCoreId {
        /// The invalid core ID.
        core_id: usize,
        /// The maximum valid core ID.
        max_core_id: usize,
    },
}

/// A commit refused before anything was staged.
///
/// Hands the transaction back untouched, so the caller still owns its items
/// and busy extents and can retry or release them.
pub struct CommitRejected<T, B> {
    /// Why the commit was refused.
    pub error: CilError,
    /// The transaction as it was passed in.
    pub delta: TransactionDelta<T, B>,
}

impl<T, B> std::fmt::Debug for CommitRejected<T, B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommitRejected")
            .field("error", &self.error)
            .field("items", &self.delta.items.len())
            .field("busy_extents", &self.delta.busy_extents.len())
            .finish_non_exhaustive()
    }
}

impl<T, B> std::fmt::Display for CommitRejected<T, B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Commit rejected: {}", self.error)
    }
}

impl<T, B> std::error::Error for CommitRejected<T, B> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

impl<T, B> From<CommitRejected<T, B>> for CilError {
    fn from(rejected: CommitRejected<T, B>) -> Self {
        rejected.error
    }
}
