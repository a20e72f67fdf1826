//! Error types for metaroute
//!
//! One error enum is shared by the routing table, the directory handle and
//! the replication path so callers can match on a single taxonomy.

use crate::types::{InodeNumber, Server};
use thiserror::Error;

/// Common result type for metaroute operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for metaroute
#[derive(Debug, Error)]
pub enum Error {
    // Lifecycle state errors
    #[error("routing table is not initialized")]
    Uninitialized,

    #[error("routing table already exists")]
    AlreadyInitialized,

    // Lookup errors
    #[error("partition not found: root inode {0}")]
    PartitionNotFound(InodeNumber),

    #[error("server not found: {0}")]
    ServerNotFound(Server),

    #[error("server already registered: {0}")]
    ServerAlreadyExists(Server),

    /// An existing partition references an owner missing from the registry.
    #[error("owner {0} is not a registered server")]
    UnknownOwner(Server),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("invalid server address: {0}")]
    InvalidAddress(String),

    // Resource errors
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    // I/O and encoding errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("corrupted routing table: {0}")]
    Corrupted(String),

    // Network errors
    #[error("transport failure: {0}")]
    Transport(String),

    #[error("protocol mismatch: {0}")]
    ProtocolMismatch(String),

    #[error("request timeout")]
    Timeout,

    // Internal errors
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create an invalid path error
    pub fn invalid_path(path: impl Into<String>) -> Self {
        Self::InvalidPath(path.into())
    }

    /// Create a corruption error
    pub fn corrupted(msg: impl Into<String>) -> Self {
        Self::Corrupted(msg.into())
    }

    /// Create a serialization error
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    /// Check if this error signals a broken invariant or misuse rather than a
    /// condition the caller is expected to recover from.
    ///
    /// Reads against an absent table, updates naming an unregistered owner
    /// and structural requests such as the parent of the root all land here.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Uninitialized
                | Self::UnknownOwner(_)
                | Self::InvalidOperation(_)
                | Self::Corrupted(_)
                | Self::Internal(_)
        )
    }
}
