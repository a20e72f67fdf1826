//! Channel error type

use crate::module::CommunicationModule;

/// Error type for channel operations
#[derive(Debug, thiserror::Error)]
pub enum CommError {
    #[error("channel to {0} already exists")]
    ChannelExists(String),

    #[error("no channel to {0}")]
    NoChannel(String),

    #[error("failed to open channel to {peer}: {reason}")]
    ChannelCreation { peer: String, reason: String },

    #[error("target #{index} ({peer}) has no channel")]
    UnknownTarget { index: usize, peer: String },

    #[error("send to target #{index} ({peer}) failed: {reason}")]
    SendFailed {
        index: usize,
        peer: String,
        reason: String,
    },

    #[error("message of {len} bytes exceeds the {max} byte limit")]
    MessageTooLarge { len: usize, max: usize },

    #[error("out of memory: {0}")]
    NoMemory(String),

    #[error("{failed} of {total} channels failed to close")]
    TeardownIncomplete { failed: usize, total: usize },

    #[error("malformed message: {0}")]
    Malformed(String),

    #[error("unknown message id {0}")]
    UnknownMessageId(u64),

    #[error("no receiver registered for module {0}")]
    NoReceiver(CommunicationModule),

    #[error("timed out after {received} of {expected} replies")]
    Timeout { received: usize, expected: usize },

    #[error("connection closed by peer")]
    Closed,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for channel operations
pub type CommResult<T> = Result<T, CommError>;

impl CommError {
    /// `ensure_channel` reports an existing channel as an error; most
    /// callers treat it as success.
    #[must_use]
    pub const fn is_already_exists(&self) -> bool {
        matches!(self, Self::ChannelExists(_))
    }

    /// Index of the target that failed in a multi target send
    #[must_use]
    pub const fn failed_index(&self) -> Option<usize> {
        match self {
            Self::UnknownTarget { index, .. } | Self::SendFailed { index, .. } => Some(*index),
            _ => None,
        }
    }
}

impl From<CommError> for metaroute_common::Error {
    fn from(e: CommError) -> Self {
        match e {
            CommError::Timeout { .. } => Self::Timeout,
            CommError::Malformed(msg) => Self::ProtocolMismatch(msg),
            CommError::NoMemory(msg) => Self::ResourceExhausted(msg),
            other => Self::Transport(other.to_string()),
        }
    }
}
