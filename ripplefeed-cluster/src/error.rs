//! Error types for the change-feed subsystem

use ripplefeed_core::ShardId;
use thiserror::Error;

/// Change-feed error types
///
/// Errors are `Clone` because a feed-level failure is delivered to every
/// downstream consumer of the feed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Shard {shard} will never deliver stamp {expected}")]
    GapExhausted { shard: ShardId, expected: u64 },

    #[error("Registration failed: {0}")]
    Registration(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Interrupted by shutdown")]
    Interrupted,

    #[error("Broadcast server {0} is stopped")]
    ServerStopped(ShardId),

    #[error("Changefeed aborted: {0}")]
    FeedAborted(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Delivery error: {0}")]
    Delivery(String),
}

/// Result type for change-feed operations
pub type Result<T> = std::result::Result<T, Error>;
