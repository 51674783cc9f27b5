use crate::watch::Position;
use thiserror::Error;

/// Errors returned by a member cluster's resource API
///
/// The variants are split by how callers are expected to react: [`ClusterError::PositionExpired`]
/// asks for a full re-list, [`ClusterError::NotFound`] and [`ClusterError::Conflict`] are answers
/// about the object itself, and everything else is infrastructure noise that should be retried.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClusterError {
    /// The addressed object does not exist
    #[error("object {0} not found")]
    NotFound(String),

    /// An optimistic write lost against a concurrent writer
    #[error("conflict writing {0}: resource version changed")]
    Conflict(String),

    /// The watch could not be resumed because the cluster no longer retains history from
    /// the requested position
    #[error("watch position {0} has expired")]
    PositionExpired(Position),

    /// Timeouts, throttling and other failures that may succeed when retried
    #[error("transient cluster error: {0}")]
    Transient(String),

    /// The cluster could not be reached at all
    #[error("cluster unreachable: {0}")]
    Unreachable(String),
}

impl ClusterError {
    /// Whether retrying the same request later may succeed
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::Unreachable(_) | Self::Conflict(_))
    }

    /// Whether the error means the watch must fall back to a full re-list
    #[must_use]
    pub fn is_position_expired(&self) -> bool {
        matches!(self, Self::PositionExpired(_))
    }
}
