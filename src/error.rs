//! Error types for eventlog-tail.
//!
//! Every failure a collection cycle can hit is a variant of [`CollectorError`].
//! Sources report their own failures as [`SourceError`], which each component
//! wraps into the collector-level kind that matches where it happened.

use thiserror::Error;

use crate::event::RecordId;

/// Failures reported by an [`EventSource`](crate::source::EventSource).
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("Channel not found: {channel}")]
    ChannelNotFound {
        channel: String,
    },

    #[error("Channel is disabled: {channel}")]
    ChannelDisabled {
        channel: String,
    },

    #[error("Invalid channel name '{channel}': {reason}")]
    InvalidChannel {
        channel: String,
        reason: String,
    },

    #[error("Invalid filter query '{query}': {reason}")]
    InvalidQuery {
        query: String,
        reason: String,
    },

    #[error("Record needs {required} bytes, buffer holds {capacity}")]
    BufferTooSmall {
        required: usize,
        capacity: usize,
    },

    #[error("Subscription is closed")]
    SubscriptionClosed,

    #[error("Operating system error {code}: {message}")]
    Os {
        code: u32,
        message: String,
    },

    #[error("Event source backend error: {0}")]
    Backend(String),
}

/// Top-level error type for eventlog-tail.
#[derive(Debug, Error)]
pub enum CollectorError {
    #[error("Configuration error: {reason}")]
    Config {
        reason: String,
    },

    #[error("Reverse query on channel '{channel}' failed: {source}")]
    Query {
        channel: String,
        #[source]
        source: SourceError,
    },

    #[error("Subscribing to channel '{channel}' failed: {source}")]
    Subscribe {
        channel: String,
        #[source]
        source: SourceError,
    },

    #[error("Draining subscription failed: {source}")]
    Drain {
        #[source]
        source: SourceError,
    },

    #[error("Rendered record needs {required} bytes, scratch buffer holds {capacity}")]
    RenderOverflow {
        required: usize,
        capacity: usize,
    },

    #[error("Rendering record failed: {source}")]
    Render {
        #[source]
        source: SourceError,
    },

    #[error("Malformed event record: {reason}")]
    Parse {
        reason: String,
        record_id: Option<RecordId>,
    },
}

/// Coarse classification of a [`CollectorError`], mirroring the policy table
/// the cycle follows.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Config,
    Query,
    Subscribe,
    Drain,
    RenderOverflow,
    Render,
    Parse,
}

impl CollectorError {
    /// Creates a configuration error.
    #[must_use]
    pub fn config(reason: impl Into<String>) -> Self {
        Self::Config {
            reason: reason.into(),
        }
    }

    /// Creates a parse error without a known record id.
    #[must_use]
    pub fn parse(reason: impl Into<String>) -> Self {
        Self::Parse {
            reason: reason.into(),
            record_id: None,
        }
    }

    /// Returns the policy kind of this error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Config { .. } => ErrorKind::Config,
            Self::Query { .. } => ErrorKind::Query,
            Self::Subscribe { .. } => ErrorKind::Subscribe,
            Self::Drain { .. } => ErrorKind::Drain,
            Self::RenderOverflow { .. } => ErrorKind::RenderOverflow,
            Self::Render { .. } => ErrorKind::Render,
            Self::Parse { .. } => ErrorKind::Parse,
        }
    }

    /// Returns true if no further cycles should be scheduled.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::Config { .. })
    }

    /// Returns true if the failure aborts the cycle but the next scheduled
    /// cycle is expected to try again.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Query { .. } | Self::Subscribe { .. } | Self::Drain { .. })
    }

    /// Returns true if the failure only drops the current record.
    #[must_use]
    pub const fn is_record_skip(&self) -> bool {
        matches!(
            self,
            Self::RenderOverflow { .. } | Self::Render { .. } | Self::Parse { .. }
        )
    }
}

/// Result type alias for collector operations.
pub type CollectorResult<T> = Result<T, CollectorError>;
