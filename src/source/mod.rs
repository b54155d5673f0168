//! Event source contract.
//!
//! An [`EventSource`] is the OS eventing subsystem seen through the three
//! operations the collector depends on: a reverse point query for the newest
//! matching record, a pull-mode subscription positioned after a cursor, and
//! rendering one record into caller-supplied storage.
//!
//! Handles are associated types so every backend owns its resources the way
//! its platform requires. Dropping a subscription closes it; dropping a record
//! releases it. Ownership alone therefore guarantees each record is released
//! exactly once.

use std::fmt;
use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;

use crate::cursor::Cursor;
use crate::error::SourceError;
use crate::filter::FilterQuery;

pub mod memory;
#[cfg(windows)]
pub mod windows;

pub use memory::{MemoryEventLog, MemoryRecord, MemorySubscription, NewEvent};
#[cfg(windows)]
pub use windows::WindowsEventLog;

/// Longest channel name accepted.
pub const MAX_CHANNEL_NAME_LEN: usize = 255;

/// Result of one poll against a subscription.
#[derive(Debug)]
pub enum Batch<R> {
    /// Records in delivery order.
    Records(Vec<R>),
    /// Nothing further is buffered right now.
    Exhausted,
}

impl<R> Batch<R> {
    /// Returns true for [`Batch::Exhausted`].
    #[must_use]
    pub const fn is_exhausted(&self) -> bool {
        matches!(self, Self::Exhausted)
    }
}

/// Upstream event subsystem.
pub trait EventSource {
    /// Live pull subscription. Dropping it closes it.
    type Subscription: fmt::Debug;
    /// Unrendered record. Dropping it releases it.
    type Record: fmt::Debug;

    /// Returns the most recent record in `channel` matching `filter`, if any.
    ///
    /// An empty channel is `Ok(None)`; `Err` means the query itself could not
    /// be issued.
    fn query_latest(
        &self,
        channel: &str,
        filter: &FilterQuery,
    ) -> Result<Option<Self::Record>, SourceError>;

    /// Opens a pull subscription delivering records strictly after `cursor`.
    fn subscribe(
        &self,
        channel: &str,
        filter: &FilterQuery,
        cursor: &Cursor,
    ) -> Result<Self::Subscription, SourceError>;

    /// Waits up to `wait` for records, then returns at most `max` of them in
    /// delivery order, or [`Batch::Exhausted`].
    fn next_batch(
        &self,
        subscription: &mut Self::Subscription,
        max: usize,
        wait: Duration,
    ) -> Result<Batch<Self::Record>, SourceError>;

    /// Renders `record` as event XML into `buf`, returning the bytes written.
    ///
    /// Must fail with [`SourceError::BufferTooSmall`] when the rendered form
    /// does not fit.
    fn render(&self, record: &Self::Record, buf: &mut [u8]) -> Result<usize, SourceError>;
}

fn channel_name_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"^[^\x00-\x1f<>"'&*?\\]+$"#).expect("channel name regex is valid")
    })
}

/// Checks a channel name, returning the reason it is unusable.
pub fn validate_channel_name(name: &str) -> Result<(), String> {
    if name.trim().is_empty() {
        return Err("channel name is empty".to_string());
    }
    if name.trim() != name {
        return Err("channel name has leading or trailing whitespace".to_string());
    }
    if name.len() > MAX_CHANNEL_NAME_LEN {
        return Err(format!(
            "channel name exceeds maximum length of {MAX_CHANNEL_NAME_LEN}"
        ));
    }
    if !channel_name_regex().is_match(name) {
        return Err("channel name contains reserved characters".to_string());
    }
    Ok(())
}
