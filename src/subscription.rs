//! Subscription lifecycle.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::cursor::Cursor;
use crate::error::{CollectorError, CollectorResult};
use crate::filter::FilterQuery;
use crate::source::EventSource;

/// Identifier attached to every opened subscription, for log correlation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubscriptionId(Uuid);

impl SubscriptionId {
    /// Create a new random subscription id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SubscriptionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// An open subscription and where it started.
#[allow(missing_docs)]
#[derive(Debug)]
pub struct ActiveSubscription<T> {
    pub id: SubscriptionId,
    pub handle: T,
    pub started_at: Cursor,
    pub opened_at: DateTime<Utc>,
}

/// Owns at most one pull subscription for a collector instance.
#[derive(Debug)]
pub struct SubscriptionManager<T> {
    active: Option<ActiveSubscription<T>>,
}

impl<T> SubscriptionManager<T> {
    /// Creates a manager with nothing open.
    #[must_use]
    pub const fn new() -> Self {
        Self { active: None }
    }

    /// Returns true if a subscription is open.
    #[must_use]
    pub const fn is_open(&self) -> bool {
        self.active.is_some()
    }

    /// The open subscription, if any.
    #[must_use]
    pub const fn active(&self) -> Option<&ActiveSubscription<T>> {
        self.active.as_ref()
    }

    /// Mutable access to the open subscription, if any.
    pub fn active_mut(&mut self) -> Option<&mut ActiveSubscription<T>> {
        self.active.as_mut()
    }

    /// Opens a pull subscription delivering records strictly after `cursor`.
    ///
    /// Does nothing if one is already open. Failures are not retried here;
    /// the next scheduled cycle tries again.
    ///
    /// # Errors
    ///
    /// `CollectorError::Subscribe` for an invalid channel name or filter, or
    /// an absent or disabled channel.
    pub fn open<S>(
        &mut self,
        source: &S,
        channel: &str,
        filter: &FilterQuery,
        cursor: Cursor,
    ) -> CollectorResult<SubscriptionId>
    where
        S: EventSource<Subscription = T>,
    {
        if let Some(active) = &self.active {
            return Ok(active.id);
        }

        let handle = source
            .subscribe(channel, filter, &cursor)
            .map_err(|err| CollectorError::Subscribe {
                channel: channel.to_string(),
                source: err,
            })?;

        let id = SubscriptionId::new();
        info!(%channel, subscription = %id, %cursor, filter = %filter, "subscription opened");
        self.active = Some(ActiveSubscription {
            id,
            handle,
            started_at: cursor,
            opened_at: Utc::now(),
        });
        Ok(id)
    }

    /// Closes the open subscription. Safe to call when nothing is open.
    pub fn close(&mut self) {
        if let Some(active) = self.active.take() {
            debug!(subscription = %active.id, "subscription closed");
            drop(active);
        }
    }
}

impl<T> Default for SubscriptionManager<T> {
    fn default() -> Self {
        Self::new()
    }
}
