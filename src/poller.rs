//! Bounded batch draining.

use std::time::Duration;

use crate::error::{CollectorError, CollectorResult, SourceError};
use crate::source::{Batch, EventSource};

/// Default number of records pulled per poll.
pub const DEFAULT_BATCH_SIZE: usize = 5;

/// Default time a poll waits for the first record.
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_secs(1);

/// Pulls bounded batches from an open subscription.
#[derive(Debug, Clone, Copy)]
pub struct BatchPoller {
    max_batch: usize,
    wait: Duration,
}

impl BatchPoller {
    /// Creates a poller. A zero `max_batch` makes every poll fail.
    #[must_use]
    pub const fn new(max_batch: usize, wait: Duration) -> Self {
        Self { max_batch, wait }
    }

    #[allow(missing_docs)]
    #[must_use]
    pub const fn max_batch(&self) -> usize {
        self.max_batch
    }

    #[allow(missing_docs)]
    #[must_use]
    pub const fn wait(&self) -> Duration {
        self.wait
    }

    /// Returns the next batch, in delivery order, or `Exhausted`.
    ///
    /// An empty batch is reported as `Exhausted`.
    ///
    /// # Errors
    ///
    /// `CollectorError::Drain` for any source failure, and for a source that
    /// hands back more than `max_batch` records.
    pub fn next<S: EventSource>(
        &self,
        source: &S,
        subscription: &mut S::Subscription,
    ) -> CollectorResult<Batch<S::Record>> {
        if self.max_batch == 0 {
            return Err(CollectorError::Drain {
                source: SourceError::Backend("batch size must be at least 1".to_string()),
            });
        }

        let batch = source
            .next_batch(subscription, self.max_batch, self.wait)
            .map_err(|err| CollectorError::Drain { source: err })?;

        match batch {
            Batch::Records(records) if records.is_empty() => Ok(Batch::Exhausted),
            Batch::Records(records) if records.len() > self.max_batch => Err(CollectorError::Drain {
                source: SourceError::Backend(format!(
                    "source returned {} records for a batch of {}",
                    records.len(),
                    self.max_batch
                )),
            }),
            other => Ok(other),
        }
    }
}

impl Default for BatchPoller {
    fn default() -> Self {
        Self::new(DEFAULT_BATCH_SIZE, DEFAULT_POLL_TIMEOUT)
    }
}
