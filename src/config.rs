//! Collector configuration.
//!
//! Loaded from TOML; every key except `eventlog_name` has a default:
//!
//! ```toml
//! eventlog_name = "Application"
//! xpath_query = "*[System[Level=2]]"
//! measurement = "win_event"
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{CollectorError, CollectorResult};
use crate::filter::FilterQuery;
use crate::metric::DEFAULT_MEASUREMENT;
use crate::poller::{DEFAULT_BATCH_SIZE, DEFAULT_POLL_TIMEOUT};
use crate::render::DEFAULT_RENDER_BUFFER_SIZE;
use crate::source::validate_channel_name;

/// Smallest scratch buffer accepted.
pub const MIN_RENDER_BUFFER_SIZE: usize = 256;

/// Settings for one collector instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CollectorConfig {
    /// Channel to tail.
    pub eventlog_name: String,
    /// Filter query; empty or `*` selects every record.
    #[serde(default = "default_query")]
    pub xpath_query: String,
    /// Measurement name of emitted metrics.
    #[serde(default = "default_measurement")]
    pub measurement: String,
    /// Records pulled per poll.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Scratch buffer size in bytes.
    #[serde(default = "default_render_buffer_size")]
    pub render_buffer_size: usize,
    /// How long one poll waits for the first record, in milliseconds.
    #[serde(default = "default_poll_timeout_ms")]
    pub poll_timeout_ms: u64,
}

fn default_query() -> String {
    "*".to_string()
}
fn default_measurement() -> String {
    DEFAULT_MEASUREMENT.to_string()
}
fn default_batch_size() -> usize {
    DEFAULT_BATCH_SIZE
}
fn default_render_buffer_size() -> usize {
    DEFAULT_RENDER_BUFFER_SIZE
}
fn default_poll_timeout_ms() -> u64 {
    u64::try_from(DEFAULT_POLL_TIMEOUT.as_millis()).unwrap_or(u64::MAX)
}

impl CollectorConfig {
    /// Creates a config for `channel` with every other setting defaulted.
    #[must_use]
    pub fn new(channel: impl Into<String>) -> Self {
        Self {
            eventlog_name: channel.into(),
            xpath_query: default_query(),
            measurement: default_measurement(),
            batch_size: default_batch_size(),
            render_buffer_size: default_render_buffer_size(),
            poll_timeout_ms: default_poll_timeout_ms(),
        }
    }

    #[allow(missing_docs)]
    #[must_use]
    pub fn with_query(mut self, query: impl Into<String>) -> Self {
        self.xpath_query = query.into();
        self
    }

    #[allow(missing_docs)]
    #[must_use]
    pub fn with_measurement(mut self, measurement: impl Into<String>) -> Self {
        self.measurement = measurement.into();
        self
    }

    #[allow(missing_docs)]
    #[must_use]
    pub const fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    #[allow(missing_docs)]
    #[must_use]
    pub const fn with_render_buffer_size(mut self, bytes: usize) -> Self {
        self.render_buffer_size = bytes;
        self
    }

    #[allow(missing_docs)]
    #[must_use]
    pub fn with_poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Poll wait as a `Duration`.
    #[must_use]
    pub const fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    /// Parses a TOML document.
    ///
    /// # Errors
    ///
    /// `CollectorError::Config` if the document does not deserialize or fails
    /// [`validate`](Self::validate).
    pub fn from_toml_str(text: &str) -> CollectorResult<Self> {
        let config: Self = toml::from_str(text)
            .map_err(|e| CollectorError::config(format!("invalid TOML: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Reads and parses a TOML file.
    ///
    /// # Errors
    ///
    /// `CollectorError::Config` if the file cannot be read or is invalid.
    pub fn from_file(path: &Path) -> CollectorResult<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| CollectorError::config(format!("reading {}: {e}", path.display())))?;
        Self::from_toml_str(&text)
    }

    /// Checks every setting and returns the parsed filter.
    ///
    /// # Errors
    ///
    /// `CollectorError::Config` naming the first invalid setting.
    pub fn validate(&self) -> CollectorResult<FilterQuery> {
        validate_channel_name(&self.eventlog_name)
            .map_err(|reason| CollectorError::config(format!("eventlog_name: {reason}")))?;

        let filter = FilterQuery::parse(&self.xpath_query)
            .map_err(|e| CollectorError::config(format!("xpath_query: {e}")))?;

        if self.measurement.trim().is_empty() {
            return Err(CollectorError::config("measurement: must not be empty"));
        }
        if self.batch_size == 0 {
            return Err(CollectorError::config("batch_size: must be at least 1"));
        }
        if self.render_buffer_size < MIN_RENDER_BUFFER_SIZE {
            return Err(CollectorError::config(format!(
                "render_buffer_size: must be at least {MIN_RENDER_BUFFER_SIZE} bytes"
            )));
        }
        Ok(filter)
    }
}
