//! # eventlog-tail - Incremental Event Log Collection
//!
//! eventlog-tail reads new records from a named event channel and turns each
//! into a flat metric. A collector keeps a cursor on the last record it
//! consumed and a pull subscription open across cycles, so every cycle emits
//! only what arrived since the previous one, in channel order.
//!
//! ## Core Concepts
//!
//! - **EventSource**: the OS eventing subsystem (Windows Event Log, or the
//!   in-memory log used for embedding and tests)
//! - **Cursor**: the last consumed record, established from the newest
//!   matching record on first run so history is never replayed
//! - **Collector**: one instance per channel, running `gather` cycles
//! - **Metric**: measurement name, fields and a `level` tag
//!
//! ## Usage
//!
//! ```rust
//! use eventlog_tail::{Collector, CollectorConfig, MemoryEventLog, NewEvent};
//!
//! let log = MemoryEventLog::new();
//! log.create_channel("Application");
//!
//! let config = CollectorConfig::new("Application")
//!     .with_poll_timeout(std::time::Duration::ZERO);
//! let mut collector = Collector::new(config, log.clone())?;
//! collector.gather()?; // establishes the cursor; nothing old is replayed
//!
//! log.append("Application", NewEvent::new(1000, "Demo").data("user", "alice"))?;
//! let gathered = collector.gather()?;
//! assert_eq!(gathered.metrics.len(), 1);
//! println!("{}", gathered.metrics[0]);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

// Core types
pub mod config;
pub mod error;
pub mod event;
pub mod filter;
pub mod source;

// Cycle components
pub mod cursor;
pub mod metric;
pub mod parser;
pub mod poller;
pub mod render;
pub mod subscription;

pub mod collector;
pub mod logging;

// Re-export primary types at crate root for convenience
pub use collector::{Collector, GatherReport, Gathered, SkippedRecord};
pub use config::CollectorConfig;
pub use cursor::{Cursor, CursorStore};
pub use error::{CollectorError, CollectorResult, ErrorKind, SourceError};
pub use event::{EventDataPair, ParsedEvent, RecordId};
pub use filter::{FilterQuery, FilterSyntaxError};
pub use metric::{FieldValue, Metric, MetricEmitter, MetricSink, OutputFormat, WriterSink};
pub use parser::RecordParser;
pub use poller::BatchPoller;
pub use render::RecordRenderer;
pub use source::{Batch, EventSource, MemoryEventLog, NewEvent};
#[cfg(windows)]
pub use source::WindowsEventLog;
pub use subscription::{SubscriptionId, SubscriptionManager};
