//! Collection cycles.
//!
//! A [`Collector`] owns every piece of per-instance state: the cursor, the
//! subscription, and the render scratch buffer. Each call to
//! [`Collector::gather`] runs one cycle:
//!
//! 1. establish the cursor if none is held
//! 2. open the subscription if none is open
//! 3. drain batches until the subscription is exhausted
//! 4. render, parse and emit each record in delivery order
//! 5. advance the cursor to the last record parsed
//!
//! A record that overflows the scratch buffer or fails to parse is skipped;
//! the batch goes on. A poll failure ends the drain but keeps the progress
//! already made. Cursor and subscription survive between cycles and are only
//! released by [`Collector::shutdown`] or drop.

use tracing::{debug, error, warn};

use crate::config::CollectorConfig;
use crate::cursor::{Cursor, CursorStore};
use crate::error::{CollectorError, CollectorResult};
use crate::event::RecordId;
use crate::filter::FilterQuery;
use crate::metric::{Metric, MetricEmitter, MetricSink};
use crate::parser::RecordParser;
use crate::poller::BatchPoller;
use crate::render::RecordRenderer;
use crate::source::{Batch, EventSource};
use crate::subscription::{SubscriptionId, SubscriptionManager};

/// A record dropped during a cycle.
#[derive(Debug)]
pub struct SkippedRecord {
    /// Record id, when it could be recovered.
    pub record_id: Option<RecordId>,
    /// Why it was dropped.
    pub error: CollectorError,
}

/// What one cycle did.
#[derive(Debug, Default)]
pub struct GatherReport {
    /// Metrics handed to the sink.
    pub emitted: usize,
    /// Records skipped for render or parse failures.
    pub skipped: Vec<SkippedRecord>,
    /// Set when a poll failure ended the drain early.
    pub aborted: Option<CollectorError>,
    /// Cursor after the cycle.
    pub cursor: Option<Cursor>,
}

impl GatherReport {
    /// Returns true if the drain ran until the subscription was exhausted.
    #[must_use]
    pub const fn completed(&self) -> bool {
        self.aborted.is_none()
    }
}

/// Metrics collected by one cycle, plus its report.
#[derive(Debug, Default)]
pub struct Gathered {
    #[allow(missing_docs)]
    pub metrics: Vec<Metric>,
    #[allow(missing_docs)]
    pub report: GatherReport,
}

/// Incremental reader for one channel.
///
/// `gather` takes `&mut self`, so cycles on one collector can never overlap.
#[derive(Debug)]
pub struct Collector<S: EventSource> {
    config: CollectorConfig,
    filter: FilterQuery,
    source: S,
    cursor: CursorStore,
    subscription: SubscriptionManager<S::Subscription>,
    poller: BatchPoller,
    renderer: RecordRenderer,
    parser: RecordParser,
    emitter: MetricEmitter,
}

impl<S: EventSource> Collector<S> {
    /// Builds a collector over `source`.
    ///
    /// # Errors
    ///
    /// `CollectorError::Config` if `config` is invalid; no collector is
    /// built, so no cycle can ever be scheduled.
    pub fn new(config: CollectorConfig, source: S) -> CollectorResult<Self> {
        let filter = config.validate()?;
        Ok(Self {
            filter,
            poller: BatchPoller::new(config.batch_size, config.poll_timeout()),
            renderer: RecordRenderer::new(config.render_buffer_size),
            parser: RecordParser::new(),
            emitter: MetricEmitter::new(config.measurement.clone()),
            cursor: CursorStore::new(),
            subscription: SubscriptionManager::new(),
            source,
            config,
        })
    }

    #[allow(missing_docs)]
    #[must_use]
    pub const fn config(&self) -> &CollectorConfig {
        &self.config
    }

    /// The event source this collector reads from.
    #[must_use]
    pub const fn source(&self) -> &S {
        &self.source
    }

    /// The held cursor, if established.
    #[must_use]
    pub const fn cursor(&self) -> Option<Cursor> {
        self.cursor.get()
    }

    /// Returns true while a subscription is open.
    #[must_use]
    pub const fn is_subscribed(&self) -> bool {
        self.subscription.is_open()
    }

    /// Id of the open subscription.
    #[must_use]
    pub fn subscription_id(&self) -> Option<SubscriptionId> {
        self.subscription.active().map(|a| a.id)
    }

    /// Runs one cycle, collecting metrics into a `Vec`.
    ///
    /// # Errors
    ///
    /// See [`gather_into`](Self::gather_into).
    pub fn gather(&mut self) -> CollectorResult<Gathered> {
        let mut metrics = Vec::new();
        let report = self.gather_into(&mut metrics)?;
        Ok(Gathered { metrics, report })
    }

    /// Runs one cycle, handing each metric to `sink` as soon as it is built.
    ///
    /// # Errors
    ///
    /// - `CollectorError::Query` if the cursor could not be established
    /// - `CollectorError::Subscribe` if the subscription could not be opened
    ///
    /// Either leaves the corresponding state unset for the next cycle. Poll
    /// failures are not returned here; they end up in
    /// [`GatherReport::aborted`] alongside the progress made before them.
    pub fn gather_into(&mut self, sink: &mut dyn MetricSink) -> CollectorResult<GatherReport> {
        let channel = self.config.eventlog_name.as_str();

        let cursor = self
            .cursor
            .ensure(&self.source, channel, &self.filter, &mut self.renderer, &self.parser)
            .inspect_err(|err| error!(%channel, error = %err, "cursor lookup failed"))?;

        self.subscription
            .open(&self.source, channel, &self.filter, cursor)
            .inspect_err(|err| error!(%channel, error = %err, "subscribe failed"))?;

        let mut report = GatherReport::default();
        let mut last_parsed: Option<RecordId> = None;

        loop {
            let Some(active) = self.subscription.active_mut() else {
                break;
            };
            let subscription_id = active.id;

            let records = match self.poller.next(&self.source, &mut active.handle) {
                Ok(Batch::Records(records)) => records,
                Ok(Batch::Exhausted) => break,
                Err(err) => {
                    error!(%channel, subscription = %subscription_id, error = %err, "drain aborted");
                    report.aborted = Some(err);
                    break;
                }
            };

            for record in records {
                let parsed = self
                    .renderer
                    .render(&self.source, record)
                    .and_then(|bytes| self.parser.parse(bytes));

                match parsed {
                    Ok(event) => {
                        last_parsed = Some(event.record_id);
                        sink.emit(self.emitter.emit(&event));
                        report.emitted += 1;
                    }
                    Err(err) => {
                        let record_id = match &err {
                            CollectorError::Parse { record_id, .. } => *record_id,
                            _ => None,
                        };
                        warn!(%channel, record_id = ?record_id, error = %err, "skipping record");
                        report.skipped.push(SkippedRecord { record_id, error: err });
                    }
                }
            }
        }

        if let Some(record_id) = last_parsed {
            self.cursor.advance(record_id);
        }
        report.cursor = self.cursor.get();

        debug!(
            %channel,
            emitted = report.emitted,
            skipped = report.skipped.len(),
            cursor = ?report.cursor,
            "cycle finished"
        );
        Ok(report)
    }

    /// Closes the subscription and forgets the cursor.
    ///
    /// The next `gather` starts over as if on first run.
    pub fn shutdown(&mut self) {
        self.subscription.close();
        self.cursor.reset();
    }
}
