//! Consumed-position tracking.

use std::fmt;

use tracing::{debug, warn};

use crate::error::{CollectorError, CollectorResult};
use crate::event::RecordId;
use crate::filter::FilterQuery;
use crate::parser::RecordParser;
use crate::render::RecordRenderer;
use crate::source::EventSource;

/// Position of the last record already consumed on a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Cursor {
    /// Nothing consumed yet and nothing to replay; only records appended after
    /// the subscription opens are delivered.
    FromNow,
    /// Every record up to and including this id has been consumed.
    After(RecordId),
}

impl Cursor {
    /// The record id this cursor sits on, if it is positioned on one.
    #[must_use]
    pub const fn record_id(&self) -> Option<RecordId> {
        match self {
            Self::FromNow => None,
            Self::After(id) => Some(*id),
        }
    }
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FromNow => f.write_str("from-now"),
            Self::After(id) => write!(f, "after:{id}"),
        }
    }
}

/// Holds the cursor for one collector instance.
///
/// The cursor is computed lazily on the first cycle and reused afterwards. It
/// only ever moves forward.
#[derive(Debug, Default)]
pub struct CursorStore {
    cursor: Option<Cursor>,
}

impl CursorStore {
    /// Creates an empty store.
    #[must_use]
    pub const fn new() -> Self {
        Self { cursor: None }
    }

    /// The held cursor, if one has been established.
    #[must_use]
    pub const fn get(&self) -> Option<Cursor> {
        self.cursor
    }

    /// Establishes the cursor if none is held.
    ///
    /// The newest record matching `filter` becomes the starting point, so no
    /// historical backlog is replayed. An empty channel starts "from now".
    ///
    /// # Errors
    ///
    /// `CollectorError::Query` if the reverse query cannot be issued. The
    /// cursor stays unset in that case.
    pub fn ensure<S: EventSource>(
        &mut self,
        source: &S,
        channel: &str,
        filter: &FilterQuery,
        renderer: &mut RecordRenderer,
        parser: &RecordParser,
    ) -> CollectorResult<Cursor> {
        if let Some(cursor) = self.cursor {
            return Ok(cursor);
        }

        let latest = source
            .query_latest(channel, filter)
            .map_err(|err| CollectorError::Query {
                channel: channel.to_string(),
                source: err,
            })?;

        let cursor = match latest {
            None => Cursor::FromNow,
            Some(record) => match renderer.render(source, record).and_then(|bytes| parser.parse(bytes)) {
                Ok(event) => Cursor::After(event.record_id),
                Err(err) => {
                    warn!(%channel, error = %err, "newest record unreadable, starting from now");
                    Cursor::FromNow
                }
            },
        };

        debug!(%channel, %cursor, "cursor initialised");
        self.cursor = Some(cursor);
        Ok(cursor)
    }

    /// Moves the cursor to `record_id`.
    ///
    /// A value behind the held position is ignored.
    pub fn advance(&mut self, record_id: RecordId) -> Cursor {
        let next = match self.cursor {
            Some(Cursor::After(current)) if record_id < current => {
                warn!(current, requested = record_id, "refusing to rewind cursor");
                Cursor::After(current)
            }
            _ => Cursor::After(record_id),
        };
        self.cursor = Some(next);
        next
    }

    /// Forgets the held cursor.
    pub fn reset(&mut self) {
        self.cursor = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::{MemoryEventLog, NewEvent};

    fn parts() -> (RecordRenderer, RecordParser) {
        (RecordRenderer::new(16 * 1024), RecordParser::new())
    }

    #[test]
    fn test_empty_channel_starts_from_now() {
        let log = MemoryEventLog::new();
        log.create_channel("Application");
        let (mut renderer, parser) = parts();
        let mut store = CursorStore::new();

        let cursor = store
            .ensure(&log, "Application", &FilterQuery::match_all(), &mut renderer, &parser)
            .unwrap();
        assert_eq!(cursor, Cursor::FromNow);
        assert_eq!(log.outstanding_records(), 0);
    }

    #[test]
    fn test_ensure_uses_newest_matching_record() {
        let log = MemoryEventLog::new();
        log.create_channel("System");
        log.append("System", NewEvent::new(1, "A").level("2")).unwrap();
        let wanted = log.append("System", NewEvent::new(2, "A").level("2")).unwrap();
        log.append("System", NewEvent::new(3, "A").level("4")).unwrap();

        let filter = FilterQuery::parse("*[System[Level=2]]").unwrap();
        let (mut renderer, parser) = parts();
        let mut store = CursorStore::new();

        let cursor = store.ensure(&log, "System", &filter, &mut renderer, &parser).unwrap();
        assert_eq!(cursor, Cursor::After(wanted));
        assert_eq!(log.outstanding_records(), 0);
    }

    #[test]
    fn test_ensure_is_noop_once_set() {
        let log = MemoryEventLog::new();
        log.create_channel("Application");
        let (mut renderer, parser) = parts();
        let mut store = CursorStore::new();
        store.advance(41);

        log.append("Application", NewEvent::new(1, "A")).unwrap();
        let cursor = store
            .ensure(&log, "Application", &FilterQuery::match_all(), &mut renderer, &parser)
            .unwrap();
        assert_eq!(cursor, Cursor::After(41));
    }

    #[test]
    fn test_missing_channel_is_query_error() {
        let log = MemoryEventLog::new();
        let (mut renderer, parser) = parts();
        let mut store = CursorStore::new();

        let err = store
            .ensure(&log, "Nope", &FilterQuery::match_all(), &mut renderer, &parser)
            .unwrap_err();
        assert!(matches!(err, CollectorError::Query { .. }));
        assert!(store.get().is_none());
    }

    #[test]
    fn test_unreadable_newest_record_falls_back_to_now() {
        let log = MemoryEventLog::new();
        log.create_channel("Application");
        log.append_raw("Application", "<Event><System>").unwrap();
        let (mut renderer, parser) = parts();
        let mut store = CursorStore::new();

        let cursor = store
            .ensure(&log, "Application", &FilterQuery::match_all(), &mut renderer, &parser)
            .unwrap();
        assert_eq!(cursor, Cursor::FromNow);
    }

    #[test]
    fn test_advance_never_rewinds() {
        let mut store = CursorStore::new();
        assert_eq!(store.advance(10), Cursor::After(10));
        assert_eq!(store.advance(7), Cursor::After(10));
        assert_eq!(store.advance(12), Cursor::After(12));
        store.reset();
        assert!(store.get().is_none());
    }
}
