//! Rendering raw records into a reusable scratch buffer.

use crate::error::{CollectorError, CollectorResult, SourceError};
use crate::source::EventSource;

/// Default scratch buffer size (16 KiB).
pub const DEFAULT_RENDER_BUFFER_SIZE: usize = 1 << 14;

/// Renders records one at a time into a single owned buffer.
///
/// The returned slice borrows the renderer, so it has to be consumed before
/// the next call can reuse the buffer.
#[derive(Debug)]
pub struct RecordRenderer {
    scratch: Vec<u8>,
}

impl RecordRenderer {
    /// Creates a renderer with a `capacity`-byte scratch buffer.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            scratch: vec![0; capacity],
        }
    }

    /// Size of the scratch buffer.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.scratch.len()
    }

    /// Renders `record`, consuming and releasing it whatever the outcome.
    ///
    /// # Errors
    ///
    /// - `RenderOverflow` when the rendered form exceeds the scratch buffer
    /// - `Render` for any other source failure
    pub fn render<S: EventSource>(&mut self, source: &S, record: S::Record) -> CollectorResult<&[u8]> {
        let result = source.render(&record, &mut self.scratch);
        drop(record);

        match result {
            Ok(len) if len <= self.scratch.len() => Ok(&self.scratch[..len]),
            Ok(len) => Err(CollectorError::RenderOverflow {
                required: len,
                capacity: self.scratch.len(),
            }),
            Err(SourceError::BufferTooSmall { required, capacity }) => {
                Err(CollectorError::RenderOverflow { required, capacity })
            }
            Err(err) => Err(CollectorError::Render { source: err }),
        }
    }
}

impl Default for RecordRenderer {
    fn default() -> Self {
        Self::new(DEFAULT_RENDER_BUFFER_SIZE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::FilterQuery;
    use crate::source::{MemoryEventLog, NewEvent};

    fn latest(log: &MemoryEventLog) -> crate::source::MemoryRecord {
        log.query_latest("Application", &FilterQuery::match_all())
            .unwrap()
            .unwrap()
    }

    #[test]
    fn test_render_writes_event_xml() {
        let log = MemoryEventLog::new();
        log.create_channel("Application");
        log.append("Application", NewEvent::new(100, "Demo").data("user", "alice"))
            .unwrap();

        let mut renderer = RecordRenderer::default();
        let bytes = renderer.render(&log, latest(&log)).unwrap();
        let text = std::str::from_utf8(bytes).unwrap();
        assert!(text.starts_with("<Event"));
        assert!(text.contains("<Data Name=\"user\">alice</Data>"));
        assert_eq!(log.outstanding_records(), 0);
    }

    #[test]
    fn test_overflow_releases_record() {
        let log = MemoryEventLog::new();
        log.create_channel("Application");
        log.append("Application", NewEvent::new(1, "Demo").data("blob", "x".repeat(4096)))
            .unwrap();

        let mut renderer = RecordRenderer::new(512);
        let err = renderer.render(&log, latest(&log)).unwrap_err();
        match err {
            CollectorError::RenderOverflow { required, capacity } => {
                assert!(required > 4096);
                assert_eq!(capacity, 512);
            }
            other => panic!("expected overflow, got {other:?}"),
        }
        assert_eq!(log.outstanding_records(), 0);
    }

    #[test]
    fn test_buffer_is_reused() {
        let log = MemoryEventLog::new();
        log.create_channel("Application");
        log.append("Application", NewEvent::new(1, "First")).unwrap();

        let mut renderer = RecordRenderer::new(4096);
        let first_len = renderer.render(&log, latest(&log)).unwrap().len();

        log.append("Application", NewEvent::new(2, "Second")).unwrap();
        let second = renderer.render(&log, latest(&log)).unwrap();
        assert!(std::str::from_utf8(second).unwrap().contains("Second"));
        assert!(first_len > 0);
        assert_eq!(renderer.capacity(), 4096);
    }
}
