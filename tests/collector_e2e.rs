use std::time::Duration;

use chrono::{TimeZone, Utc};
use proptest::prelude::*;

use eventlog_tail::{
    Collector, CollectorConfig, CollectorError, Cursor, ErrorKind, FieldValue, MemoryEventLog,
    NewEvent, OutputFormat, WriterSink,
};

const CHANNEL: &str = "Application";

fn setup(config: CollectorConfig) -> (MemoryEventLog, Collector<MemoryEventLog>) {
    let log = MemoryEventLog::new();
    log.create_channel(CHANNEL);
    let collector = Collector::new(config.with_poll_timeout(Duration::ZERO), log.clone()).unwrap();
    (log, collector)
}

fn primed(config: CollectorConfig) -> (MemoryEventLog, Collector<MemoryEventLog>) {
    let (log, mut collector) = setup(config);
    collector.gather().unwrap();
    (log, collector)
}

fn event_ids(metrics: &[eventlog_tail::Metric]) -> Vec<i64> {
    metrics
        .iter()
        .map(|m| m.field("eventID").and_then(FieldValue::as_i64).unwrap())
        .collect()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn drained_records_keep_channel_order(
        ids in proptest::collection::vec(0i64..65_535, 1..40),
        batch in 1usize..8,
    ) {
        let (log, mut collector) = primed(CollectorConfig::new(CHANNEL).with_batch_size(batch));
        for id in &ids {
            log.append(CHANNEL, NewEvent::new(*id, "Prop")).unwrap();
        }

        let gathered = collector.gather().unwrap();
        prop_assert_eq!(event_ids(&gathered.metrics), ids.clone());

        let record_ids: Vec<u64> = gathered
            .metrics
            .iter()
            .map(|m| m.field("recordID").and_then(FieldValue::as_u64).unwrap())
            .collect();
        prop_assert!(record_ids.windows(2).all(|w| w[0] < w[1]));
        prop_assert_eq!(collector.cursor(), record_ids.last().copied().map(Cursor::After));
        prop_assert_eq!(log.outstanding_records(), 0);
    }
}

#[test]
fn cursor_tracks_last_parsed_and_never_decreases() {
    let (log, mut collector) = primed(CollectorConfig::new(CHANNEL).with_batch_size(3));
    let mut previous = 0;

    for round in 0..5 {
        let mut last = 0;
        for i in 0..=round {
            last = log.append(CHANNEL, NewEvent::new(i, "Loop")).unwrap();
        }
        let report = collector.gather().unwrap().report;
        assert_eq!(report.cursor, Some(Cursor::After(last)));
        assert!(last > previous);
        previous = last;
    }
}

#[test]
fn empty_channel_first_run_has_no_history() {
    let (log, mut collector) = setup(CollectorConfig::new(CHANNEL));
    let gathered = collector.gather().unwrap();

    assert!(gathered.metrics.is_empty());
    assert!(gathered.report.completed());
    assert_eq!(collector.cursor(), Some(Cursor::FromNow));
    assert_eq!(log.active_subscriptions(CHANNEL), 1);
}

#[test]
fn rerun_without_new_records_is_a_noop() {
    let (log, mut collector) = primed(CollectorConfig::new(CHANNEL));
    log.append(CHANNEL, NewEvent::new(7, "Once")).unwrap();
    assert_eq!(collector.gather().unwrap().metrics.len(), 1);
    let cursor = collector.cursor();

    let gathered = collector.gather().unwrap();
    assert!(gathered.metrics.is_empty());
    assert_eq!(collector.cursor(), cursor);
    assert_eq!(log.active_subscriptions(CHANNEL), 1);
}

#[test]
fn oversized_record_is_skipped() {
    let config = CollectorConfig::new(CHANNEL)
        .with_batch_size(5)
        .with_render_buffer_size(1024);
    let (log, mut collector) = primed(config);

    log.append(CHANNEL, NewEvent::new(1, "Small")).unwrap();
    log.append(CHANNEL, NewEvent::new(2, "Huge").data("blob", "x".repeat(4096)))
        .unwrap();
    let last = log.append(CHANNEL, NewEvent::new(3, "Small")).unwrap();

    let gathered = collector.gather().unwrap();
    assert_eq!(event_ids(&gathered.metrics), vec![1, 3]);
    assert_eq!(gathered.report.skipped.len(), 1);
    assert_eq!(gathered.report.skipped[0].error.kind(), ErrorKind::RenderOverflow);
    assert_eq!(collector.cursor(), Some(Cursor::After(last)));
    assert_eq!(log.outstanding_records(), 0);

    assert!(collector.gather().unwrap().metrics.is_empty());
}

#[test]
fn malformed_record_is_skipped_with_its_id() {
    let (log, mut collector) = primed(CollectorConfig::new(CHANNEL));

    log.append(CHANNEL, NewEvent::new(10, "Good")).unwrap();
    let bad = log
        .append_raw(
            CHANNEL,
            "<Event><System><EventRecordID>2</EventRecordID></System></Event>",
        )
        .unwrap();
    log.append_raw(CHANNEL, "not xml at all").unwrap();
    log.append(CHANNEL, NewEvent::new(11, "Good")).unwrap();

    let gathered = collector.gather().unwrap();
    assert_eq!(event_ids(&gathered.metrics), vec![10, 11]);

    let skipped = &gathered.report.skipped;
    assert_eq!(skipped.len(), 2);
    assert!(skipped.iter().all(|s| s.error.kind() == ErrorKind::Parse));
    assert_eq!(skipped[0].record_id, Some(bad));
    assert_eq!(log.outstanding_records(), 0);
}

#[test]
fn drain_failure_keeps_progress_and_resumes() {
    let (log, mut collector) = primed(CollectorConfig::new(CHANNEL).with_batch_size(2));
    for i in 1..=5 {
        log.append(CHANNEL, NewEvent::new(i, "Batch")).unwrap();
    }
    log.inject_poll_failure(CHANNEL, 1).unwrap();

    let first = collector.gather().unwrap();
    assert_eq!(event_ids(&first.metrics), vec![1, 2]);
    assert!(matches!(first.report.aborted, Some(CollectorError::Drain { .. })));
    assert_eq!(collector.cursor(), Some(Cursor::After(2)));
    assert!(collector.is_subscribed());

    let second = collector.gather().unwrap();
    assert_eq!(event_ids(&second.metrics), vec![3, 4, 5]);
    assert!(second.report.completed());
    assert_eq!(collector.cursor(), Some(Cursor::After(5)));
}

#[test]
fn positional_data_becomes_message() {
    let (log, mut collector) = primed(CollectorConfig::new(CHANNEL));
    let at = Utc.with_ymd_and_hms(2024, 3, 1, 12, 30, 0).unwrap();
    log.append(
        CHANNEL,
        NewEvent::new(1000, "Application Error")
            .level("2")
            .time_created(at)
            .positional("a")
            .positional("b"),
    )
    .unwrap();

    let metric = collector.gather().unwrap().metrics.remove(0);
    assert_eq!(metric.measurement, "win_event");
    assert_eq!(metric.field("message").and_then(FieldValue::as_str), Some("a\nb"));
    assert_eq!(metric.field("source").and_then(FieldValue::as_str), Some("Application Error"));
    assert_eq!(
        metric.field("created").and_then(FieldValue::as_str),
        Some("2024-03-01T12:30:00Z")
    );
    assert_eq!(metric.tag("level"), Some("2"));
}

#[test]
fn filter_selects_cursor_and_deliveries() {
    let config = CollectorConfig::new(CHANNEL)
        .with_query("*[System[Level=2]]")
        .with_measurement("errors");
    let (log, mut collector) = setup(config);

    let seed = log.append(CHANNEL, NewEvent::new(1, "Old").level("2")).unwrap();
    log.append(CHANNEL, NewEvent::new(2, "Old").level("4")).unwrap();
    collector.gather().unwrap();
    assert_eq!(collector.cursor(), Some(Cursor::After(seed)));

    log.append(CHANNEL, NewEvent::new(3, "New").level("4")).unwrap();
    log.append(CHANNEL, NewEvent::new(4, "New").level("2")).unwrap();
    let gathered = collector.gather().unwrap();
    assert_eq!(event_ids(&gathered.metrics), vec![4]);
    assert_eq!(gathered.metrics[0].measurement, "errors");
}

#[test]
fn writer_sink_streams_json_lines() {
    let (log, mut collector) = primed(CollectorConfig::new(CHANNEL));
    log.append(CHANNEL, NewEvent::new(1, "Json")).unwrap();
    log.append(CHANNEL, NewEvent::new(2, "Json")).unwrap();

    let mut sink = WriterSink::new(Vec::new(), OutputFormat::Json);
    let report = collector.gather_into(&mut sink).unwrap();
    assert_eq!(report.emitted, 2);
    assert_eq!(sink.written(), 2);

    let out = String::from_utf8(sink.into_inner()).unwrap();
    let lines: Vec<serde_json::Value> = out
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect();
    assert_eq!(lines.len(), 2);
    assert_eq!(lines[1]["fields"]["eventID"], 2);
    assert_eq!(lines[1]["tags"]["level"], "4");
}

#[test]
fn shutdown_twice_and_restart_from_scratch() {
    let (log, mut collector) = primed(CollectorConfig::new(CHANNEL));
    log.append(CHANNEL, NewEvent::new(1, "Before")).unwrap();

    collector.shutdown();
    collector.shutdown();
    assert_eq!(log.active_subscriptions(CHANNEL), 0);
    assert!(collector.cursor().is_none());

    // the unread record is now history and is not replayed
    assert!(collector.gather().unwrap().metrics.is_empty());
    log.append(CHANNEL, NewEvent::new(2, "After")).unwrap();
    assert_eq!(event_ids(&collector.gather().unwrap().metrics), vec![2]);
}

#[test]
fn collectors_on_separate_channels_are_independent() {
    let log = MemoryEventLog::new();
    log.create_channel("System");
    log.create_channel("Security");
    let mut system =
        Collector::new(CollectorConfig::new("System").with_poll_timeout(Duration::ZERO), log.clone()).unwrap();
    let mut security =
        Collector::new(CollectorConfig::new("Security").with_poll_timeout(Duration::ZERO), log.clone()).unwrap();
    system.gather().unwrap();
    security.gather().unwrap();

    log.append("System", NewEvent::new(1, "S")).unwrap();
    log.append("System", NewEvent::new(2, "S")).unwrap();
    log.append("Security", NewEvent::new(3, "X")).unwrap();

    assert_eq!(event_ids(&system.gather().unwrap().metrics), vec![1, 2]);
    assert_eq!(event_ids(&security.gather().unwrap().metrics), vec![3]);
    assert_eq!(system.cursor(), Some(Cursor::After(2)));
    assert_eq!(security.cursor(), Some(Cursor::After(1)));
}

#[test]
fn records_before_first_subscription_count_as_history() {
    let (log, mut collector) = setup(CollectorConfig::new(CHANNEL));
    log.set_enabled(CHANNEL, false).unwrap();

    let err = collector.gather().unwrap_err();
    assert!(matches!(err, CollectorError::Subscribe { .. }));
    assert_eq!(collector.cursor(), Some(Cursor::FromNow));

    log.set_enabled(CHANNEL, true).unwrap();
    log.append(CHANNEL, NewEvent::new(1, "Gap")).unwrap();
    assert!(collector.gather().unwrap().metrics.is_empty());
    assert!(collector.is_subscribed());

    log.append(CHANNEL, NewEvent::new(2, "Live")).unwrap();
    assert_eq!(event_ids(&collector.gather().unwrap().metrics), vec![2]);
}
