//! Metrics handed to the downstream pipeline.
//!
//! A [`Metric`] follows the InfluxDB data model: one measurement name, a set
//! of typed fields, and a set of string tags. [`MetricEmitter`] maps decoded
//! records onto it; [`MetricSink`] is the receiving side.

use std::collections::BTreeMap;
use std::fmt;
use std::io::Write;

use chrono::SecondsFormat;
use serde::{Deserialize, Serialize};

use crate::event::ParsedEvent;

/// Default measurement name.
pub const DEFAULT_MEASUREMENT: &str = "win_event";

/// A typed field value.
///
/// Serializes as a bare JSON scalar. Output only: a JSON number cannot say
/// whether it came from `UInt` or `Int`.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum FieldValue {
    UInt(u64),
    Int(i64),
    String(String),
}

impl FieldValue {
    #[allow(missing_docs)]
    pub const fn as_u64(&self) -> Option<u64> {
        match self {
            Self::UInt(v) => Some(*v),
            _ => None,
        }
    }

    #[allow(missing_docs)]
    pub const fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            _ => None,
        }
    }

    #[allow(missing_docs)]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(v) => Some(v),
            _ => None,
        }
    }
}

impl From<u64> for FieldValue {
    fn from(v: u64) -> Self {
        Self::UInt(v)
    }
}

impl From<i64> for FieldValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<String> for FieldValue {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

/// One emitted metric.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Metric {
    /// Measurement name.
    pub measurement: String,
    /// Field set, ordered by key.
    pub fields: BTreeMap<String, FieldValue>,
    /// Tag set, ordered by key.
    pub tags: BTreeMap<String, String>,
}

impl Metric {
    /// Field lookup.
    #[must_use]
    pub fn field(&self, key: &str) -> Option<&FieldValue> {
        self.fields.get(key)
    }

    /// Tag lookup.
    #[must_use]
    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags.get(key).map(String::as_str)
    }

    /// Renders the metric as one InfluxDB line-protocol line, without a
    /// timestamp and without the trailing newline.
    #[must_use]
    pub fn to_line_protocol(&self) -> String {
        self.to_string()
    }
}

/// InfluxDB line protocol.
///
/// Tags with an empty value are left out, since line protocol has no way to
/// write one. Newlines in string fields are written as the two characters
/// `\n` so every metric stays on one line; readers get the escape back
/// verbatim rather than a newline.
impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&escape(&self.measurement, &[',', ' ']))?;
        for (k, v) in self.tags.iter().filter(|(_, v)| !v.is_empty()) {
            write!(f, ",{}={}", escape(k, &[',', '=', ' ']), escape(v, &[',', '=', ' ']))?;
        }
        let mut sep = ' ';
        for (k, v) in &self.fields {
            write!(f, "{sep}{}=", escape(k, &[',', '=', ' ']))?;
            match v {
                FieldValue::UInt(n) => write!(f, "{n}u")?,
                FieldValue::Int(n) => write!(f, "{n}i")?,
                FieldValue::String(s) => write!(f, "\"{}\"", escape_string_field(s))?,
            }
            sep = ',';
        }
        Ok(())
    }
}

fn escape(s: &str, specials: &[char]) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '\n' => out.push_str("\\n"),
            '\\' => out.push_str("\\\\"),
            c if specials.contains(&c) => {
                out.push('\\');
                out.push(c);
            }
            c => out.push(c),
        }
    }
    out
}

fn escape_string_field(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            c => out.push(c),
        }
    }
    out
}

/// Maps decoded records onto metrics. Pure; no aggregation.
#[derive(Debug, Clone)]
pub struct MetricEmitter {
    measurement: String,
}

impl MetricEmitter {
    /// Creates an emitter writing to `measurement`.
    #[must_use]
    pub fn new(measurement: impl Into<String>) -> Self {
        Self {
            measurement: measurement.into(),
        }
    }

    /// The configured measurement name.
    #[must_use]
    pub fn measurement(&self) -> &str {
        &self.measurement
    }

    /// Builds the metric for one record.
    #[must_use]
    pub fn emit(&self, event: &ParsedEvent) -> Metric {
        let mut fields = BTreeMap::new();
        fields.insert("recordID".to_string(), FieldValue::UInt(event.record_id));
        fields.insert("eventID".to_string(), FieldValue::Int(event.event_id));
        fields.insert("message".to_string(), FieldValue::String(event.message_text()));
        fields.insert("source".to_string(), FieldValue::String(event.provider.clone()));
        fields.insert(
            "created".to_string(),
            FieldValue::String(event.time_created.to_rfc3339_opts(SecondsFormat::AutoSi, true)),
        );

        let mut tags = BTreeMap::new();
        tags.insert("level".to_string(), event.level.clone());

        Metric {
            measurement: self.measurement.clone(),
            fields,
            tags,
        }
    }
}

impl Default for MetricEmitter {
    fn default() -> Self {
        Self::new(DEFAULT_MEASUREMENT)
    }
}

/// Downstream metric consumer. Assumed reliable and non-blocking.
pub trait MetricSink {
    /// Accepts one metric.
    fn emit(&mut self, metric: Metric);
}

impl MetricSink for Vec<Metric> {
    fn emit(&mut self, metric: Metric) {
        self.push(metric);
    }
}

/// Output encoding for [`WriterSink`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputFormat {
    /// InfluxDB line protocol.
    #[default]
    Line,
    /// One JSON object per line.
    Json,
}

/// Writes each metric as one line to an `io::Write`.
///
/// Write failures are logged and counted rather than returned, since the
/// sink contract is infallible.
#[derive(Debug)]
pub struct WriterSink<W: Write> {
    writer: W,
    format: OutputFormat,
    written: u64,
    failed: u64,
}

impl<W: Write> WriterSink<W> {
    #[allow(missing_docs)]
    pub const fn new(writer: W, format: OutputFormat) -> Self {
        Self {
            writer,
            format,
            written: 0,
            failed: 0,
        }
    }

    /// Metrics written successfully.
    #[must_use]
    pub const fn written(&self) -> u64 {
        self.written
    }

    /// Metrics that could not be written.
    #[must_use]
    pub const fn failed(&self) -> u64 {
        self.failed
    }

    /// Flushes the underlying writer.
    pub fn flush(&mut self) -> std::io::Result<()> {
        self.writer.flush()
    }

    /// Returns the underlying writer.
    pub fn into_inner(self) -> W {
        self.writer
    }

    fn write_metric(&mut self, metric: &Metric) -> std::io::Result<()> {
        match self.format {
            OutputFormat::Line => writeln!(self.writer, "{metric}"),
            OutputFormat::Json => {
                serde_json::to_writer(&mut self.writer, metric)?;
                self.writer.write_all(b"\n")
            }
        }
    }
}

impl<W: Write> MetricSink for WriterSink<W> {
    fn emit(&mut self, metric: Metric) {
        match self.write_metric(&metric) {
            Ok(()) => self.written += 1,
            Err(err) => {
                self.failed += 1;
                tracing::error!(error = %err, measurement = %metric.measurement, "failed to write metric");
            }
        }
    }
}
