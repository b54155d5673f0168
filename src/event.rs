//! Structured form of a decoded event record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Channel-wide sequence number of an event record.
pub type RecordId = u64;

/// One `EventData` entry.
///
/// Entries keep their document order. Names may repeat, and positional
/// entries have no name at all.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventDataPair {
    /// Value of the `Name` attribute, if the entry carried one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    /// Text content of the entry.
    pub value: String,
}

impl EventDataPair {
    /// Creates a named entry.
    #[must_use]
    pub fn named(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: Some(key.into()),
            value: value.into(),
        }
    }

    /// Creates a positional entry.
    #[must_use]
    pub fn positional(value: impl Into<String>) -> Self {
        Self {
            key: None,
            value: value.into(),
        }
    }
}

/// A fully decoded event record.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParsedEvent {
    pub record_id: RecordId,
    pub event_id: i64,
    /// Level exactly as rendered (Windows renders the numeric level, e.g. `"4"`).
    pub level: String,
    pub provider: String,
    pub time_created: DateTime<Utc>,
    #[serde(default)]
    pub event_data: Vec<EventDataPair>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub computer: Option<String>,
}

impl ParsedEvent {
    /// Human-readable message for this record.
    ///
    /// The explicit `Message` wins when present. Otherwise the `EventData`
    /// values are joined with `\n` in document order; keys are ignored.
    #[must_use]
    pub fn message_text(&self) -> String {
        if let Some(message) = &self.message {
            return message.clone();
        }
        let values: Vec<&str> = self.event_data.iter().map(|p| p.value.as_str()).collect();
        values.join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(event_data: Vec<EventDataPair>, message: Option<&str>) -> ParsedEvent {
        ParsedEvent {
            record_id: 7,
            event_id: 1000,
            level: "4".to_string(),
            provider: "App".to_string(),
            time_created: Utc::now(),
            event_data,
            message: message.map(str::to_string),
            channel: None,
            computer: None,
        }
    }

    #[test]
    fn test_message_joins_values_in_order() {
        let ev = event(
            vec![EventDataPair::named("", "a"), EventDataPair::named("", "b")],
            None,
        );
        assert_eq!(ev.message_text(), "a\nb");
    }

    #[test]
    fn test_message_ignores_keys_and_keeps_duplicates() {
        let ev = event(
            vec![
                EventDataPair::named("k", "1"),
                EventDataPair::positional("2"),
                EventDataPair::named("k", "3"),
            ],
            None,
        );
        assert_eq!(ev.message_text(), "1\n2\n3");
    }

    #[test]
    fn test_explicit_message_wins() {
        let ev = event(vec![EventDataPair::positional("ignored")], Some("Service started"));
        assert_eq!(ev.message_text(), "Service started");
    }

    #[test]
    fn test_empty_event_data_gives_empty_message() {
        assert_eq!(event(Vec::new(), None).message_text(), "");
    }
}
