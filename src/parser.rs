//! Decoding rendered event XML.
//!
//! The rendered form follows the Windows event schema:
//!
//! ```xml
//! <Event xmlns="http://schemas.microsoft.com/win/2004/08/events/event">
//!   <System>
//!     <Provider Name="Service Control Manager"/>
//!     <EventID Qualifiers="16384">7036</EventID>
//!     <Level>4</Level>
//!     <TimeCreated SystemTime="2024-03-01T08:15:30.1234567Z"/>
//!     <EventRecordID>51234</EventRecordID>
//!     <Channel>System</Channel>
//!     <Computer>host-01</Computer>
//!   </System>
//!   <EventData>
//!     <Data Name="param1">Windows Update</Data>
//!     <Data Name="param2">running</Data>
//!   </EventData>
//! </Event>
//! ```
//!
//! Leaf elements anywhere under `UserData` are collected into the same
//! ordered pair list as `EventData`, keyed by element name. An element's text
//! is only kept if it ends without having opened a child. `RenderingInfo/Message`, when
//! present, becomes the explicit message.

use std::borrow::Cow;

use chrono::{DateTime, Utc};
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

use crate::error::{CollectorError, CollectorResult};
use crate::event::{EventDataPair, ParsedEvent, RecordId};

/// Decodes rendered records into [`ParsedEvent`]s.
#[derive(Debug, Clone, Copy, Default)]
pub struct RecordParser;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TextTarget {
    EventId,
    Level,
    RecordId,
    Channel,
    Computer,
    Data,
    UserData,
    Message,
}

#[derive(Default)]
struct Partial {
    record_id: Option<RecordId>,
    event_id: Option<String>,
    level: Option<String>,
    provider: Option<String>,
    time_created: Option<String>,
    channel: Option<String>,
    computer: Option<String>,
    message: Option<String>,
    event_data: Vec<EventDataPair>,
}

impl RecordParser {
    /// Creates a parser.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Parses one rendered record.
    ///
    /// # Errors
    ///
    /// `CollectorError::Parse` for invalid UTF-8, malformed XML, a root other
    /// than `Event`, or a missing or invalid `EventRecordID`, `EventID`,
    /// `Provider@Name` or `TimeCreated@SystemTime`.
    pub fn parse(&self, bytes: &[u8]) -> CollectorResult<ParsedEvent> {
        let text = std::str::from_utf8(bytes)
            .map_err(|e| CollectorError::parse(format!("rendered record is not UTF-8: {e}")))?;
        let text = text.trim_end_matches('\0');

        let mut partial = Partial::default();
        match walk(text, &mut partial) {
            Ok(()) => finish(partial),
            Err(reason) => Err(CollectorError::Parse {
                reason,
                record_id: partial.record_id,
            }),
        }
    }
}

fn walk(text: &str, out: &mut Partial) -> Result<(), String> {
    let mut reader = Reader::from_str(text);
    let mut path: Vec<String> = Vec::new();
    let mut target: Option<TextTarget> = None;
    let mut buffer = String::new();
    let mut seen_root = false;

    loop {
        let event = reader
            .read_event()
            .map_err(|e| format!("malformed XML at byte {}: {e}", reader.buffer_position()))?;

        match event {
            Event::Start(start) => {
                let name = local_name(&start)?;
                open_element(&start, &name, &path, &mut seen_root, out)?;
                path.push(name);
                target = text_target(&path);
                buffer.clear();
                if target == Some(TextTarget::Data) {
                    out.event_data.push(EventDataPair {
                        key: attribute(&start, b"Name")?,
                        value: String::new(),
                    });
                }
            }
            Event::Empty(start) => {
                let name = local_name(&start)?;
                open_element(&start, &name, &path, &mut seen_root, out)?;
                path.push(name);
                match text_target(&path) {
                    Some(TextTarget::Data) => out.event_data.push(EventDataPair {
                        key: attribute(&start, b"Name")?,
                        value: String::new(),
                    }),
                    Some(TextTarget::UserData) => out.event_data.push(EventDataPair {
                        key: path.last().cloned(),
                        value: String::new(),
                    }),
                    _ => {}
                }
                path.pop();
                // the enclosing element has a child now, so it is not a leaf
                target = None;
            }
            Event::Text(t) => {
                if target.is_some() {
                    let value = t.unescape().map_err(|e| format!("bad text content: {e}"))?;
                    buffer.push_str(&value);
                }
            }
            Event::CData(c) => {
                if target.is_some() {
                    buffer.push_str(&String::from_utf8_lossy(&c.into_inner()));
                }
            }
            Event::End(_) => {
                if let Some(t) = target.take() {
                    store_text(t, std::mem::take(&mut buffer), &path, out)?;
                }
                path.pop();
                target = None;
            }
            Event::Eof => break,
            _ => {}
        }
    }

    if !seen_root {
        return Err("document has no Event element".to_string());
    }
    if !path.is_empty() {
        return Err(format!("unclosed element <{}>", path.join("/")));
    }
    Ok(())
}

fn local_name(start: &BytesStart<'_>) -> Result<String, String> {
    let local = start.local_name();
    std::str::from_utf8(local.as_ref())
        .map(str::to_string)
        .map_err(|e| format!("element name is not UTF-8: {e}"))
}

fn attribute(start: &BytesStart<'_>, key: &[u8]) -> Result<Option<String>, String> {
    for attr in start.attributes() {
        let attr = attr.map_err(|e| format!("bad attribute: {e}"))?;
        if attr.key.local_name().as_ref() == key {
            let value: Cow<'_, str> = attr
                .unescape_value()
                .map_err(|e| format!("bad attribute value: {e}"))?;
            return Ok(Some(value.into_owned()));
        }
    }
    Ok(None)
}

fn open_element(
    start: &BytesStart<'_>,
    name: &str,
    path: &[String],
    seen_root: &mut bool,
    out: &mut Partial,
) -> Result<(), String> {
    if path.is_empty() {
        if *seen_root {
            return Err("more than one root element".to_string());
        }
        if name != "Event" {
            return Err(format!("expected root element <Event>, found <{name}>"));
        }
        *seen_root = true;
        return Ok(());
    }

    if path.len() == 2 && path[1] == "System" {
        match name {
            "Provider" => out.provider = attribute(start, b"Name")?,
            "TimeCreated" => out.time_created = attribute(start, b"SystemTime")?,
            _ => {}
        }
    }
    Ok(())
}

fn text_target(path: &[String]) -> Option<TextTarget> {
    let parts: Vec<&str> = path.iter().map(String::as_str).collect();
    match parts.as_slice() {
        ["Event", "System", "EventID"] => Some(TextTarget::EventId),
        ["Event", "System", "Level"] => Some(TextTarget::Level),
        ["Event", "System", "EventRecordID"] => Some(TextTarget::RecordId),
        ["Event", "System", "Channel"] => Some(TextTarget::Channel),
        ["Event", "System", "Computer"] => Some(TextTarget::Computer),
        ["Event", "EventData", "Data"] => Some(TextTarget::Data),
        ["Event", "UserData", _, ..] => Some(TextTarget::UserData),
        ["Event", "RenderingInfo", "Message"] => Some(TextTarget::Message),
        _ => None,
    }
}

fn store_text(target: TextTarget, text: String, path: &[String], out: &mut Partial) -> Result<(), String> {
    match target {
        TextTarget::EventId => out.event_id = Some(text),
        TextTarget::Level => out.level = Some(text),
        TextTarget::RecordId => {
            let id = text
                .trim()
                .parse::<RecordId>()
                .map_err(|_| format!("EventRecordID '{}' is not an unsigned integer", text.trim()))?;
            out.record_id = Some(id);
        }
        TextTarget::Channel => out.channel = Some(text),
        TextTarget::Computer => out.computer = Some(text),
        TextTarget::Data => {
            if let Some(last) = out.event_data.last_mut() {
                last.value = text;
            }
        }
        TextTarget::UserData => out.event_data.push(EventDataPair {
            key: path.last().cloned(),
            value: text,
        }),
        TextTarget::Message => out.message = Some(text),
    }
    Ok(())
}

fn finish(partial: Partial) -> CollectorResult<ParsedEvent> {
    let record_id = partial.record_id;
    let fail = |reason: String| CollectorError::Parse { reason, record_id };

    let record_id = record_id.ok_or_else(|| fail("missing System/EventRecordID".to_string()))?;

    let raw_event_id = partial
        .event_id
        .ok_or_else(|| fail("missing System/EventID".to_string()))?;
    let event_id = raw_event_id
        .trim()
        .parse::<i64>()
        .map_err(|_| fail(format!("EventID '{}' is not an integer", raw_event_id.trim())))?;

    let provider = partial
        .provider
        .ok_or_else(|| fail("missing System/Provider@Name".to_string()))?;

    let raw_time = partial
        .time_created
        .ok_or_else(|| fail("missing System/TimeCreated@SystemTime".to_string()))?;
    let time_created = DateTime::parse_from_rfc3339(raw_time.trim())
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| fail(format!("TimeCreated '{raw_time}' is not RFC 3339: {e}")))?;

    Ok(ParsedEvent {
        record_id,
        event_id,
        level: partial.level.map(|l| l.trim().to_string()).unwrap_or_default(),
        provider,
        time_created,
        event_data: partial.event_data,
        message: partial.message,
        channel: partial.channel,
        computer: partial.computer,
    })
}
