//! In-memory event source.
//!
//! This module provides a thread-safe, in-process implementation of
//! [`EventSource`]. Channels are append-only record lists with channel-wide
//! increasing record ids; subscriptions are woken through a bounded
//! `crossbeam-channel` signal, the same way the Windows source waits on its
//! signal event. It is intended for embedded usage, tests, and as a reference
//! implementation.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use quick_xml::events::{BytesEnd, BytesStart, BytesText, Event};
use quick_xml::Writer;

use crate::cursor::Cursor;
use crate::error::SourceError;
use crate::event::{EventDataPair, ParsedEvent, RecordId};
use crate::filter::FilterQuery;

use super::{validate_channel_name, Batch, EventSource};

const EVENT_NAMESPACE: &str = "http://schemas.microsoft.com/win/2004/08/events/event";

/// Builder for records appended to a [`MemoryEventLog`].
#[derive(Debug, Clone)]
pub struct NewEvent {
    event_id: i64,
    provider: String,
    level: String,
    time_created: Option<DateTime<Utc>>,
    event_data: Vec<EventDataPair>,
    message: Option<String>,
    computer: Option<String>,
}

impl NewEvent {
    /// Starts an informational (level 4) record.
    #[must_use]
    pub fn new(event_id: i64, provider: impl Into<String>) -> Self {
        Self {
            event_id,
            provider: provider.into(),
            level: "4".to_string(),
            time_created: None,
            event_data: Vec::new(),
            message: None,
            computer: None,
        }
    }

    #[allow(missing_docs)]
    #[must_use]
    pub fn level(mut self, level: impl Into<String>) -> Self {
        self.level = level.into();
        self
    }

    /// Creation time; defaults to the append time.
    #[must_use]
    pub fn time_created(mut self, at: DateTime<Utc>) -> Self {
        self.time_created = Some(at);
        self
    }

    /// Adds a named `EventData` entry.
    #[must_use]
    pub fn data(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.event_data.push(EventDataPair::named(key, value));
        self
    }

    /// Adds an unnamed `EventData` entry.
    #[must_use]
    pub fn positional(mut self, value: impl Into<String>) -> Self {
        self.event_data.push(EventDataPair::positional(value));
        self
    }

    #[allow(missing_docs)]
    #[must_use]
    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    #[allow(missing_docs)]
    #[must_use]
    pub fn computer(mut self, computer: impl Into<String>) -> Self {
        self.computer = Some(computer.into());
        self
    }
}

#[derive(Debug)]
enum Body {
    Event(ParsedEvent),
    /// Pre-rendered text, stored verbatim.
    Raw(String),
}

impl Body {
    fn matches(&self, filter: &FilterQuery) -> bool {
        match self {
            Self::Event(ev) => filter.matches(ev),
            Self::Raw(_) => filter.is_match_all(),
        }
    }
}

#[derive(Debug)]
struct Stored {
    record_id: RecordId,
    body: Arc<Body>,
}

#[derive(Debug)]
struct Watcher {
    signal: Sender<()>,
    alive: Arc<AtomicBool>,
}

#[derive(Debug)]
struct Channel {
    enabled: bool,
    last_id: RecordId,
    records: Vec<Stored>,
    watchers: Vec<Watcher>,
    /// Polls left before the next poll fails.
    fail_after_polls: Option<usize>,
}

impl Channel {
    fn new() -> Self {
        Self {
            enabled: true,
            last_id: 0,
            records: Vec::new(),
            watchers: Vec::new(),
            fail_after_polls: None,
        }
    }

    fn push(&mut self, body: Body) -> RecordId {
        self.last_id += 1;
        let record_id = self.last_id;
        self.records.push(Stored {
            record_id,
            body: Arc::new(body),
        });

        self.watchers.retain(|w| {
            if !w.alive.load(Ordering::Acquire) {
                return false;
            }
            !matches!(w.signal.try_send(()), Err(TrySendError::Disconnected(_)))
        });
        record_id
    }
}

#[derive(Debug, Default)]
struct Shared {
    channels: RwLock<HashMap<String, Channel>>,
    issued: AtomicU64,
    released: AtomicU64,
}

/// A raw record handed out by [`MemoryEventLog`]. Released on drop.
#[derive(Debug)]
pub struct MemoryRecord {
    record_id: RecordId,
    body: Arc<Body>,
    shared: Arc<Shared>,
}

impl MemoryRecord {
    fn new(stored: &Stored, shared: &Arc<Shared>) -> Self {
        shared.issued.fetch_add(1, Ordering::Relaxed);
        Self {
            record_id: stored.record_id,
            body: Arc::clone(&stored.body),
            shared: Arc::clone(shared),
        }
    }

    /// The record id this handle points at.
    #[must_use]
    pub const fn record_id(&self) -> RecordId {
        self.record_id
    }
}

impl Drop for MemoryRecord {
    fn drop(&mut self) {
        self.shared.released.fetch_add(1, Ordering::Relaxed);
    }
}

/// A pull subscription on a [`MemoryEventLog`] channel. Closed on drop.
#[derive(Debug)]
pub struct MemorySubscription {
    channel: String,
    filter: FilterQuery,
    /// Last record id delivered (or skipped by the filter).
    position: RecordId,
    signal: Receiver<()>,
    alive: Arc<AtomicBool>,
}

impl MemorySubscription {
    /// Last record id this subscription has moved past.
    #[must_use]
    pub const fn position(&self) -> RecordId {
        self.position
    }

    #[allow(missing_docs)]
    #[must_use]
    pub fn channel(&self) -> &str {
        &self.channel
    }
}

impl Drop for MemorySubscription {
    fn drop(&mut self) {
        self.alive.store(false, Ordering::Release);
    }
}

/// Thread-safe in-memory event log. Clones share the same channels.
#[derive(Debug, Clone, Default)]
pub struct MemoryEventLog {
    shared: Arc<Shared>,
}

impl MemoryEventLog {
    /// Creates a log with no channels.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, Channel>> {
        self.shared.channels.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, Channel>> {
        self.shared.channels.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Creates an enabled, empty channel. Returns false if it already exists.
    pub fn create_channel(&self, name: &str) -> bool {
        let mut channels = self.write();
        if channels.contains_key(name) {
            return false;
        }
        channels.insert(name.to_string(), Channel::new());
        true
    }

    /// Removes a channel and its records. Returns false if it did not exist.
    pub fn remove_channel(&self, name: &str) -> bool {
        self.write().remove(name).is_some()
    }

    /// Enables or disables a channel.
    ///
    /// # Errors
    ///
    /// `ChannelNotFound` if the channel does not exist.
    pub fn set_enabled(&self, name: &str, enabled: bool) -> Result<(), SourceError> {
        let mut channels = self.write();
        let channel = channels.get_mut(name).ok_or_else(|| not_found(name))?;
        channel.enabled = enabled;
        Ok(())
    }

    /// Appends a record and wakes subscribers.
    ///
    /// # Errors
    ///
    /// `ChannelNotFound` or `ChannelDisabled`.
    pub fn append(&self, name: &str, event: NewEvent) -> Result<RecordId, SourceError> {
        let mut channels = self.write();
        let channel = writable(&mut channels, name)?;
        let parsed = ParsedEvent {
            record_id: channel.last_id + 1,
            event_id: event.event_id,
            level: event.level,
            provider: event.provider,
            time_created: event.time_created.unwrap_or_else(Utc::now),
            event_data: event.event_data,
            message: event.message,
            channel: Some(name.to_string()),
            computer: event.computer,
        };
        Ok(channel.push(Body::Event(parsed)))
    }

    /// Appends a record whose rendered form is `text`, verbatim.
    ///
    /// Only match-all filters select such records.
    ///
    /// # Errors
    ///
    /// `ChannelNotFound` or `ChannelDisabled`.
    pub fn append_raw(&self, name: &str, text: impl Into<String>) -> Result<RecordId, SourceError> {
        let mut channels = self.write();
        let channel = writable(&mut channels, name)?;
        Ok(channel.push(Body::Raw(text.into())))
    }

    /// Makes a poll on `name` fail after `polls` further successful polls.
    ///
    /// # Errors
    ///
    /// `ChannelNotFound` if the channel does not exist.
    pub fn inject_poll_failure(&self, name: &str, polls: usize) -> Result<(), SourceError> {
        let mut channels = self.write();
        let channel = channels.get_mut(name).ok_or_else(|| not_found(name))?;
        channel.fail_after_polls = Some(polls);
        Ok(())
    }

    /// Number of records stored in `name`.
    #[must_use]
    pub fn len(&self, name: &str) -> usize {
        self.read().get(name).map_or(0, |c| c.records.len())
    }

    /// Newest record id in `name`.
    #[must_use]
    pub fn last_record_id(&self, name: &str) -> Option<RecordId> {
        self.read()
            .get(name)
            .and_then(|c| c.records.last().map(|r| r.record_id))
    }

    /// Open subscriptions on `name`.
    #[must_use]
    pub fn active_subscriptions(&self, name: &str) -> usize {
        self.read().get(name).map_or(0, |c| {
            c.watchers
                .iter()
                .filter(|w| w.alive.load(Ordering::Acquire))
                .count()
        })
    }

    /// Record handles handed out and not yet released.
    #[must_use]
    pub fn outstanding_records(&self) -> u64 {
        let issued = self.shared.issued.load(Ordering::Relaxed);
        let released = self.shared.released.load(Ordering::Relaxed);
        issued.saturating_sub(released)
    }

    fn collect(&self, sub: &mut MemorySubscription, max: usize) -> Result<Vec<MemoryRecord>, SourceError> {
        let channels = self.read();
        let channel = channels.get(&sub.channel).ok_or_else(|| not_found(&sub.channel))?;

        let start = channel.records.partition_point(|r| r.record_id <= sub.position);
        let mut out = Vec::new();
        for stored in &channel.records[start..] {
            if out.len() >= max {
                break;
            }
            sub.position = stored.record_id;
            if stored.body.matches(&sub.filter) {
                out.push(MemoryRecord::new(stored, &self.shared));
            }
        }
        Ok(out)
    }

    fn take_injected_failure(&self, name: &str) -> Result<(), SourceError> {
        let mut channels = self.write();
        let Some(channel) = channels.get_mut(name) else {
            return Ok(());
        };
        match channel.fail_after_polls {
            Some(0) => {
                channel.fail_after_polls = None;
                Err(SourceError::Backend(format!("injected poll failure on '{name}'")))
            }
            Some(n) => {
                channel.fail_after_polls = Some(n - 1);
                Ok(())
            }
            None => Ok(()),
        }
    }
}

impl EventSource for MemoryEventLog {
    type Subscription = MemorySubscription;
    type Record = MemoryRecord;

    fn query_latest(
        &self,
        channel: &str,
        filter: &FilterQuery,
    ) -> Result<Option<Self::Record>, SourceError> {
        check_name(channel)?;
        let channels = self.read();
        let state = channels.get(channel).ok_or_else(|| not_found(channel))?;
        Ok(state
            .records
            .iter()
            .rev()
            .find(|r| r.body.matches(filter))
            .map(|r| MemoryRecord::new(r, &self.shared)))
    }

    fn subscribe(
        &self,
        channel: &str,
        filter: &FilterQuery,
        cursor: &Cursor,
    ) -> Result<Self::Subscription, SourceError> {
        check_name(channel)?;
        let mut channels = self.write();
        let state = channels.get_mut(channel).ok_or_else(|| not_found(channel))?;
        if !state.enabled {
            return Err(SourceError::ChannelDisabled {
                channel: channel.to_string(),
            });
        }

        let position = match cursor {
            Cursor::FromNow => state.last_id,
            Cursor::After(id) => *id,
        };
        let (tx, rx) = bounded(1);
        let alive = Arc::new(AtomicBool::new(true));
        state.watchers.push(Watcher {
            signal: tx,
            alive: Arc::clone(&alive),
        });

        Ok(MemorySubscription {
            channel: channel.to_string(),
            filter: filter.clone(),
            position,
            signal: rx,
            alive,
        })
    }

    fn next_batch(
        &self,
        subscription: &mut Self::Subscription,
        max: usize,
        wait: Duration,
    ) -> Result<Batch<Self::Record>, SourceError> {
        if !subscription.alive.load(Ordering::Acquire) {
            return Err(SourceError::SubscriptionClosed);
        }
        self.take_injected_failure(&subscription.channel)?;

        while subscription.signal.try_recv().is_ok() {}
        let records = self.collect(subscription, max)?;
        if !records.is_empty() {
            return Ok(Batch::Records(records));
        }

        // A timeout or a dropped sender both just mean "nothing new".
        let _ = subscription.signal.recv_timeout(wait);
        let records = self.collect(subscription, max)?;
        if records.is_empty() {
            Ok(Batch::Exhausted)
        } else {
            Ok(Batch::Records(records))
        }
    }

    fn render(&self, record: &Self::Record, buf: &mut [u8]) -> Result<usize, SourceError> {
        let rendered = match record.body.as_ref() {
            Body::Event(ev) => render_event_xml(ev)?,
            Body::Raw(text) => text.as_bytes().to_vec(),
        };
        if rendered.len() > buf.len() {
            return Err(SourceError::BufferTooSmall {
                required: rendered.len(),
                capacity: buf.len(),
            });
        }
        buf[..rendered.len()].copy_from_slice(&rendered);
        Ok(rendered.len())
    }
}

fn not_found(channel: &str) -> SourceError {
    SourceError::ChannelNotFound {
        channel: channel.to_string(),
    }
}

fn check_name(channel: &str) -> Result<(), SourceError> {
    validate_channel_name(channel).map_err(|reason| SourceError::InvalidChannel {
        channel: channel.to_string(),
        reason,
    })
}

fn writable<'a>(
    channels: &'a mut HashMap<String, Channel>,
    name: &str,
) -> Result<&'a mut Channel, SourceError> {
    let channel = channels.get_mut(name).ok_or_else(|| not_found(name))?;
    if !channel.enabled {
        return Err(SourceError::ChannelDisabled {
            channel: name.to_string(),
        });
    }
    Ok(channel)
}

fn xml_err(e: impl std::fmt::Display) -> SourceError {
    SourceError::Backend(format!("writing event XML: {e}"))
}

/// Renders a record the way `EvtRender(EvtRenderEventXml)` lays it out.
fn render_event_xml(ev: &ParsedEvent) -> Result<Vec<u8>, SourceError> {
    let mut w = Writer::new(Vec::with_capacity(512));

    w.write_event(Event::Start(
        BytesStart::new("Event").with_attributes([("xmlns", EVENT_NAMESPACE)]),
    ))
    .map_err(xml_err)?;
    w.write_event(Event::Start(BytesStart::new("System"))).map_err(xml_err)?;

    w.create_element("Provider")
        .with_attribute(("Name", ev.provider.as_str()))
        .write_empty()
        .map_err(xml_err)?;
    w.create_element("EventID")
        .write_text_content(BytesText::new(&ev.event_id.to_string()))
        .map_err(xml_err)?;
    w.create_element("Level")
        .write_text_content(BytesText::new(&ev.level))
        .map_err(xml_err)?;
    let system_time = ev.time_created.to_rfc3339_opts(SecondsFormat::Nanos, true);
    w.create_element("TimeCreated")
        .with_attribute(("SystemTime", system_time.as_str()))
        .write_empty()
        .map_err(xml_err)?;
    w.create_element("EventRecordID")
        .write_text_content(BytesText::new(&ev.record_id.to_string()))
        .map_err(xml_err)?;
    if let Some(channel) = &ev.channel {
        w.create_element("Channel")
            .write_text_content(BytesText::new(channel))
            .map_err(xml_err)?;
    }
    if let Some(computer) = &ev.computer {
        w.create_element("Computer")
            .write_text_content(BytesText::new(computer))
            .map_err(xml_err)?;
    }
    w.write_event(Event::End(BytesEnd::new("System"))).map_err(xml_err)?;

    w.write_event(Event::Start(BytesStart::new("EventData"))).map_err(xml_err)?;
    for pair in &ev.event_data {
        let element = w.create_element("Data");
        let element = match &pair.key {
            Some(key) => element.with_attribute(("Name", key.as_str())),
            None => element,
        };
        element
            .write_text_content(BytesText::new(&pair.value))
            .map_err(xml_err)?;
    }
    w.write_event(Event::End(BytesEnd::new("EventData"))).map_err(xml_err)?;

    if let Some(message) = &ev.message {
        w.write_event(Event::Start(
            BytesStart::new("RenderingInfo").with_attributes([("Culture", "en-US")]),
        ))
        .map_err(xml_err)?;
        w.create_element("Message")
            .write_text_content(BytesText::new(message))
            .map_err(xml_err)?;
        w.write_event(Event::End(BytesEnd::new("RenderingInfo"))).map_err(xml_err)?;
    }

    w.write_event(Event::End(BytesEnd::new("Event"))).map_err(xml_err)?;
    Ok(w.into_inner())
}
