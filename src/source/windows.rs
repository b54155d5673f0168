//! Windows Event Log source (Wevtapi).
//!
//! - the cursor query is `EvtQuery` in reverse direction, first hit only
//! - subscriptions are pull-mode `EvtSubscribe` handles woken by a signal event
//! - a cursor becomes a bookmark built from its record id
//! - records render with `EvtRender(EvtRenderEventXml)` and are transcoded to
//!   UTF-8 before being copied into the caller's buffer

use std::ffi::c_void;
use std::ptr;
use std::time::Duration;

use tracing::debug;
use windows_sys::Win32::Foundation::{
    CloseHandle, GetLastError, ERROR_INSUFFICIENT_BUFFER, ERROR_NO_MORE_ITEMS, ERROR_TIMEOUT,
    HANDLE, WAIT_TIMEOUT,
};
use windows_sys::Win32::System::EventLog::{
    EvtClose, EvtCreateBookmark, EvtNext, EvtQuery, EvtQueryChannelPath,
    EvtQueryReverseDirection, EvtRender, EvtRenderEventXml, EvtSubscribe,
    EvtSubscribeStartAfterBookmark, EvtSubscribeToFutureEvents, EVT_HANDLE,
};
use windows_sys::Win32::System::Threading::{CreateEventW, ResetEvent, WaitForSingleObject};

use crate::cursor::Cursor;
use crate::error::SourceError;
use crate::filter::FilterQuery;

use super::{validate_channel_name, Batch, EventSource};

const ERROR_EVT_INVALID_QUERY: u32 = 15001;
const ERROR_EVT_CHANNEL_NOT_FOUND: u32 = 15007;
const ERROR_EVT_CHANNEL_CANNOT_ACTIVATE: u32 = 15025;
const WAIT_OBJECT_0: u32 = 0;
const INFINITE: u32 = u32::MAX;

/// Owned `EVT_HANDLE`, closed on drop.
#[derive(Debug)]
struct EvtHandle(EVT_HANDLE);

impl EvtHandle {
    fn new(raw: EVT_HANDLE) -> Option<Self> {
        (raw != 0).then_some(Self(raw))
    }
}

impl Drop for EvtHandle {
    fn drop(&mut self) {
        unsafe {
            EvtClose(self.0);
        }
    }
}

/// Owned kernel event handle, closed on drop.
#[derive(Debug)]
struct SignalEvent(HANDLE);

impl Drop for SignalEvent {
    fn drop(&mut self) {
        unsafe {
            CloseHandle(self.0);
        }
    }
}

/// A live pull subscription. Closed on drop.
#[derive(Debug)]
pub struct WindowsSubscription {
    handle: EvtHandle,
    signal: SignalEvent,
    channel: String,
}

impl WindowsSubscription {
    #[allow(missing_docs)]
    #[must_use]
    pub fn channel(&self) -> &str {
        &self.channel
    }
}

/// An unrendered event handle. Released on drop.
#[derive(Debug)]
pub struct WindowsRecord(EvtHandle);

/// The local machine's Event Log.
#[derive(Debug, Clone, Copy, Default)]
pub struct WindowsEventLog;

impl WindowsEventLog {
    #[allow(missing_docs)]
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

fn wide(s: &str) -> Vec<u16> {
    s.encode_utf16().chain(std::iter::once(0)).collect()
}

fn query_text(filter: &FilterQuery) -> &str {
    if filter.is_match_all() {
        "*"
    } else {
        filter.as_str()
    }
}

fn os_error(code: u32) -> SourceError {
    let message = i32::try_from(code)
        .map(|c| std::io::Error::from_raw_os_error(c).to_string())
        .unwrap_or_else(|_| "unknown error".to_string());
    SourceError::Os { code, message }
}

fn classify(code: u32, channel: &str, filter: &FilterQuery) -> SourceError {
    match code {
        ERROR_EVT_CHANNEL_NOT_FOUND => SourceError::ChannelNotFound {
            channel: channel.to_string(),
        },
        ERROR_EVT_CHANNEL_CANNOT_ACTIVATE => SourceError::ChannelDisabled {
            channel: channel.to_string(),
        },
        ERROR_EVT_INVALID_QUERY => SourceError::InvalidQuery {
            query: filter.as_str().to_string(),
            reason: os_error(code).to_string(),
        },
        other => os_error(other),
    }
}

fn check_name(channel: &str) -> Result<(), SourceError> {
    validate_channel_name(channel).map_err(|reason| SourceError::InvalidChannel {
        channel: channel.to_string(),
        reason,
    })
}

fn escape_attr(value: &str) -> String {
    quick_xml::escape::escape(value).into_owned()
}

/// Bookmark XML pointing at `record_id` in `channel`.
fn bookmark_xml(channel: &str, record_id: u64) -> String {
    format!(
        "<BookmarkList><Bookmark Channel='{}' RecordId='{record_id}' IsCurrent='true'/></BookmarkList>",
        escape_attr(channel)
    )
}

/// Pulls up to `max` handles without waiting. `Ok(empty)` means nothing is ready.
fn pull(handle: &EvtHandle, max: usize) -> Result<Vec<WindowsRecord>, SourceError> {
    let mut raw: Vec<EVT_HANDLE> = vec![0; max];
    let mut returned: u32 = 0;
    let capacity = u32::try_from(max).unwrap_or(u32::MAX);
    let ok = unsafe { EvtNext(handle.0, capacity, raw.as_mut_ptr(), 0, 0, &mut returned) };
    if ok == 0 {
        let code = unsafe { GetLastError() };
        return match code {
            ERROR_NO_MORE_ITEMS | ERROR_TIMEOUT => Ok(Vec::new()),
            other => Err(os_error(other)),
        };
    }
    raw.truncate(returned as usize);
    Ok(raw
        .into_iter()
        .filter_map(EvtHandle::new)
        .map(WindowsRecord)
        .collect())
}

impl EventSource for WindowsEventLog {
    type Subscription = WindowsSubscription;
    type Record = WindowsRecord;

    fn query_latest(
        &self,
        channel: &str,
        filter: &FilterQuery,
    ) -> Result<Option<Self::Record>, SourceError> {
        check_name(channel)?;
        let path = wide(channel);
        let query = wide(query_text(filter));
        let flags = (EvtQueryChannelPath | EvtQueryReverseDirection) as u32;

        let raw = unsafe { EvtQuery(0, path.as_ptr(), query.as_ptr(), flags) };
        let Some(results) = EvtHandle::new(raw) else {
            return Err(classify(unsafe { GetLastError() }, channel, filter));
        };

        let mut event: EVT_HANDLE = 0;
        let mut returned: u32 = 0;
        let ok = unsafe { EvtNext(results.0, 1, &mut event, INFINITE, 0, &mut returned) };
        if ok == 0 {
            let code = unsafe { GetLastError() };
            return match code {
                ERROR_NO_MORE_ITEMS => Ok(None),
                other => Err(classify(other, channel, filter)),
            };
        }
        Ok(EvtHandle::new(event).map(WindowsRecord))
    }

    fn subscribe(
        &self,
        channel: &str,
        filter: &FilterQuery,
        cursor: &Cursor,
    ) -> Result<Self::Subscription, SourceError> {
        check_name(channel)?;
        let path = wide(channel);
        let query = wide(query_text(filter));

        let signal = unsafe { CreateEventW(ptr::null(), 1, 1, ptr::null()) };
        if signal == 0 {
            return Err(os_error(unsafe { GetLastError() }));
        }
        let signal = SignalEvent(signal);

        let bookmark = match cursor {
            Cursor::FromNow => None,
            Cursor::After(record_id) => {
                let xml = wide(&bookmark_xml(channel, *record_id));
                let raw = unsafe { EvtCreateBookmark(xml.as_ptr()) };
                Some(EvtHandle::new(raw).ok_or_else(|| os_error(unsafe { GetLastError() }))?)
            }
        };
        let (bookmark_raw, flags) = match &bookmark {
            None => (0, EvtSubscribeToFutureEvents as u32),
            Some(b) => (b.0, EvtSubscribeStartAfterBookmark as u32),
        };

        let raw = unsafe {
            EvtSubscribe(
                0,
                signal.0,
                path.as_ptr(),
                query.as_ptr(),
                bookmark_raw,
                ptr::null::<c_void>(),
                None,
                flags,
            )
        };
        let handle =
            EvtHandle::new(raw).ok_or_else(|| classify(unsafe { GetLastError() }, channel, filter))?;

        debug!(%channel, %cursor, "EvtSubscribe succeeded");
        Ok(WindowsSubscription {
            handle,
            signal,
            channel: channel.to_string(),
        })
    }

    fn next_batch(
        &self,
        subscription: &mut Self::Subscription,
        max: usize,
        wait: Duration,
    ) -> Result<Batch<Self::Record>, SourceError> {
        let records = pull(&subscription.handle, max)?;
        if !records.is_empty() {
            return Ok(Batch::Records(records));
        }

        let millis = u32::try_from(wait.as_millis()).unwrap_or(INFINITE - 1);
        let status = unsafe { WaitForSingleObject(subscription.signal.0, millis) };
        match status {
            WAIT_OBJECT_0 => {
                unsafe {
                    ResetEvent(subscription.signal.0);
                }
                let records = pull(&subscription.handle, max)?;
                if records.is_empty() {
                    Ok(Batch::Exhausted)
                } else {
                    Ok(Batch::Records(records))
                }
            }
            WAIT_TIMEOUT => Ok(Batch::Exhausted),
            _ => Err(os_error(unsafe { GetLastError() })),
        }
    }

    fn render(&self, record: &Self::Record, buf: &mut [u8]) -> Result<usize, SourceError> {
        let mut wide_buf: Vec<u16> = vec![0; buf.len().max(1)];
        loop {
            let size_bytes = u32::try_from(wide_buf.len() * 2).unwrap_or(u32::MAX);
            let mut used: u32 = 0;
            let mut props: u32 = 0;
            let ok = unsafe {
                EvtRender(
                    0,
                    (record.0).0,
                    EvtRenderEventXml as u32,
                    size_bytes,
                    wide_buf.as_mut_ptr().cast::<c_void>(),
                    &mut used,
                    &mut props,
                )
            };
            if ok != 0 {
                wide_buf.truncate(used as usize / 2);
                break;
            }
            match unsafe { GetLastError() } {
                ERROR_INSUFFICIENT_BUFFER => wide_buf.resize((used as usize).div_ceil(2), 0),
                other => return Err(os_error(other)),
            }
        }

        while wide_buf.last() == Some(&0) {
            wide_buf.pop();
        }
        let text = String::from_utf16(&wide_buf)
            .map_err(|e| SourceError::Backend(format!("rendered XML is not valid UTF-16: {e}")))?;

        let bytes = text.as_bytes();
        if bytes.len() > buf.len() {
            return Err(SourceError::BufferTooSmall {
                required: bytes.len(),
                capacity: buf.len(),
            });
        }
        buf[..bytes.len()].copy_from_slice(bytes);
        Ok(bytes.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bookmark_xml_escapes_channel() {
        let xml = bookmark_xml("A'B", 42);
        assert!(xml.contains("Channel='A&apos;B'"));
        assert!(xml.contains("RecordId='42'"));
    }

    #[test]
    fn test_wide_is_nul_terminated() {
        assert_eq!(wide("ab"), vec![u16::from(b'a'), u16::from(b'b'), 0]);
    }

    #[test]
    fn test_match_all_query_text() {
        assert_eq!(query_text(&FilterQuery::match_all()), "*");
        let filter = FilterQuery::parse("*[System[Level=2]]").unwrap();
        assert_eq!(query_text(&filter), "*[System[Level=2]]");
    }

    #[test]
    fn test_missing_channel_is_not_found() {
        let err = WindowsEventLog::new()
            .subscribe(
                "eventlog-tail-no-such-channel",
                &FilterQuery::match_all(),
                &Cursor::FromNow,
            )
            .unwrap_err();
        assert!(matches!(err, SourceError::ChannelNotFound { .. }));
    }
}
