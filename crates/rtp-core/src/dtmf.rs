//! RFC 4733 telephone-event handling (formerly RFC 2833)
//!
//! In-band DTMF arrives as dedicated RTP packets on a negotiated dynamic
//! payload type. A key press produces a burst of packets sharing one RTP
//! timestamp: zero or more interim reports followed by (usually three
//! retransmitted) end-of-event reports. We only act on end-of-event
//! packets and suppress the retransmissions by remembering recently seen
//! (event, timestamp) pairs.

use std::time::{Duration, Instant};

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::Error;
use crate::{Result, RtpTimestamp};

/// Wire size of a telephone-event report
pub const TELEPHONE_EVENT_SIZE: usize = 4;

/// Retransmitted end packets for the same key press arrive within well
/// under a second; five covers pathological jitter.
pub const DEDUP_WINDOW: Duration = Duration::from_secs(5);

/// A decoded telephone-event report
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TelephoneEvent {
    /// Event code (0-9 digits, 10 `*`, 11 `#`, 12-15 `A`-`D`)
    pub event: u8,
    /// Set on the final (and retransmitted final) packets of a press
    pub end: bool,
    /// Attenuation in dBm0, 0-63
    pub volume: u8,
    /// Duration so far in timestamp units (8 kHz samples)
    pub duration: u16,
}

impl TelephoneEvent {
    /// Parse a report from an RTP payload.
    ///
    /// Some endpoints pack several reports per packet; only the first is
    /// meaningful for single-digit detection, so trailing bytes are
    /// ignored.
    pub fn parse(payload: &[u8]) -> Result<Self> {
        if payload.len() < TELEPHONE_EVENT_SIZE {
            return Err(Error::BufferTooSmall {
                needed: TELEPHONE_EVENT_SIZE,
                got: payload.len(),
            });
        }

        Ok(Self {
            event: payload[0],
            end: payload[1] & 0x80 != 0,
            volume: payload[1] & 0x3F,
            duration: u16::from_be_bytes([payload[2], payload[3]]),
        })
    }

    /// Serialize a report to its 4-byte wire form
    pub fn serialize(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(TELEPHONE_EVENT_SIZE);
        buf.put_u8(self.event);
        buf.put_u8(if self.end { 0x80 } else { 0 } | (self.volume & 0x3F));
        buf.put_u16(self.duration);
        buf.freeze()
    }

    /// The dialpad character for this event, if it maps to one
    pub fn digit(&self) -> Option<char> {
        event_to_digit(self.event)
    }
}

/// Map an event code to its dialpad character
pub fn event_to_digit(event: u8) -> Option<char> {
    match event {
        0..=9 => Some((b'0' + event) as char),
        10 => Some('*'),
        11 => Some('#'),
        12..=15 => Some((b'A' + event - 12) as char),
        _ => None,
    }
}

/// Map a dialpad character to its event code
pub fn digit_to_event(digit: char) -> Option<u8> {
    match digit {
        '0'..='9' => Some(digit as u8 - b'0'),
        '*' => Some(10),
        '#' => Some(11),
        'A'..='D' => Some(digit as u8 - b'A' + 12),
        _ => None,
    }
}

/// Suppresses retransmitted end-of-event reports.
///
/// A press is identified by its (event, RTP timestamp) pair; two presses
/// of the same digit always carry different timestamps. Entries expire
/// after [`DEDUP_WINDOW`] so the set stays small on long calls.
#[derive(Debug, Default)]
pub struct DtmfDeduper {
    seen: Vec<(u8, RtpTimestamp, Instant)>,
}

impl DtmfDeduper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true the first time a given press is reported, false for
    /// retransmissions within the window.
    pub fn accept(&mut self, event: u8, timestamp: RtpTimestamp) -> bool {
        self.accept_at(event, timestamp, Instant::now())
    }

    fn accept_at(&mut self, event: u8, timestamp: RtpTimestamp, now: Instant) -> bool {
        self.seen
            .retain(|&(_, _, at)| now.duration_since(at) < DEDUP_WINDOW);

        if self
            .seen
            .iter()
            .any(|&(e, ts, _)| e == event && ts == timestamp)
        {
            return false;
        }

        self.seen.push((event, timestamp, now));
        true
    }
}
