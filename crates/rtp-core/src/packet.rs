//! RTP packet encoding and decoding
//!
//! Implements the fixed 12-byte RTP header (RFC 3550) with big-endian
//! sequence number, timestamp and SSRC. Senders in this crate never emit
//! CSRC lists or header extensions, but the parser accounts for both so
//! that packets from arbitrary PBX equipment decode correctly.

use bytes::{BufMut, Bytes, BytesMut};

use crate::{Error, Result, RtpSequenceNumber, RtpSsrc, RtpTimestamp};

/// Minimum RTP header size in bytes
pub const RTP_MIN_HEADER_SIZE: usize = 12;

/// RTP protocol version implemented here
pub const RTP_VERSION: u8 = 2;

/// G.711 μ-law payload type (static assignment)
pub const PT_PCMU: u8 = 0;

/// G.711 A-law payload type (static assignment)
pub const PT_PCMA: u8 = 8;

/// Telephone-event payload type offered in our SDP
pub const PT_TELEPHONE_EVENT: u8 = 101;

/// Coarse routing for received payload types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadKind {
    /// PCMU/PCMA audio (payload types 0 and 8)
    Audio,
    /// RFC 2833/4733 telephone-event (dynamic range 96-127)
    TelephoneEvent,
    /// Anything else; ignored by the media session
    Other,
}

impl PayloadKind {
    pub fn of(payload_type: u8) -> Self {
        match payload_type {
            PT_PCMU | PT_PCMA => PayloadKind::Audio,
            96..=127 => PayloadKind::TelephoneEvent,
            _ => PayloadKind::Other,
        }
    }
}

/// RTP packet header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpHeader {
    /// RTP version (always 2 on the wire)
    pub version: u8,
    /// Padding flag
    pub padding: bool,
    /// Extension flag
    pub extension: bool,
    /// CSRC count
    pub cc: u8,
    /// Marker bit
    pub marker: bool,
    /// Payload type (7 bits)
    pub payload_type: u8,
    /// Sequence number
    pub sequence_number: RtpSequenceNumber,
    /// Timestamp in sampling-clock units
    pub timestamp: RtpTimestamp,
    /// Synchronization source
    pub ssrc: RtpSsrc,
}

impl RtpHeader {
    /// Create a new header with no padding, extension or CSRC list
    pub fn new(
        payload_type: u8,
        sequence_number: RtpSequenceNumber,
        timestamp: RtpTimestamp,
        ssrc: RtpSsrc,
    ) -> Self {
        Self {
            version: RTP_VERSION,
            padding: false,
            extension: false,
            cc: 0,
            marker: false,
            payload_type,
            sequence_number,
            timestamp,
            ssrc,
        }
    }

    /// Serialized size of this header in bytes
    pub fn size(&self) -> usize {
        RTP_MIN_HEADER_SIZE + 4 * self.cc as usize
    }

    /// Serialize into the fixed wire layout
    pub fn serialize(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(RTP_MIN_HEADER_SIZE);
        let mut byte0 = (self.version & 0x03) << 6;
        if self.padding {
            byte0 |= 0x20;
        }
        if self.extension {
            byte0 |= 0x10;
        }
        byte0 |= self.cc & 0x0F;
        buf.put_u8(byte0);

        let mut byte1 = self.payload_type & 0x7F;
        if self.marker {
            byte1 |= 0x80;
        }
        buf.put_u8(byte1);

        buf.put_u16(self.sequence_number);
        buf.put_u32(self.timestamp);
        buf.put_u32(self.ssrc);
        buf.freeze()
    }

    /// Parse a header from the start of `data`, returning the header and
    /// the total header length (including CSRC list and any extension).
    pub fn parse(data: &[u8]) -> Result<(Self, usize)> {
        if data.len() < RTP_MIN_HEADER_SIZE {
            return Err(Error::BufferTooSmall {
                needed: RTP_MIN_HEADER_SIZE,
                got: data.len(),
            });
        }

        let version = (data[0] >> 6) & 0x03;
        if version != RTP_VERSION {
            return Err(Error::UnsupportedVersion(version));
        }

        let padding = data[0] & 0x20 != 0;
        let extension = data[0] & 0x10 != 0;
        let cc = data[0] & 0x0F;
        let marker = data[1] & 0x80 != 0;
        let payload_type = data[1] & 0x7F;
        let sequence_number = u16::from_be_bytes([data[2], data[3]]);
        let timestamp = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
        let ssrc = u32::from_be_bytes([data[8], data[9], data[10], data[11]]);

        let mut header_len = RTP_MIN_HEADER_SIZE + 4 * cc as usize;
        if data.len() < header_len {
            return Err(Error::BufferTooSmall {
                needed: header_len,
                got: data.len(),
            });
        }

        if extension {
            // Extension header: 16-bit profile id, 16-bit length in words
            if data.len() < header_len + 4 {
                return Err(Error::BufferTooSmall {
                    needed: header_len + 4,
                    got: data.len(),
                });
            }
            let ext_words =
                u16::from_be_bytes([data[header_len + 2], data[header_len + 3]]) as usize;
            header_len += 4 + 4 * ext_words;
            if data.len() < header_len {
                return Err(Error::BufferTooSmall {
                    needed: header_len,
                    got: data.len(),
                });
            }
        }

        Ok((
            Self {
                version,
                padding,
                extension,
                cc,
                marker,
                payload_type,
                sequence_number,
                timestamp,
                ssrc,
            },
            header_len,
        ))
    }
}

/// A complete RTP packet (header plus payload)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpPacket {
    pub header: RtpHeader,
    pub payload: Bytes,
}

impl RtpPacket {
    pub fn new(header: RtpHeader, payload: Bytes) -> Self {
        Self { header, payload }
    }

    /// Serialize header and payload into a single datagram
    pub fn serialize(&self) -> Bytes {
        let header = self.header.serialize();
        let mut buf = BytesMut::with_capacity(header.len() + self.payload.len());
        buf.put_slice(&header);
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    /// Parse a datagram into header and payload
    pub fn parse(data: &[u8]) -> Result<Self> {
        let (header, header_len) = RtpHeader::parse(data)?;
        let payload = Bytes::copy_from_slice(&data[header_len..]);
        Ok(Self { header, payload })
    }

    /// Routing of the payload based on payload type
    pub fn payload_kind(&self) -> PayloadKind {
        PayloadKind::of(self.header.payload_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_round_trip() {
        let mut header = RtpHeader::new(PT_PCMA, 0x1234, 0xDEADBEEF, 0xCAFEBABE);
        header.marker = true;

        let wire = header.serialize();
        assert_eq!(wire.len(), RTP_MIN_HEADER_SIZE);
        assert_eq!(wire[0], 0x80);
        assert_eq!(wire[1], 0x88); // marker set, PT 8

        let (parsed, len) = RtpHeader::parse(&wire).unwrap();
        assert_eq!(len, RTP_MIN_HEADER_SIZE);
        assert_eq!(parsed, header);
    }

    #[test]
    fn test_packet_round_trip() {
        let header = RtpHeader::new(PT_TELEPHONE_EVENT, 7, 160, 0x12345678);
        let packet = RtpPacket::new(header, Bytes::from_static(&[0x01, 0x8A, 0x03, 0x20]));

        let wire = packet.serialize();
        let parsed = RtpPacket::parse(&wire).unwrap();
        assert_eq!(parsed, packet);
        assert_eq!(parsed.payload_kind(), PayloadKind::TelephoneEvent);
    }

    #[test]
    fn test_rejects_short_packet() {
        let err = RtpHeader::parse(&[0x80, 0x00, 0x00]).unwrap_err();
        assert!(matches!(err, Error::BufferTooSmall { .. }));
    }

    #[test]
    fn test_rejects_wrong_version() {
        let mut wire = RtpHeader::new(PT_PCMU, 1, 1, 1).serialize().to_vec();
        wire[0] = 0x40; // version 1
        let err = RtpHeader::parse(&wire).unwrap_err();
        assert!(matches!(err, Error::UnsupportedVersion(1)));
    }

    #[test]
    fn test_header_len_includes_csrc_and_extension() {
        let mut wire = RtpHeader::new(PT_PCMU, 1, 1, 1).serialize().to_vec();
        wire[0] = 0x92; // version 2, extension, cc = 2
        wire.extend_from_slice(&[0; 8]); // two CSRC entries
        wire.extend_from_slice(&[0xBE, 0xDE, 0x00, 0x01]); // extension, 1 word
        wire.extend_from_slice(&[0; 4]); // extension body
        wire.extend_from_slice(&[0x55; 3]); // payload

        let (header, len) = RtpHeader::parse(&wire).unwrap();
        assert_eq!(header.cc, 2);
        assert!(header.extension);
        assert_eq!(len, 12 + 8 + 4 + 4);
    }

    #[test]
    fn test_payload_kind_routing() {
        assert_eq!(PayloadKind::of(0), PayloadKind::Audio);
        assert_eq!(PayloadKind::of(8), PayloadKind::Audio);
        assert_eq!(PayloadKind::of(101), PayloadKind::TelephoneEvent);
        assert_eq!(PayloadKind::of(96), PayloadKind::TelephoneEvent);
        assert_eq!(PayloadKind::of(9), PayloadKind::Other);
    }
}
