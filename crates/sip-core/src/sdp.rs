//! Minimal SDP offer/answer handling
//!
//! The offer is fixed: one audio stream preferring PCMA, with PCMU,
//! G.722 and Opus as alternatives and telephone-event for out-of-band
//! DTMF. From the answer we only need where to send RTP and which
//! payload type the far end uses for telephone-event.

use std::net::IpAddr;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::{Error, Result};

/// Renders the audio offer embedded in an INVITE
#[derive(Debug, Clone)]
pub struct SdpOffer {
    pub local_ip: IpAddr,
    pub rtp_port: u16,
}

impl SdpOffer {
    pub fn audio(local_ip: IpAddr, rtp_port: u16) -> Self {
        Self { local_ip, rtp_port }
    }

    /// The session body. PCMA is listed first; the announcement audio is
    /// pre-encoded as A-law.
    pub fn render(&self) -> String {
        let session_id = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or(0);
        [
            "v=0".to_string(),
            format!("o=- {} {} IN IP4 {}", session_id, session_id, self.local_ip),
            "s=dialcast".to_string(),
            format!("c=IN IP4 {}", self.local_ip),
            "t=0 0".to_string(),
            format!("m=audio {} RTP/AVP 8 0 9 111 101", self.rtp_port),
            "a=rtpmap:8 PCMA/8000".to_string(),
            "a=rtpmap:0 PCMU/8000".to_string(),
            "a=rtpmap:9 G722/8000".to_string(),
            "a=rtpmap:111 opus/48000/2".to_string(),
            "a=rtpmap:101 telephone-event/8000".to_string(),
            "a=fmtp:101 0-16".to_string(),
            "a=fmtp:111 minptime=10;useinbandfec=1".to_string(),
            "a=ptime:20".to_string(),
            "a=maxptime:60".to_string(),
            "a=sendrecv".to_string(),
        ]
        .join("\r\n")
    }
}

/// The parts of an SDP answer the media engine needs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SdpAnswer {
    pub remote_ip: IpAddr,
    pub remote_port: u16,
    /// Payload type the far end advertises for telephone-event, when it
    /// does
    pub telephone_event_pt: Option<u8>,
}

impl SdpAnswer {
    /// Extracts the connection address, audio port and telephone-event
    /// payload type from an answer body.
    pub fn parse(body: &str) -> Result<Self> {
        let mut remote_ip = None;
        let mut remote_port = None;
        let mut telephone_event_pt = None;

        for line in body.lines().map(str::trim_end) {
            if let Some(rest) = line.strip_prefix("c=IN IP4 ") {
                remote_ip = Some(
                    rest.trim()
                        .parse::<IpAddr>()
                        .map_err(|_| Error::Sdp(format!("bad connection address {:?}", rest)))?,
                );
            } else if let Some(rest) = line.strip_prefix("m=audio ") {
                let port = rest
                    .split_whitespace()
                    .next()
                    .ok_or_else(|| Error::Sdp("empty m=audio line".to_string()))?;
                remote_port = Some(
                    port.parse::<u16>()
                        .map_err(|_| Error::Sdp(format!("bad audio port {:?}", port)))?,
                );
            } else if let Some(rest) = line.strip_prefix("a=rtpmap:") {
                if let Some((pt, codec)) = rest.split_once(' ') {
                    if codec.trim().starts_with("telephone-event/") {
                        telephone_event_pt = pt.trim().parse::<u8>().ok();
                    }
                }
            }
        }

        Ok(Self {
            remote_ip: remote_ip.ok_or_else(|| Error::Sdp("no c= line".to_string()))?,
            remote_port: remote_port.ok_or_else(|| Error::Sdp("no m=audio line".to_string()))?,
            telephone_event_pt,
        })
    }
}
