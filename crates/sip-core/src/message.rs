//! SIP message model and text framing
//!
//! SIP over UDP is one message per datagram: a start line, CRLF-separated
//! headers, a blank line, then an optional body. Header names are matched
//! case-insensitively but stored as written, and insertion order is
//! preserved because the wire ordering matters to some PBXes.

use std::fmt;
use std::str::FromStr;

use crate::{Error, Result};

/// SIP request method
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Method {
    Register,
    Invite,
    Ack,
    Bye,
    Cancel,
    Options,
    Info,
    Notify,
    Update,
    /// Anything else, kept verbatim so it can be echoed in responses
    Extension(String),
}

impl Method {
    pub fn as_str(&self) -> &str {
        match self {
            Method::Register => "REGISTER",
            Method::Invite => "INVITE",
            Method::Ack => "ACK",
            Method::Bye => "BYE",
            Method::Cancel => "CANCEL",
            Method::Options => "OPTIONS",
            Method::Info => "INFO",
            Method::Notify => "NOTIFY",
            Method::Update => "UPDATE",
            Method::Extension(s) => s,
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Method {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "REGISTER" => Method::Register,
            "INVITE" => Method::Invite,
            "ACK" => Method::Ack,
            "BYE" => Method::Bye,
            "CANCEL" => Method::Cancel,
            "OPTIONS" => Method::Options,
            "INFO" => Method::Info,
            "NOTIFY" => Method::Notify,
            "UPDATE" => Method::Update,
            other if !other.is_empty() && other.chars().all(|c| c.is_ascii_uppercase()) => {
                Method::Extension(other.to_string())
            }
            other => return Err(Error::Parse(format!("bad method {:?}", other))),
        })
    }
}

/// Ordered, case-insensitive header collection
#[derive(Debug, Clone, Default)]
pub struct Headers(Vec<(String, String)>);

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a header at the end
    pub fn push(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.push((name.into(), value.into()));
    }

    /// Insert a header at a wire position (auth headers go in a fixed
    /// slot after CSeq)
    pub fn insert_at(&mut self, index: usize, name: impl Into<String>, value: impl Into<String>) {
        let index = index.min(self.0.len());
        self.0.insert(index, (name.into(), value.into()));
    }

    /// First value for `name`, case-insensitive
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// An outbound or inbound SIP request
#[derive(Debug, Clone)]
pub struct Request {
    pub method: Method,
    pub uri: String,
    pub headers: Headers,
    pub body: String,
}

/// A SIP response
#[derive(Debug, Clone)]
pub struct Response {
    pub status_code: u16,
    pub reason: String,
    pub headers: Headers,
    pub body: String,
}

/// Either kind of message, as parsed off the wire
#[derive(Debug, Clone)]
pub enum SipMessage {
    Request(Request),
    Response(Response),
}

impl SipMessage {
    /// Parse one UDP datagram.
    ///
    /// Malformed input is an `Err`; callers drop the datagram so one bad
    /// peer cannot affect other live calls.
    pub fn parse(data: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(data)
            .map_err(|_| Error::Parse("not valid UTF-8".to_string()))?;

        let (head, body) = match text.split_once("\r\n\r\n") {
            Some((h, b)) => (h, b),
            // Tolerate a missing terminator on body-less messages
            None => (text.trim_end_matches("\r\n"), ""),
        };

        let mut lines = head.split("\r\n");
        let start = lines
            .next()
            .filter(|l| !l.is_empty())
            .ok_or_else(|| Error::Parse("empty message".to_string()))?;

        let mut headers = Headers::new();
        for line in lines {
            if line.is_empty() {
                continue;
            }
            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| Error::Parse(format!("bad header line {:?}", line)))?;
            headers.push(name.trim(), value.trim());
        }

        if let Some(rest) = start.strip_prefix("SIP/2.0 ") {
            let (code, reason) = rest
                .split_once(' ')
                .map(|(c, r)| (c, r.to_string()))
                .unwrap_or((rest, String::new()));
            let status_code: u16 = code
                .parse()
                .map_err(|_| Error::Parse(format!("bad status code {:?}", code)))?;
            return Ok(SipMessage::Response(Response {
                status_code,
                reason,
                headers,
                body: body.to_string(),
            }));
        }

        let mut parts = start.split_whitespace();
        let (method, uri, version) = match (parts.next(), parts.next(), parts.next()) {
            (Some(m), Some(u), Some(v)) => (m, u, v),
            _ => return Err(Error::Parse(format!("bad start line {:?}", start))),
        };
        if version != "SIP/2.0" {
            return Err(Error::Parse(format!("bad SIP version {:?}", version)));
        }
        Ok(SipMessage::Request(Request {
            method: method.parse()?,
            uri: uri.to_string(),
            headers,
            body: body.to_string(),
        }))
    }
}

fn render(start_line: &str, headers: &Headers, body: &str, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}\r\n", start_line)?;
    for (name, value) in headers.iter() {
        write!(f, "{}: {}\r\n", name, value)?;
    }
    write!(f, "\r\n{}", body)
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        render(
            &format!("{} {} SIP/2.0", self.method, self.uri),
            &self.headers,
            &self.body,
            f,
        )
    }
}

impl fmt::Display for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        render(
            &format!("SIP/2.0 {} {}", self.status_code, self.reason),
            &self.headers,
            &self.body,
            f,
        )
    }
}

/// Extract the `tag` parameter from a From/To header value
pub fn header_tag(value: &str) -> Option<&str> {
    value.split(';').skip(1).find_map(|param| {
        let (key, val) = param.split_once('=')?;
        (key.trim() == "tag").then(|| val.trim())
    })
}

/// Parse a CSeq value into its sequence number and method
pub fn parse_cseq(value: &str) -> Result<(u32, Method)> {
    let (seq, method) = value
        .trim()
        .split_once(' ')
        .ok_or_else(|| Error::Parse(format!("bad CSeq {:?}", value)))?;
    let seq: u32 = seq
        .parse()
        .map_err(|_| Error::Parse(format!("bad CSeq number {:?}", seq)))?;
    Ok((seq, method.trim().parse()?))
}

impl Response {
    pub fn call_id(&self) -> Option<&str> {
        self.headers.get("Call-ID")
    }

    /// Sequence number and method from CSeq, if well-formed
    pub fn cseq(&self) -> Option<(u32, Method)> {
        self.headers.get("CSeq").and_then(|v| parse_cseq(v).ok())
    }

    pub fn to_tag(&self) -> Option<&str> {
        self.headers.get("To").and_then(header_tag)
    }

    pub fn from_tag(&self) -> Option<&str> {
        self.headers.get("From").and_then(header_tag)
    }

    /// Granted registration lifetime, from Expires or the Contact
    /// `expires` parameter
    pub fn expires(&self) -> Option<u32> {
        if let Some(v) = self.headers.get("Expires") {
            return v.trim().parse().ok();
        }
        let contact = self.headers.get("Contact")?;
        contact.split(';').skip(1).find_map(|param| {
            let (key, val) = param.split_once('=')?;
            (key.trim() == "expires").then(|| val.trim().parse().ok())?
        })
    }
}

impl Request {
    pub fn call_id(&self) -> Option<&str> {
        self.headers.get("Call-ID")
    }
}
