//! Request and response construction
//!
//! Header order is fixed and deliberate: Via, From, To, Call-ID, CSeq,
//! then Contact and the rest. Some PBX implementations are picky about
//! it, and an Authorization header always lands in the slot right after
//! CSeq. Every request gets a fresh branch; tags and Call-IDs are random
//! hex.

use std::net::IpAddr;

use rand::Rng;

use crate::message::{Headers, Method, Request, Response};

const MAX_FORWARDS: &str = "70";
const ALLOW_METHODS: &str = "INVITE, ACK, BYE, CANCEL, OPTIONS, INFO, UPDATE, NOTIFY";

/// Index of the slot following CSeq in the fixed header order
const AUTH_SLOT: usize = 5;

/// One SIP account on one PBX
#[derive(Debug, Clone)]
pub struct SipIdentity {
    pub username: String,
    pub domain: String,
    pub local_ip: IpAddr,
    pub local_port: u16,
    pub user_agent: String,
}

impl SipIdentity {
    fn local_uri(&self) -> String {
        format!("sip:{}@{}", self.username, self.domain)
    }

    fn remote_uri(&self, number: &str) -> String {
        format!("sip:{}@{}", number, self.domain)
    }

    fn contact(&self) -> String {
        format!(
            "<sip:{}@{}:{}>",
            self.username, self.local_ip, self.local_port
        )
    }

    fn via(&self, branch: &str) -> String {
        format!(
            "SIP/2.0/UDP {}:{};branch={};rport",
            self.local_ip, self.local_port, branch
        )
    }

    /// Shared prefix of every request: Via through CSeq, then Contact,
    /// Max-Forwards and User-Agent.
    fn base_headers(
        &self,
        method: &Method,
        to: &str,
        call_id: &str,
        from_tag: &str,
        to_tag: Option<&str>,
        cseq: u32,
    ) -> Headers {
        let mut headers = Headers::new();
        headers.push("Via", self.via(&generate_branch()));
        headers.push("From", format!("<{}>;tag={}", self.local_uri(), from_tag));
        match to_tag {
            Some(tag) => headers.push("To", format!("<{}>;tag={}", to, tag)),
            None => headers.push("To", format!("<{}>", to)),
        }
        headers.push("Call-ID", call_id);
        headers.push("CSeq", format!("{} {}", cseq, method));
        headers.push("Contact", self.contact());
        headers.push("Max-Forwards", MAX_FORWARDS);
        headers.push("User-Agent", self.user_agent.clone());
        headers
    }

    /// Build a REGISTER, optionally carrying a digest Authorization
    pub fn register(
        &self,
        call_id: &str,
        from_tag: &str,
        cseq: u32,
        expires: u32,
        authorization: Option<&str>,
    ) -> Request {
        let uri = format!("sip:{}", self.domain);
        let mut headers = self.base_headers(
            &Method::Register,
            &self.local_uri(),
            call_id,
            from_tag,
            None,
            cseq,
        );
        if let Some(auth) = authorization {
            headers.insert_at(AUTH_SLOT, "Authorization", auth);
        }
        headers.push("Allow", ALLOW_METHODS);
        headers.push("Expires", expires.to_string());
        headers.push("Content-Length", "0");
        Request {
            method: Method::Register,
            uri,
            headers,
            body: String::new(),
        }
    }

    /// Build an INVITE carrying the SDP offer
    pub fn invite(
        &self,
        number: &str,
        call_id: &str,
        from_tag: &str,
        cseq: u32,
        sdp: &str,
        authorization: Option<&str>,
    ) -> Request {
        let uri = self.remote_uri(number);
        let mut headers =
            self.base_headers(&Method::Invite, &uri, call_id, from_tag, None, cseq);
        if let Some(auth) = authorization {
            headers.insert_at(AUTH_SLOT, "Authorization", auth);
        }
        headers.push("Allow", ALLOW_METHODS);
        headers.push("Content-Type", "application/sdp");
        headers.push("Content-Length", sdp.len().to_string());
        Request {
            method: Method::Invite,
            uri,
            headers,
            body: sdp.to_string(),
        }
    }

    /// Build the ACK for a 2xx answer (new branch, answered dialog tags)
    pub fn ack(
        &self,
        number: &str,
        call_id: &str,
        from_tag: &str,
        to_tag: &str,
        cseq: u32,
    ) -> Request {
        let uri = self.remote_uri(number);
        let mut headers =
            self.base_headers(&Method::Ack, &uri, call_id, from_tag, Some(to_tag), cseq);
        headers.push("Content-Length", "0");
        Request {
            method: Method::Ack,
            uri,
            headers,
            body: String::new(),
        }
    }

    /// Build an in-dialog BYE
    pub fn bye(
        &self,
        number: &str,
        call_id: &str,
        from_tag: &str,
        to_tag: &str,
        cseq: u32,
    ) -> Request {
        let uri = self.remote_uri(number);
        let mut headers =
            self.base_headers(&Method::Bye, &uri, call_id, from_tag, Some(to_tag), cseq);
        headers.push("Content-Length", "0");
        Request {
            method: Method::Bye,
            uri,
            headers,
            body: String::new(),
        }
    }

    /// Build a CANCEL for a ringing INVITE.
    ///
    /// Per the transaction rules it reuses the INVITE's branch and CSeq
    /// number, so both are passed in rather than generated.
    pub fn cancel(
        &self,
        number: &str,
        call_id: &str,
        from_tag: &str,
        invite_branch: &str,
        invite_cseq: u32,
    ) -> Request {
        let uri = self.remote_uri(number);
        let mut headers = Headers::new();
        headers.push("Via", self.via(invite_branch));
        headers.push("From", format!("<{}>;tag={}", self.local_uri(), from_tag));
        headers.push("To", format!("<{}>", uri));
        headers.push("Call-ID", call_id);
        headers.push("CSeq", format!("{} CANCEL", invite_cseq));
        headers.push("Max-Forwards", MAX_FORWARDS);
        headers.push("User-Agent", self.user_agent.clone());
        headers.push("Content-Length", "0");
        Request {
            method: Method::Cancel,
            uri,
            headers,
            body: String::new(),
        }
    }

    /// Build an in-dialog OPTIONS keepalive
    pub fn options(
        &self,
        number: &str,
        call_id: &str,
        from_tag: &str,
        to_tag: &str,
        cseq: u32,
    ) -> Request {
        let uri = self.remote_uri(number);
        let mut headers =
            self.base_headers(&Method::Options, &uri, call_id, from_tag, Some(to_tag), cseq);
        headers.push("Content-Length", "0");
        Request {
            method: Method::Options,
            uri,
            headers,
            body: String::new(),
        }
    }

    /// Build an in-dialog UPDATE keepalive
    pub fn update(
        &self,
        number: &str,
        call_id: &str,
        from_tag: &str,
        to_tag: &str,
        cseq: u32,
    ) -> Request {
        let uri = self.remote_uri(number);
        let mut headers =
            self.base_headers(&Method::Update, &uri, call_id, from_tag, Some(to_tag), cseq);
        headers.push("Content-Length", "0");
        Request {
            method: Method::Update,
            uri,
            headers,
            body: String::new(),
        }
    }

    /// A fresh Call-ID scoped to this host
    pub fn generate_call_id(&self) -> String {
        format!("{}@{}", random_hex(16), self.local_ip)
    }
}

/// Insert credentials into a built request at the slot after CSeq.
///
/// `name` is `Authorization` for a 401 retry and `Proxy-Authorization`
/// for a 407 retry.
pub fn insert_authorization(request: &mut Request, name: &str, value: &str) {
    request.headers.insert_at(AUTH_SLOT, name, value);
}

/// Respond to a received request, echoing the headers that identify the
/// transaction (Via, From, To, Call-ID, CSeq).
pub fn respond(request: &Request, status_code: u16, reason: &str) -> Response {
    let mut headers = Headers::new();
    for name in ["Via", "From", "To", "Call-ID", "CSeq"] {
        if let Some(value) = request.headers.get(name) {
            headers.push(name, value);
        }
    }
    headers.push("Content-Length", "0");
    Response {
        status_code,
        reason: reason.to_string(),
        headers,
        body: String::new(),
    }
}

/// 200 OK for a received request
pub fn respond_ok(request: &Request) -> Response {
    respond(request, 200, "OK")
}

/// A fresh Via branch with the RFC 3261 magic cookie
pub fn generate_branch() -> String {
    format!("z9hG4bK{}", random_hex(16))
}

/// A fresh From/To tag
pub fn generate_tag() -> String {
    random_hex(8)
}

fn random_hex(bytes: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..bytes).map(|_| format!("{:02x}", rng.gen::<u8>())).collect()
}
