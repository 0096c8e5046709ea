//! The SIP transaction engine
//!
//! One engine per SIP identity. It owns the signaling socket and a
//! Call-ID keyed dispatch table: the receive loop parses each datagram
//! and either routes a response to the in-flight transaction waiting on
//! it, or answers the request itself (the engine is a minimal UAS:
//! OPTIONS and NOTIFY get 200, BYE tears the owning call down, inbound
//! INVITEs get 486, INFO is mined for DTMF). Outbound calls are driven
//! by `place_call`, which walks the dialog FSM response by response.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use dialcast_rtp_core::port::{PortAllocator, PortRange};
use dialcast_rtp_core::session::{RtpSession, SessionStats, StreamConfig};
use dialcast_sip_core::auth::{DigestChallenge, DigestCredentials};
use dialcast_sip_core::builder::{self, SipIdentity};
use dialcast_sip_core::message::{Headers, Method, Request, Response, SipMessage};
use dialcast_sip_core::sdp::{SdpAnswer, SdpOffer};

use crate::dialog::{Dialog, DialogTransition};
use crate::events::{DtmfMethod, SipEvent};
use crate::{Error, Result};

/// How long an INVITE may ring before we CANCEL it
const INVITE_TIMEOUT: Duration = Duration::from_secs(30);

/// How long a REGISTER exchange may take
const REGISTER_TIMEOUT: Duration = Duration::from_secs(10);

/// Re-register this long before the granted expiry
const REREGISTER_MARGIN: u32 = 60;

/// Answered calls idle longer than this get an UPDATE keepalive
const KEEPALIVE_IDLE: Duration = Duration::from_secs(25);

/// Keepalive sweep period
const KEEPALIVE_SWEEP: Duration = Duration::from_secs(10);

/// Configuration for one engine instance
#[derive(Debug, Clone)]
pub struct SipConfig {
    /// PBX signaling address
    pub server: IpAddr,
    pub server_port: u16,
    pub username: String,
    pub password: String,
    pub domain: String,
    /// Local address to bind and to advertise in Via/Contact/SDP
    pub local_ip: IpAddr,
    /// 0 picks an ephemeral port
    pub local_port: u16,
    pub user_agent: String,
    /// Registration lifetime to request, seconds
    pub expires: u32,
    /// Selects this instance's RTP port slice
    pub instance_index: u16,
}

impl Default for SipConfig {
    fn default() -> Self {
        Self {
            server: IpAddr::V4(Ipv4Addr::LOCALHOST),
            server_port: 5060,
            username: String::new(),
            password: String::new(),
            domain: String::new(),
            local_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            local_port: 5060,
            user_agent: "dialcast/0.1".to_string(),
            expires: 300,
            instance_index: 0,
        }
    }
}

impl SipConfig {
    fn server_addr(&self) -> SocketAddr {
        SocketAddr::new(self.server, self.server_port)
    }
}

/// Per-call media parameters for `place_call`
#[derive(Debug, Clone)]
pub struct CallOptions {
    /// Announcement audio, raw A-law at 8 kHz
    pub audio: Bytes,
    pub stream: StreamConfig,
}

/// How a call attempt resolved
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallOutcome {
    /// Answered and streaming; ended later via `hangup` or remote BYE
    Connected {
        call_id: String,
        answered_after: Duration,
    },
    /// Terminal failure response or local media failure
    Failed { code: u16, reason: String },
    /// No answer within the INVITE window; CANCEL sent
    Timeout,
}

/// An answered dialog with live media
struct ActiveCall {
    number: String,
    from_tag: String,
    to_tag: String,
    session: Arc<RtpSession>,
    last_keepalive: Instant,
}

/// SIP transaction engine for one identity
pub struct SipEngine {
    config: SipConfig,
    identity: SipIdentity,
    credentials: DigestCredentials,
    socket: Arc<UdpSocket>,
    allocator: PortAllocator,
    port_range: PortRange,
    cseq: AtomicU32,
    /// In-flight transactions by Call-ID; entries removed on the first
    /// final non-challenge response
    handlers: Mutex<HashMap<String, mpsc::UnboundedSender<Response>>>,
    /// Answered dialogs by Call-ID
    calls: Mutex<HashMap<String, ActiveCall>>,
    events: mpsc::UnboundedSender<SipEvent>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SipEngine {
    /// Bind the signaling socket and start the receive and keepalive
    /// loops. A bind failure here is fatal for the instance.
    pub async fn bind(
        config: SipConfig,
        allocator: PortAllocator,
    ) -> Result<(Arc<Self>, mpsc::UnboundedReceiver<SipEvent>)> {
        let socket = UdpSocket::bind(SocketAddr::new(config.local_ip, config.local_port)).await?;
        let local_port = socket.local_addr()?.port();
        info!(
            "SIP engine for {}@{} bound on {}:{}",
            config.username, config.domain, config.local_ip, local_port
        );

        let identity = SipIdentity {
            username: config.username.clone(),
            domain: config.domain.clone(),
            local_ip: config.local_ip,
            local_port,
            user_agent: config.user_agent.clone(),
        };
        let credentials = DigestCredentials {
            username: config.username.clone(),
            password: config.password.clone(),
        };
        let port_range = PortRange::for_instance(config.instance_index);
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let engine = Arc::new(Self {
            identity,
            credentials,
            socket: Arc::new(socket),
            allocator,
            port_range,
            cseq: AtomicU32::new(1),
            handlers: Mutex::new(HashMap::new()),
            calls: Mutex::new(HashMap::new()),
            events: events_tx,
            tasks: Mutex::new(Vec::new()),
            config,
        });

        let recv = tokio::spawn(recv_loop(engine.clone()));
        let keepalive = tokio::spawn(keepalive_loop(engine.clone()));
        engine.tasks.lock().extend([recv, keepalive]);

        Ok((engine, events_rx))
    }

    /// REGISTER against the PBX, answering at most one digest challenge.
    /// Returns the granted expiry.
    pub async fn register(&self) -> Result<u32> {
        let call_id = self.identity.generate_call_id();
        let rx = self.add_handler(&call_id);
        let result = self.register_exchange(&call_id, rx).await;
        self.remove_handler(&call_id);
        if let Ok(expires) = &result {
            info!("registered {}@{} for {}s", self.config.username, self.config.domain, expires);
            self.emit(SipEvent::Registered { expires: *expires });
        }
        result
    }

    async fn register_exchange(
        &self,
        call_id: &str,
        mut rx: mpsc::UnboundedReceiver<Response>,
    ) -> Result<u32> {
        let from_tag = builder::generate_tag();
        let request = self.identity.register(
            call_id,
            &from_tag,
            self.next_cseq(),
            self.config.expires,
            None,
        );
        self.send(&request).await?;

        let mut challenged = false;
        loop {
            let response = tokio::time::timeout(REGISTER_TIMEOUT, rx.recv())
                .await
                .map_err(|_| Error::RegistrationFailed("no response from server".to_string()))?
                .ok_or(Error::EngineStopped)?;

            match response.status_code {
                200..=299 => {
                    return Ok(response.expires().unwrap_or(self.config.expires));
                }
                401 | 407 => {
                    if challenged {
                        return Err(Error::AuthenticationFailed(
                            "server re-challenged authenticated REGISTER".to_string(),
                        ));
                    }
                    challenged = true;

                    let uri = format!("sip:{}", self.config.domain);
                    let (name, value) = self.answer_challenge(&response, "REGISTER", &uri)?;
                    let mut retry = self.identity.register(
                        call_id,
                        &from_tag,
                        self.next_cseq(),
                        self.config.expires,
                        None,
                    );
                    builder::insert_authorization(&mut retry, name, &value);
                    self.send(&retry).await?;
                }
                code => {
                    return Err(Error::RegistrationFailed(format!(
                        "{} {}",
                        code, response.reason
                    )));
                }
            }
        }
    }

    /// Keep the registration alive: register now, then again 60 s before
    /// each expiry. A failed attempt emits `RegistrationFailed` and is
    /// retried; in-flight calls are unaffected.
    pub fn start_registration(self: &Arc<Self>) {
        let engine = self.clone();
        let handle = tokio::spawn(async move {
            loop {
                match engine.register().await {
                    Ok(expires) => {
                        let renew = expires.saturating_sub(REREGISTER_MARGIN).max(30);
                        debug!("re-registering in {}s", renew);
                        tokio::time::sleep(Duration::from_secs(renew as u64)).await;
                    }
                    Err(e) => {
                        warn!("registration failed: {}", e);
                        engine.emit(SipEvent::RegistrationFailed {
                            reason: e.to_string(),
                        });
                        tokio::time::sleep(Duration::from_secs(30)).await;
                    }
                }
            }
        });
        self.tasks.lock().push(handle);
    }

    /// Call `number` and, when answered, stream the announcement audio
    /// to the far end while watching for DTMF.
    ///
    /// Resolves when the call is answered, fails, or rings out; an
    /// answered call keeps running until `hangup` or a remote BYE.
    pub async fn place_call(&self, number: &str, options: CallOptions) -> Result<CallOutcome> {
        let call_id = self.identity.generate_call_id();
        let from_tag = builder::generate_tag();
        let mut dialog = Dialog::new(
            call_id.clone(),
            number.to_string(),
            from_tag.clone(),
            self.next_cseq(),
        );

        // Media socket first so the offer can carry its port
        let session = Arc::new(
            RtpSession::bind(
                &self.allocator,
                self.port_range,
                &call_id,
                self.config.local_ip,
                |owner| {
                    self.handlers.lock().contains_key(owner)
                        || self.calls.lock().contains_key(owner)
                },
            )
            .await?,
        );
        let sdp = SdpOffer::audio(self.config.local_ip, session.local_port()?).render();

        let rx = self.add_handler(&call_id);
        let outcome = self
            .drive_invite(&mut dialog, &session, &sdp, options, rx)
            .await;
        self.remove_handler(&call_id);

        match &outcome {
            Ok(CallOutcome::Connected { .. }) => {}
            _ => session.close(),
        }
        outcome
    }

    async fn drive_invite(
        &self,
        dialog: &mut Dialog,
        session: &Arc<RtpSession>,
        sdp: &str,
        options: CallOptions,
        mut rx: mpsc::UnboundedReceiver<Response>,
    ) -> Result<CallOutcome> {
        let number = dialog.number.clone();
        let call_id = dialog.call_id.clone();

        let invite =
            self.identity
                .invite(&number, &call_id, &dialog.from_tag, dialog.cseq, sdp, None);
        let mut invite_branch = via_branch(&invite).unwrap_or_default().to_string();
        self.send(&invite).await?;

        let deadline = tokio::time::Instant::now() + INVITE_TIMEOUT;
        let mut challenged = false;

        loop {
            let response = match tokio::time::timeout_at(deadline, rx.recv()).await {
                Err(_) => {
                    info!("call {} rang out, cancelling", call_id);
                    let cancel = self.identity.cancel(
                        &number,
                        &call_id,
                        &dialog.from_tag,
                        &invite_branch,
                        dialog.cseq,
                    );
                    if let Err(e) = self.send(&cancel).await {
                        warn!("CANCEL send failed for {}: {}", call_id, e);
                    }
                    return Ok(CallOutcome::Timeout);
                }
                Ok(None) => return Err(Error::EngineStopped),
                Ok(Some(r)) => r,
            };

            // CANCEL and stray non-INVITE responses share the Call-ID
            if let Some((_, method)) = response.cseq() {
                if method != Method::Invite {
                    continue;
                }
            }

            match dialog.handle_response(&response) {
                DialogTransition::None => {}
                DialogTransition::Trying => self.emit(SipEvent::Trying {
                    call_id: call_id.clone(),
                }),
                DialogTransition::Ringing => self.emit(SipEvent::Ringing {
                    call_id: call_id.clone(),
                }),
                DialogTransition::EarlyMedia => self.emit(SipEvent::EarlyMedia {
                    call_id: call_id.clone(),
                }),
                DialogTransition::Challenge { .. } => {
                    self.ack_non_2xx(&invite_branch, dialog, &response).await;
                    if challenged {
                        return Ok(CallOutcome::Failed {
                            code: response.status_code,
                            reason: "server re-challenged authenticated INVITE".to_string(),
                        });
                    }
                    challenged = true;

                    let uri = format!("sip:{}@{}", number, self.config.domain);
                    let (name, value) = match self.answer_challenge(&response, "INVITE", &uri) {
                        Ok(v) => v,
                        Err(e) => {
                            return Ok(CallOutcome::Failed {
                                code: response.status_code,
                                reason: e.to_string(),
                            })
                        }
                    };
                    dialog.cseq = self.next_cseq();
                    let mut retry = self.identity.invite(
                        &number,
                        &call_id,
                        &dialog.from_tag,
                        dialog.cseq,
                        sdp,
                        None,
                    );
                    builder::insert_authorization(&mut retry, name, &value);
                    invite_branch = via_branch(&retry).unwrap_or_default().to_string();
                    self.send(&retry).await?;
                }
                DialogTransition::Answer {
                    to_tag,
                    sdp: answer_sdp,
                } => {
                    let ack =
                        self.identity
                            .ack(&number, &call_id, &dialog.from_tag, &to_tag, dialog.cseq);
                    if let Err(e) = self.send(&ack).await {
                        warn!("ACK send failed for {}: {}", call_id, e);
                    }

                    let answer = match SdpAnswer::parse(&answer_sdp) {
                        Ok(a) => a,
                        Err(e) => {
                            warn!("call {} answered with unusable SDP: {}", call_id, e);
                            let bye = self.identity.bye(
                                &number,
                                &call_id,
                                &dialog.from_tag,
                                &to_tag,
                                self.next_cseq(),
                            );
                            let _ = self.send(&bye).await;
                            return Ok(CallOutcome::Failed {
                                code: 0,
                                reason: format!("unusable SDP answer: {}", e),
                            });
                        }
                    };

                    let remote = SocketAddr::new(answer.remote_ip, answer.remote_port);
                    let (dtmf_tx, dtmf_rx) = mpsc::unbounded_channel();
                    session.start(remote, options.audio.clone(), options.stream.clone(), dtmf_tx);
                    self.spawn_dtmf_forwarder(call_id.clone(), dtmf_rx);

                    let answered_after = dialog.started_at.elapsed();
                    self.calls.lock().insert(
                        call_id.clone(),
                        ActiveCall {
                            number: number.clone(),
                            from_tag: dialog.from_tag.clone(),
                            to_tag,
                            session: session.clone(),
                            last_keepalive: Instant::now(),
                        },
                    );
                    info!(
                        "call {} to {} answered after {:.1}s, streaming to {}",
                        call_id,
                        number,
                        answered_after.as_secs_f64(),
                        remote
                    );
                    self.emit(SipEvent::Answered {
                        call_id: call_id.clone(),
                        answered_after,
                    });
                    return Ok(CallOutcome::Connected {
                        call_id: call_id.clone(),
                        answered_after,
                    });
                }
                DialogTransition::Failed { code, reason } => {
                    self.ack_non_2xx(&invite_branch, dialog, &response).await;
                    info!("call {} to {} failed: {} {}", call_id, number, code, reason);
                    self.emit(SipEvent::CallFailed {
                        call_id: call_id.clone(),
                        code,
                        reason: reason.clone(),
                    });
                    return Ok(CallOutcome::Failed { code, reason });
                }
            }
        }
    }

    /// Hang up an answered call: BYE, stop media, release the port.
    pub async fn hangup(&self, call_id: &str) -> Result<SessionStats> {
        let call = self
            .calls
            .lock()
            .remove(call_id)
            .ok_or_else(|| Error::UnknownCall(call_id.to_string()))?;

        let bye = self.identity.bye(
            &call.number,
            call_id,
            &call.from_tag,
            &call.to_tag,
            self.next_cseq(),
        );
        if let Err(e) = self.send(&bye).await {
            warn!("BYE send failed for {}: {}", call_id, e);
        }

        let stats = call.session.stats();
        call.session.close();
        info!(
            "call {} ended: {} packets sent ({} silence), {} DTMF observed",
            call_id, stats.packets_sent, stats.silence_packets, stats.dtmf_observed
        );
        self.emit(SipEvent::CallEnded {
            call_id: call_id.to_string(),
            stats: Some(stats),
        });
        Ok(stats)
    }

    /// Whether the engine still tracks `call_id` as answered
    pub fn is_active(&self, call_id: &str) -> bool {
        self.calls.lock().contains_key(call_id)
    }

    /// Abort the background loops and tear down every live call's media
    pub fn shutdown(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        self.handlers.lock().clear();
        for (_, call) in self.calls.lock().drain() {
            call.session.close();
        }
    }

    fn next_cseq(&self) -> u32 {
        self.cseq.fetch_add(1, Ordering::Relaxed)
    }

    fn emit(&self, event: SipEvent) {
        let _ = self.events.send(event);
    }

    fn add_handler(&self, call_id: &str) -> mpsc::UnboundedReceiver<Response> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.handlers.lock().insert(call_id.to_string(), tx);
        rx
    }

    fn remove_handler(&self, call_id: &str) {
        self.handlers.lock().remove(call_id);
    }

    /// Compute the (header name, value) answering a 401/407
    fn answer_challenge(
        &self,
        response: &Response,
        method: &str,
        uri: &str,
    ) -> Result<(&'static str, String)> {
        let proxy = response.status_code == 407;
        let (challenge_header, auth_header) = if proxy {
            ("Proxy-Authenticate", "Proxy-Authorization")
        } else {
            ("WWW-Authenticate", "Authorization")
        };
        let header = response
            .headers
            .get(challenge_header)
            .ok_or(Error::AuthenticationFailed(
                "challenge without authenticate header".to_string(),
            ))?;
        let challenge = DigestChallenge::parse(header)?;
        let value = self.credentials.authorization(method, uri, &challenge);
        Ok((auth_header, value))
    }

    /// ACK a non-2xx final INVITE response (same branch, To as received)
    async fn ack_non_2xx(&self, branch: &str, dialog: &Dialog, response: &Response) {
        let uri = format!("sip:{}@{}", dialog.number, self.config.domain);
        let mut headers = Headers::new();
        headers.push(
            "Via",
            format!(
                "SIP/2.0/UDP {}:{};branch={};rport",
                self.identity.local_ip, self.identity.local_port, branch
            ),
        );
        headers.push(
            "From",
            format!(
                "<sip:{}@{}>;tag={}",
                self.identity.username, self.identity.domain, dialog.from_tag
            ),
        );
        let to = response
            .headers
            .get("To")
            .map(str::to_string)
            .unwrap_or_else(|| format!("<{}>", uri));
        headers.push("To", to);
        headers.push("Call-ID", dialog.call_id.clone());
        headers.push("CSeq", format!("{} ACK", dialog.cseq));
        headers.push("Max-Forwards", "70");
        headers.push("Content-Length", "0");
        let ack = Request {
            method: Method::Ack,
            uri,
            headers,
            body: String::new(),
        };
        if let Err(e) = self.send(&ack).await {
            warn!("ACK send failed for {}: {}", dialog.call_id, e);
        }
    }

    fn spawn_dtmf_forwarder(
        &self,
        call_id: String,
        mut rx: mpsc::UnboundedReceiver<dialcast_rtp_core::session::DtmfObservation>,
    ) {
        let events = self.events.clone();
        let handle = tokio::spawn(async move {
            while let Some(obs) = rx.recv().await {
                let _ = events.send(SipEvent::Dtmf {
                    call_id: call_id.clone(),
                    digit: obs.digit,
                    method: DtmfMethod::Rfc2833,
                });
            }
        });
        self.tasks.lock().push(handle);
    }

    async fn send(&self, message: &impl std::fmt::Display) -> Result<()> {
        let rendered = message.to_string();
        self.socket
            .send_to(rendered.as_bytes(), self.config.server_addr())
            .await?;
        Ok(())
    }

    async fn send_response(&self, response: &Response, to: SocketAddr) {
        if let Err(e) = self.socket.send_to(response.to_string().as_bytes(), to).await {
            warn!("response send to {} failed: {}", to, e);
        }
    }

    fn dispatch_response(&self, response: Response) {
        let Some(call_id) = response.call_id().map(str::to_string) else {
            debug!("dropping response without Call-ID");
            return;
        };
        let terminal = response.status_code >= 200
            && response.status_code != 401
            && response.status_code != 407;

        let mut handlers = self.handlers.lock();
        match handlers.get(&call_id) {
            Some(tx) => {
                let _ = tx.send(response);
                if terminal {
                    handlers.remove(&call_id);
                }
            }
            None => debug!(
                "no transaction waiting on {} response for {}",
                response.status_code, call_id
            ),
        }
    }

    async fn handle_request(&self, request: Request, from: SocketAddr) {
        match request.method {
            Method::Options | Method::Notify => {
                self.send_response(&builder::respond_ok(&request), from).await;
            }
            Method::Invite => {
                // Outbound-only: never accept inbound calls
                self.send_response(&builder::respond(&request, 486, "Busy Here"), from)
                    .await;
            }
            Method::Bye => {
                self.send_response(&builder::respond_ok(&request), from).await;
                let Some(call_id) = request.call_id().map(str::to_string) else {
                    return;
                };
                if let Some(call) = self.calls.lock().remove(&call_id) {
                    info!("remote hangup on call {}", call_id);
                    let stats = call.session.stats();
                    call.session.close();
                    self.emit(SipEvent::RemoteHangup {
                        call_id: call_id.clone(),
                    });
                    self.emit(SipEvent::CallEnded {
                        call_id,
                        stats: Some(stats),
                    });
                }
            }
            Method::Info => {
                let content_type = request.headers.get("Content-Type").unwrap_or("");
                if let Some(digit) = parse_dtmf_info(content_type, &request.body) {
                    if let Some(call_id) = request.call_id() {
                        debug!("DTMF digit {} via INFO on call {}", digit, call_id);
                        self.emit(SipEvent::Dtmf {
                            call_id: call_id.to_string(),
                            digit,
                            method: DtmfMethod::SipInfo,
                        });
                    }
                }
                // 200 regardless of whether the body made sense
                self.send_response(&builder::respond_ok(&request), from).await;
            }
            Method::Ack | Method::Cancel => {}
            _ => {
                self.send_response(&builder::respond(&request, 501, "Not Implemented"), from)
                    .await;
            }
        }
    }
}

/// Extract the branch parameter from a request's topmost Via
fn via_branch(request: &Request) -> Option<&str> {
    let via = request.headers.get("Via")?;
    via.split(';').find_map(|param| {
        let (key, value) = param.split_once('=')?;
        (key.trim() == "branch").then(|| value.trim())
    })
}

/// Pull a digit out of a SIP INFO body.
///
/// Three body formats occur in the wild: `application/dtmf-relay` with
/// `Signal=<digit>` lines, `application/dtmf` carrying the bare digit,
/// and plaintext bodies that are just the digit.
pub fn parse_dtmf_info(content_type: &str, body: &str) -> Option<char> {
    let body = body.trim();
    let candidate = if content_type.starts_with("application/dtmf-relay") {
        body.lines()
            .find_map(|line| line.trim().strip_prefix("Signal="))
            .map(str::trim)
            .and_then(|s| s.chars().next())
    } else {
        body.chars().next()
    };
    candidate.filter(|&c| dialcast_rtp_core::dtmf::digit_to_event(c).is_some())
}

async fn recv_loop(engine: Arc<SipEngine>) {
    let mut buf = vec![0u8; 65535];
    loop {
        let (len, from) = match engine.socket.recv_from(&mut buf).await {
            Ok(v) => v,
            Err(e) => {
                warn!("SIP receive error: {}", e);
                continue;
            }
        };
        match SipMessage::parse(&buf[..len]) {
            Ok(SipMessage::Response(response)) => engine.dispatch_response(response),
            Ok(SipMessage::Request(request)) => engine.handle_request(request, from).await,
            Err(e) => debug!("dropping malformed datagram from {}: {}", from, e),
        }
    }
}

/// Pokes long-lived answered calls with an UPDATE so stateful middleboxes
/// keep the dialog alive.
async fn keepalive_loop(engine: Arc<SipEngine>) {
    let mut ticker = tokio::time::interval(KEEPALIVE_SWEEP);
    loop {
        ticker.tick().await;

        let due: Vec<(String, String, String, String)> = {
            let mut calls = engine.calls.lock();
            calls
                .iter_mut()
                .filter(|(_, call)| call.last_keepalive.elapsed() > KEEPALIVE_IDLE)
                .map(|(id, call)| {
                    call.last_keepalive = Instant::now();
                    (
                        id.clone(),
                        call.number.clone(),
                        call.from_tag.clone(),
                        call.to_tag.clone(),
                    )
                })
                .collect()
        };

        for (call_id, number, from_tag, to_tag) in due {
            debug!("sending UPDATE keepalive for call {}", call_id);
            let update =
                engine
                    .identity
                    .update(&number, &call_id, &from_tag, &to_tag, engine.next_cseq());
            if let Err(e) = engine.send(&update).await {
                warn!("keepalive send failed for {}: {}", call_id, e);
            }
        }
    }
}
