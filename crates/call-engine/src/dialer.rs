//! Per-recipient dialing orchestration
//!
//! `dial` runs one recipient end to end: place the call, and once it
//! answers, stream the announcement while the limiter's timers and the
//! confirmation pipeline watch it. Every way a call can end funnels
//! into one teardown at the bottom of the loop, so a confirmed call, a
//! timed-out call and a remote hangup all release their resources the
//! same way exactly once. Recipients are dialed one at a time per
//! backend; the broadcast queue serializes above this.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use dialcast_dialog_core::{CallOptions, CallOutcome, SipEngine, SipEvent};
use dialcast_rtp_core::session::{SessionStats, StreamConfig};

use crate::audio::playback_duration;
use crate::confirm::{Confirmation, ConfirmationPipeline};
use crate::limiter::{CallLimiter, CallStats, LimiterConfig, TeardownReason, TeardownRequest};
use crate::Result;

#[derive(Debug, Clone, Default)]
pub struct DialerConfig {
    pub limiter: LimiterConfig,
    pub stream: StreamConfig,
}

/// How one recipient's call resolved
#[derive(Debug, Clone)]
pub enum DialOutcome {
    Confirmed(Confirmation),
    /// Answered but never confirmed
    Unconfirmed(TeardownReason),
    /// Rang out without answer
    NoAnswer,
    /// Rejected before answer
    Failed { code: u16, reason: String },
}

/// Everything recorded about one dialed recipient
#[derive(Debug, Clone)]
pub struct CallReport {
    pub number: String,
    pub call_id: Option<String>,
    pub answered_after: Option<Duration>,
    pub outcome: DialOutcome,
    pub stats: Option<SessionStats>,
    /// Ring and talk durations from the limiter, for answered calls
    pub timing: Option<CallStats>,
}

impl CallReport {
    fn unanswered(number: &str, outcome: DialOutcome) -> Self {
        Self {
            number: number.to_string(),
            call_id: None,
            answered_after: None,
            outcome,
            stats: None,
            timing: None,
        }
    }
}

/// Dials recipients one at a time over a single engine
pub struct BroadcastDialer {
    engine: Arc<SipEngine>,
    events: mpsc::UnboundedReceiver<SipEvent>,
    limiter: Arc<CallLimiter>,
    teardown_rx: mpsc::UnboundedReceiver<TeardownRequest>,
    pipeline: Arc<ConfirmationPipeline>,
    config: DialerConfig,
}

impl BroadcastDialer {
    /// Wire a dialer onto an engine and its event stream. The returned
    /// receiver carries every confirmation for the broadcast layer.
    pub fn new(
        engine: Arc<SipEngine>,
        events: mpsc::UnboundedReceiver<SipEvent>,
        config: DialerConfig,
    ) -> (Self, mpsc::UnboundedReceiver<Confirmation>) {
        let (limiter, teardown_rx) = CallLimiter::new(config.limiter.clone());
        let (pipeline, confirmations) = ConfirmationPipeline::new();
        (
            Self {
                engine,
                events,
                limiter,
                teardown_rx,
                pipeline: Arc::new(pipeline),
                config,
            },
            confirmations,
        )
    }

    /// A handle to the confirmation gate. Cloneable and usable from
    /// another task while a `dial` is in flight, which is how the
    /// manual override reaches a live call.
    pub fn pipeline(&self) -> Arc<ConfirmationPipeline> {
        self.pipeline.clone()
    }

    /// Call one recipient, stream `audio`, and wait for the call to end
    pub async fn dial(&mut self, number: &str, audio: Bytes) -> Result<CallReport> {
        let message_duration = self.config.stream.preroll
            + playback_duration(audio.len(), self.config.stream.repeat);
        let options = CallOptions {
            audio,
            stream: self.config.stream.clone(),
        };

        let (call_id, answered_after) = match self.engine.place_call(number, options).await? {
            CallOutcome::Connected {
                call_id,
                answered_after,
            } => (call_id, answered_after),
            CallOutcome::Timeout => {
                return Ok(CallReport::unanswered(number, DialOutcome::NoAnswer))
            }
            CallOutcome::Failed { code, reason } => {
                return Ok(CallReport::unanswered(
                    number,
                    DialOutcome::Failed { code, reason },
                ))
            }
        };

        self.limiter
            .track_answered(&call_id, number, answered_after);
        self.pipeline.watch(&call_id, number, message_duration);

        let mut confirmation = None;
        let reason = loop {
            tokio::select! {
                event = self.events.recv() => {
                    let Some(event) = event else {
                        warn!("engine event stream closed while call {} live", call_id);
                        break TeardownReason::RemoteHangup;
                    };
                    match event {
                        SipEvent::Dtmf { call_id: id, digit, method } if id == call_id => {
                            if let Some(c) = self.pipeline.observe(&call_id, digit, method) {
                                self.limiter.on_confirmed(&call_id);
                                confirmation = Some(c);
                            }
                        }
                        SipEvent::RemoteHangup { call_id: id } if id == call_id => {
                            break TeardownReason::RemoteHangup;
                        }
                        other => debug!("event during call {}: {:?}", call_id, other),
                    }
                }
                request = self.teardown_rx.recv() => {
                    let Some(request) = request else {
                        break TeardownReason::RemoteHangup;
                    };
                    if request.call_id != call_id {
                        continue;
                    }
                    // Last-resort detector before giving up on the call
                    if request.reason == TeardownReason::DurationLimit {
                        if let Some(c) = self.pipeline.check_duration(&call_id) {
                            confirmation = Some(c);
                        }
                    }
                    break request.reason;
                }
            }
        };

        let stats = if reason == TeardownReason::RemoteHangup {
            // The engine already tore its side down; its CallEnded event
            // carries the final counters
            self.ended_stats(&call_id).await
        } else {
            self.engine.hangup(&call_id).await.ok()
        };
        let timing = self.limiter.teardown(&call_id, reason);
        // A manual override confirms through the pipeline handle, not
        // through our event loop
        let confirmation = confirmation.or_else(|| self.pipeline.confirmation_of(&call_id));
        self.pipeline.unwatch(&call_id);

        let outcome = match confirmation {
            Some(c) => DialOutcome::Confirmed(c),
            None => DialOutcome::Unconfirmed(reason),
        };
        Ok(CallReport {
            number: number.to_string(),
            call_id: Some(call_id),
            answered_after: Some(answered_after),
            outcome,
            stats,
            timing,
        })
    }

    /// Pull the CallEnded stats that follow a remote hangup, if they
    /// arrive promptly
    async fn ended_stats(&mut self, call_id: &str) -> Option<SessionStats> {
        let deadline = tokio::time::Instant::now() + Duration::from_millis(200);
        loop {
            let event = tokio::time::timeout_at(deadline, self.events.recv())
                .await
                .ok()??;
            if let SipEvent::CallEnded {
                call_id: id, stats, ..
            } = event
            {
                if id == call_id {
                    return stats;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dialcast_dialog_core::{DtmfMethod, SipConfig};
    use dialcast_rtp_core::dtmf::TelephoneEvent;
    use dialcast_rtp_core::packet::{RtpHeader, RtpPacket};
    use dialcast_rtp_core::port::PortAllocator;
    use dialcast_sip_core::builder::respond;
    use dialcast_sip_core::message::{Headers, Method, Request, SipMessage};
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};
    use tokio::net::UdpSocket;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(5);

    fn localhost() -> IpAddr {
        IpAddr::V4(Ipv4Addr::LOCALHOST)
    }

    async fn recv_request(server: &UdpSocket) -> (Request, SocketAddr) {
        let mut buf = vec![0u8; 65535];
        loop {
            let (len, from) = timeout(WAIT, server.recv_from(&mut buf))
                .await
                .unwrap()
                .unwrap();
            match SipMessage::parse(&buf[..len]).unwrap() {
                SipMessage::Request(req) => return (req, from),
                // BYE 200s and the like
                SipMessage::Response(_) => continue,
            }
        }
    }

    fn offered_rtp_port(invite: &Request) -> u16 {
        invite
            .body
            .lines()
            .find_map(|line| line.strip_prefix("m=audio "))
            .and_then(|rest| rest.split_whitespace().next())
            .and_then(|p| p.parse().ok())
            .expect("INVITE offer carries an audio port")
    }

    async fn dialer_pair(
        server: &UdpSocket,
        limiter: LimiterConfig,
    ) -> (BroadcastDialer, mpsc::UnboundedReceiver<Confirmation>) {
        let config = SipConfig {
            server: localhost(),
            server_port: server.local_addr().unwrap().port(),
            username: "100".to_string(),
            password: "secret".to_string(),
            domain: "pbx.local".to_string(),
            local_ip: localhost(),
            local_port: 0,
            ..SipConfig::default()
        };
        let (engine, events) = SipEngine::bind(config, PortAllocator::new()).await.unwrap();
        let dialer_config = DialerConfig {
            limiter,
            stream: StreamConfig {
                preroll: Duration::ZERO,
                repeat: 1,
                ..StreamConfig::default()
            },
        };
        BroadcastDialer::new(engine, events, dialer_config)
    }

    fn answer_with_sdp(invite: &Request, media_port: u16) -> dialcast_sip_core::message::Response {
        let mut ok = respond(invite, 200, "OK");
        let to = format!("{};tag=pbx1", invite.headers.get("To").unwrap());
        let mut headers = Headers::new();
        for (name, value) in ok.headers.iter() {
            if name == "To" {
                headers.push("To", to.clone());
            } else {
                headers.push(name, value);
            }
        }
        ok.headers = headers;
        ok.body = format!(
            "v=0\r\nc=IN IP4 127.0.0.1\r\nm=audio {} RTP/AVP 8 101\r\n\
             a=rtpmap:101 telephone-event/8000\r\n",
            media_port
        );
        ok
    }

    #[tokio::test]
    async fn test_dial_confirmed_by_rfc2833() {
        let server = UdpSocket::bind((localhost(), 0)).await.unwrap();
        let (mut dialer, mut confirmations) = dialer_pair(
            &server,
            LimiterConfig {
                confirm_end_delay: Duration::from_millis(100),
                ..LimiterConfig::default()
            },
        )
        .await;

        let pbx = async {
            let (invite, from) = recv_request(&server).await;
            assert_eq!(invite.method, Method::Invite);
            let rtp_port = offered_rtp_port(&invite);

            let media = UdpSocket::bind((localhost(), 0)).await.unwrap();
            let answer = answer_with_sdp(&invite, media.local_addr().unwrap().port());
            server
                .send_to(answer.to_string().as_bytes(), from)
                .await
                .unwrap();

            let (ack, _) = recv_request(&server).await;
            assert_eq!(ack.method, Method::Ack);

            // Callee presses 1: end-of-event packet, retransmitted
            let press = RtpPacket {
                header: RtpHeader::new(101, 500, 16000, 0xC0FFEE),
                payload: TelephoneEvent {
                    event: 1,
                    end: true,
                    volume: 10,
                    duration: 800,
                }
                .serialize(),
            };
            let target = SocketAddr::new(localhost(), rtp_port);
            for _ in 0..3 {
                media.send_to(&press.serialize(), target).await.unwrap();
                tokio::time::sleep(Duration::from_millis(20)).await;
            }

            // Confirmation grace period ends with our BYE
            let (bye, from) = recv_request(&server).await;
            assert_eq!(bye.method, Method::Bye);
            server
                .send_to(respond(&bye, 200, "OK").to_string().as_bytes(), from)
                .await
                .unwrap();
        };

        let audio = Bytes::from(vec![0x2Au8; 160 * 50]);
        let (report, _) = tokio::join!(
            async {
                timeout(WAIT, dialer.dial("998887766", audio))
                    .await
                    .unwrap()
                    .unwrap()
            },
            pbx
        );

        let DialOutcome::Confirmed(confirmation) = &report.outcome else {
            panic!("expected confirmation, got {:?}", report.outcome);
        };
        assert_eq!(confirmation.digit, '1');
        assert_eq!(confirmation.method, DtmfMethod::Rfc2833);
        assert_eq!(confirmation.number, "998887766");
        // Redelivered end packets collapsed to one observation
        assert_eq!(report.stats.unwrap().dtmf_observed, 1);

        let timing = report.timing.unwrap();
        assert_eq!(timing.reason, TeardownReason::Confirmed);
        assert!(timing.talk_duration.is_some());

        let broadcast_copy = timeout(WAIT, confirmations.recv()).await.unwrap().unwrap();
        assert_eq!(broadcast_copy.call_id, report.call_id.unwrap());
    }

    #[tokio::test]
    async fn test_manual_confirmation_reaches_live_call() {
        let server = UdpSocket::bind((localhost(), 0)).await.unwrap();
        let (mut dialer, mut confirmations) = dialer_pair(
            &server,
            LimiterConfig {
                max_call_duration: Duration::from_millis(400),
                ..LimiterConfig::default()
            },
        )
        .await;
        let pipeline = dialer.pipeline();

        let pbx = async move {
            let (invite, from) = recv_request(&server).await;
            let answer = answer_with_sdp(&invite, 40002);
            server
                .send_to(answer.to_string().as_bytes(), from)
                .await
                .unwrap();
            let (ack, _) = recv_request(&server).await;
            assert_eq!(ack.method, Method::Ack);

            // Operator confirms from another task mid-call
            tokio::time::sleep(Duration::from_millis(100)).await;
            let c = pipeline.confirm_manually("998887766").unwrap();
            assert_eq!(c.method, DtmfMethod::Manual);

            let (bye, from) = recv_request(&server).await;
            assert_eq!(bye.method, Method::Bye);
            server
                .send_to(respond(&bye, 200, "OK").to_string().as_bytes(), from)
                .await
                .unwrap();
        };

        let (report, _) = tokio::join!(
            async {
                timeout(WAIT, dialer.dial("998887766", Bytes::from(vec![0x2Au8; 160])))
                    .await
                    .unwrap()
                    .unwrap()
            },
            pbx
        );

        let DialOutcome::Confirmed(confirmation) = &report.outcome else {
            panic!("expected manual confirmation, got {:?}", report.outcome);
        };
        assert_eq!(confirmation.method, DtmfMethod::Manual);
        assert_eq!(confirmation.number, "998887766");
        assert_eq!(
            timeout(WAIT, confirmations.recv()).await.unwrap().unwrap(),
            *confirmation
        );
    }

    #[tokio::test]
    async fn test_dial_busy_reports_failure() {
        let server = UdpSocket::bind((localhost(), 0)).await.unwrap();
        let (mut dialer, _confirmations) =
            dialer_pair(&server, LimiterConfig::default()).await;

        let pbx = async {
            let (invite, from) = recv_request(&server).await;
            server
                .send_to(
                    respond(&invite, 486, "Busy Here").to_string().as_bytes(),
                    from,
                )
                .await
                .unwrap();
            let (ack, _) = recv_request(&server).await;
            assert_eq!(ack.method, Method::Ack);
        };

        let (report, _) = tokio::join!(
            async {
                timeout(WAIT, dialer.dial("998887766", Bytes::from(vec![0x2Au8; 160])))
                    .await
                    .unwrap()
                    .unwrap()
            },
            pbx
        );
        assert!(matches!(
            report.outcome,
            DialOutcome::Failed { code: 486, .. }
        ));
        assert!(report.call_id.is_none());
        assert!(report.stats.is_none());
    }

    #[tokio::test]
    async fn test_dial_remote_hangup_unconfirmed() {
        let server = UdpSocket::bind((localhost(), 0)).await.unwrap();
        let (mut dialer, _confirmations) =
            dialer_pair(&server, LimiterConfig::default()).await;

        let pbx = async {
            let (invite, from) = recv_request(&server).await;
            let answer = answer_with_sdp(&invite, 40000);
            server
                .send_to(answer.to_string().as_bytes(), from)
                .await
                .unwrap();
            let (ack, engine_addr) = recv_request(&server).await;
            assert_eq!(ack.method, Method::Ack);

            // Callee hangs up without pressing anything
            let mut headers = Headers::new();
            headers.push("Via", "SIP/2.0/UDP 127.0.0.1:5060;branch=z9hG4bKbye");
            headers.push(
                "From",
                format!("{};tag=pbx1", invite.headers.get("To").unwrap()),
            );
            headers.push("To", invite.headers.get("From").unwrap());
            headers.push("Call-ID", invite.call_id().unwrap());
            headers.push("CSeq", "1 BYE");
            headers.push("Content-Length", "0");
            let bye = Request {
                method: Method::Bye,
                uri: "sip:100@pbx.local".to_string(),
                headers,
                body: String::new(),
            };
            server
                .send_to(bye.to_string().as_bytes(), engine_addr)
                .await
                .unwrap();
        };

        let (report, _) = tokio::join!(
            async {
                timeout(WAIT, dialer.dial("998887766", Bytes::from(vec![0x2Au8; 160])))
                    .await
                    .unwrap()
                    .unwrap()
            },
            pbx
        );
        assert!(matches!(
            report.outcome,
            DialOutcome::Unconfirmed(TeardownReason::RemoteHangup)
        ));
        assert!(report.answered_after.is_some());
        assert_eq!(
            report.timing.unwrap().reason,
            TeardownReason::RemoteHangup
        );
    }
}
