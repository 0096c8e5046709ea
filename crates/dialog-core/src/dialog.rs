//! Per-dialog finite state machine
//!
//! One outbound INVITE dialog moves through
//! `Calling -> Proceeding -> Ringing/EarlyMedia -> Answered -> Terminated`.
//! All response handling funnels through a single transition function
//! that returns what the engine should do next, so the state table is
//! testable without a socket.

use std::time::Instant;

use dialcast_sip_core::message::Response;
use tracing::debug;

/// Dialog lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialogState {
    /// INVITE sent, nothing heard yet
    Calling,
    /// 100 Trying received
    Proceeding,
    /// 180 received, far end is ringing
    Ringing,
    /// 183 received, early media flowing
    EarlyMedia,
    /// 200 received and ACKed
    Answered,
    Terminated,
}

/// What the engine must do after feeding a response to the FSM
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DialogTransition {
    /// Nothing; retransmission or stray response
    None,
    Trying,
    Ringing,
    EarlyMedia,
    /// 200 arrived: ACK, start media toward the answered SDP
    Answer { to_tag: String, sdp: String },
    /// 401/407: retry the INVITE once with credentials
    Challenge {
        header: String,
        /// True for 407 (Proxy-Authenticate)
        proxy: bool,
    },
    /// Terminal failure; tear the dialog down
    Failed { code: u16, reason: String },
}

/// State for one outbound call attempt, owned solely by its engine
#[derive(Debug)]
pub struct Dialog {
    pub call_id: String,
    pub number: String,
    pub from_tag: String,
    pub to_tag: Option<String>,
    pub cseq: u32,
    pub state: DialogState,
    pub started_at: Instant,
    pub answered_at: Option<Instant>,
}

impl Dialog {
    pub fn new(call_id: String, number: String, from_tag: String, cseq: u32) -> Self {
        Self {
            call_id,
            number,
            from_tag,
            to_tag: None,
            cseq,
            state: DialogState::Calling,
            started_at: Instant::now(),
            answered_at: None,
        }
    }

    fn pre_answer(&self) -> bool {
        matches!(
            self.state,
            DialogState::Calling
                | DialogState::Proceeding
                | DialogState::Ringing
                | DialogState::EarlyMedia
        )
    }

    /// Feed one response for this dialog's Call-ID through the state
    /// table.
    pub fn handle_response(&mut self, response: &Response) -> DialogTransition {
        let code = response.status_code;
        debug!(
            "dialog {} in {:?} got {} {}",
            self.call_id, self.state, code, response.reason
        );

        match (self.state, code) {
            (_, 100) if self.pre_answer() => {
                self.state = DialogState::Proceeding;
                DialogTransition::Trying
            }
            (_, 180) if self.pre_answer() => {
                self.state = DialogState::Ringing;
                DialogTransition::Ringing
            }
            (_, 183) if self.pre_answer() => {
                self.state = DialogState::EarlyMedia;
                DialogTransition::EarlyMedia
            }
            (_, 200..=299) if self.pre_answer() => {
                let to_tag = response.to_tag().unwrap_or_default().to_string();
                self.to_tag = Some(to_tag.clone());
                self.state = DialogState::Answered;
                self.answered_at = Some(Instant::now());
                DialogTransition::Answer {
                    to_tag,
                    sdp: response.body.clone(),
                }
            }
            (_, 401) | (_, 407) if self.pre_answer() => {
                let proxy = code == 407;
                let header_name = if proxy {
                    "Proxy-Authenticate"
                } else {
                    "WWW-Authenticate"
                };
                match response.headers.get(header_name) {
                    Some(header) => DialogTransition::Challenge {
                        header: header.to_string(),
                        proxy,
                    },
                    None => {
                        self.state = DialogState::Terminated;
                        DialogTransition::Failed {
                            code,
                            reason: "challenge without authenticate header".to_string(),
                        }
                    }
                }
            }
            // Redirects are not followed; any 3xx is as terminal as a
            // failure for an announcement dialer
            (_, 300..) if self.pre_answer() => {
                self.state = DialogState::Terminated;
                DialogTransition::Failed {
                    code,
                    reason: response.reason.clone(),
                }
            }
            // Retransmissions and responses after answer/termination
            _ => DialogTransition::None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dialcast_sip_core::message::{Headers, Response};

    fn response(code: u16, reason: &str) -> Response {
        Response {
            status_code: code,
            reason: reason.to_string(),
            headers: Headers::new(),
            body: String::new(),
        }
    }

    fn dialog() -> Dialog {
        Dialog::new(
            "cid-1".to_string(),
            "998887766".to_string(),
            "ft".to_string(),
            1,
        )
    }

    #[test]
    fn test_happy_path_to_answer() {
        let mut d = dialog();
        assert_eq!(d.handle_response(&response(100, "Trying")), DialogTransition::Trying);
        assert_eq!(d.state, DialogState::Proceeding);
        assert_eq!(d.handle_response(&response(180, "Ringing")), DialogTransition::Ringing);
        assert_eq!(d.state, DialogState::Ringing);

        let mut ok = response(200, "OK");
        ok.headers.push("To", "<sip:998887766@pbx.local>;tag=remote9");
        ok.body = "v=0\r\n".to_string();
        let transition = d.handle_response(&ok);
        assert_eq!(
            transition,
            DialogTransition::Answer {
                to_tag: "remote9".to_string(),
                sdp: "v=0\r\n".to_string()
            }
        );
        assert_eq!(d.state, DialogState::Answered);
        assert_eq!(d.to_tag.as_deref(), Some("remote9"));
        assert!(d.answered_at.is_some());
    }

    #[test]
    fn test_answer_without_provisional_responses() {
        // Some PBXes answer instantly without 100/180
        let mut d = dialog();
        let mut ok = response(200, "OK");
        ok.headers.push("To", "<sip:x@y>;tag=t");
        assert!(matches!(d.handle_response(&ok), DialogTransition::Answer { .. }));
    }

    #[test]
    fn test_early_media() {
        let mut d = dialog();
        assert_eq!(
            d.handle_response(&response(183, "Session Progress")),
            DialogTransition::EarlyMedia
        );
        assert_eq!(d.state, DialogState::EarlyMedia);
    }

    #[test]
    fn test_failure_terminates() {
        let mut d = dialog();
        d.handle_response(&response(180, "Ringing"));
        assert_eq!(
            d.handle_response(&response(486, "Busy Here")),
            DialogTransition::Failed {
                code: 486,
                reason: "Busy Here".to_string()
            }
        );
        assert_eq!(d.state, DialogState::Terminated);

        // Anything after termination is a no-op
        assert_eq!(d.handle_response(&response(200, "OK")), DialogTransition::None);
    }

    #[test]
    fn test_challenge_401_vs_407_header() {
        let mut d = dialog();
        let mut ch = response(401, "Unauthorized");
        ch.headers.push("WWW-Authenticate", "Digest realm=\"pbx\", nonce=\"n1\"");
        assert_eq!(
            d.handle_response(&ch),
            DialogTransition::Challenge {
                header: "Digest realm=\"pbx\", nonce=\"n1\"".to_string(),
                proxy: false
            }
        );
        // Still pre-answer; the engine retries within the same FSM
        assert_eq!(d.state, DialogState::Calling);

        let mut d = dialog();
        let mut ch = response(407, "Proxy Authentication Required");
        ch.headers.push("Proxy-Authenticate", "Digest realm=\"pbx\", nonce=\"n2\"");
        assert!(matches!(
            d.handle_response(&ch),
            DialogTransition::Challenge { proxy: true, .. }
        ));
    }

    #[test]
    fn test_challenge_missing_header_fails() {
        let mut d = dialog();
        assert!(matches!(
            d.handle_response(&response(401, "Unauthorized")),
            DialogTransition::Failed { code: 401, .. }
        ));
        assert_eq!(d.state, DialogState::Terminated);
    }

    #[test]
    fn test_retransmitted_200_after_answer_is_ignored() {
        let mut d = dialog();
        let mut ok = response(200, "OK");
        ok.headers.push("To", "<sip:x@y>;tag=t");
        d.handle_response(&ok);
        assert_eq!(d.handle_response(&ok), DialogTransition::None);
    }
}
