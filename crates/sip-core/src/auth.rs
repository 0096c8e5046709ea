//! MD5 digest authentication (RFC 2617 as reused by SIP)
//!
//! The PBX challenges REGISTER/INVITE with a 401/407 carrying a digest
//! challenge; we answer once with a computed Authorization header. A
//! second challenge on the retried request is treated as bad credentials
//! by the caller, never retried again.

use md5::{Digest, Md5};
use rand::Rng;

use crate::{Error, Result};

/// Parsed WWW-Authenticate / Proxy-Authenticate challenge
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DigestChallenge {
    pub realm: String,
    pub nonce: String,
    pub qop: Option<String>,
    pub algorithm: Option<String>,
    pub opaque: Option<String>,
}

impl DigestChallenge {
    /// Parse a challenge header value, e.g.
    /// `Digest realm="pbx", nonce="abc", qop="auth"`.
    pub fn parse(header: &str) -> Result<Self> {
        let params = header
            .trim()
            .strip_prefix("Digest")
            .ok_or_else(|| Error::Challenge("not a Digest challenge".to_string()))?;

        let mut realm = None;
        let mut nonce = None;
        let mut qop = None;
        let mut algorithm = None;
        let mut opaque = None;

        for part in split_params(params) {
            let Some((key, value)) = part.split_once('=') else {
                continue;
            };
            let value = value.trim().trim_matches('"').to_string();
            match key.trim() {
                "realm" => realm = Some(value),
                "nonce" => nonce = Some(value),
                "qop" => qop = Some(value),
                "algorithm" => algorithm = Some(value),
                "opaque" => opaque = Some(value),
                _ => {}
            }
        }

        Ok(Self {
            realm: realm.ok_or_else(|| Error::Challenge("missing realm".to_string()))?,
            nonce: nonce.ok_or_else(|| Error::Challenge("missing nonce".to_string()))?,
            qop,
            algorithm,
            opaque,
        })
    }

    /// The qop mode we answer with: `auth` when offered, nothing
    /// otherwise (`auth-int` is not supported)
    fn chosen_qop(&self) -> Option<&str> {
        self.qop
            .as_deref()
            .and_then(|q| q.split(',').map(str::trim).find(|&q| q == "auth"))
    }
}

/// Splits challenge parameters on commas outside quoted strings
fn split_params(s: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut start = 0;
    let mut in_quotes = false;
    for (i, c) in s.char_indices() {
        match c {
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => {
                parts.push(&s[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(&s[start..]);
    parts
}

/// Account credentials used to answer challenges
#[derive(Debug, Clone)]
pub struct DigestCredentials {
    pub username: String,
    pub password: String,
}

impl DigestCredentials {
    /// Compute the Authorization header value for retrying `method uri`
    /// against `challenge`.
    pub fn authorization(&self, method: &str, uri: &str, challenge: &DigestChallenge) -> String {
        let cnonce = random_cnonce();
        self.authorization_with_cnonce(method, uri, challenge, &cnonce)
    }

    fn authorization_with_cnonce(
        &self,
        method: &str,
        uri: &str,
        challenge: &DigestChallenge,
        cnonce: &str,
    ) -> String {
        let qop = challenge.chosen_qop();
        let response = self.response(method, uri, challenge, qop, cnonce);

        let mut header = format!(
            "Digest username=\"{}\",realm=\"{}\",nonce=\"{}\",uri=\"{}\",response=\"{}\"",
            self.username, challenge.realm, challenge.nonce, uri, response
        );
        if let Some(algorithm) = &challenge.algorithm {
            header.push_str(&format!(",algorithm={}", algorithm));
        }
        if let Some(opaque) = &challenge.opaque {
            header.push_str(&format!(",opaque=\"{}\"", opaque));
        }
        if let Some(qop) = qop {
            header.push_str(&format!(",qop={},nc={},cnonce=\"{}\"", qop, NC, cnonce));
        }
        header
    }

    /// The digest response value itself
    fn response(
        &self,
        method: &str,
        uri: &str,
        challenge: &DigestChallenge,
        qop: Option<&str>,
        cnonce: &str,
    ) -> String {
        let ha1 = md5_hex(&format!(
            "{}:{}:{}",
            self.username, challenge.realm, self.password
        ));
        let ha2 = md5_hex(&format!("{}:{}", method, uri));

        match qop {
            Some(qop) => md5_hex(&format!(
                "{}:{}:{}:{}:{}:{}",
                ha1, challenge.nonce, NC, cnonce, qop, ha2
            )),
            None => md5_hex(&format!("{}:{}:{}", ha1, challenge.nonce, ha2)),
        }
    }
}

/// Nonce count; we never reuse a server nonce, so it stays at one
const NC: &str = "00000001";

fn random_cnonce() -> String {
    let mut rng = rand::thread_rng();
    (0..8).map(|_| format!("{:02x}", rng.gen::<u8>())).collect()
}

fn md5_hex(input: &str) -> String {
    let digest = Md5::digest(input.as_bytes());
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}
