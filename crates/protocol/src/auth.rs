//! Command signing and sender throttling.
//!
//! The chat transport authenticates nobody, so the command text itself is
//! signed: `<command-text> |sig=<hex hmac-sha256>`. Verification recomputes
//! the tag and compares in constant time; it never errors on malformed
//! input, it just returns false.

use std::collections::HashMap;

use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::task::{now_ts, ProtocolError};

type HmacSha256 = Hmac<Sha256>;

/// Separator between command text and signature on a chat line.
pub const SIG_MARKER: &str = "|sig=";

/// HMAC-SHA256 over the raw command text, rendered as 64 lowercase hex chars.
pub fn sign(secret: &str, raw: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .expect("hmac accepts keys of any length");
    mac.update(raw.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Constant-time verification. Returns false for any malformed signature.
pub fn verify(secret: &str, raw: &str, sig: &str) -> bool {
    let provided = match hex::decode(sig) {
        Ok(bytes) => bytes,
        Err(_) => return false,
    };
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .expect("hmac accepts keys of any length");
    mac.update(raw.as_bytes());
    mac.verify_slice(&provided).is_ok()
}

/// Split a chat line into (raw command text, signature).
///
/// Absence of the marker is a parse failure, distinct from a verification
/// failure. The split is on the last occurrence so command text may contain
/// pipes.
pub fn split_signed(line: &str) -> Result<(&str, &str), ProtocolError> {
    let idx = line.rfind(SIG_MARKER).ok_or(ProtocolError::MissingSignature)?;
    let raw = line[..idx].trim();
    let sig = line[idx + SIG_MARKER.len()..].trim();
    Ok((raw, sig))
}

/// Produce a ready-to-send signed command line.
pub fn format_signed(raw: &str, secret: &str) -> String {
    format!("{} {}{}", raw, SIG_MARKER, sign(secret, raw))
}

/// Per-sender sliding-window rate limiter.
///
/// In-memory and approximate: each commander instance tracks its own
/// windows. Timestamps older than the window are pruned before the count is
/// checked, and the attempt is only recorded when admitted.
#[derive(Debug)]
pub struct RateLimiter {
    max_requests: usize,
    window_secs: i64,
    requests: HashMap<String, Vec<i64>>,
}

impl RateLimiter {
    pub fn new(max_requests: usize, window_secs: i64) -> Self {
        Self {
            max_requests,
            window_secs,
            requests: HashMap::new(),
        }
    }

    pub fn check(&mut self, sender: &str) -> bool {
        self.check_at(sender, now_ts())
    }

    pub fn check_at(&mut self, sender: &str, now: i64) -> bool {
        let window_start = now - self.window_secs;
        let entry = self.requests.entry(sender.to_string()).or_default();
        entry.retain(|&ts| ts > window_start);

        if entry.len() >= self.max_requests {
            return false;
        }
        entry.push(now);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_verify_round_trip() {
        let sig = sign("secret", "!ping agent:all");
        assert_eq!(sig.len(), 64);
        assert!(verify("secret", "!ping agent:all", &sig));
    }

    #[test]
    fn wrong_secret_fails() {
        let sig = sign("secret-a", "!halt agent:all");
        assert!(!verify("secret-b", "!halt agent:all", &sig));
    }

    #[test]
    fn tampered_text_fails() {
        let sig = sign("secret", "!ping agent:worker-1");
        assert!(!verify("secret", "!halt agent:worker-1", &sig));
    }

    #[test]
    fn malformed_signature_returns_false_not_error() {
        assert!(!verify("secret", "!ping agent:all", "not-hex"));
        assert!(!verify("secret", "!ping agent:all", ""));
        assert!(!verify("secret", "!ping agent:all", "deadbeef"));
    }

    #[test]
    fn split_requires_marker() {
        assert!(matches!(
            split_signed("!ping agent:all"),
            Err(ProtocolError::MissingSignature)
        ));

        let (raw, sig) = split_signed("!ping agent:all |sig=abc123").unwrap();
        assert_eq!(raw, "!ping agent:all");
        assert_eq!(sig, "abc123");
    }

    #[test]
    fn split_uses_last_marker() {
        let (raw, sig) = split_signed("!dispatch a:b x {\"v\":\"|sig=\"} |sig=ff").unwrap();
        assert_eq!(raw, "!dispatch a:b x {\"v\":\"|sig=\"}");
        assert_eq!(sig, "ff");
    }

    #[test]
    fn format_signed_verifies() {
        let line = format_signed("!resume agent:all", "s3cr3t");
        let (raw, sig) = split_signed(&line).unwrap();
        assert!(verify("s3cr3t", raw, sig));
    }

    #[test]
    fn rate_limiter_window() {
        let mut rl = RateLimiter::new(3, 60);
        let t0 = 1_000_000;
        assert!(rl.check_at("alice", t0));
        assert!(rl.check_at("alice", t0 + 1));
        assert!(rl.check_at("alice", t0 + 2));
        assert!(!rl.check_at("alice", t0 + 3));

        // Other senders are unaffected.
        assert!(rl.check_at("bob", t0 + 3));

        // Window elapses and the sender is admitted again.
        assert!(rl.check_at("alice", t0 + 61));
    }

    #[test]
    fn rejected_attempts_are_not_recorded() {
        let mut rl = RateLimiter::new(1, 60);
        let t0 = 0;
        assert!(rl.check_at("carol", t0));
        assert!(!rl.check_at("carol", t0 + 10));
        // The rejected attempt at t0+10 must not extend the window.
        assert!(rl.check_at("carol", t0 + 61));
    }
}
