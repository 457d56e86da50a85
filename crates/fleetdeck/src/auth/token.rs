//! Signed bearer tokens.
//!
//! Stateless, time-limited tokens shared with the companion console UI:
//! `base64url(payload + ":" + hex(HMAC-SHA256(secret, payload)))` where
//! `payload` is `"<expiryEpochSeconds>:<nonceHex>"`. There is no server-side
//! revocation list; a token is valid exactly while its MAC checks out and its
//! expiry lies in the future.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE;
use hmac::{Hmac, Mac};
use rand::Rng;
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Default token lifetime: 24 hours.
pub const DEFAULT_TOKEN_TTL: Duration = Duration::from_secs(24 * 3600);

/// Issues and verifies signed tokens.
#[derive(Clone)]
pub struct TokenService {
    secret: Vec<u8>,
}

impl std::fmt::Debug for TokenService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenService").finish_non_exhaustive()
    }
}

impl TokenService {
    /// Create a service with the shared signing secret.
    pub fn new(secret: impl AsRef<[u8]>) -> Self {
        Self {
            secret: secret.as_ref().to_vec(),
        }
    }

    fn mac_hex(&self, payload: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .expect("HMAC accepts keys of any length");
        mac.update(payload.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// Sign an arbitrary payload string.
    pub fn sign(&self, payload: &str) -> String {
        let token = format!("{}:{}", payload, self.mac_hex(payload));
        URL_SAFE.encode(token.as_bytes())
    }

    /// Issue a fresh token expiring `ttl` from now. Returns the token and
    /// its expiry as epoch seconds.
    pub fn issue(&self, ttl: Duration) -> (String, u64) {
        let expiry = now_epoch() + ttl.as_secs();
        let nonce: [u8; 8] = rand::rng().random();
        let payload = format!("{}:{}", expiry, hex::encode(nonce));
        (self.sign(&payload), expiry)
    }

    /// Verify a token: MAC match (constant time) and expiry in the future.
    pub fn verify(&self, token: &str) -> bool {
        self.verify_at(token, now_epoch())
    }

    /// Verification against an explicit clock, for tests.
    fn verify_at(&self, token: &str, now: u64) -> bool {
        let Ok(raw) = URL_SAFE.decode(token.as_bytes()) else {
            return false;
        };
        let Ok(raw) = String::from_utf8(raw) else {
            return false;
        };
        // The MAC follows the last colon; the payload itself contains one.
        let Some((payload, mac_hex)) = raw.rsplit_once(':') else {
            return false;
        };
        let Ok(mac_bytes) = hex::decode(mac_hex) else {
            return false;
        };
        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .expect("HMAC accepts keys of any length");
        mac.update(payload.as_bytes());
        if mac.verify_slice(&mac_bytes).is_err() {
            return false;
        }
        let Some(expiry_str) = payload.split(':').next() else {
            return false;
        };
        let Ok(expiry) = expiry_str.parse::<u64>() else {
            return false;
        };
        now < expiry
    }
}

fn now_epoch() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> TokenService {
        TokenService::new("test-secret")
    }

    #[test]
    fn test_sign_verify_roundtrip() {
        let svc = service();
        let (token, expiry) = svc.issue(Duration::from_secs(60));
        assert!(expiry > now_epoch());
        assert!(svc.verify(&token));
    }

    #[test]
    fn test_expired_token_rejected() {
        let svc = service();
        let payload = format!("{}:{}", 1000, "aabbccdd");
        let token = svc.sign(&payload);
        // valid strictly before expiry
        assert!(svc.verify_at(&token, 999));
        // invalid at and after expiry
        assert!(!svc.verify_at(&token, 1000));
        assert!(!svc.verify_at(&token, 2000));
    }

    #[test]
    fn test_tampered_signature_rejected() {
        let svc = service();
        let (token, _) = svc.issue(Duration::from_secs(60));
        let decoded = String::from_utf8(URL_SAFE.decode(token.as_bytes()).unwrap()).unwrap();
        // flip one character of the hex MAC
        let mut chars: Vec<char> = decoded.chars().collect();
        let last = chars.len() - 1;
        chars[last] = if chars[last] == '0' { '1' } else { '0' };
        let tampered: String = chars.into_iter().collect();
        let tampered = URL_SAFE.encode(tampered.as_bytes());
        assert!(!svc.verify(&tampered));
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let (token, _) = service().issue(Duration::from_secs(60));
        let other = TokenService::new("another-secret");
        assert!(!other.verify(&token));
    }

    #[test]
    fn test_garbage_tokens_rejected() {
        let svc = service();
        assert!(!svc.verify(""));
        assert!(!svc.verify("not-base64!!"));
        assert!(!svc.verify(&URL_SAFE.encode(b"no-colon-here")));
        assert!(!svc.verify(&URL_SAFE.encode(b"payload:nothex")));
    }
}
