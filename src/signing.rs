//! HMAC-SHA256 request signing: `sha256=<hex(hmac_sha256(secret, ts + "." + body))>`.

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Signs `body` with `secret` at `unix_ts`, returning the hex-encoded HMAC (without the
/// `sha256=` header prefix, which callers add when building `X-Webhook-Signature`).
pub fn sign(secret: &str, unix_ts: i64, body: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts keys of any length");
    let signed = format!("{unix_ts}.{body}");
    mac.update(signed.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Verifies a signature header value (e.g. `sha256=<hex>`) against `secret`, `unix_ts`, `body`.
/// Constant-time comparison via `subtle`-free `Mac::verify_slice`, to avoid timing side channels.
pub fn verify(secret: &str, unix_ts: i64, body: &str, header_value: &str) -> bool {
    let Some(hex_sig) = header_value.strip_prefix("sha256=") else {
        return false;
    };
    let Ok(expected_bytes) = hex::decode(hex_sig) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    let signed = format!("{unix_ts}.{body}");
    mac.update(signed.as_bytes());
    mac.verify_slice(&expected_bytes).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_then_verify_round_trips() {
        let secret = "a".repeat(32);
        let body = r#"{"id":"e1","type":"issue.created"}"#;
        let ts = 1_700_000_000;
        let sig = sign(&secret, ts, body);
        let header = format!("sha256={sig}");
        assert!(verify(&secret, ts, body, &header));
    }

    #[test]
    fn verify_rejects_wrong_secret() {
        let body = "{}";
        let ts = 1_700_000_000;
        let sig = sign(&"a".repeat(32), ts, body);
        let header = format!("sha256={sig}");
        assert!(!verify(&"b".repeat(32), ts, body, &header));
    }

    #[test]
    fn verify_rejects_tampered_body() {
        let secret = "a".repeat(32);
        let ts = 1_700_000_000;
        let sig = sign(&secret, ts, "original");
        let header = format!("sha256={sig}");
        assert!(!verify(&secret, ts, "tampered", &header));
    }

    #[test]
    fn verify_rejects_missing_prefix() {
        let secret = "a".repeat(32);
        let sig = sign(&secret, 1, "{}");
        assert!(!verify(&secret, 1, "{}", &sig));
    }
}
