//! Webhook boundary auth: static bearer token OR HMAC-SHA256 body signature
//! (dual-accept so two integrators can migrate independently).

use axum::http::HeaderMap;
use hmac::{Hmac, Mac};
use sha2::Sha256;

pub const SIGNATURE_HEADER: &str = "X-Webhook-Signature";

/// Resolved webhook credentials. When neither is set, every delivery is
/// rejected (fail closed).
#[derive(Debug, Clone, Default)]
pub struct WebhookAuth {
    pub token: Option<String>,
    pub secret: Option<String>,
}

impl WebhookAuth {
    pub fn new(token: Option<String>, secret: Option<String>) -> Self {
        Self { token, secret }
    }

    /// True when the request carries a matching bearer token or a valid body
    /// signature. Never inspects the payload contents.
    pub fn verify(&self, headers: &HeaderMap, body: &[u8]) -> bool {
        if self.token.is_none() && self.secret.is_none() {
            log::warn!("webhook auth not configured, rejecting delivery");
            return false;
        }

        if let Some(expected) = &self.token {
            let provided = headers
                .get(axum::http::header::AUTHORIZATION)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.strip_prefix("Bearer "))
                .map(str::trim);
            if provided == Some(expected.as_str()) {
                return true;
            }
        }

        if let Some(secret) = &self.secret {
            let signature = headers
                .get(SIGNATURE_HEADER)
                .and_then(|v| v.to_str().ok());
            if verify_signature(secret, body, signature) {
                return true;
            }
        }

        false
    }
}

/// Verify `sha256=<hex>` over the raw body. Comparison is constant-time via the
/// MAC verify, not string equality.
pub fn verify_signature(secret: &str, body: &[u8], signature_header: Option<&str>) -> bool {
    let signature = signature_header.unwrap_or("").trim();
    let signature = signature.strip_prefix("sha256=").unwrap_or(signature).trim();
    if signature.is_empty() {
        return false;
    }
    let Ok(signature_bytes) = hex::decode(signature) else {
        return false;
    };
    let Ok(mut mac) = Hmac::<Sha256>::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&signature_bytes).is_ok()
}

/// Produce the `sha256=<hex>` signature for a body (outbound signing and tests).
pub fn sign_body(secret: &str, body: &[u8]) -> String {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
        .unwrap_or_else(|_| Hmac::<Sha256>::new_from_slice(b"").expect("empty hmac key"));
    mac.update(body);
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::header::AUTHORIZATION;

    #[test]
    fn sign_then_verify_round_trips() {
        let body = br#"{"event":"message"}"#;
        let sig = sign_body("s3cret", body);
        assert!(verify_signature("s3cret", body, Some(&sig)));
    }

    #[test]
    fn tampered_body_fails_verification() {
        let sig = sign_body("s3cret", b"original");
        assert!(!verify_signature("s3cret", b"tampered", Some(&sig)));
    }

    #[test]
    fn wrong_secret_fails_verification() {
        let sig = sign_body("s3cret", b"body");
        assert!(!verify_signature("other", b"body", Some(&sig)));
    }

    #[test]
    fn missing_or_malformed_header_fails() {
        assert!(!verify_signature("s3cret", b"body", None));
        assert!(!verify_signature("s3cret", b"body", Some("")));
        assert!(!verify_signature("s3cret", b"body", Some("sha256=zz-not-hex")));
    }

    #[test]
    fn bearer_token_accepted() {
        let auth = WebhookAuth::new(Some("tok".to_string()), None);
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, "Bearer tok".parse().expect("header"));
        assert!(auth.verify(&headers, b"{}"));
    }

    #[test]
    fn either_mechanism_is_sufficient() {
        let auth = WebhookAuth::new(Some("tok".to_string()), Some("s3cret".to_string()));
        let body = b"{}";

        let mut headers = HeaderMap::new();
        headers.insert(
            SIGNATURE_HEADER,
            sign_body("s3cret", body).parse().expect("header"),
        );
        assert!(auth.verify(&headers, body));

        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, "Bearer tok".parse().expect("header"));
        assert!(auth.verify(&headers, body));
    }

    #[test]
    fn unconfigured_auth_rejects_everything() {
        let auth = WebhookAuth::default();
        assert!(!auth.verify(&HeaderMap::new(), b"{}"));
    }

    #[test]
    fn wrong_token_and_bad_signature_rejected() {
        let auth = WebhookAuth::new(Some("tok".to_string()), Some("s3cret".to_string()));
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, "Bearer nope".parse().expect("header"));
        headers.insert(SIGNATURE_HEADER, "sha256=00".parse().expect("header"));
        assert!(!auth.verify(&headers, b"{}"));
    }
}
