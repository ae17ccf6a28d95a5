//! Webhook authenticity checks.
//!
//! Requests are accepted unconditionally by default. A provider-specific
//! check (an HMAC signature header, a shared token) can be supplied by
//! implementing `WebhookVerifier` and passing it to the listener.

use axum::http::HeaderMap;

pub trait WebhookVerifier: Send + Sync {
    /// Return `Err(reason)` to reject the delivery with 401.
    fn verify(&self, headers: &HeaderMap, body: &[u8]) -> Result<(), String>;
}

/// Accepts every delivery.
#[derive(Debug, Default, Clone, Copy)]
pub struct AcceptAll;

impl WebhookVerifier for AcceptAll {
    fn verify(&self, _headers: &HeaderMap, _body: &[u8]) -> Result<(), String> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accept_all() {
        assert!(AcceptAll.verify(&HeaderMap::new(), b"{}").is_ok());
    }
}
