//! Header fingerprint matcher.
//!
//! Hashes a fixed, ordered subset of request headers and checks the digest
//! (and the transport fingerprint, if present) against known-bot sets that an
//! external feed maintains in the shared cache.

use super::{DetectionSignal, Detector, SignalAction};
use crate::cache::SharedCache;
use crate::error::CacheError;
use crate::request::Request;
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::{debug, warn};

/// Headers hashed into the fingerprint, in order.
pub const FINGERPRINT_HEADERS: [&str; 8] = [
    "accept",
    "accept-encoding",
    "accept-language",
    "cache-control",
    "connection",
    "dnt",
    "upgrade-insecure-requests",
    "user-agent",
];

/// Shared set of known-bot header fingerprints.
pub const KNOWN_BOT_FINGERPRINTS: &str = "fingerprint:known_bots";

/// Shared set of known-bot transport fingerprints.
pub const KNOWN_BOT_TLS: &str = "fingerprint:known_tls";

/// Residual confidence when nothing matches.
const NO_MATCH_CONFIDENCE: f64 = 0.1;

/// Compute the header fingerprint of a request as lowercase hex SHA-256.
///
/// Missing headers contribute an empty field so positions stay stable.
pub fn fingerprint(request: &Request) -> String {
    let canonical = FINGERPRINT_HEADERS
        .iter()
        .map(|name| match *name {
            "user-agent" => request.user_agent(),
            other => request.header(other).unwrap_or(""),
        })
        .collect::<Vec<_>>()
        .join("|");

    hex::encode(Sha256::digest(canonical.as_bytes()))
}

/// Fingerprint matcher detector.
pub struct FingerprintMatcher {
    cache: Arc<dyn SharedCache>,
}

impl FingerprintMatcher {
    pub fn new(cache: Arc<dyn SharedCache>) -> Self {
        Self { cache }
    }

    /// Add a header fingerprint to the known-bot set.
    pub async fn register_fingerprint(&self, digest: &str) -> Result<bool, CacheError> {
        self.cache.sadd(KNOWN_BOT_FINGERPRINTS, digest, None).await
    }

    /// Add a transport fingerprint to the known-bot set.
    pub async fn register_tls(&self, tls: &str) -> Result<bool, CacheError> {
        self.cache.sadd(KNOWN_BOT_TLS, tls, None).await
    }
}

#[async_trait]
impl Detector for FingerprintMatcher {
    async fn analyze(&self, request: &Request) -> DetectionSignal {
        let digest = fingerprint(request);

        match self.cache.sismember(KNOWN_BOT_FINGERPRINTS, &digest).await {
            Ok(true) => {
                debug!(request_id = %request.id, fingerprint = %digest, "Known bot fingerprint");
                return DetectionSignal::bot(self.name(), 0.95, SignalAction::Block)
                    .with_detail("fingerprint", digest)
                    .with_detail("match", "headers");
            }
            Ok(false) => {}
            Err(e) => {
                warn!(error = %e, "Fingerprint lookup failed");
                return DetectionSignal::clean(self.name());
            }
        }

        if let Some(tls) = request.tls_fingerprint.as_deref().filter(|t| !t.is_empty()) {
            match self.cache.sismember(KNOWN_BOT_TLS, tls).await {
                Ok(true) => {
                    debug!(request_id = %request.id, tls = %tls, "Known bot TLS fingerprint");
                    return DetectionSignal::bot(self.name(), 0.9, SignalAction::Block)
                        .with_detail("fingerprint", digest)
                        .with_detail("tls_fingerprint", tls)
                        .with_detail("match", "tls");
                }
                Ok(false) => {}
                Err(e) => {
                    warn!(error = %e, "TLS fingerprint lookup failed");
                    return DetectionSignal::clean(self.name());
                }
            }
        }

        DetectionSignal::clean(self.name())
            .with_confidence(NO_MATCH_CONFIDENCE)
            .with_detail("fingerprint", digest)
    }

    fn name(&self) -> &'static str {
        "fingerprint"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::InMemorySharedCache;

    fn make_request(ua: &str) -> Request {
        Request::new("test", "example.com", "/")
            .with_user_agent(ua)
            .with_header("accept", "*/*")
    }

    #[test]
    fn test_fingerprint_is_stable() {
        let a = fingerprint(&make_request("bot/1.0"));
        let b = fingerprint(&make_request("bot/1.0").with_header("x-unrelated", "1"));
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);

        let c = fingerprint(&make_request("bot/2.0"));
        assert_ne!(a, c);
    }

    #[tokio::test]
    async fn test_no_match_keeps_residual_confidence() {
        let matcher = FingerprintMatcher::new(Arc::new(InMemorySharedCache::new()));
        let result = matcher.analyze(&make_request("bot/1.0")).await;
        assert!(!result.is_bot);
        assert!((result.confidence - 0.1).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_header_match_blocks() {
        let matcher = FingerprintMatcher::new(Arc::new(InMemorySharedCache::new()));
        let request = make_request("bot/1.0");
        matcher.register_fingerprint(&fingerprint(&request)).await.unwrap();

        let result = matcher.analyze(&request).await;
        assert!(result.is_bot);
        assert_eq!(result.action, SignalAction::Block);
        assert!((result.confidence - 0.95).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_tls_match_blocks() {
        let matcher = FingerprintMatcher::new(Arc::new(InMemorySharedCache::new()));
        matcher.register_tls("771,4865-4866,0-23").await.unwrap();

        let request = make_request("bot/1.0").with_tls_fingerprint("771,4865-4866,0-23");
        let result = matcher.analyze(&request).await;
        assert!(result.is_bot);
        assert_eq!(result.action, SignalAction::Block);
        assert!((result.confidence - 0.9).abs() < f64::EPSILON);
    }
}
