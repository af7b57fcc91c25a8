//! Challenge solution detector.
//!
//! Looks for a proof-of-work solution on the request and verifies it against
//! the client's outstanding challenge. A valid solution marks this request,
//! and only this request, as human.

use super::{DetectionSignal, Detector};
use crate::challenge::{ChallengeManager, Verification};
use crate::request::Request;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, warn};

pub struct ChallengeDetector {
    manager: Arc<ChallengeManager>,
    solution_header: String,
}

impl ChallengeDetector {
    pub fn new(manager: Arc<ChallengeManager>, solution_header: impl Into<String>) -> Self {
        Self {
            manager,
            solution_header: solution_header.into().to_lowercase(),
        }
    }
}

#[async_trait]
impl Detector for ChallengeDetector {
    async fn analyze(&self, request: &Request) -> DetectionSignal {
        let solution = match request.header(&self.solution_header) {
            Some(s) if !s.trim().is_empty() && !request.client_ip.is_empty() => s.trim(),
            _ => return DetectionSignal::clean(self.name()),
        };

        match self.manager.verify(&request.client_ip, solution).await {
            Ok(Verification::Verified) => DetectionSignal::clean(self.name())
                .with_verified_human()
                .with_detail("challenge", "verified"),
            Ok(outcome) => {
                debug!(client_ip = %request.client_ip, outcome = ?outcome, "Challenge not verified");
                DetectionSignal::clean(self.name()).with_detail("challenge", "failed")
            }
            Err(e) => {
                warn!(client_ip = %request.client_ip, error = %e, "Challenge verification failed");
                DetectionSignal::clean(self.name())
            }
        }
    }

    fn name(&self) -> &'static str {
        "challenge"
    }
}
