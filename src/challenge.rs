//! Proof-of-work challenges.
//!
//! A challenge is a random nonce plus a difficulty. The client must find a
//! solution such that `sha256(nonce + solution)`, hex-encoded, starts with
//! `difficulty` zero characters. Challenges live in the shared cache under the
//! client key and are consumed atomically on successful verification.

use crate::cache::SharedCache;
use crate::config::ChallengeConfig;
use crate::error::CacheError;
use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// An issued proof-of-work challenge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Challenge {
    pub nonce: String,
    /// Required leading zero hex characters
    pub difficulty: u8,
    pub expires_at: DateTime<Utc>,
}

/// Outcome of a verification attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verification {
    /// Solution accepted; the challenge has been consumed.
    Verified,
    /// Solution rejected; the challenge remains outstanding.
    Rejected,
    /// No outstanding challenge for this client.
    Missing,
}

/// Hex characters in a SHA-256 digest; higher difficulties are unsolvable.
pub const MAX_DIFFICULTY: u8 = 64;

/// Check whether `solution` solves `nonce` at `difficulty`.
pub fn is_solution(nonce: &str, solution: &str, difficulty: u8) -> bool {
    let mut hasher = Sha256::new();
    hasher.update(nonce.as_bytes());
    hasher.update(solution.as_bytes());
    let digest = hex::encode(hasher.finalize());
    digest.len() >= difficulty as usize
        && digest.bytes().take(difficulty as usize).all(|b| b == b'0')
}

/// Brute-force a solution. Used by clients and tests; cost grows 16x per
/// difficulty step. Difficulties above [`MAX_DIFFICULTY`] are clamped.
pub fn solve(nonce: &str, difficulty: u8) -> String {
    let difficulty = difficulty.min(MAX_DIFFICULTY);
    let mut counter = 0u64;
    loop {
        let candidate = counter.to_string();
        if is_solution(nonce, &candidate, difficulty) {
            return candidate;
        }
        counter += 1;
    }
}

/// Issues and verifies challenges.
pub struct ChallengeManager {
    cache: Arc<dyn SharedCache>,
    difficulty: u8,
    ttl: Duration,
}

impl ChallengeManager {
    pub fn new(cache: Arc<dyn SharedCache>, config: &ChallengeConfig) -> Self {
        if config.difficulty > MAX_DIFFICULTY {
            warn!(
                configured = config.difficulty,
                max = MAX_DIFFICULTY,
                "Challenge difficulty out of range, clamping"
            );
        }
        Self {
            cache,
            difficulty: config.difficulty.min(MAX_DIFFICULTY),
            ttl: Duration::from_secs(config.ttl_seconds),
        }
    }

    fn key(client: &str) -> String {
        format!("challenge:{}", client)
    }

    fn generate_nonce() -> String {
        let mut bytes = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut bytes);
        hex::encode(bytes)
    }

    /// Issue a fresh challenge for `client`, replacing any outstanding one.
    pub async fn issue(&self, client: &str) -> Result<Challenge, CacheError> {
        let challenge = Challenge {
            nonce: Self::generate_nonce(),
            difficulty: self.difficulty,
            expires_at: Utc::now()
                + chrono::Duration::from_std(self.ttl).unwrap_or_else(|_| chrono::Duration::zero()),
        };
        let encoded = serde_json::to_string(&challenge)?;
        self.cache.set_ex(&Self::key(client), &encoded, self.ttl).await?;

        debug!(client = %client, difficulty = self.difficulty, "Challenge issued");
        Ok(challenge)
    }

    /// Verify a solution for `client`'s outstanding challenge.
    ///
    /// The stored challenge is taken atomically, so two concurrent attempts
    /// can never both succeed. A wrong answer puts it back for the rest of
    /// its lifetime, unless a newer challenge was issued in the meantime.
    pub async fn verify(&self, client: &str, solution: &str) -> Result<Verification, CacheError> {
        let key = Self::key(client);
        let Some(stored) = self.cache.take(&key).await? else {
            return Ok(Verification::Missing);
        };
        let challenge: Challenge = serde_json::from_str(&stored)?;

        let now = Utc::now();
        if challenge.expires_at <= now {
            return Ok(Verification::Missing);
        }

        if is_solution(&challenge.nonce, solution, challenge.difficulty) {
            debug!(client = %client, "Challenge solved");
            return Ok(Verification::Verified);
        }

        if let Ok(remaining) = (challenge.expires_at - now).to_std() {
            if !self.cache.set_nx_ex(&key, &stored, remaining).await? {
                debug!(client = %client, "Newer challenge outstanding, not restoring");
            }
        }
        Ok(Verification::Rejected)
    }
}
