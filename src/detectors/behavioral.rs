//! Behavioral analysis detector.
//!
//! Tracks per-client request patterns in the shared cache:
//! - Total request volume over the window envelope
//! - Rolling per-minute rate (hard limit)
//! - Inter-request timing inside the pattern sub-window
//! - User-agent rotation and robots.txt access
//!
//! Every update is an atomic cache primitive (INCR, SADD, sorted window
//! insert), so concurrent requests from one client never lose counts.

use super::{DetectionSignal, Detector, SignalAction};
use crate::cache::SharedCache;
use crate::config::BehavioralConfig;
use crate::error::CacheError;
use crate::request::Request;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

const MINUTE_MS: i64 = 60_000;

/// Snapshot of one client's behavior window after recording a request.
#[derive(Debug, Clone, PartialEq)]
pub struct BehaviorWindow {
    pub request_count: u64,
    pub first_seen_ms: i64,
    pub last_seen_ms: i64,
    pub unique_user_agents: u64,
    pub robots_accessed: bool,
    /// Request timestamps inside the pattern sub-window, oldest first
    pub recent: Vec<i64>,
}

impl BehaviorWindow {
    /// Requests observed in the minute ending at the latest request, both
    /// ends inclusive.
    pub fn requests_per_minute(&self) -> usize {
        let cutoff = self.last_seen_ms - MINUTE_MS;
        self.recent.iter().filter(|&&ts| ts >= cutoff).count()
    }

    /// Mean gap between consecutive requests in the pattern sub-window.
    pub fn average_interval_ms(&self) -> Option<f64> {
        let (first, last) = (self.recent.first()?, self.recent.last()?);
        if self.recent.len() < 2 {
            return None;
        }
        Some((last - first) as f64 / (self.recent.len() - 1) as f64)
    }

    pub fn is_first_observation(&self) -> bool {
        self.request_count <= 1
    }
}

/// Behavioral tracker detector.
pub struct BehavioralTracker {
    cache: Arc<dyn SharedCache>,
    config: BehavioralConfig,
}

impl BehavioralTracker {
    pub fn new(cache: Arc<dyn SharedCache>, config: BehavioralConfig) -> Self {
        Self { cache, config }
    }

    fn key(ip: &str, part: &str) -> String {
        format!("behavior:{}:{}", ip, part)
    }

    /// Record the request and return the updated window.
    pub async fn observe(&self, request: &Request) -> Result<BehaviorWindow, CacheError> {
        let ip = request.client_ip.as_str();
        let ttl = Duration::from_secs(self.config.window_ttl_seconds);
        let now_ms = request.timestamp.timestamp_millis();

        let request_count = self
            .cache
            .incr_with_expiry(&Self::key(ip, "count"), ttl)
            .await?;

        let first_key = Self::key(ip, "first");
        if request_count == 1 {
            self.cache.set_ex(&first_key, &now_ms.to_string(), ttl).await?;
        }
        let first_seen_ms = self
            .cache
            .get(&first_key)
            .await?
            .and_then(|v| v.parse().ok())
            .unwrap_or(now_ms);

        let uas_key = Self::key(ip, "user_agents");
        let ua = request.user_agent();
        if !ua.is_empty() {
            self.cache.sadd(&uas_key, ua, Some(ttl)).await?;
        }
        let unique_user_agents = self.cache.scard(&uas_key).await?;

        let robots_key = Self::key(ip, "robots");
        if request.path().eq_ignore_ascii_case("/robots.txt") {
            self.cache.set_ex(&robots_key, "1", ttl).await?;
        }
        let robots_accessed = self.cache.get(&robots_key).await?.is_some();

        let recent = self
            .cache
            .record_in_window(
                &Self::key(ip, "pattern"),
                now_ms,
                Duration::from_secs(self.config.pattern_window_seconds),
            )
            .await?;

        Ok(BehaviorWindow {
            request_count,
            first_seen_ms,
            last_seen_ms: now_ms,
            unique_user_agents,
            robots_accessed,
            recent,
        })
    }

    /// Turn a window snapshot into a signal.
    pub fn assess(&self, window: &BehaviorWindow) -> DetectionSignal {
        let rpm = window.requests_per_minute();
        let avg_interval = window.average_interval_ms();

        let base = |signal: DetectionSignal| {
            let signal = signal
                .with_detail("request_count", window.request_count)
                .with_detail("requests_per_minute", rpm as u64)
                .with_detail("unique_user_agents", window.unique_user_agents)
                .with_detail("robots_accessed", window.robots_accessed)
                .with_detail("first_seen_ms", window.first_seen_ms);
            match avg_interval {
                Some(ms) => signal.with_detail("avg_interval_ms", ms),
                None => signal,
            }
        };

        if window.is_first_observation() {
            return base(DetectionSignal::clean(self.name()).with_detail("cold_start", true));
        }

        if rpm > self.config.rpm_threshold as usize {
            return base(
                DetectionSignal::bot(self.name(), 0.9, SignalAction::Block)
                    .with_hard_limit()
                    .with_detail("reason", "rate_limit_exceeded"),
            );
        }

        if let Some(ms) = avg_interval {
            if window.recent.len() > self.config.min_requests_for_timing
                && ms < self.config.fast_interval_ms as f64
            {
                return base(
                    DetectionSignal::bot(self.name(), 0.85, SignalAction::Challenge)
                        .with_detail("reason", "rapid_requests"),
                );
            }
        }

        let mut suspicion = 0u32;
        if window.request_count > self.config.high_volume_threshold {
            suspicion += 20;
        }
        if window.unique_user_agents > self.config.unique_user_agent_threshold {
            suspicion += 15;
        }
        if window.robots_accessed {
            suspicion += 10;
        }

        let confidence = f64::from(suspicion) / 100.0;
        let signal = if suspicion >= 25 {
            DetectionSignal::bot(self.name(), confidence, SignalAction::Monitor)
        } else {
            DetectionSignal::clean(self.name()).with_confidence(confidence)
        };
        base(signal.with_detail("suspicion", suspicion))
    }
}

#[async_trait]
impl Detector for BehavioralTracker {
    async fn analyze(&self, request: &Request) -> DetectionSignal {
        if request.client_ip.is_empty() {
            return DetectionSignal::clean(self.name());
        }

        match self.observe(request).await {
            Ok(window) => {
                let signal = self.assess(&window);
                if signal.is_bot {
                    debug!(
                        client_ip = %request.client_ip,
                        request_count = window.request_count,
                        action = signal.action.as_str(),
                        "Behavioral anomaly"
                    );
                }
                signal
            }
            Err(e) => {
                warn!(client_ip = %request.client_ip, error = %e, "Behavior window unavailable");
                DetectionSignal::clean(self.name())
            }
        }
    }

    fn name(&self) -> &'static str {
        "behavioral"
    }
}
