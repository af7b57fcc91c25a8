//! Heuristic request scorer.
//!
//! Adds up suspicion points from user-agent keywords, missing browser
//! headers, user-agent shape and crawler-file access. The score is additive,
//! so the order heuristics are applied in never changes the result.

use super::{DetectionSignal, Detector, SignalAction};
use crate::config::DetectionConfig;
use crate::request::Request;
use async_trait::async_trait;
use std::sync::LazyLock;

/// Upper bound on the heuristic score.
const MAX_SCORE: u32 = 95;

/// User-agent substring groups: (label, points, lowercase keywords).
static UA_KEYWORD_GROUPS: LazyLock<Vec<(&'static str, u32, Vec<&'static str>)>> =
    LazyLock::new(|| {
        vec![
            (
                "automation_tool_ua",
                25,
                vec![
                    "curl",
                    "wget",
                    "httpie",
                    "python-requests",
                    "python-urllib",
                    "aiohttp",
                    "go-http-client",
                    "java/",
                    "axios",
                    "node-fetch",
                    "okhttp",
                    "libwww-perl",
                ],
            ),
            (
                "scraper_ua",
                30,
                vec![
                    "scrapy", "scraper", "crawler", "spider", "httrack", "ahrefsbot",
                    "semrushbot", "mj12bot", "dotbot",
                ],
            ),
            (
                "browser_automation_ua",
                35,
                vec!["selenium", "puppeteer", "playwright", "webdriver", "phantomjs"],
            ),
            ("headless_ua", 20, vec!["headless"]),
            (
                "ai_agent_ua",
                40,
                vec![
                    "gptbot", "chatgpt", "openai", "claude", "anthropic", "perplexity",
                    "cohere", "ccbot", "bytespider", "llm", "ai-agent", "ai2bot",
                ],
            ),
        ]
    });

/// Headers real browsers send: (header, label, points).
static BROWSER_HEADERS: LazyLock<Vec<(&'static str, &'static str, u32)>> = LazyLock::new(|| {
    vec![
        ("accept-language", "missing_accept_language", 15),
        ("accept-encoding", "missing_accept_encoding", 10),
    ]
});

/// Heuristic scorer detector.
pub struct HeuristicScorer {
    bot_threshold: u32,
    ai_threshold: u32,
}

impl HeuristicScorer {
    pub fn new(bot_threshold: u8, ai_threshold: u8) -> Self {
        Self {
            bot_threshold: u32::from(bot_threshold),
            ai_threshold: u32::from(ai_threshold),
        }
    }

    pub fn from_config(config: &DetectionConfig) -> Self {
        Self::new(config.heuristic_bot_threshold, config.heuristic_ai_threshold)
    }

    /// Score a request, returning the clamped score and triggered labels.
    pub fn score(&self, request: &Request) -> (u32, Vec<&'static str>) {
        let mut score = 0u32;
        let mut labels = Vec::new();

        let ua = request.user_agent();
        let ua_lower = ua.to_lowercase();
        for (label, points, keywords) in UA_KEYWORD_GROUPS.iter() {
            if keywords.iter().any(|k| ua_lower.contains(k)) {
                score += points;
                labels.push(*label);
            }
        }

        for (header, label, points) in BROWSER_HEADERS.iter() {
            let present = request.header(header).is_some_and(|v| !v.trim().is_empty());
            if !present {
                score += points;
                labels.push(*label);
            }
        }

        if request.method.eq_ignore_ascii_case("GET") && request.referer().is_none() {
            score += 5;
            labels.push("missing_referer");
        }

        let ua_len = ua.chars().count();
        if !(20..=500).contains(&ua_len) {
            score += 15;
            labels.push("abnormal_ua_length");
        }

        let path = request.path().to_lowercase();
        if path.ends_with("/robots.txt") || path.ends_with("/sitemap.xml") {
            score += 10;
            labels.push("crawler_file_access");
        }

        (score.min(MAX_SCORE), labels)
    }
}

impl Default for HeuristicScorer {
    fn default() -> Self {
        Self::from_config(&DetectionConfig::default())
    }
}

/// Whether a label names an AI or automation heuristic.
fn is_ai_label(label: &str) -> bool {
    label.split('_').any(|part| part == "ai" || part == "automation")
}

#[async_trait]
impl Detector for HeuristicScorer {
    async fn analyze(&self, request: &Request) -> DetectionSignal {
        let (score, labels) = self.score(request);

        let is_bot = score >= self.bot_threshold;
        let is_ai_bot = score >= self.ai_threshold && labels.iter().any(|l| is_ai_label(l));
        let action = if is_bot {
            SignalAction::Monitor
        } else {
            SignalAction::Allow
        };

        DetectionSignal::new(self.name(), is_bot, f64::from(score) / 100.0, action)
            .with_ai_bot(is_ai_bot)
            .with_detail("score", score)
            .with_detail("labels", labels)
    }

    fn name(&self) -> &'static str {
        "heuristic"
    }
}
