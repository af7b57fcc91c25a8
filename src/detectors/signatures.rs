//! User-agent signature matcher.
//!
//! Identifies automated agents from an ordered table of user-agent patterns.
//! The first matching entry wins, so specific signatures must precede
//! generic ones.

use super::{DetectionSignal, Detector, SignalAction};
use crate::request::Request;
use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, warn};

/// A signature definition as stored on disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignatureDef {
    /// Case-insensitive regex matched against the user-agent
    pub pattern: String,

    /// Bot name (e.g., "GPTBot")
    pub bot_name: String,

    /// Operator of the bot
    pub company: String,

    /// Classification: `ai_crawler`, `ai_assistant`, `ai_search`,
    /// `search_engine`, `scraper` or `malicious`
    #[serde(rename = "type")]
    pub bot_class: String,

    /// Confidence reported on match (0.0-1.0)
    pub base_confidence: f64,

    /// Suggested per-request price for this bot
    #[serde(default)]
    pub suggested_rate: Option<f64>,
}

/// Compiled signature.
#[derive(Debug, Clone)]
pub struct Signature {
    pattern: Regex,
    pub bot_name: String,
    pub company: String,
    pub bot_class: String,
    pub base_confidence: f64,
    pub suggested_rate: Option<f64>,
}

impl Signature {
    pub fn is_ai(&self) -> bool {
        self.bot_class.starts_with("ai_")
    }

    pub fn is_malicious(&self) -> bool {
        self.bot_class == "malicious"
    }

    pub fn matches(&self, user_agent: &str) -> bool {
        self.pattern.is_match(user_agent)
    }
}

/// Ordered signature table.
pub struct SignatureMatcher {
    signatures: Vec<Signature>,
}

impl SignatureMatcher {
    /// Create a matcher from definitions, skipping entries whose pattern does
    /// not compile.
    pub fn new(defs: Vec<SignatureDef>) -> Self {
        let signatures = defs
            .into_iter()
            .filter_map(|def| match Self::compile(def) {
                Ok(sig) => Some(sig),
                Err(e) => {
                    warn!(error = %e, "Skipping signature with invalid pattern");
                    None
                }
            })
            .collect();
        Self { signatures }
    }

    /// Load signatures from a JSON file, or the built-in table if the file
    /// does not exist.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let defs: Vec<SignatureDef> = serde_json::from_str(&content)?;
            Ok(Self::new(defs))
        } else {
            Ok(Self::with_defaults())
        }
    }

    /// Create with the built-in signature table.
    pub fn with_defaults() -> Self {
        Self::new(default_signatures())
    }

    fn compile(def: SignatureDef) -> Result<Signature, regex::Error> {
        Ok(Signature {
            pattern: Regex::new(&format!("(?i){}", def.pattern))?,
            bot_name: def.bot_name,
            company: def.company,
            bot_class: def.bot_class,
            base_confidence: def.base_confidence.clamp(0.0, 1.0),
            suggested_rate: def.suggested_rate,
        })
    }

    /// First signature matching the user-agent.
    pub fn identify(&self, user_agent: &str) -> Option<&Signature> {
        if user_agent.is_empty() {
            return None;
        }
        self.signatures.iter().find(|sig| sig.matches(user_agent))
    }

    /// Number of loaded signatures.
    pub fn len(&self) -> usize {
        self.signatures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.signatures.is_empty()
    }
}

impl Default for SignatureMatcher {
    fn default() -> Self {
        Self::with_defaults()
    }
}

fn sig(
    pattern: &str,
    bot_name: &str,
    company: &str,
    bot_class: &str,
    base_confidence: f64,
    suggested_rate: Option<f64>,
) -> SignatureDef {
    SignatureDef {
        pattern: pattern.to_string(),
        bot_name: bot_name.to_string(),
        company: company.to_string(),
        bot_class: bot_class.to_string(),
        base_confidence,
        suggested_rate,
    }
}

fn default_signatures() -> Vec<SignatureDef> {
    vec![
        // OpenAI
        sig(r"ChatGPT-User", "ChatGPT-User", "OpenAI", "ai_assistant", 0.95, Some(0.002)),
        sig(r"OAI-SearchBot", "OAI-SearchBot", "OpenAI", "ai_search", 0.95, Some(0.001)),
        sig(r"GPTBot", "GPTBot", "OpenAI", "ai_crawler", 0.95, Some(0.01)),
        // Anthropic
        sig(r"Claude-Web", "Claude-Web", "Anthropic", "ai_assistant", 0.95, Some(0.002)),
        sig(r"Claude-User", "Claude-User", "Anthropic", "ai_assistant", 0.95, Some(0.002)),
        sig(r"ClaudeBot", "ClaudeBot", "Anthropic", "ai_crawler", 0.95, Some(0.01)),
        sig(r"anthropic-ai", "anthropic-ai", "Anthropic", "ai_crawler", 0.9, Some(0.01)),
        // Perplexity
        sig(r"Perplexity-User", "Perplexity-User", "Perplexity", "ai_assistant", 0.9, Some(0.002)),
        sig(r"PerplexityBot", "PerplexityBot", "Perplexity", "ai_search", 0.95, Some(0.005)),
        // Other AI training crawlers
        sig(r"Google-Extended", "Google-Extended", "Google", "ai_crawler", 0.9, Some(0.01)),
        sig(r"Applebot-Extended", "Applebot-Extended", "Apple", "ai_crawler", 0.9, Some(0.01)),
        sig(r"meta-externalagent", "meta-externalagent", "Meta", "ai_crawler", 0.9, Some(0.01)),
        sig(r"FacebookBot", "FacebookBot", "Meta", "ai_crawler", 0.85, Some(0.01)),
        sig(r"CCBot", "CCBot", "Common Crawl", "ai_crawler", 0.9, Some(0.005)),
        sig(r"Bytespider", "Bytespider", "ByteDance", "ai_crawler", 0.9, Some(0.01)),
        sig(r"Amazonbot", "Amazonbot", "Amazon", "ai_crawler", 0.85, Some(0.005)),
        sig(r"cohere-ai", "cohere-ai", "Cohere", "ai_crawler", 0.9, Some(0.005)),
        sig(r"Diffbot", "Diffbot", "Diffbot", "ai_crawler", 0.85, Some(0.005)),
        sig(r"YouBot", "YouBot", "You.com", "ai_search", 0.85, Some(0.002)),
        // Search engines
        sig(r"Googlebot", "Googlebot", "Google", "search_engine", 0.9, None),
        sig(r"bingbot", "Bingbot", "Microsoft", "search_engine", 0.9, None),
        // Scanners
        sig(r"sqlmap", "sqlmap", "sqlmap", "malicious", 0.95, None),
        sig(r"nikto", "Nikto", "CIRT", "malicious", 0.95, None),
        sig(r"nuclei", "Nuclei", "ProjectDiscovery", "malicious", 0.9, None),
        sig(r"masscan", "masscan", "masscan", "malicious", 0.9, None),
        sig(r"zgrab", "ZGrab", "ZMap", "malicious", 0.85, None),
    ]
}

#[async_trait]
impl Detector for SignatureMatcher {
    async fn analyze(&self, request: &Request) -> DetectionSignal {
        let Some(sig) = self.identify(request.user_agent()) else {
            return DetectionSignal::clean(self.name());
        };

        let action = if sig.is_malicious() {
            SignalAction::Block
        } else {
            SignalAction::Monitor
        };

        debug!(
            request_id = %request.id,
            bot = %sig.bot_name,
            company = %sig.company,
            "Signature matched"
        );

        let mut signal = DetectionSignal::bot(self.name(), sig.base_confidence, action)
            .with_bot_type(sig.bot_name.clone())
            .with_ai_bot(sig.is_ai())
            .with_detail("company", sig.company.clone())
            .with_detail("type", sig.bot_class.clone());
        if let Some(rate) = sig.suggested_rate {
            signal = signal.with_detail("suggested_rate", rate);
        }
        signal
    }

    fn name(&self) -> &'static str {
        "signature"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_request(ua: &str) -> Request {
        Request::new("test", "example.com", "/").with_user_agent(ua)
    }

    #[tokio::test]
    async fn test_gptbot_detection() {
        let matcher = SignatureMatcher::with_defaults();
        let result = matcher.analyze(&make_request("Mozilla/5.0 GPTBot/1.0")).await;

        assert!(result.is_bot);
        assert!(result.is_ai_bot);
        assert_eq!(result.bot_type.as_deref(), Some("GPTBot"));
        assert_eq!(result.action, SignalAction::Monitor);
        assert!((result.confidence - 0.95).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_case_insensitive_match() {
        let matcher = SignatureMatcher::with_defaults();
        let result = matcher.analyze(&make_request("ccbot/2.0 (https://commoncrawl.org)")).await;
        assert_eq!(result.bot_type.as_deref(), Some("CCBot"));
    }

    #[tokio::test]
    async fn test_malicious_blocks() {
        let matcher = SignatureMatcher::with_defaults();
        let result = matcher.analyze(&make_request("sqlmap/1.7")).await;
        assert_eq!(result.action, SignalAction::Block);
        assert!(!result.is_ai_bot);
    }

    #[tokio::test]
    async fn test_no_match() {
        let matcher = SignatureMatcher::with_defaults();
        let result = matcher
            .analyze(&make_request(
                "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 Chrome/120.0 Safari/537.36",
            ))
            .await;
        assert!(!result.is_bot);
        assert_eq!(result.confidence, 0.0);
        assert_eq!(result.bot_type, None);
    }

    #[test]
    fn test_first_match_wins() {
        let matcher = SignatureMatcher::new(vec![
            sig("special-crawler", "Special", "Acme", "ai_crawler", 0.9, None),
            sig("crawler", "Generic", "Unknown", "scraper", 0.5, None),
        ]);
        let found = matcher.identify("special-crawler/1.0").unwrap();
        assert_eq!(found.bot_name, "Special");
        let found = matcher.identify("other-crawler/1.0").unwrap();
        assert_eq!(found.bot_name, "Generic");
    }

    #[test]
    fn test_invalid_pattern_skipped() {
        let matcher = SignatureMatcher::new(vec![
            sig("(unclosed", "Broken", "x", "scraper", 0.5, None),
            sig("good", "Good", "x", "scraper", 0.5, None),
        ]);
        assert_eq!(matcher.len(), 1);
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("signatures.json");
        std::fs::write(
            &path,
            r#"[{"pattern": "AcmeBot", "bot_name": "AcmeBot", "company": "Acme",
                 "type": "ai_crawler", "base_confidence": 0.8, "suggested_rate": 0.02}]"#,
        )
        .unwrap();

        let matcher = SignatureMatcher::from_file(&path).unwrap();
        assert_eq!(matcher.len(), 1);
        assert_eq!(matcher.identify("acmebot/3").unwrap().suggested_rate, Some(0.02));

        let missing = SignatureMatcher::from_file(&dir.path().join("none.json")).unwrap();
        assert!(missing.len() > 10);
    }
}
