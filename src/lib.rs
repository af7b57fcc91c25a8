//! Request classification and monetization engine for AI-crawler traffic.
//!
//! Classifies inbound HTTP requests as human or automated and turns the
//! classification plus a tenant's rules into an access/pricing decision.
//!
//! # Pipeline
//!
//! - Detectors: user-agent signatures, additive heuristics, per-client
//!   behavior windows, header fingerprints, proof-of-work verification
//! - Aggregation into one [`DetectionResult`]
//! - Cached tenant rules, AND-combined conditions, per-type action resolution
//! - Pricing with discount stacking
//! - Asynchronous audit emission
//!
//! # Example
//!
//! ```ignore
//! use paycrawl_engine::{DecisionEngine, EngineConfig, Request, StaticRuleSource};
//! use std::sync::Arc;
//!
//! let source = Arc::new(StaticRuleSource::from_file("rules.json".as_ref(), "tenant-1")?);
//! let engine = DecisionEngine::new(EngineConfig::default(), source);
//!
//! let request = Request::new("req-1", "example.com", "/article")
//!     .with_user_agent("Mozilla/5.0 GPTBot/1.0");
//! let result = engine.evaluate("tenant-1", &request).await;
//! ```

pub mod audit;
pub mod cache;
pub mod challenge;
pub mod config;
pub mod detectors;
pub mod engine;
pub mod error;
pub mod metrics;
pub mod request;
pub mod rules;
pub mod score;

#[cfg(test)]
mod test_support;

pub use config::EngineConfig;
pub use detectors::{DetectionSignal, SignalAction, SignatureMatcher};
pub use engine::{DecisionEngine, EvaluationResult, MatchedRule};
pub use error::{CacheError, EngineError, RuleSourceError};
pub use request::Request;
pub use rules::{Rule, RuleSource, RuleStore, StaticRuleSource};
pub use score::{DetectionAggregator, DetectionResult};
