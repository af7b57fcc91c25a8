//! Error types for the decision engine.
//!
//! None of these reach the caller of [`DecisionEngine::evaluate`]; they are
//! recovered locally or folded into the result metadata.
//!
//! [`DecisionEngine::evaluate`]: crate::engine::DecisionEngine::evaluate

use thiserror::Error;

/// Errors raised by shared cache backends.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache backend unavailable: {0}")]
    Unavailable(String),
    #[error("cache operation timed out after {0}ms")]
    Timeout(u64),
    #[error("cache value could not be decoded: {0}")]
    Codec(#[from] serde_json::Error),
    #[error("operation against a key holding the wrong kind of value: {0}")]
    WrongType(String),
}

/// Errors raised by the rule-management collaborator.
#[derive(Debug, Clone, Error)]
pub enum RuleSourceError {
    #[error("rule source unavailable: {0}")]
    Unavailable(String),
    #[error("rule source timed out after {0}ms")]
    Timeout(u64),
    #[error("invalid rule data: {0}")]
    Invalid(String),
}

/// Errors surfaced inside the evaluation pipeline.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error(transparent)]
    RuleSource(#[from] RuleSourceError),
    #[error("evaluation deadline of {0}ms exceeded")]
    DeadlineExceeded(u64),
    #[error("internal error: {0}")]
    Internal(String),
}
