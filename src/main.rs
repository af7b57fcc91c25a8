//! Paycrawl decision engine CLI
//!
//! Evaluates a stream of JSON-lines requests against a tenant's rules and
//! prints one JSON evaluation result per line.

use anyhow::{Context, Result};
use clap::Parser;
use paycrawl_engine::{DecisionEngine, EngineConfig, Request, SignatureMatcher, StaticRuleSource};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{error, info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "paycrawl-engine")]
#[command(author, version, about = "Classify crawler traffic and price it per tenant rules")]
struct Args {
    /// Rules file (JSON): a rule list, or a map of tenant id to rule list
    #[arg(short, long)]
    rules: PathBuf,

    /// Requests file, one JSON request per line ("-" for stdin)
    #[arg(long, default_value = "-")]
    requests: String,

    /// Tenant to evaluate requests for
    #[arg(short, long)]
    tenant: String,

    /// Path to configuration file (JSON or YAML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Path to signature table (JSON); built-in table if omitted
    #[arg(long)]
    signatures: Option<PathBuf>,

    /// Enable JSON logging format
    #[arg(long)]
    json_logs: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn init_logging(json: bool, level: &str) {
    let level = match level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let env_filter = EnvFilter::from_default_env().add_directive(level.into());

    // Results go to stdout, so logs go to stderr.
    if json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

fn load_config(path: &Path) -> Result<EngineConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("reading config {}", path.display()))?;
    let config: EngineConfig = if path.extension().is_some_and(|e| e == "yaml" || e == "yml") {
        serde_yaml::from_str(&content)?
    } else {
        serde_json::from_str(&content)?
    };
    config
        .validate()
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok(config)
}

#[cfg(feature = "redis-cache")]
async fn shared_cache(
    config: &EngineConfig,
) -> Result<Option<Arc<dyn paycrawl_engine::cache::SharedCache>>> {
    match &config.cache.redis_url {
        Some(url) => {
            let cache = paycrawl_engine::cache::redis::RedisSharedCache::connect(url).await?;
            info!(url = %url, "Using Redis shared cache");
            Ok(Some(Arc::new(cache)))
        }
        None => Ok(None),
    }
}

#[cfg(not(feature = "redis-cache"))]
async fn shared_cache(
    config: &EngineConfig,
) -> Result<Option<Arc<dyn paycrawl_engine::cache::SharedCache>>> {
    if config.cache.redis_url.is_some() {
        tracing::warn!("redis_url set but built without the redis-cache feature; using in-process cache");
    }
    Ok(None)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(args.json_logs, &args.log_level);

    let config = match &args.config {
        Some(path) => load_config(path)?,
        None => EngineConfig::default(),
    };

    let source = StaticRuleSource::from_file(&args.rules, &args.tenant)
        .with_context(|| format!("loading rules {}", args.rules.display()))?;
    let signatures = match &args.signatures {
        Some(path) => SignatureMatcher::from_file(path)?,
        None => SignatureMatcher::with_defaults(),
    };

    let mut builder = DecisionEngine::builder(Arc::new(source))
        .config(config.clone())
        .signatures(signatures);
    if let Some(cache) = shared_cache(&config).await? {
        builder = builder.shared_cache(cache);
    }
    let engine = builder.build();

    let input: Box<dyn tokio::io::AsyncRead + Unpin + Send> = if args.requests == "-" {
        Box::new(tokio::io::stdin())
    } else {
        Box::new(
            tokio::fs::File::open(&args.requests)
                .await
                .with_context(|| format!("opening requests {}", args.requests))?,
        )
    };

    let mut lines = BufReader::new(input).lines();
    let mut stdout = tokio::io::stdout();
    let mut line_no = 0usize;

    while let Some(line) = lines.next_line().await? {
        line_no += 1;
        if line.trim().is_empty() {
            continue;
        }

        let request: Request = match serde_json::from_str(&line) {
            Ok(r) => r,
            Err(e) => {
                error!(line = line_no, error = %e, "Skipping malformed request");
                continue;
            }
        };

        let result = engine.evaluate(&args.tenant, &request).await;
        let mut encoded = serde_json::to_vec(&result)?;
        encoded.push(b'\n');
        stdout.write_all(&encoded).await?;
    }
    stdout.flush().await?;

    engine.shutdown().await;
    let metrics = engine.metrics();
    info!(
        evaluations = metrics.evaluations,
        matched = metrics.matched,
        errors = metrics.errors,
        rule_cache_hits = metrics.rule_cache_hits,
        "Done"
    );

    Ok(())
}
