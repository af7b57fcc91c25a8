//! Audit event emission.
//!
//! Events are handed to a background worker over an unbounded channel, so
//! submitting never blocks or fails the decision path. Events that cannot be
//! queued are logged and dropped.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// One evaluation, as recorded for the tenant's audit trail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub tenant_id: String,
    pub request_id: String,
    pub domain: String,
    pub matched: bool,
    pub matched_rule_count: usize,
    pub evaluation_time_ms: f64,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub action: Option<String>,
    #[serde(default)]
    pub price: Option<f64>,
    #[serde(default)]
    pub bot_type: Option<String>,
}

/// Destination for audit events.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, event: AuditEvent) -> anyhow::Result<()>;
}

/// Writes events as structured logs on the `audit` target.
#[derive(Debug, Default)]
pub struct TracingAuditSink;

#[async_trait]
impl AuditSink for TracingAuditSink {
    async fn record(&self, event: AuditEvent) -> anyhow::Result<()> {
        info!(
            target: "audit",
            tenant_id = %event.tenant_id,
            request_id = %event.request_id,
            domain = %event.domain,
            matched = event.matched,
            matched_rule_count = event.matched_rule_count,
            evaluation_time_ms = event.evaluation_time_ms,
            action = event.action.as_deref().unwrap_or("none"),
            price = event.price,
            bot_type = event.bot_type.as_deref(),
            "evaluation"
        );
        Ok(())
    }
}

/// Keeps events in memory. Useful for tests and embedding callers that
/// persist events themselves.
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    events: Mutex<Vec<AuditEvent>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl AuditSink for MemoryAuditSink {
    async fn record(&self, event: AuditEvent) -> anyhow::Result<()> {
        self.events
            .lock()
            .map_err(|_| anyhow::anyhow!("audit buffer poisoned"))?
            .push(event);
        Ok(())
    }
}

/// Background audit emitter.
pub struct AuditEmitter {
    tx: Mutex<Option<mpsc::UnboundedSender<AuditEvent>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    dropped: Arc<AtomicU64>,
    drain_on_shutdown: bool,
}

impl AuditEmitter {
    /// Spawn the worker. Must be called inside a Tokio runtime.
    pub fn spawn(sink: Arc<dyn AuditSink>, drain_on_shutdown: bool) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<AuditEvent>();
        let dropped = Arc::new(AtomicU64::new(0));
        let worker_dropped = Arc::clone(&dropped);

        let worker = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let request_id = event.request_id.clone();
                if let Err(e) = sink.record(event).await {
                    worker_dropped.fetch_add(1, Ordering::Relaxed);
                    error!(request_id = %request_id, error = %e, "Audit sink rejected event");
                }
            }
            debug!("Audit worker stopped");
        });

        Self {
            tx: Mutex::new(Some(tx)),
            worker: Mutex::new(Some(worker)),
            dropped,
            drain_on_shutdown,
        }
    }

    /// Queue an event. Never blocks; failures are logged and counted.
    pub fn submit(&self, event: AuditEvent) {
        let sent = match self.tx.lock() {
            Ok(guard) => match guard.as_ref() {
                Some(tx) => tx.send(event).map_err(|e| e.0.request_id),
                None => Err(event.request_id),
            },
            Err(_) => Err(event.request_id),
        };

        if let Err(request_id) = sent {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            warn!(request_id = %request_id, "Audit emitter closed, event dropped");
        }
    }

    /// Events lost to sink errors or a closed emitter.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Stop accepting events. Queued events are delivered first when
    /// draining is enabled, otherwise discarded.
    pub async fn shutdown(&self) {
        let tx = self.tx.lock().ok().and_then(|mut guard| guard.take());
        drop(tx);

        let worker = self.worker.lock().ok().and_then(|mut guard| guard.take());
        if let Some(worker) = worker {
            if self.drain_on_shutdown {
                if let Err(e) = worker.await {
                    warn!(error = %e, "Audit worker ended abnormally");
                }
            } else {
                worker.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::CapturedLogs;

    fn event(id: &str) -> AuditEvent {
        AuditEvent {
            tenant_id: "t1".to_string(),
            request_id: id.to_string(),
            domain: "example.com".to_string(),
            matched: true,
            matched_rule_count: 1,
            evaluation_time_ms: 0.4,
            timestamp: Utc::now(),
            action: None,
            price: None,
            bot_type: None,
        }
    }

    #[tokio::test]
    async fn test_drain_on_shutdown() {
        let sink = Arc::new(MemoryAuditSink::new());
        let emitter = AuditEmitter::spawn(sink.clone(), true);

        for i in 0..50 {
            emitter.submit(event(&format!("r{}", i)));
        }
        emitter.shutdown().await;

        assert_eq!(sink.events().len(), 50);
        assert_eq!(emitter.dropped(), 0);
    }

    #[tokio::test]
    async fn test_submit_after_shutdown_is_dropped() {
        let sink = Arc::new(MemoryAuditSink::new());
        let emitter = AuditEmitter::spawn(sink.clone(), true);
        emitter.shutdown().await;

        emitter.submit(event("late"));
        assert_eq!(emitter.dropped(), 1);
        assert!(sink.events().is_empty());
    }

    struct FailingSink;

    #[async_trait]
    impl AuditSink for FailingSink {
        async fn record(&self, _: AuditEvent) -> anyhow::Result<()> {
            anyhow::bail!("sink offline")
        }
    }

    #[tokio::test]
    async fn test_sink_errors_are_swallowed() {
        let emitter = AuditEmitter::spawn(Arc::new(FailingSink), true);
        emitter.submit(event("r1"));
        emitter.submit(event("r2"));
        emitter.shutdown().await;
        assert_eq!(emitter.dropped(), 2);
    }

    struct RejectingSink;

    #[async_trait]
    impl AuditSink for RejectingSink {
        async fn record(&self, _: AuditEvent) -> anyhow::Result<()> {
            anyhow::bail!("sink offline")
        }
    }

    #[tokio::test]
    async fn test_sink_failure_logs_at_error() {
        let (logs, _guard) = CapturedLogs::install();
        let emitter = AuditEmitter::spawn(Arc::new(RejectingSink), true);

        emitter.submit(event("r1"));
        emitter.shutdown().await;

        assert_eq!(emitter.dropped(), 1);
        let line = logs.line_with("Audit sink rejected event").unwrap();
        assert!(line.contains("ERROR"), "{line}");
    }
}
