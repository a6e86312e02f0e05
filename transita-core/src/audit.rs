use async_trait::async_trait;
use std::sync::Mutex;
use transita_shared::models::events::AuditEvent;

/// Where the engine reports what it did. Publishing is best-effort:
/// implementations log their own failures and never fail the caller.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn publish(&self, event: AuditEvent);
}

/// Writes events as structured log lines.
#[derive(Debug, Default)]
pub struct TracingAuditSink;

#[async_trait]
impl AuditSink for TracingAuditSink {
    async fn publish(&self, event: AuditEvent) {
        match serde_json::to_string(&event) {
            Ok(payload) => tracing::info!(topic = event.topic(), key = %event.key(), %payload, "audit event"),
            Err(e) => tracing::warn!(topic = event.topic(), "failed to serialize audit event: {}", e),
        }
    }
}

/// Keeps events in memory so callers can assert on them.
#[derive(Debug, Default)]
pub struct RecordingAuditSink {
    events: Mutex<Vec<AuditEvent>>,
}

impl RecordingAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn count_topic(&self, topic: &str) -> usize {
        self.events().iter().filter(|e| e.topic() == topic).count()
    }
}

#[async_trait]
impl AuditSink for RecordingAuditSink {
    async fn publish(&self, event: AuditEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}
