use async_trait::async_trait;
use serde_json::Value;

/// Seam between the connection core and message-handling collaborators.
///
/// The gateway session invokes this once per dispatch frame, in receipt
/// order, never concurrently for the same session. Implementations reply by
/// calling back into the outbound API client.
#[async_trait]
pub trait DispatchSink: Send + Sync {
    async fn on_event(&self, event_type: &str, event_data: Value);
}

/// Default sink: logs every event, with `READY` surfaced specially as the
/// first-class readiness signal.
pub struct LogSink;

#[async_trait]
impl DispatchSink for LogSink {
    async fn on_event(&self, event_type: &str, event_data: Value) {
        if event_type == "READY" {
            let username = event_data
                .pointer("/user/username")
                .and_then(Value::as_str)
                .unwrap_or("<unknown>");
            tracing::info!(username, "bot ready");
        } else {
            tracing::debug!(event = event_type, "dispatch event");
        }
    }
}
