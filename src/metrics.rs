//! Metrics seam.
//!
//! The gateway core emits typed events; the backing sink is an external
//! collaborator. The default recorder writes events through the logger.

use crate::logger;

#[derive(Debug, Clone)]
pub enum MetricEvent {
    RequestCompleted {
        model: String,
        channel_id: i64,
        user_id: i64,
        quota: i64,
        elapsed_ms: i64,
        is_stream: bool,
    },
    RequestFailed {
        model: String,
        channel_id: i64,
        status: u16,
    },
    /// Post-consume missed its deadline; pre-consumed units stay committed.
    BillingTimeout {
        user_id: i64,
        channel_id: i64,
        model: String,
        estimated_quota: i64,
        elapsed_ms: i64,
    },
}

pub trait Recorder: Send + Sync {
    fn emit(&self, event: MetricEvent);
}

/// Default sink: structured log lines.
pub struct LogRecorder;

impl Recorder for LogRecorder {
    fn emit(&self, event: MetricEvent) {
        match event {
            MetricEvent::RequestCompleted {
                model,
                channel_id,
                user_id,
                quota,
                elapsed_ms,
                is_stream,
            } => logger::info(
                "metrics",
                &format!(
                    "request completed: model={}, channel={}, user={}, quota={}, elapsed={}ms, stream={}",
                    model, channel_id, user_id, quota, elapsed_ms, is_stream
                ),
            ),
            MetricEvent::RequestFailed {
                model,
                channel_id,
                status,
            } => logger::warn(
                "metrics",
                &format!(
                    "request failed: model={}, channel={}, status={}",
                    model, channel_id, status
                ),
            ),
            MetricEvent::BillingTimeout {
                user_id,
                channel_id,
                model,
                estimated_quota,
                elapsed_ms,
            } => logger::critical(
                "metrics",
                "billing timeout",
                &serde_json::json!({
                    "user_id": user_id,
                    "channel_id": channel_id,
                    "model": model,
                    "estimated_quota": estimated_quota,
                    "elapsed_ms": elapsed_ms,
                }),
            ),
        }
    }
}

#[cfg(test)]
pub mod test_support {
    use super::*;
    use std::sync::Mutex;

    /// Captures events for assertions.
    #[derive(Default)]
    pub struct CapturingRecorder {
        pub events: Mutex<Vec<MetricEvent>>,
    }

    impl Recorder for CapturingRecorder {
        fn emit(&self, event: MetricEvent) {
            self.events.lock().unwrap().push(event);
        }
    }
}
