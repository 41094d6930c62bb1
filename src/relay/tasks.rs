//! Async-task bindings.
//!
//! Video and long-running image jobs answer with an opaque `{id}`. The
//! binding row ties that id back to the originating channel, user and model
//! so polling can route to the same upstream and billing can reconcile when
//! the job reaches a terminal state.

use std::sync::Arc;

use serde_json::Value;

use crate::logger;
use crate::store::{Store, TaskBinding};

use super::error::{RelayError, RelayResult};
use super::meta::RelayMeta;

/// Upstream job states that end the binding's life.
const TERMINAL_STATUSES: &[&str] = &["completed", "succeeded", "failed", "cancelled", "expired"];

pub fn is_terminal_status(status: &str) -> bool {
    TERMINAL_STATUSES
        .iter()
        .any(|s| status.eq_ignore_ascii_case(s))
}

/// Extract the job id from a 2xx async-job response body.
pub fn task_id_from_response(body: &Value) -> Option<String> {
    body.get("id")
        .and_then(Value::as_str)
        .map(str::to_string)
        .or_else(|| {
            body.get("task_id")
                .and_then(Value::as_str)
                .map(str::to_string)
        })
}

/// Persist the binding for a freshly accepted job. Runs before the response
/// body is copied to the client so a poll can never race an absent row.
pub fn bind(
    store: &Arc<dyn Store>,
    meta: &RelayMeta,
    task_type: &str,
    task_id: &str,
    request_method: &str,
    request_params: &Value,
) -> RelayResult<()> {
    let binding = TaskBinding {
        task_id: task_id.to_string(),
        task_type: task_type.to_string(),
        channel_id: meta.channel_id,
        channel_type: meta.channel_type.id(),
        user_id: meta.user_id,
        token_id: meta.token_id,
        origin_model: meta.origin_model.clone(),
        actual_model: meta.actual_model.clone(),
        request_method: request_method.to_string(),
        request_path: meta.request_path.clone(),
        request_params: request_params.to_string(),
        created_at: chrono::Utc::now().timestamp(),
    };
    store.save_task_binding(&binding)?;
    logger::info(
        "tasks",
        &format!(
            "bound task {}: type={}, channel={}, model={}",
            task_id, task_type, meta.channel_id, meta.origin_model
        ),
    );
    Ok(())
}

/// Look up the binding a poll request refers to.
pub fn lookup(store: &Arc<dyn Store>, task_id: &str) -> RelayResult<TaskBinding> {
    store
        .task_binding(task_id)?
        .ok_or_else(|| RelayError::ModelNotAvailable(format!("unknown task id '{}'", task_id)))
}

/// Delete the binding once a poll observed a terminal status.
pub fn reconcile_terminal(store: &Arc<dyn Store>, task_id: &str, status: &str) {
    if !is_terminal_status(status) {
        return;
    }
    if let Err(e) = store.delete_task_binding(task_id) {
        logger::error(
            "tasks",
            &format!("failed to delete binding for task {}: {}", task_id, e),
        );
    } else {
        logger::info(
            "tasks",
            &format!("task {} reached terminal status {}", task_id, status),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::meta::{ApiType, ChannelType};
    use crate::store::MemStore;
    use serde_json::json;
    use std::time::Instant;

    fn meta() -> RelayMeta {
        RelayMeta {
            api_type: ApiType::OpenAI,
            channel_type: ChannelType::OpenAI,
            channel_id: 4,
            user_id: 2,
            token_id: 3,
            token_name: "t".into(),
            group: "default".into(),
            origin_model: "sora-2".into(),
            actual_model: "sora-2".into(),
            model_mapping: vec![],
            request_path: "/v1/videos".into(),
            is_stream: false,
            start_time: Instant::now(),
            prompt_tokens: 0,
            base_url: None,
            key: String::new(),
            group_ratio: 1.0,
            response_api_fallback: false,
            claude_conversion: false,
            claude_native: false,
            request_id: "req".into(),
            trace_id: "trace".into(),
        }
    }

    #[test]
    fn id_extraction() {
        assert_eq!(
            task_id_from_response(&json!({"id": "video_123"})),
            Some("video_123".into())
        );
        assert_eq!(
            task_id_from_response(&json!({"task_id": "t-9"})),
            Some("t-9".into())
        );
        assert_eq!(task_id_from_response(&json!({"status": "queued"})), None);
    }

    #[test]
    fn bind_lookup_reconcile_lifecycle() {
        let store: Arc<dyn Store> = Arc::new(MemStore::new());
        let meta = meta();
        let params = json!({"model": "sora-2", "prompt": "a dog"});
        bind(&store, &meta, "video", "video_123", "POST", &params).unwrap();

        let binding = lookup(&store, "video_123").unwrap();
        assert_eq!(binding.channel_id, 4);
        assert_eq!(binding.origin_model, "sora-2");
        assert_eq!(binding.request_params, params.to_string());

        // Non-terminal statuses leave the row alone.
        reconcile_terminal(&store, "video_123", "in_progress");
        assert!(lookup(&store, "video_123").is_ok());

        reconcile_terminal(&store, "video_123", "completed");
        assert!(lookup(&store, "video_123").is_err());
    }

    #[test]
    fn terminal_statuses() {
        assert!(is_terminal_status("completed"));
        assert!(is_terminal_status("FAILED"));
        assert!(!is_terminal_status("queued"));
        assert!(!is_terminal_status("in_progress"));
    }
}
