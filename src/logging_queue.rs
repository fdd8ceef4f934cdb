//! Background Log Queue: bounded, best-effort, single-consumer.
//!
//! Grounded on `cfx/background.py`'s `BackgroundTaskQueue` (bounded deque,
//! drop-and-warn on overflow, single worker that never dies on a failed
//! task) combined with `cfx/logger.py`'s sparse insert. The teacher's
//! `audit.rs` models the same "never let logging break the main flow" idiom
//! with a bare `tokio::spawn`; this replaces that with an actual bounded
//! channel so a slow store can't cause unbounded memory growth.

use std::sync::Arc;

use tokio::sync::mpsc::{self, error::TrySendError, Sender};

use crate::store::{RequestLogRecord, StoreAdapter};

const QUEUE_CAPACITY: usize = 1000;

#[derive(Clone)]
pub struct BackgroundLogQueue {
    sender: Sender<RequestLogRecord>,
}

impl BackgroundLogQueue {
    /// Records currently queued but not yet drained — used by `/metrics`.
    pub fn depth(&self) -> usize {
        QUEUE_CAPACITY - self.sender.capacity()
    }
}

impl BackgroundLogQueue {
    /// Spawn the single consumer task and return a handle for enqueueing.
    pub fn spawn(store: Arc<dyn StoreAdapter>) -> Self {
        let (sender, mut receiver) = mpsc::channel(QUEUE_CAPACITY);

        tokio::spawn(async move {
            while let Some(record) = receiver.recv().await {
                if let Err(err) = store.insert_request_log(&record).await {
                    tracing::warn!(error = %err, request_id = %record.request_id, "failed to persist request log");
                }
            }
            tracing::info!("background log queue worker exiting — sender dropped");
        });

        Self { sender }
    }

    /// Enqueue a log record. Drops it (with a warning) if the queue is at
    /// capacity rather than blocking the caller's request — logging must
    /// never add latency to the hot path.
    pub fn enqueue(&self, record: RequestLogRecord) {
        match self.sender.try_send(record) {
            Ok(()) => {}
            Err(TrySendError::Full(record)) => {
                tracing::warn!(request_id = %record.request_id, "log queue full, dropping record");
            }
            Err(TrySendError::Closed(record)) => {
                tracing::warn!(request_id = %record.request_id, "log queue worker gone, dropping record");
            }
        }
    }
}

/// Best-effort cost lookup. `None` for an unrecognized model, mirroring
/// `cfx/logger.py::calculate_cost`'s behavior for models outside its table.
// TODO: load this from a pricing config once one exists instead of a literal table.
pub fn calculate_cost(model: &str, prompt_tokens: i64, completion_tokens: i64) -> Option<f64> {
    let (input_per_million, output_per_million) = match model {
        "claude-3-5-sonnet-20241022" => (3.0, 15.0),
        "deepseek-chat" => (0.27, 1.10),
        "gpt-4o-mini" => (0.15, 0.60),
        _ => return None,
    };
    let cost = (prompt_tokens as f64 / 1_000_000.0) * input_per_million
        + (completion_tokens as f64 / 1_000_000.0) * output_per_million;
    Some(cost)
}

/// Pull token counts out of an OpenAI-shaped `usage` object, matching
/// `cfx/logger.py::extract_token_usage`.
pub fn extract_token_usage(body: &serde_json::Value) -> (Option<i64>, Option<i64>, Option<i64>) {
    let usage = body.get("usage");
    let prompt = usage.and_then(|u| u.get("prompt_tokens")).and_then(|v| v.as_i64());
    let completion = usage.and_then(|u| u.get("completion_tokens")).and_then(|v| v.as_i64());
    let total = usage.and_then(|u| u.get("total_tokens")).and_then(|v| v.as_i64());
    (prompt, completion, total)
}

/// Pull the incremental text out of one OpenAI-shaped streaming chunk, for
/// the fallback length estimator described in spec.md §4.10. Checks the
/// standard `choices[0].delta.content` streaming shape first, then falls
/// back to a bare top-level `content` key some upstreams emit directly.
pub fn extract_streaming_content(event: &serde_json::Value) -> Option<&str> {
    event
        .get("choices")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("delta"))
        .and_then(|d| d.get("content"))
        .and_then(|v| v.as_str())
        .or_else(|| event.get("content").and_then(|v| v.as_str()))
}

/// Rough 4-chars-per-token estimate used only to avoid a null cost column
/// when the upstream omits a `usage` block — never for quota decisions
/// (spec.md §9 Design Notes).
pub fn estimate_tokens_from_chars(char_count: usize) -> i64 {
    (char_count / 4) as i64
}

/// Sum of all message `content` lengths in a chat-completions request body,
/// used as the input side of the fallback estimator.
pub fn total_input_chars(body: &serde_json::Value) -> usize {
    body.get("messages")
        .and_then(|m| m.as_array())
        .map(|messages| {
            messages
                .iter()
                .filter_map(|m| m.get("content").and_then(|c| c.as_str()))
                .map(|c| c.len())
                .sum()
        })
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::fake::FakeStore;
    use chrono::Utc;
    use serde_json::json;
    use uuid::Uuid;

    fn sample_record() -> RequestLogRecord {
        RequestLogRecord {
            request_id: Uuid::new_v4(),
            user_id: Some(Uuid::new_v4()),
            api_key_id: Some(Uuid::new_v4()),
            session_id: None,
            stage: Some("plan".to_string()),
            model: Some("claude-3-5-sonnet-20241022".to_string()),
            status_code: 200,
            latency_ms: 42,
            prompt_tokens: Some(10),
            completion_tokens: Some(20),
            total_tokens: Some(30),
            cost_usd: calculate_cost("claude-3-5-sonnet-20241022", 10, 20),
            error: None,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn enqueued_record_reaches_the_store() {
        let store = Arc::new(FakeStore::new());
        let queue = BackgroundLogQueue::spawn(store.clone());

        queue.enqueue(sample_record());

        // Give the worker a moment to drain the channel.
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(store.logs.lock().unwrap().len(), 1);
    }

    #[test]
    fn unknown_model_has_no_cost() {
        assert_eq!(calculate_cost("unknown-model", 10, 10), None);
    }

    #[test]
    fn known_model_computes_cost() {
        assert!(calculate_cost("gpt-4o-mini", 1_000_000, 1_000_000).unwrap() > 0.0);
    }

    #[test]
    fn token_usage_extracted_from_openai_shape() {
        let body = json!({"usage": {"prompt_tokens": 5, "completion_tokens": 7, "total_tokens": 12}});
        assert_eq!(extract_token_usage(&body), (Some(5), Some(7), Some(12)));
    }

    #[test]
    fn token_usage_missing_is_none() {
        assert_eq!(extract_token_usage(&json!({})), (None, None, None));
    }

    #[test]
    fn streaming_content_extracted_from_delta_shape() {
        let event = json!({"choices": [{"delta": {"content": "hello"}}]});
        assert_eq!(extract_streaming_content(&event), Some("hello"));
    }

    #[test]
    fn streaming_content_falls_back_to_bare_content_key() {
        let event = json!({"content": "hi there"});
        assert_eq!(extract_streaming_content(&event), Some("hi there"));
    }

    #[test]
    fn streaming_content_absent_is_none() {
        assert_eq!(extract_streaming_content(&json!({"choices": [{}]})), None);
    }

    #[test]
    fn char_estimate_is_four_chars_per_token() {
        assert_eq!(estimate_tokens_from_chars(40), 10);
        assert_eq!(estimate_tokens_from_chars(3), 0);
    }

    #[test]
    fn input_chars_summed_across_messages() {
        let body = json!({"messages": [{"role": "user", "content": "hi"}, {"role": "user", "content": "there"}]});
        assert_eq!(total_input_chars(&body), 7);
    }
}
