//! LM client: opaque transport with a hard timeout, JSON-shape coercion,
//! truncation markers, and telemetry persistence.
//!
//! The engine never talks to a provider directly; it goes through
//! [`LmClient::call_json`], which persists one `llm_calls` row per exchange
//! whether the call succeeded or not.

pub mod http;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use serde_json::{json, Value};
use sqlx::SqlitePool;
use tracing::debug;

use crate::errors::ErrorCode;
use crate::telemetry::{record_llm_call, LlmCallRecord};
use crate::util::truncate_with_note;

pub use http::{HttpProvider, ProviderError, ProviderErrorKind};

/// Transport seam. Implementations send one prompt and return raw text.
#[async_trait]
pub trait LmProvider: Send + Sync {
    async fn complete(&self, prompt: &str) -> anyhow::Result<String>;
}

/// Per-call metadata persisted with the telemetry row.
#[derive(Debug, Clone, Default)]
pub struct CallMeta {
    pub plan_id: Option<String>,
    pub task_id: Option<String>,
    pub agent: String,
    pub scope: String,
    pub shared_prompt_version: Option<String>,
    pub shared_prompt_hash: Option<String>,
    pub agent_prompt_version: Option<String>,
    pub agent_prompt_hash: Option<String>,
    pub attempt: Option<i64>,
    pub review_attempt: Option<i64>,
    pub retry_reason: Option<String>,
}

/// One completed exchange: raw text plus parsed JSON or a classified error.
#[derive(Debug, Clone)]
pub struct LmExchange {
    pub llm_call_id: String,
    pub raw_text: String,
    pub parsed: Option<Value>,
    pub error_code: Option<ErrorCode>,
    pub error: Option<String>,
}

impl LmExchange {
    pub fn is_err(&self) -> bool {
        self.error_code.is_some()
    }
}

#[derive(Clone)]
pub struct LmClient {
    provider: Arc<dyn LmProvider>,
    timeout: Duration,
    max_prompt_chars: usize,
    max_response_chars: usize,
}

impl LmClient {
    pub fn new(
        provider: Arc<dyn LmProvider>,
        timeout: Duration,
        max_prompt_chars: usize,
        max_response_chars: usize,
    ) -> Self {
        Self {
            provider,
            timeout,
            max_prompt_chars,
            max_response_chars,
        }
    }

    /// Send a prompt, extract a JSON object from the response, and persist
    /// the telemetry row. Never returns a transport error as `Err`; failures
    /// are carried in the exchange so callers apply the §7 mapping table.
    pub async fn call_json(&self, pool: &SqlitePool, meta: &CallMeta, prompt: &str) -> LmExchange {
        let prompt_truncated = prompt.chars().count() > self.max_prompt_chars;
        let sent_prompt = if prompt_truncated {
            truncate_with_note(prompt, self.max_prompt_chars)
        } else {
            prompt.to_string()
        };

        let started_at_ts = unix_now();
        let outcome = tokio::time::timeout(self.timeout, self.provider.complete(&sent_prompt)).await;
        let finished_at_ts = unix_now();

        let (raw_text, error_code, error) = match outcome {
            Err(_) => (
                String::new(),
                Some(ErrorCode::LlmTimeout),
                Some(format!("LM call exceeded {}s", self.timeout.as_secs())),
            ),
            Ok(Err(e)) => {
                let code = classify_provider_error(&e);
                (String::new(), Some(code), Some(format!("{e:#}")))
            }
            Ok(Ok(text)) => (text, None, None),
        };

        let response_truncated = raw_text.chars().count() > self.max_response_chars;
        let stored_response = if response_truncated {
            truncate_with_note(&raw_text, self.max_response_chars)
        } else {
            raw_text.clone()
        };

        let (parsed, error_code, error) = if error_code.is_some() {
            (None, error_code, error)
        } else {
            match parse_json_response(&raw_text) {
                Ok(value) => (Some(value), None, None),
                Err(reason) => {
                    if looks_like_refusal(&raw_text) {
                        (None, Some(ErrorCode::LlmRefusal), Some("LM refusal".to_string()))
                    } else {
                        (
                            None,
                            Some(ErrorCode::LlmUnparseable),
                            Some(format!("UNPARSEABLE_JSON: {}", reason)),
                        )
                    }
                }
            }
        };

        let llm_call_id = record_llm_call(
            pool,
            &LlmCallRecord {
                plan_id: meta.plan_id.clone(),
                task_id: meta.task_id.clone(),
                agent: meta.agent.clone(),
                scope: meta.scope.clone(),
                started_at_ts: Some(started_at_ts),
                finished_at_ts: Some(finished_at_ts),
                shared_prompt_version: meta.shared_prompt_version.clone(),
                shared_prompt_hash: meta.shared_prompt_hash.clone(),
                agent_prompt_version: meta.agent_prompt_version.clone(),
                agent_prompt_hash: meta.agent_prompt_hash.clone(),
                prompt_text: sent_prompt,
                response_text: stored_response,
                parsed_json: parsed.clone(),
                normalized_json: None,
                validator_error: None,
                error_code: error_code.map(|c| c.as_str().to_string()),
                error_message: error.clone(),
                meta: Some(json!({
                    "attempt": meta.attempt,
                    "review_attempt": meta.review_attempt,
                    "retry_reason": meta.retry_reason,
                    "prompt_truncated": prompt_truncated,
                    "response_truncated": response_truncated,
                })),
            },
        )
        .await;

        debug!(
            agent = %meta.agent,
            scope = %meta.scope,
            error_code = error_code.map(|c| c.as_str()).unwrap_or("-"),
            "LM exchange recorded"
        );

        LmExchange {
            llm_call_id,
            raw_text,
            parsed,
            error_code,
            error,
        }
    }
}

fn unix_now() -> f64 {
    chrono::Utc::now().timestamp_millis() as f64 / 1000.0
}

fn classify_provider_error(error: &anyhow::Error) -> ErrorCode {
    match error.downcast_ref::<ProviderError>() {
        Some(p) if p.kind == ProviderErrorKind::Timeout => ErrorCode::LlmTimeout,
        _ => ErrorCode::LlmFailed,
    }
}

// =============================================================================
// JSON extraction
// =============================================================================

const REFUSAL_HINTS: &[&str] = &[
    "i can't help",
    "i can't comply",
    "i can't do that",
    "i can't assist",
    "i'm sorry",
    "cannot comply",
    "cannot assist",
    "refuse",
];

fn looks_like_refusal(text: &str) -> bool {
    let t = text.trim().to_lowercase();
    if t.is_empty() {
        return false;
    }
    // Curly apostrophes appear in some model refusals.
    let t = t.replace('\u{2019}', "'");
    REFUSAL_HINTS.iter().any(|hint| t.contains(hint))
}

/// Extract and parse a JSON object from model text that may carry fences,
/// surrounding prose, trailing commas, or stray control characters.
pub fn parse_json_response(text: &str) -> Result<Value, String> {
    let candidate = extract_json_object(text)?;

    // Fast path first; repairs only when plain parsing fails.
    if let Ok(value) = serde_json::from_str::<Value>(&candidate) {
        return require_object(value);
    }

    let cleaned = strip_control_chars(&candidate);
    if let Ok(value) = serde_json::from_str::<Value>(&cleaned) {
        return require_object(value);
    }

    let without_trailing_commas = strip_trailing_commas(&cleaned);
    serde_json::from_str::<Value>(&without_trailing_commas)
        .map_err(|e| e.to_string())
        .and_then(require_object)
}

fn require_object(value: Value) -> Result<Value, String> {
    if value.is_object() {
        Ok(value)
    } else {
        Err("parsed JSON is not an object".to_string())
    }
}

fn extract_json_object(text: &str) -> Result<String, String> {
    let trimmed = text.trim();
    if trimmed.starts_with('{') && trimmed.ends_with('}') {
        return Ok(trimmed.to_string());
    }

    // Fenced block first: ```json ... ``` or a bare fence.
    if let Some(start) = trimmed.find("```") {
        let after = &trimmed[start + 3..];
        let body_start = after.find('\n').map(|i| i + 1).unwrap_or(0);
        let body = &after[body_start..];
        if let Some(end) = body.find("```") {
            let inner = body[..end].trim();
            if inner.starts_with('{') && inner.ends_with('}') {
                return Ok(inner.to_string());
            }
        }
    }

    // Widest brace span in prose.
    let object_re = Regex::new(r"(?s)\{.*\}").expect("static regex");
    match object_re.find(trimmed) {
        Some(m) => Ok(m.as_str().to_string()),
        None => Err("response does not contain a JSON object".to_string()),
    }
}

fn strip_control_chars(text: &str) -> String {
    text.chars()
        .filter(|c| !c.is_control() || matches!(c, '\n' | '\r' | '\t'))
        .collect()
}

fn strip_trailing_commas(text: &str) -> String {
    let re = Regex::new(r",\s*([}\]])").expect("static regex");
    re.replace_all(text, "$1").into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bare_object() {
        let value = parse_json_response(r#"{"a": 1}"#).unwrap();
        assert_eq!(value["a"], 1);
    }

    #[test]
    fn test_parse_fenced_object() {
        let text = "Here is the result:\n```json\n{\"result_type\": \"NOOP\"}\n```\nDone.";
        let value = parse_json_response(text).unwrap();
        assert_eq!(value["result_type"], "NOOP");
    }

    #[test]
    fn test_parse_object_in_prose() {
        let text = "Sure! The answer is {\"total_score\": 92} as requested.";
        let value = parse_json_response(text).unwrap();
        assert_eq!(value["total_score"], 92);
    }

    #[test]
    fn test_parse_trailing_commas_repaired() {
        let text = r#"{"items": [1, 2, 3,], "last": true,}"#;
        let value = parse_json_response(text).unwrap();
        assert_eq!(value["items"].as_array().unwrap().len(), 3);
        assert_eq!(value["last"], true);
    }

    #[test]
    fn test_parse_control_chars_stripped() {
        let text = "{\"a\": \"x\u{0002}y\"}";
        let value = parse_json_response(text).unwrap();
        assert_eq!(value["a"], "xy");
    }

    #[test]
    fn test_non_object_rejected() {
        assert!(parse_json_response("[1, 2, 3]").is_err());
        assert!(parse_json_response("just words").is_err());
    }

    #[test]
    fn test_refusal_detection() {
        assert!(looks_like_refusal("I'm sorry, I can't help with that."));
        assert!(looks_like_refusal("I can\u{2019}t assist with this request"));
        assert!(!looks_like_refusal(r#"{"result_type": "NOOP"}"#));
        assert!(!looks_like_refusal(""));
    }

    mod client {
        use super::*;
        use crate::store::Store;

        struct FixedProvider(String);

        #[async_trait]
        impl LmProvider for FixedProvider {
            async fn complete(&self, _prompt: &str) -> anyhow::Result<String> {
                Ok(self.0.clone())
            }
        }

        struct SlowProvider;

        #[async_trait]
        impl LmProvider for SlowProvider {
            async fn complete(&self, _prompt: &str) -> anyhow::Result<String> {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(String::new())
            }
        }

        fn meta() -> CallMeta {
            CallMeta {
                agent: "xiaobo".to_string(),
                scope: "TASK_ACTION".to_string(),
                ..Default::default()
            }
        }

        #[tokio::test]
        async fn test_call_persists_row_and_parses() {
            let store = Store::open_in_memory().await.unwrap();
            let client = LmClient::new(
                Arc::new(FixedProvider(r#"{"result_type": "NOOP"}"#.to_string())),
                Duration::from_secs(5),
                10_000,
                10_000,
            );
            let exchange = client.call_json(store.pool(), &meta(), "do the thing").await;
            assert!(!exchange.is_err());
            assert_eq!(exchange.parsed.unwrap()["result_type"], "NOOP");

            let rows: i64 = sqlx::query_scalar("SELECT COUNT(1) FROM llm_calls")
                .fetch_one(store.pool())
                .await
                .unwrap();
            assert_eq!(rows, 1);
        }

        #[tokio::test]
        async fn test_timeout_maps_to_llm_timeout() {
            let store = Store::open_in_memory().await.unwrap();
            tokio::time::pause();
            let client = LmClient::new(
                Arc::new(SlowProvider),
                Duration::from_secs(1),
                10_000,
                10_000,
            );
            let exchange = client.call_json(store.pool(), &meta(), "slow").await;
            assert_eq!(exchange.error_code, Some(ErrorCode::LlmTimeout));
        }

        #[tokio::test]
        async fn test_unparseable_persisted_with_raw_response() {
            let store = Store::open_in_memory().await.unwrap();
            let client = LmClient::new(
                Arc::new(FixedProvider("no json here at all".to_string())),
                Duration::from_secs(5),
                10_000,
                10_000,
            );
            let exchange = client.call_json(store.pool(), &meta(), "x").await;
            assert_eq!(exchange.error_code, Some(ErrorCode::LlmUnparseable));

            let stored: String = sqlx::query_scalar("SELECT response_text FROM llm_calls")
                .fetch_one(store.pool())
                .await
                .unwrap();
            assert_eq!(stored, "no json here at all");
        }

        #[tokio::test]
        async fn test_prompt_truncation_marker() {
            let store = Store::open_in_memory().await.unwrap();
            let client = LmClient::new(
                Arc::new(FixedProvider(r#"{"ok": true}"#.to_string())),
                Duration::from_secs(5),
                50,
                10_000,
            );
            let long_prompt = "x".repeat(500);
            client.call_json(store.pool(), &meta(), &long_prompt).await;

            let (prompt, meta_json): (String, String) =
                sqlx::query_as("SELECT prompt_text, meta_json FROM llm_calls")
                    .fetch_one(store.pool())
                    .await
                    .unwrap();
            assert!(prompt.ends_with("(truncated)"));
            let meta: Value = serde_json::from_str(&meta_json).unwrap();
            assert_eq!(meta["prompt_truncated"], true);
        }
    }
}
