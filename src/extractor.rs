//! Batch extraction client (§4.G): turns a [`PostBatch`] into a list of
//! [`ExtractedTopic`] via a single Anthropic Messages API tool-use call,
//! with bounded exponential-backoff retry and drop-batch-on-exhaustion.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::buffer::PostBatch;
use crate::config::ExtractorConfig;

/// One row of the LLM's `record_topics` tool call, validated and clamped.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExtractedTopic {
    pub topic: String,
    pub score: f64,
    pub count: u64,
}

const SYSTEM_PROMPT: &str = "You are a trend-spotting assistant. From the following numbered posts, \
which are mostly German, extract specific trending topic noun phrases 1-4 words long about a named \
locality. Do not invent topics that are not present in the text. Prefer concrete terms over broad \
categories like 'politics' or 'weather'. Return an empty list if no clear topics stand out.";

fn record_topics_tool() -> Value {
    json!({
        "name": "record_topics",
        "description": "Record the trending topics extracted from the batch of posts.",
        "input_schema": {
            "type": "object",
            "properties": {
                "topics": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": {
                            "topic": {"type": "string"},
                            "score": {"type": "number"},
                            "count": {"type": "integer"}
                        },
                        "required": ["topic", "score", "count"]
                    }
                }
            },
            "required": ["topics"]
        }
    })
}

#[derive(Debug)]
enum CallOutcome {
    Topics(Vec<ExtractedTopic>),
    ProviderError(String),
    ParseError(String),
}

/// Extracts trending topics from a batch of posts via the LLM provider.
pub struct Extractor {
    http: reqwest::Client,
    config: ExtractorConfig,
}

impl Extractor {
    pub fn new(config: ExtractorConfig) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .expect("failed to build extractor HTTP client");
        Self { http, config }
    }

    /// Extract topics from `batch`. An empty batch short-circuits to an
    /// empty result without making an API call. On exhaustion of
    /// `max_retries`, the batch is dropped (returns an empty list); the
    /// caller is responsible for recording the failed-batch metric.
    pub async fn extract(&self, batch: &PostBatch) -> Vec<ExtractedTopic> {
        if batch.posts.is_empty() {
            return Vec::new();
        }

        let message = build_message(batch);
        let mut backoff = Duration::from_secs_f64(self.config.initial_backoff_seconds);

        for attempt in 0..=self.config.max_retries {
            match self.call_once(&message).await {
                CallOutcome::Topics(topics) => return topics,
                CallOutcome::ProviderError(msg) | CallOutcome::ParseError(msg) => {
                    if attempt == self.config.max_retries {
                        tracing::warn!(
                            attempts = attempt + 1,
                            error = %msg,
                            "extractor exhausted retries; dropping batch"
                        );
                        return Vec::new();
                    }
                    tracing::warn!(
                        attempt = attempt + 1,
                        max_retries = self.config.max_retries,
                        error = %msg,
                        backoff_secs = backoff.as_secs_f64(),
                        "extractor call failed, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                }
            }
        }
        Vec::new()
    }

    async fn call_once(&self, message: &str) -> CallOutcome {
        let body = json!({
            "model": self.config.model,
            "max_tokens": 1024,
            "system": SYSTEM_PROMPT,
            "tools": [record_topics_tool()],
            "tool_choice": {"type": "tool", "name": "record_topics"},
            "messages": [{"role": "user", "content": message}],
        });

        let resp = match self
            .http
            .post(format!("{}/v1/messages", self.config.base_url))
            .header("x-api-key", &self.config.api_key)
            .header("anthropic-version", "2023-06-01")
            .json(&body)
            .send()
            .await
        {
            Ok(r) => r,
            Err(e) => return CallOutcome::ProviderError(e.to_string()),
        };

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return CallOutcome::ProviderError(format!("provider returned {}: {}", status, text));
        }

        let value: Value = match resp.json().await {
            Ok(v) => v,
            Err(e) => return CallOutcome::ParseError(e.to_string()),
        };

        parse_tool_response(&value)
    }
}

/// Build the `"[i] {text}"`-numbered message body for a batch, in the
/// order posts were appended (§4.G).
fn build_message(batch: &PostBatch) -> String {
    batch
        .posts
        .iter()
        .enumerate()
        .map(|(i, post)| format!("[{}] {}", i + 1, post.text))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Parse a `record_topics` tool-use response: strict at the top level
/// (must find the tool call and a `topics` array), lenient per-row
/// (invalid rows are skipped with a warning, valid ones keep their
/// order).
fn parse_tool_response(value: &Value) -> CallOutcome {
    let content = match value.get("content").and_then(Value::as_array) {
        Some(c) => c,
        None => return CallOutcome::ParseError("response missing content array".into()),
    };

    let tool_input = content.iter().find_map(|block| {
        if block.get("type").and_then(Value::as_str) == Some("tool_use")
            && block.get("name").and_then(Value::as_str) == Some("record_topics")
        {
            block.get("input")
        } else {
            None
        }
    });

    let Some(input) = tool_input else {
        return CallOutcome::ParseError("no record_topics tool_use block found".into());
    };

    let Some(rows) = input.get("topics").and_then(Value::as_array) else {
        return CallOutcome::ParseError("tool input missing topics array".into());
    };

    let mut topics = Vec::with_capacity(rows.len());
    for row in rows {
        match parse_row(row) {
            Some(t) => topics.push(t),
            None => tracing::warn!(row = %row, "skipping invalid extracted-topic row"),
        }
    }
    CallOutcome::Topics(topics)
}

fn parse_row(row: &Value) -> Option<ExtractedTopic> {
    let topic = row.get("topic")?.as_str()?.trim().to_string();
    if topic.is_empty() {
        return None;
    }
    let score = coerce_f64(row.get("score")?)?.clamp(0.0, 1.0);
    let count = coerce_i64(row.get("count")?)?.max(0) as u64;
    Some(ExtractedTopic { topic, score, count })
}

fn coerce_f64(v: &Value) -> Option<f64> {
    v.as_f64().or_else(|| v.as_str().and_then(|s| s.parse().ok()))
}

fn coerce_i64(v: &Value) -> Option<i64> {
    v.as_i64().or_else(|| v.as_str().and_then(|s| s.parse().ok()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::post::Post;
    use chrono::Utc;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn cfg(base_url: String) -> ExtractorConfig {
        ExtractorConfig {
            api_key: "sk-ant-test".into(),
            model: "claude-haiku-4-5-20251001".into(),
            base_url,
            max_retries: 2,
            initial_backoff_seconds: 0.01,
        }
    }

    fn post(text: &str) -> Post {
        Post {
            id: "1".into(),
            text: text.into(),
            created_at: Utc::now(),
            language: None,
            source: "a".into(),
        }
    }

    fn batch(posts: Vec<Post>) -> PostBatch {
        let now = Utc::now();
        PostBatch {
            posts,
            window_start: now,
            window_end: now,
            source: "a".into(),
        }
    }

    #[test]
    fn empty_batch_produces_empty_message() {
        let b = batch(vec![post("a"), post("b")]);
        assert_eq!(build_message(&b), "[1] a\n[2] b");
    }

    #[tokio::test]
    async fn empty_batch_skips_the_api_call() {
        let extractor = Extractor::new(cfg("http://localhost:1".into()));
        let result = extractor.extract(&batch(vec![])).await;
        assert!(result.is_empty());
    }

    fn tool_use_body(topics: Value) -> Value {
        json!({
            "content": [
                {"type": "tool_use", "name": "record_topics", "input": {"topics": topics}}
            ]
        })
    }

    /// S6 — provider errors once, succeeds on the second attempt.
    #[tokio::test]
    async fn s6_retries_then_succeeds() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .and(header("x-api-key", "sk-ant-test"))
            .respond_with(ResponseTemplate::new(500))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .respond_with(ResponseTemplate::new(200).set_body_json(tool_use_body(json!([
                {"topic": "Donauinselfest", "score": 0.8, "count": 3}
            ]))))
            .mount(&server)
            .await;

        let extractor = Extractor::new(cfg(server.uri()));
        let result = extractor.extract(&batch(vec![post("hi")])).await;
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].topic, "Donauinselfest");
    }

    #[tokio::test]
    async fn exhausted_retries_drops_the_batch() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let extractor = Extractor::new(cfg(server.uri()));
        let result = extractor.extract(&batch(vec![post("hi")])).await;
        assert!(result.is_empty());
    }

    #[test]
    fn parse_row_clamps_score_and_count() {
        let row = json!({"topic": "  wien  ", "score": 1.5, "count": -4});
        let parsed = parse_row(&row).unwrap();
        assert_eq!(parsed.topic, "wien");
        assert_eq!(parsed.score, 1.0);
        assert_eq!(parsed.count, 0);
    }

    #[test]
    fn parse_row_rejects_empty_topic() {
        let row = json!({"topic": "   ", "score": 0.5, "count": 1});
        assert!(parse_row(&row).is_none());
    }

    #[test]
    fn parse_tool_response_skips_invalid_rows_keeps_valid() {
        let resp = tool_use_body(json!([
            {"topic": "", "score": 0.5, "count": 1},
            {"topic": "Valid", "score": 0.5, "count": 1}
        ]));
        match parse_tool_response(&resp) {
            CallOutcome::Topics(topics) => {
                assert_eq!(topics.len(), 1);
                assert_eq!(topics[0].topic, "Valid");
            }
            other => panic!("expected Topics, got {:?}", other),
        }
    }
}
