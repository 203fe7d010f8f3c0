//! Integration tests driving more than one component together through
//! their public APIs. Unit-level scenario coverage lives alongside each
//! module (`topic_store`, `buffer`, `extractor`); this file wires a real
//! `PostBuffer` to a real `Extractor` against a mocked provider, the way
//! `pipeline::Pipeline` wires them in production.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use serde_json::json;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use topicstream::buffer::{PostBatch, PostBuffer};
use topicstream::config::ExtractorConfig;
use topicstream::extractor::Extractor;
use topicstream::post::Post;

fn extractor_config(base_url: String) -> ExtractorConfig {
    ExtractorConfig {
        api_key: "sk-ant-test".into(),
        model: "claude-haiku-4-5-20251001".into(),
        base_url,
        max_retries: 2,
        initial_backoff_seconds: 0.01,
    }
}

fn post(id: &str, text: &str) -> Post {
    Post {
        id: id.to_string(),
        text: text.to_string(),
        created_at: Utc::now(),
        language: Some("de".to_string()),
        source: "wien.rocks".to_string(),
    }
}

fn tool_use_body(topics: serde_json::Value) -> serde_json::Value {
    json!({
        "content": [
            {"type": "tool_use", "name": "record_topics", "input": {"topics": topics}}
        ]
    })
}

/// S3 + S6 combined: a buffer's early flush (hitting `max_batch_size`)
/// hands a batch straight to a real `Extractor`, which tolerates one
/// transient provider failure before succeeding — mirroring the wiring
/// `Pipeline::new`'s `on_batch` closure performs in production, minus the
/// topic store / snapshot / post-log side effects this test isn't
/// exercising.
#[tokio::test(flavor = "multi_thread")]
async fn early_flush_feeds_a_real_extractor_that_recovers_from_one_failure() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .respond_with(ResponseTemplate::new(200).set_body_json(tool_use_body(json!([
            {"topic": "Donauinselfest", "score": 0.9, "count": 2}
        ]))))
        .mount(&server)
        .await;

    let extractor = Arc::new(Extractor::new(extractor_config(server.uri())));
    let extracted: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let flushes = Arc::new(AtomicUsize::new(0));

    let extractor_clone = Arc::clone(&extractor);
    let extracted_clone = Arc::clone(&extracted);
    let flushes_clone = Arc::clone(&flushes);

    let buffer = PostBuffer::new(
        3600,
        2,
        Arc::new(move |batch: PostBatch| {
            flushes_clone.fetch_add(1, Ordering::SeqCst);
            let extractor = Arc::clone(&extractor_clone);
            let extracted = Arc::clone(&extracted_clone);
            tokio::task::block_in_place(move || {
                tokio::runtime::Handle::current().block_on(async move {
                    let topics = extractor.extract(&batch).await;
                    let mut guard = extracted.lock().unwrap();
                    guard.extend(topics.into_iter().map(|t| t.topic));
                });
            });
        }),
    )
    .unwrap();
    buffer.start();

    buffer.add_post(post("1", "Heute Abend ist Donauinselfest in Wien!"));
    assert!(extracted.lock().unwrap().is_empty());

    buffer.add_post(post("2", "Wer kommt alles zum Donauinselfest?"));

    assert_eq!(flushes.load(Ordering::SeqCst), 1);
    assert_eq!(extracted.lock().unwrap().as_slice(), ["Donauinselfest"]);

    buffer.stop();
}

/// S6 exhaustion, driven through the same buffer-to-extractor wiring: a
/// provider that never recovers leaves the batch's topics empty, and the
/// buffer itself keeps accepting posts afterward.
#[tokio::test(flavor = "multi_thread")]
async fn early_flush_feeding_a_permanently_failing_extractor_drops_the_batch() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let extractor = Arc::new(Extractor::new(extractor_config(server.uri())));
    let extracted: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let extractor_clone = Arc::clone(&extractor);
    let extracted_clone = Arc::clone(&extracted);

    let buffer = PostBuffer::new(
        3600,
        1,
        Arc::new(move |batch: PostBatch| {
            let extractor = Arc::clone(&extractor_clone);
            let extracted = Arc::clone(&extracted_clone);
            tokio::task::block_in_place(move || {
                tokio::runtime::Handle::current().block_on(async move {
                    let topics = extractor.extract(&batch).await;
                    extracted.lock().unwrap().extend(topics.into_iter().map(|t| t.topic));
                });
            });
        }),
    )
    .unwrap();
    buffer.start();

    buffer.add_post(post("1", "Stau auf der Südosttangente"));
    assert!(extracted.lock().unwrap().is_empty());

    // the buffer is still alive and accepts further posts after a dropped batch
    buffer.add_post(post("2", "Noch mehr Stau"));
    buffer.stop();
    assert!(extracted.lock().unwrap().is_empty());
}
