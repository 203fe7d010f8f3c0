//! Microblog REST-poll datasource (§4.C): polls the local public
//! timeline on an interval, maintaining a monotonically increasing
//! `since_id` cursor.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;

use super::build_post;
use crate::errors::Result;
use crate::post::{Datasource, OnError, OnPost};

#[derive(Debug, Deserialize)]
struct StatusPayload {
    id: Option<String>,
    content: Option<String>,
    created_at: Option<String>,
    #[serde(default)]
    language: Option<String>,
    #[serde(default)]
    sensitive: bool,
    #[serde(default)]
    reblog: Option<serde_json::Value>,
}

/// Fields shared with the spawned poll-loop task, held behind `Arc` so
/// `start()` can hand out a clone instead of reaching for an unsafe
/// lifetime extension of `&self`.
struct Shared {
    instance_url: String,
    access_token: String,
    source_id: String,
    poll_interval: Duration,
    http: reqwest::Client,
    since_id: Mutex<Option<String>>,
}

impl Shared {
    async fn poll_once(&self, on_post: &OnPost, on_error: &Option<OnError>) {
        let mut url = format!(
            "{}/api/v1/timelines/public?local=true",
            self.instance_url.trim_end_matches('/')
        );
        let since = self.since_id.lock().await.clone();
        if let Some(since_id) = &since {
            url.push_str(&format!("&since_id={}", since_id));
        }

        let response = match self.http.get(&url).bearer_auth(&self.access_token).send().await {
            Ok(r) => r,
            Err(e) => {
                if let Some(cb) = on_error {
                    cb(anyhow::anyhow!("poll request failed: {}", e));
                }
                return;
            }
        };

        if !response.status().is_success() {
            if let Some(cb) = on_error {
                cb(anyhow::anyhow!("poll returned status {}", response.status()));
            }
            return;
        }

        let payloads: Vec<StatusPayload> = match response.json().await {
            Ok(p) => p,
            Err(e) => {
                if let Some(cb) = on_error {
                    cb(anyhow::anyhow!("failed to decode poll response: {}", e));
                }
                return;
            }
        };

        // The API returns newest-first; emit chronologically.
        let mut newest_id: Option<String> = None;
        for payload in payloads.into_iter().rev() {
            let Some(id) = payload.id.clone() else { continue };
            newest_id = Some(id);

            if payload.reblog.is_some() || payload.sensitive {
                continue;
            }
            let Some(content) = payload.content else { continue };
            let created_at = payload
                .created_at
                .as_deref()
                .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                .map(|dt| dt.with_timezone(&Utc))
                .unwrap_or_else(Utc::now);

            if let Some(post) = build_post(
                payload.id.unwrap_or_default(),
                &content,
                created_at,
                payload.language,
                self.source_id.clone(),
            ) {
                on_post(post);
            }
        }

        if let Some(id) = newest_id {
            *self.since_id.lock().await = Some(id);
        }
    }
}

pub struct MicroblogPollDatasource {
    shared: Arc<Shared>,
    running: Arc<AtomicBool>,
    stop_notify: Arc<Notify>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl MicroblogPollDatasource {
    pub fn new(instance_url: String, access_token: String, poll_interval_seconds: u64) -> Self {
        let host = instance_url
            .trim_start_matches("https://")
            .trim_start_matches("http://")
            .trim_end_matches('/')
            .to_string();
        Self {
            shared: Arc::new(Shared {
                instance_url,
                access_token,
                source_id: format!("microblog:{}", host),
                poll_interval: Duration::from_secs(poll_interval_seconds),
                http: reqwest::Client::builder()
                    .timeout(Duration::from_secs(30))
                    .build()
                    .expect("failed to build HTTP client"),
                since_id: Mutex::new(None),
            }),
            running: Arc::new(AtomicBool::new(false)),
            stop_notify: Arc::new(Notify::new()),
            task: Mutex::new(None),
        }
    }

    /// Seed the cursor from the post log on startup (§4.C "optionally
    /// seeded from the post log on startup").
    pub async fn seed_since_id(&self, id: Option<String>) {
        *self.shared.since_id.lock().await = id;
    }

    #[cfg(test)]
    async fn poll_once(&self, on_post: &OnPost, on_error: &Option<OnError>) {
        self.shared.poll_once(on_post, on_error).await;
    }

    #[cfg(test)]
    async fn since_id(&self) -> Option<String> {
        self.shared.since_id.lock().await.clone()
    }
}

#[async_trait]
impl Datasource for MicroblogPollDatasource {
    fn source_id(&self) -> &str {
        &self.shared.source_id
    }

    async fn start(&self, on_post: OnPost, on_error: Option<OnError>) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let shared = Arc::clone(&self.shared);
        let running = Arc::clone(&self.running);
        let stop_notify = Arc::clone(&self.stop_notify);

        let handle = tokio::spawn(async move {
            while running.load(Ordering::SeqCst) {
                shared.poll_once(&on_post, &on_error).await;
                tokio::select! {
                    _ = tokio::time::sleep(shared.poll_interval) => {},
                    _ = stop_notify.notified() => break,
                }
            }
        });
        *self.task.lock().await = Some(handle);
        Ok(())
    }

    async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.stop_notify.notify_waiters();
        if let Some(handle) = self.task.lock().await.take() {
            let _ = tokio::time::timeout(Duration::from_secs(10), handle).await;
        }
    }
}
