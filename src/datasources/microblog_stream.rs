//! Microblog SSE datasource (§4.B): a long-lived `text/event-stream`
//! connection to the local public timeline, with automatic reconnect and
//! exponential backoff.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use eventsource_stream::Eventsource;
use futures::StreamExt;
use serde::Deserialize;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use super::{build_post, Backoff};
use crate::errors::Result;
use crate::post::{Datasource, OnError, OnPost};

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(60);

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

pub struct MicroblogStreamDatasource {
    instance_url: String,
    access_token: String,
    source_id: String,
    http: reqwest::Client,
    running: Arc<AtomicBool>,
    stop_notify: Arc<Notify>,
    task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl MicroblogStreamDatasource {
    pub fn new(instance_url: String, access_token: String) -> Self {
        let host = instance_url
            .trim_start_matches("https://")
            .trim_start_matches("http://")
            .trim_end_matches('/')
            .to_string();
        Self {
            instance_url,
            access_token,
            source_id: format!("microblog:{}", host),
            http: reqwest::Client::new(),
            running: Arc::new(AtomicBool::new(false)),
            stop_notify: Arc::new(Notify::new()),
            task: tokio::sync::Mutex::new(None),
        }
    }

    async fn run_loop(
        http: reqwest::Client,
        url: String,
        token: String,
        source_id: String,
        running: Arc<AtomicBool>,
        stop_notify: Arc<Notify>,
        on_post: OnPost,
        on_error: Option<OnError>,
    ) {
        let mut backoff = Backoff::new(INITIAL_BACKOFF, MAX_BACKOFF);

        while running.load(Ordering::SeqCst) {
            let connect = http
                .get(&url)
                .bearer_auth(&token)
                .send();

            let response = tokio::select! {
                r = connect => r,
                _ = stop_notify.notified() => break,
            };

            let response = match response {
                Ok(r) => r,
                Err(e) => {
                    if let Some(cb) = &on_error {
                        cb(anyhow::anyhow!("stream connect failed: {}", e));
                    }
                    Self::sleep_or_stop(&stop_notify, backoff.next(), &running).await;
                    continue;
                }
            };

            if !response.status().is_success() {
                if let Some(cb) = &on_error {
                    cb(anyhow::anyhow!("stream returned status {}", response.status()));
                }
                Self::sleep_or_stop(&stop_notify, backoff.next(), &running).await;
                continue;
            }

            let mut stream = response.bytes_stream().eventsource();
            loop {
                let next = tokio::select! {
                    n = stream.next() => n,
                    _ = stop_notify.notified() => return,
                };
                let Some(event) = next else {
                    break; // stream ended; reconnect
                };
                if !running.load(Ordering::SeqCst) {
                    return;
                }
                match event {
                    Ok(ev) => {
                        if ev.event != "update" {
                            continue;
                        }
                        backoff.reset();
                        match parse_status(&ev.data, &source_id) {
                            Ok(Some(post)) => on_post(post),
                            Ok(None) => {} // filtered (reblog/sensitive/empty)
                            Err(e) => {
                                if let Some(cb) = &on_error {
                                    cb(anyhow::anyhow!("malformed status payload: {}", e));
                                }
                            }
                        }
                    }
                    Err(e) => {
                        if let Some(cb) = &on_error {
                            cb(anyhow::anyhow!("stream decode error: {}", e));
                        }
                        break; // reconnect
                    }
                }
            }

            Self::sleep_or_stop(&stop_notify, backoff.next(), &running).await;
        }
    }

    async fn sleep_or_stop(stop_notify: &Notify, duration: Duration, running: &AtomicBool) {
        if !running.load(Ordering::SeqCst) {
            return;
        }
        tokio::select! {
            _ = tokio::time::sleep(duration) => {},
            _ = stop_notify.notified() => {},
        }
    }
}

/// Parse and filter a single status payload (§4.B steps 1–6). Returns
/// `Ok(None)` for payloads that should be silently dropped (reposts,
/// sensitive, empty body) and `Err` for malformed payloads that should
/// be logged via `on_error` and skipped.
fn parse_status(data: &str, source_id: &str) -> std::result::Result<Option<crate::post::Post>, String> {
    let payload: StatusPayload = serde_json::from_str(data).map_err(|e| e.to_string())?;

    let Some(id) = payload.id else {
        return Err("status missing id".to_string());
    };
    let Some(content) = payload.content else {
        return Err("status missing content".to_string());
    };
    if payload.created_at.is_none() {
        return Err("status missing created_at".to_string());
    }

    if payload.reblog.is_some() || payload.sensitive {
        return Ok(None);
    }

    let created_at = parse_created_at(payload.created_at.as_deref());

    Ok(build_post(id, &content, created_at, payload.language, source_id.to_string()))
}

fn parse_created_at(raw: Option<&str>) -> DateTime<Utc> {
    raw.and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|| {
            tracing::warn!("unparseable created_at, falling back to now");
            Utc::now()
        })
}

#[async_trait]
impl Datasource for MicroblogStreamDatasource {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    async fn start(&self, on_post: OnPost, on_error: Option<OnError>) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let url = format!(
            "{}/api/v1/streaming/public?local=true",
            self.instance_url.trim_end_matches('/')
        );
        let http = self.http.clone();
        let token = self.access_token.clone();
        let source_id = self.source_id.clone();
        let running = Arc::clone(&self.running);
        let stop_notify = Arc::clone(&self.stop_notify);

        let handle = tokio::spawn(Self::run_loop(
            http, url, token, source_id, running, stop_notify, on_post, on_error,
        ));
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
