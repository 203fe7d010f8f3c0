//! RSS datasource (§4.D): polls a set of feeds on an interval, honoring
//! conditional GETs (`ETag`/`Last-Modified`) and per-feed dedup against
//! the previous cycle's entry ids.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::header::{HeaderValue, ETAG, IF_MODIFIED_SINCE, IF_NONE_MATCH, LAST_MODIFIED};
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;

use super::build_post;
use crate::config::FeedConfig;
use crate::errors::Result;
use crate::post::{Datasource, OnError, OnPost};

struct FeedState {
    etag: Option<String>,
    last_modified: Option<String>,
    seen_entry_ids: HashSet<String>,
}

impl Default for FeedState {
    fn default() -> Self {
        Self {
            etag: None,
            last_modified: None,
            seen_entry_ids: HashSet::new(),
        }
    }
}

struct Shared {
    feeds: Vec<FeedConfig>,
    poll_interval: Duration,
    user_agent: String,
    http: reqwest::Client,
    state: Mutex<HashMap<String, FeedState>>,
}

impl Shared {
    async fn poll_all(&self, on_post: &OnPost, on_error: &Option<OnError>) {
        for feed in &self.feeds {
            if let Err(e) = self.poll_feed(feed, on_post).await {
                if let Some(cb) = on_error {
                    cb(anyhow::anyhow!("feed '{}' failed: {}", feed.name, e));
                }
            }
        }
    }

    async fn poll_feed(&self, feed: &FeedConfig, on_post: &OnPost) -> anyhow::Result<()> {
        let (etag, last_modified) = {
            let guard = self.state.lock().await;
            let s = guard.get(&feed.name);
            (
                s.and_then(|s| s.etag.clone()),
                s.and_then(|s| s.last_modified.clone()),
            )
        };

        let mut req = self.http.get(&feed.url).header("User-Agent", &self.user_agent);
        if let Some(etag) = &etag {
            if let Ok(v) = HeaderValue::from_str(etag) {
                req = req.header(IF_NONE_MATCH, v);
            }
        }
        if let Some(lm) = &last_modified {
            if let Ok(v) = HeaderValue::from_str(lm) {
                req = req.header(IF_MODIFIED_SINCE, v);
            }
        }

        let response = req.send().await?;
        if response.status() == reqwest::StatusCode::NOT_MODIFIED {
            return Ok(());
        }
        if !response.status().is_success() {
            anyhow::bail!("feed returned status {}", response.status());
        }

        let new_etag = response
            .headers()
            .get(ETAG)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let new_last_modified = response
            .headers()
            .get(LAST_MODIFIED)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let body = response.bytes().await?;
        let channel = rss::Channel::read_from(&body[..])?;

        let previous_ids = {
            let mut guard = self.state.lock().await;
            let entry = guard.entry(feed.name.clone()).or_default();
            std::mem::take(&mut entry.seen_entry_ids)
        };

        let mut current_ids = HashSet::new();
        for item in channel.items() {
            let entry_id = entry_id_of(item);
            if entry_id.is_empty() {
                continue;
            }
            current_ids.insert(entry_id.clone());
            if previous_ids.contains(&entry_id) {
                continue;
            }

            let title = item.title().unwrap_or_default();
            let summary = item.description().unwrap_or_default();
            let text = combine_title_and_summary(title, summary);
            if text.is_empty() {
                continue;
            }

            let created_at = item
                .pub_date()
                .and_then(|d| chrono::DateTime::parse_from_rfc2822(d).ok())
                .map(|dt| dt.with_timezone(&Utc))
                .unwrap_or_else(Utc::now);

            let language = None; // rss::Item has no per-entry language; fall back below.
            let post = build_post(
                format!("rss:{}:{}", feed.name, entry_id),
                &text,
                created_at,
                language.or_else(|| Some(feed.language.clone())),
                format!("news:{}", feed.name),
            );
            if let Some(post) = post {
                on_post(post);
            }
        }

        let mut guard = self.state.lock().await;
        let entry = guard.entry(feed.name.clone()).or_default();
        entry.seen_entry_ids = current_ids;
        entry.etag = new_etag;
        entry.last_modified = new_last_modified;

        Ok(())
    }
}

fn entry_id_of(item: &rss::Item) -> String {
    if let Some(guid) = item.guid() {
        return guid.value().to_string();
    }
    if let Some(link) = item.link() {
        return link.to_string();
    }
    String::new()
}

fn combine_title_and_summary(title: &str, summary: &str) -> String {
    let title = crate::text::strip_html(title);
    let summary = crate::text::strip_html(summary);
    match (title.is_empty(), summary.is_empty()) {
        (false, false) => format!("{}. {}", title, summary),
        (false, true) => title,
        (true, false) => summary,
        (true, true) => String::new(),
    }
}

pub struct RssDatasource {
    shared: Arc<Shared>,
    running: Arc<AtomicBool>,
    stop_notify: Arc<Notify>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl RssDatasource {
    pub fn new(feeds: Vec<FeedConfig>, poll_interval_seconds: u64, user_agent: String) -> Self {
        Self {
            shared: Arc::new(Shared {
                feeds,
                poll_interval: Duration::from_secs(poll_interval_seconds),
                user_agent,
                http: reqwest::Client::builder()
                    .timeout(Duration::from_secs(30))
                    .build()
                    .expect("failed to build HTTP client"),
                state: Mutex::new(HashMap::new()),
            }),
            running: Arc::new(AtomicBool::new(false)),
            stop_notify: Arc::new(Notify::new()),
            task: Mutex::new(None),
        }
    }

    #[cfg(test)]
    async fn poll_all(&self, on_post: &OnPost, on_error: &Option<OnError>) {
        self.shared.poll_all(on_post, on_error).await;
    }
}

#[async_trait]
impl Datasource for RssDatasource {
    fn source_id(&self) -> &str {
        "rss"
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
                shared.poll_all(&on_post, &on_error).await;
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

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn feed(url: String) -> FeedConfig {
        FeedConfig {
            url,
            name: "test-feed".to_string(),
            language: "de".to_string(),
        }
    }

    fn rss_body(items: &str) -> String {
        format!(
            r#"<?xml version="1.0"?><rss version="2.0"><channel><title>T</title><link>http://x</link><description>d</description>{}</channel></rss>"#,
            items
        )
    }

    /// S5 — conditional GET: first fetch returns 200 with an ETag; second
    /// fetch sends If-None-Match and gets 304, producing no posts.
    #[tokio::test]
    async fn s5_conditional_get_skips_on_304() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/feed.xml"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("ETag", "\"abc\"")
                    .set_body_string(rss_body(
                        r#"<item><guid>1</guid><title>Title</title><description>Body</description></item>"#,
                    )),
            )
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/feed.xml"))
            .respond_with(ResponseTemplate::new(304))
            .mount(&server)
            .await;

        let ds = RssDatasource::new(
            vec![feed(format!("{}/feed.xml", server.uri()))],
            600,
            "test-agent".into(),
        );
        let received: Arc<std::sync::Mutex<Vec<crate::post::Post>>> =
            Arc::new(std::sync::Mutex::new(Vec::new()));
        let received_clone = Arc::clone(&received);
        let on_post: OnPost = Arc::new(move |p| received_clone.lock().unwrap().push(p));

        ds.poll_all(&on_post, &None).await;
        assert_eq!(received.lock().unwrap().len(), 1);

        ds.poll_all(&on_post, &None).await;
        assert_eq!(received.lock().unwrap().len(), 1, "304 must not add posts");
    }

    #[tokio::test]
    async fn dedups_against_previous_cycle_only() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/feed.xml"))
            .respond_with(ResponseTemplate::new(200).set_body_string(rss_body(
                r#"<item><guid>1</guid><title>One</title><description>d</description></item><item><guid>2</guid><title>Two</title><description>d</description></item>"#,
            )))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/feed.xml"))
            .respond_with(ResponseTemplate::new(200).set_body_string(rss_body(
                r#"<item><guid>2</guid><title>Two</title><description>d</description></item><item><guid>3</guid><title>Three</title><description>d</description></item>"#,
            )))
            .mount(&server)
            .await;

        let ds = RssDatasource::new(
            vec![feed(format!("{}/feed.xml", server.uri()))],
            600,
            "test-agent".into(),
        );
        let received: Arc<std::sync::Mutex<Vec<String>>> = Arc::new(std::sync::Mutex::new(Vec::new()));
        let received_clone = Arc::clone(&received);
        let on_post: OnPost = Arc::new(move |p| received_clone.lock().unwrap().push(p.id));

        ds.poll_all(&on_post, &None).await;
        ds.poll_all(&on_post, &None).await;

        let ids = received.lock().unwrap().clone();
        assert_eq!(ids, vec!["rss:test-feed:1", "rss:test-feed:2", "rss:test-feed:3"]);
    }

    #[test]
    fn combine_title_and_summary_prefers_both_when_present() {
        assert_eq!(combine_title_and_summary("A", "B"), "A. B");
        assert_eq!(combine_title_and_summary("A", ""), "A");
        assert_eq!(combine_title_and_summary("", "B"), "B");
        assert_eq!(combine_title_and_summary("", ""), "");
    }
}
