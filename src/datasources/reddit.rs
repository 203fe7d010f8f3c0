//! Link-aggregator datasource (§4.E): polls a multireddit's newest
//! submissions (and optionally comments) on an interval, deduping by the
//! newest fullname seen per stream.
//!
//! Authentication (added, supplements the distilled spec): the upstream
//! API requires an OAuth2 "password" grant before any listing call
//! succeeds. `RedditAuth` performs the grant and caches the bearer token,
//! refreshing it a fixed margin before expiry — grounded in the
//! teacher's credential-injection pattern of fetching/caching a token and
//! attaching it as an `Authorization` header (`middleware/key_inject.rs`
//! in the pre-transform tree).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;

use super::build_post;
use crate::config::RedditConfig;
use crate::errors::Result;
use crate::post::{Datasource, OnError, OnPost};

const TOKEN_REFRESH_MARGIN: Duration = Duration::from_secs(60);
const BOT_AUTHORS: &[&str] = &["AutoModerator", "[deleted]"];
const REMOVED_BODIES: &[&str] = &["[removed]", "[deleted]"];
const MIN_COMMENT_LEN: usize = 10;

struct CachedToken {
    access_token: String,
    expires_at: Instant,
}

/// OAuth2 password-grant client with a cached, auto-refreshed token.
pub struct RedditAuth {
    http: reqwest::Client,
    client_id: String,
    client_secret: String,
    username: String,
    password: String,
    user_agent: String,
    cached: Mutex<Option<CachedToken>>,
}

impl RedditAuth {
    pub fn new(cfg: &RedditConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            client_id: cfg.client_id.clone(),
            client_secret: cfg.client_secret.clone(),
            username: cfg.username.clone(),
            password: cfg.password.clone(),
            user_agent: cfg.user_agent.clone(),
            cached: Mutex::new(None),
        }
    }

    async fn token(&self) -> anyhow::Result<String> {
        {
            let guard = self.cached.lock().await;
            if let Some(cached) = guard.as_ref() {
                if Instant::now() + TOKEN_REFRESH_MARGIN < cached.expires_at {
                    return Ok(cached.access_token.clone());
                }
            }
        }

        let params = [
            ("grant_type", "password"),
            ("username", &self.username),
            ("password", &self.password),
        ];
        let resp = self
            .http
            .post("https://www.reddit.com/api/v1/access_token")
            .basic_auth(&self.client_id, Some(&self.client_secret))
            .header("User-Agent", &self.user_agent)
            .form(&params)
            .send()
            .await?;

        if !resp.status().is_success() {
            anyhow::bail!("reddit OAuth grant failed with status {}", resp.status());
        }

        #[derive(Deserialize)]
        struct TokenResponse {
            access_token: String,
            expires_in: u64,
        }
        let token: TokenResponse = resp.json().await?;
        let expires_at = Instant::now() + Duration::from_secs(token.expires_in);

        *self.cached.lock().await = Some(CachedToken {
            access_token: token.access_token.clone(),
            expires_at,
        });
        Ok(token.access_token)
    }
}

#[derive(Debug, Deserialize)]
struct Listing {
    data: ListingData,
}

#[derive(Debug, Deserialize)]
struct ListingData {
    children: Vec<ListingChild>,
}

#[derive(Debug, Deserialize)]
struct ListingChild {
    data: ThingData,
}

#[derive(Debug, Deserialize, Default)]
struct ThingData {
    name: String,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    selftext: Option<String>,
    #[serde(default)]
    body: Option<String>,
    author: String,
    #[serde(default)]
    stickied: bool,
    created_utc: f64,
}

struct Shared {
    subreddits: String,
    include_comments: bool,
    poll_interval: Duration,
    default_language: String,
    user_agent: String,
    http: reqwest::Client,
    auth: RedditAuth,
    newest_submission: Mutex<Option<String>>,
    newest_comment: Mutex<Option<String>>,
}

impl Shared {
    async fn poll(&self, on_post: &OnPost, on_error: &Option<OnError>) {
        if let Err(e) = self.poll_stream(true, on_post).await {
            if let Some(cb) = on_error {
                cb(anyhow::anyhow!("reddit submissions poll failed: {}", e));
            }
        }
        if self.include_comments {
            if let Err(e) = self.poll_stream(false, on_post).await {
                if let Some(cb) = on_error {
                    cb(anyhow::anyhow!("reddit comments poll failed: {}", e));
                }
            }
        }
    }

    async fn poll_stream(&self, submissions: bool, on_post: &OnPost) -> anyhow::Result<()> {
        let token = self.auth.token().await?;
        let path = if submissions { "new" } else { "comments" };
        let url = format!(
            "https://oauth.reddit.com/r/{}/{}?limit=100",
            self.subreddits, path
        );

        let resp = self
            .http
            .get(&url)
            .bearer_auth(&token)
            .header("User-Agent", &self.user_agent)
            .send()
            .await?;
        if !resp.status().is_success() {
            anyhow::bail!("reddit listing returned status {}", resp.status());
        }
        let listing: Listing = resp.json().await?;

        let cursor = if submissions {
            &self.newest_submission
        } else {
            &self.newest_comment
        };
        let previous_newest = cursor.lock().await.clone();

        // Items arrive newest-first; collect until we reach the previously
        // stored newest fullname, then replay oldest-first.
        let mut fresh = Vec::new();
        for child in &listing.data.children {
            if Some(&child.data.name) == previous_newest.as_ref() {
                break;
            }
            fresh.push(child);
        }

        if let Some(first) = listing.data.children.first() {
            *cursor.lock().await = Some(first.data.name.clone());
        }

        for child in fresh.into_iter().rev() {
            if let Some(post) = self.to_post(&child.data, submissions) {
                on_post(post);
            }
        }
        Ok(())
    }

    fn to_post(&self, item: &ThingData, is_submission: bool) -> Option<crate::post::Post> {
        if BOT_AUTHORS.contains(&item.author.as_str()) {
            return None;
        }
        if is_submission && item.stickied {
            return None;
        }

        let text = if is_submission {
            let title = item.title.as_deref().unwrap_or_default();
            let selftext = item.selftext.as_deref().unwrap_or_default();
            if is_removed(selftext) {
                return None;
            }
            let title = strip_markdown_and_collapse(title);
            let selftext = strip_markdown_and_collapse(selftext);
            match (title.is_empty(), selftext.is_empty()) {
                (false, false) => format!("{}. {}", title, selftext),
                (false, true) => title,
                (true, false) => selftext,
                (true, true) => String::new(),
            }
        } else {
            let body = item.body.as_deref().unwrap_or_default();
            if is_removed(body) {
                return None;
            }
            let cleaned = strip_markdown_and_collapse(body);
            if cleaned.chars().count() < MIN_COMMENT_LEN {
                return None;
            }
            cleaned
        };

        let created_at = Utc
            .timestamp_opt(item.created_utc as i64, 0)
            .single()
            .unwrap_or_else(Utc::now);

        build_post(
            format!("reddit:{}", item.name),
            &text,
            created_at,
            Some(self.default_language.clone()),
            format!("reddit:{}", self.subreddits),
        )
    }
}

fn is_removed(body: &str) -> bool {
    REMOVED_BODIES.contains(&body.trim())
}

static FENCED_CODE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)```.*?```").unwrap());
static INLINE_CODE: Lazy<Regex> = Lazy::new(|| Regex::new(r"`([^`]*)`").unwrap());

fn strip_markdown_and_collapse(input: &str) -> String {
    let s = FENCED_CODE.replace_all(input, "");
    let s = INLINE_CODE.replace_all(&s, "$1");
    crate::text::strip_markdown(&s)
}

pub struct RedditDatasource {
    shared: Arc<Shared>,
    running: Arc<AtomicBool>,
    stop_notify: Arc<Notify>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl RedditDatasource {
    pub fn new(cfg: &RedditConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                subreddits: cfg.subreddits.join("+"),
                include_comments: cfg.include_comments,
                poll_interval: Duration::from_secs(cfg.poll_interval_seconds),
                default_language: cfg.default_language.clone(),
                user_agent: cfg.user_agent.clone(),
                http: reqwest::Client::builder()
                    .timeout(Duration::from_secs(30))
                    .build()
                    .expect("failed to build HTTP client"),
                auth: RedditAuth::new(cfg),
                newest_submission: Mutex::new(None),
                newest_comment: Mutex::new(None),
            }),
            running: Arc::new(AtomicBool::new(false)),
            stop_notify: Arc::new(Notify::new()),
            task: Mutex::new(None),
        }
    }
}

#[async_trait]
impl Datasource for RedditDatasource {
    fn source_id(&self) -> &str {
        "reddit"
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
                shared.poll(&on_post, &on_error).await;
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
