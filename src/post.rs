//! The normalized post model and the datasource contract every ingest
//! source (Mastodon stream/poll, RSS, Reddit) implements against.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::Result;

/// A normalized post from any datasource, already stripped of markup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Post {
    /// Unique identifier within its source, e.g. `mastodon:12345` or
    /// `rss:orf-news:abcde`.
    pub id: String,
    /// Plain text content, HTML/Markdown already stripped.
    pub text: String,
    pub created_at: DateTime<Utc>,
    /// ISO 639-1 language code, if the source reports one.
    pub language: Option<String>,
    /// Datasource identifier, e.g. `mastodon:wien.rocks` or `reddit:wien`.
    pub source: String,
}

/// Callback invoked for each post a datasource receives.
pub type OnPost = Arc<dyn Fn(Post) + Send + Sync>;
/// Callback invoked when a datasource's connection fails or is lost.
pub type OnError = Arc<dyn Fn(anyhow::Error) + Send + Sync>;

/// Common contract for every ingest source.
///
/// A datasource owns its connection lifecycle: `start` spawns whatever
/// background work is needed (a streaming connection, a polling loop) and
/// returns once that work is running; `stop` signals it to wind down.
/// Posts and errors are delivered via callbacks rather than a channel the
/// caller polls, since a single `Arc<dyn Datasource>` may be driven from
/// the pipeline orchestrator without it knowing each source's concrete
/// delivery mechanism.
#[async_trait]
pub trait Datasource: Send + Sync {
    /// Identifier for this datasource instance, e.g. `mastodon:wien.rocks`.
    fn source_id(&self) -> &str;

    async fn start(&self, on_post: OnPost, on_error: Option<OnError>) -> Result<()>;

    async fn stop(&self);
}
