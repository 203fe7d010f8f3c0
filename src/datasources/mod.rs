//! Datasource implementations: one module per ingest source, each
//! implementing the [`crate::post::Datasource`] contract from §4.A.

pub mod microblog_poll;
pub mod microblog_stream;
pub mod reddit;
pub mod rss;

use chrono::{DateTime, Utc};

use crate::post::Post;
use crate::text::strip_html;

/// Validate and construct a [`Post`] from already-HTML-stripped text: id
/// and text must both be non-empty after trimming (§4.A's "already
/// validated" requirement shared by every datasource).
pub fn build_post(
    id: String,
    raw_html_or_text: &str,
    created_at: DateTime<Utc>,
    language: Option<String>,
    source: String,
) -> Option<Post> {
    let id = id.trim().to_string();
    if id.is_empty() {
        return None;
    }
    let text = strip_html(raw_html_or_text);
    if text.is_empty() {
        return None;
    }
    Some(Post {
        id,
        text,
        created_at,
        language: language.filter(|l| !l.is_empty()),
        source,
    })
}

/// Shared exponential-backoff sequence used by the SSE datasource's
/// reconnect loop: starts at `initial`, doubles each step, ceilings at
/// `max`, and resets to `initial` whenever the caller observes success.
#[derive(Debug, Clone)]
pub struct Backoff {
    current: std::time::Duration,
    initial: std::time::Duration,
    max: std::time::Duration,
}

impl Backoff {
    pub fn new(initial: std::time::Duration, max: std::time::Duration) -> Self {
        Self {
            current: initial,
            initial,
            max,
        }
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }

    pub fn next(&mut self) -> std::time::Duration {
        let wait = self.current;
        self.current = std::cmp::min(self.current * 2, self.max);
        wait
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn backoff_doubles_and_ceilings() {
        let mut b = Backoff::new(Duration::from_secs(1), Duration::from_secs(8));
        assert_eq!(b.next(), Duration::from_secs(1));
        assert_eq!(b.next(), Duration::from_secs(2));
        assert_eq!(b.next(), Duration::from_secs(4));
        assert_eq!(b.next(), Duration::from_secs(8));
        assert_eq!(b.next(), Duration::from_secs(8));
    }

    #[test]
    fn backoff_resets() {
        let mut b = Backoff::new(Duration::from_secs(1), Duration::from_secs(60));
        b.next();
        b.next();
        b.reset();
        assert_eq!(b.next(), Duration::from_secs(1));
    }

    #[test]
    fn build_post_rejects_empty_id_or_empty_text() {
        let now = Utc::now();
        assert!(build_post(String::new(), "hi", now, None, "a".into()).is_none());
        assert!(build_post("1".into(), "<p></p>", now, None, "a".into()).is_none());
    }

    #[test]
    fn build_post_strips_html_and_normalizes_language() {
        let now = Utc::now();
        let post = build_post(
            "1".into(),
            "<p>Hello <b>world</b></p>",
            now,
            Some(String::new()),
            "a".into(),
        )
        .unwrap();
        assert_eq!(post.text, "Hello world");
        assert!(post.language.is_none());
    }
}
