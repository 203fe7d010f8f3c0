//! Time-windowed post batching (§4.F).
//!
//! `PostBuffer` accumulates posts under a synchronous mutex and flushes
//! them into a [`PostBatch`] either when a timer fires, when the
//! in-flight count reaches `max_batch_size` ("early flush"), or on
//! `stop()`. All three paths share the same `flush` routine so the
//! protocol (swap under lock, build batch outside the lock, never call
//! back while holding the lock) only has one implementation.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::errors::{PipelineError, Result};
use crate::post::Post;

/// An immutable group of posts collected during one time window.
#[derive(Debug, Clone)]
pub struct PostBatch {
    pub posts: Vec<Post>,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub source: String,
}

impl PostBatch {
    pub fn post_count(&self) -> usize {
        self.posts.len()
    }
}

/// Callback invoked with each flushed, non-empty batch.
pub type OnBatch = Arc<dyn Fn(PostBatch) + Send + Sync>;

struct Inner {
    pending: Vec<Post>,
    window_start: DateTime<Utc>,
    running: bool,
}

/// Thread-safe, time-windowed batching buffer.
pub struct PostBuffer {
    window_seconds: u64,
    max_batch_size: usize,
    state: Mutex<Inner>,
    on_batch: OnBatch,
    timer_notify: Arc<Notify>,
    timer_handle: Mutex<Option<JoinHandle<()>>>,
}

impl PostBuffer {
    /// Build a new buffer. `window_seconds` and `max_batch_size` must both
    /// be strictly positive; invalid configuration fails fast here rather
    /// than surfacing as a silent no-op later.
    pub fn new(window_seconds: u64, max_batch_size: usize, on_batch: OnBatch) -> Result<Arc<Self>> {
        if window_seconds == 0 {
            return Err(PipelineError::Config(
                "buffer window_seconds must be > 0".into(),
            ));
        }
        if max_batch_size == 0 {
            return Err(PipelineError::Config(
                "buffer max_batch_size must be > 0".into(),
            ));
        }
        Ok(Arc::new(Self {
            window_seconds,
            max_batch_size,
            state: Mutex::new(Inner {
                pending: Vec::new(),
                window_start: Utc::now(),
                running: false,
            }),
            on_batch,
            timer_notify: Arc::new(Notify::new()),
            timer_handle: Mutex::new(None),
        }))
    }

    /// Start the timer that flushes the buffer every `window_seconds`.
    /// Idempotent: a second call while already running is a no-op.
    pub fn start(self: &Arc<Self>) {
        let mut guard = self.state.lock().unwrap();
        if guard.running {
            return;
        }
        guard.running = true;
        guard.window_start = Utc::now();
        drop(guard);

        let this = Arc::clone(self);
        let notify = Arc::clone(&self.timer_notify);
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(std::time::Duration::from_secs(this.window_seconds)) => {
                        this.flush(Utc::now());
                    }
                    _ = notify.notified() => {
                        break;
                    }
                }
            }
        });
        *self.timer_handle.lock().unwrap() = Some(handle);
    }

    /// Stop the timer and perform a final flush. Idempotent.
    pub fn stop(self: &Arc<Self>) {
        {
            let mut guard = self.state.lock().unwrap();
            if !guard.running {
                return;
            }
            guard.running = false;
        }
        self.timer_notify.notify_one();
        if let Some(handle) = self.timer_handle.lock().unwrap().take() {
            handle.abort();
        }
        self.flush(Utc::now());
    }

    /// Append a post to the in-flight window. Dropped silently if the
    /// buffer has not been started (or has already been stopped). Triggers
    /// a synchronous early flush when the cap is reached.
    pub fn add_post(self: &Arc<Self>, post: Post) {
        let should_flush_now = {
            let mut guard = self.state.lock().unwrap();
            if !guard.running {
                return;
            }
            guard.pending.push(post);
            guard.pending.len() >= self.max_batch_size
        };
        if should_flush_now {
            self.flush(Utc::now());
        }
    }

    /// Shared flush routine: swap the pending vec under the lock, then
    /// invoke `on_batch` outside it. Catches (by construction — the
    /// callback is a plain closure, not a fallible call) and logs any
    /// panic-free error the callback reports via its own tracing calls;
    /// a panicking callback is still a bug in the caller, not something
    /// this buffer can recover from.
    fn flush(&self, now: DateTime<Utc>) {
        let (posts, window_start) = {
            let mut guard = self.state.lock().unwrap();
            let posts = std::mem::take(&mut guard.pending);
            let window_start = guard.window_start;
            guard.window_start = now;
            (posts, window_start)
        };

        if posts.is_empty() {
            return;
        }

        let source = batch_source(&posts);
        let batch = PostBatch {
            posts,
            window_start,
            window_end: now,
            source,
        };

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            (self.on_batch)(batch);
        }));
        if result.is_err() {
            tracing::error!("on_batch callback panicked; buffer remains operational");
        }
    }
}

fn batch_source(posts: &[Post]) -> String {
    let first = &posts[0].source;
    if posts.iter().all(|p| &p.source == first) {
        first.clone()
    } else {
        "multi".to_string()
    }
}
