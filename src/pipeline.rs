//! Pipeline orchestrator (§4.K): wires every datasource, the buffer, the
//! extractor, the topic store, the post log, and health accounting
//! together, and owns graceful startup/shutdown.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use chrono::Utc;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::buffer::{OnBatch, PostBatch, PostBuffer};
use crate::config::{Config, DatasourceMode};
use crate::datasources::microblog_poll::MicroblogPollDatasource;
use crate::datasources::microblog_stream::MicroblogStreamDatasource;
use crate::datasources::reddit::RedditDatasource;
use crate::datasources::rss::RssDatasource;
use crate::errors::{PipelineError, Result};
use crate::extractor::Extractor;
use crate::health::{HealthMonitor, HealthSnapshot};
use crate::post::{Datasource, OnError, OnPost, Post};
use crate::post_log::PostLog;
use crate::snapshot;
use crate::topic_store::{Topic, TopicStore, TopicStoreConfig};

const DEFAULT_DB_PATH: &str = "topicstream.db";

/// Runs an async future to completion from a synchronous callback without
/// spawning a detached task, so the extractor/store/log work triggered by
/// a flush or a post genuinely finishes before the callback returns (§5:
/// "runs synchronously on whatever worker triggered the flush"). Requires
/// the multi-threaded runtime so the current worker can hand off while
/// blocked.
fn block_on<F: std::future::Future>(fut: F) -> F::Output {
    tokio::task::block_in_place(|| tokio::runtime::Handle::current().block_on(fut))
}

/// Orchestrates the whole ingestion pipeline: one process, one instance.
pub struct Pipeline {
    config: Config,
    post_log: Arc<PostLog>,
    buffer: Arc<PostBuffer>,
    extractor: Arc<Extractor>,
    store: Arc<TopicStore>,
    health: Arc<HealthMonitor>,
    datasources: Vec<Arc<dyn Datasource>>,
    mastodon_poll: Option<Arc<MicroblogPollDatasource>>,
    stop_notify: Arc<Notify>,
    stopping: AtomicBool,
    health_timer: StdMutex<Option<JoinHandle<()>>>,
}

impl Pipeline {
    /// Build every component and connect the post log, but start nothing
    /// yet — datasources, the buffer timer, and the health timer all start
    /// in [`Pipeline::run`].
    pub async fn new(config: Config) -> Result<Arc<Self>> {
        let db_path = config
            .pipeline
            .db_path
            .clone()
            .unwrap_or_else(|| DEFAULT_DB_PATH.to_string());
        let post_log = Arc::new(PostLog::connect(&db_path).await?);

        let health = Arc::new(HealthMonitor::new(config.pipeline.stale_stream_seconds));
        let extractor = Arc::new(Extractor::new(config.extractor.clone()));
        let store = Arc::new(
            TopicStore::new(TopicStoreConfig::default()).map_err(PipelineError::Config)?,
        );

        let on_batch = build_on_batch(
            Arc::clone(&extractor),
            Arc::clone(&store),
            Arc::clone(&health),
            Arc::clone(&post_log),
            config.pipeline.snapshot_dir.clone(),
            config.pipeline.retention_hours,
        );
        let buffer = PostBuffer::new(
            config.pipeline.buffer_window_seconds,
            config.pipeline.buffer_max_batch_size,
            on_batch,
        )?;

        let mut datasources: Vec<Arc<dyn Datasource>> = Vec::new();
        let mastodon_poll = match config.mastodon.datasource_mode {
            DatasourceMode::Stream => {
                let ds = Arc::new(MicroblogStreamDatasource::new(
                    config.mastodon.instance_url.clone(),
                    config.mastodon.access_token.clone(),
                ));
                datasources.push(ds);
                None
            }
            DatasourceMode::Polling => {
                let ds = Arc::new(MicroblogPollDatasource::new(
                    config.mastodon.instance_url.clone(),
                    config.mastodon.access_token.clone(),
                    config.mastodon.poll_interval_seconds,
                ));
                datasources.push(Arc::clone(&ds) as Arc<dyn Datasource>);
                Some(ds)
            }
        };
        if config.rss.enabled {
            datasources.push(Arc::new(RssDatasource::new(
                config.rss.feeds.clone(),
                config.rss.poll_interval_seconds,
                config.rss.user_agent.clone(),
            )));
        }
        if config.reddit.enabled {
            datasources.push(Arc::new(RedditDatasource::new(&config.reddit)));
        }

        Ok(Arc::new(Self {
            config,
            post_log,
            buffer,
            extractor,
            store,
            health,
            datasources,
            mastodon_poll,
            stop_notify: Arc::new(Notify::new()),
            stopping: AtomicBool::new(false),
            health_timer: StdMutex::new(None),
        }))
    }

    /// Run the pipeline to completion: startup, block until stopped
    /// (signal or [`Pipeline::request_stop`]), then shut down in order.
    pub async fn run(self: &Arc<Self>) -> Result<()> {
        if let Some(poll_ds) = &self.mastodon_poll {
            match self.post_log.max_post_id().await {
                Ok(id) => poll_ds.seed_since_id(id).await,
                Err(e) => tracing::warn!(error = %e, "failed to seed since_id from post log"),
            }
        }

        self.buffer.start();
        match self.post_log.get_unprocessed_posts().await {
            Ok(posts) => {
                if !posts.is_empty() {
                    tracing::info!(count = posts.len(), "replaying unprocessed posts");
                }
                for post in posts {
                    self.buffer.add_post(post);
                }
            }
            Err(e) => tracing::error!(error = %e, "failed to load unprocessed posts for replay"),
        }

        self.start_datasources().await;
        self.schedule_health_timer();
        self.install_signal_handlers();

        tracing::info!("pipeline running");
        self.stop_notify.notified().await;
        self.shutdown().await;
        Ok(())
    }

    /// Idempotently request shutdown; safe to call from a signal handler
    /// task or a test.
    pub fn request_stop(&self) {
        if self.stopping.swap(true, Ordering::SeqCst) {
            return;
        }
        self.stop_notify.notify_one();
    }

    /// A sorted, detached snapshot of currently active topics (§6).
    pub fn topics_snapshot(&self) -> Vec<Topic> {
        self.store.get_current_topics()
    }

    /// The current health counters (§6).
    pub fn health_snapshot(&self) -> HealthSnapshot {
        self.health.snapshot()
    }

    async fn start_datasources(self: &Arc<Self>) {
        for ds in &self.datasources {
            let on_post = self.build_on_post();
            let on_error = self.build_on_error(ds.source_id().to_string());
            match ds.start(on_post, Some(on_error)).await {
                Ok(()) => tracing::info!(source = %ds.source_id(), "datasource started"),
                Err(e) => {
                    tracing::error!(source = %ds.source_id(), error = %e, "failed to start datasource")
                }
            }
        }
    }

    fn build_on_post(self: &Arc<Self>) -> OnPost {
        let post_log = Arc::clone(&self.post_log);
        let buffer = Arc::clone(&self.buffer);
        let health = Arc::clone(&self.health);
        Arc::new(move |post: Post| {
            health.post_received();
            match block_on(post_log.save_post(&post)) {
                Ok(true) => buffer.add_post(post),
                Ok(false) => {} // already logged; duplicate delivery, skip
                Err(e) => tracing::error!(error = %e, "failed to persist post"),
            }
        })
    }

    fn build_on_error(&self, source_id: String) -> OnError {
        Arc::new(move |err: anyhow::Error| {
            tracing::warn!(source = %source_id, error = %err, "datasource error");
        })
    }

    fn schedule_health_timer(self: &Arc<Self>) {
        let this = Arc::clone(self);
        let interval = std::time::Duration::from_secs(self.config.pipeline.health_log_interval_seconds);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // first tick fires immediately; skip it
            loop {
                ticker.tick().await;
                this.health.log_health();
            }
        });
        *self.health_timer.lock().unwrap() = Some(handle);
    }

    fn install_signal_handlers(self: &Arc<Self>) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            #[cfg(unix)]
            {
                let mut terminate = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                    Ok(s) => s,
                    Err(e) => {
                        tracing::error!(error = %e, "failed to install SIGTERM handler");
                        return;
                    }
                };
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {},
                    _ = terminate.recv() => {},
                }
            }
            #[cfg(not(unix))]
            {
                let _ = tokio::signal::ctrl_c().await;
            }
            tracing::info!("shutdown signal received");
            this.request_stop();
        });
    }

    async fn shutdown(&self) {
        tracing::info!("pipeline shutting down");

        for ds in &self.datasources {
            ds.stop().await;
            tracing::info!(source = %ds.source_id(), "datasource stopped");
        }

        self.buffer.stop();

        if let Some(handle) = self.health_timer.lock().unwrap().take() {
            handle.abort();
        }

        let current = self.store.get_current_topics();
        match snapshot::save_snapshot(
            self.config.pipeline.snapshot_dir.as_deref(),
            &current,
            Utc::now(),
        )
        .await
        {
            Ok(Some(_)) => self.health.snapshot_written(),
            Ok(None) => {}
            Err(e) => tracing::error!(error = %e, "final snapshot save failed"),
        }

        self.health.log_health();

        if let Err(e) = self.post_log.cleanup_old_posts(self.config.pipeline.retention_hours).await {
            tracing::error!(error = %e, "post log cleanup failed");
        }
        self.post_log.close().await;

        tracing::info!("pipeline shutdown complete");
    }
}

fn build_on_batch(
    extractor: Arc<Extractor>,
    store: Arc<TopicStore>,
    health: Arc<HealthMonitor>,
    post_log: Arc<PostLog>,
    snapshot_dir: Option<String>,
    retention_hours: i64,
) -> OnBatch {
    Arc::new(move |batch: PostBatch| {
        let extractor = Arc::clone(&extractor);
        let store = Arc::clone(&store);
        let health = Arc::clone(&health);
        let post_log = Arc::clone(&post_log);
        let snapshot_dir = snapshot_dir.clone();
        block_on(async move {
            let topics = extractor.extract(&batch).await;
            if !topics.is_empty() {
                health.batch_success(topics.len());
                store.merge(&topics, &batch.source, Utc::now());
            } else if batch.post_count() > 0 {
                health.batch_failure();
            } else {
                health.batch_success(0);
            }

            let current = store.get_current_topics();
            match snapshot::save_snapshot(snapshot_dir.as_deref(), &current, Utc::now()).await {
                Ok(Some(_)) => health.snapshot_written(),
                Ok(None) => {}
                Err(e) => tracing::error!(error = %e, "snapshot save failed"),
            }
            if let Err(e) = snapshot::cleanup_snapshots(snapshot_dir.as_deref(), Utc::now(), retention_hours).await {
                tracing::warn!(error = %e, "snapshot cleanup failed");
            }

            let ids: Vec<String> = batch.posts.iter().map(|p| p.id.clone()).collect();
            if let Err(e) = post_log.mark_batch_processed(&ids).await {
                tracing::error!(error = %e, "failed to mark batch processed");
            }
        });
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ExtractorConfig, MastodonConfig, PipelineSettings, RedditConfig, RssConfig};

    fn temp_db_path() -> String {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        std::env::temp_dir()
            .join(format!("topicstream-pipeline-test-{}.db", nanos))
            .to_string_lossy()
            .to_string()
    }

    fn test_config(db_path: String) -> Config {
        Config {
            mastodon: MastodonConfig {
                instance_url: "https://example-instance.invalid".to_string(),
                client_id: "cid".to_string(),
                client_secret: "secret".to_string(),
                access_token: "token".to_string(),
                datasource_mode: DatasourceMode::Polling,
                poll_interval_seconds: 3600,
            },
            extractor: ExtractorConfig {
                api_key: "sk-ant-test".to_string(),
                model: "claude-haiku-4-5-20251001".to_string(),
                base_url: "https://example-llm.invalid".to_string(),
                max_retries: 0,
                initial_backoff_seconds: 1.0,
            },
            rss: RssConfig {
                enabled: false,
                feeds: vec![],
                poll_interval_seconds: 600,
                user_agent: "test".to_string(),
            },
            reddit: RedditConfig {
                enabled: false,
                client_id: String::new(),
                client_secret: String::new(),
                username: String::new(),
                password: String::new(),
                subreddits: vec![],
                poll_interval_seconds: 60,
                include_comments: false,
                user_agent: "test".to_string(),
                default_language: "de".to_string(),
            },
            pipeline: PipelineSettings {
                buffer_window_seconds: 3600,
                buffer_max_batch_size: 100,
                snapshot_dir: None,
                retention_hours: 24,
                stale_stream_seconds: 1800,
                health_log_interval_seconds: 3600,
                db_path: Some(db_path),
            },
        }
    }

    #[tokio::test]
    async fn builds_one_datasource_per_enabled_source() {
        let pipeline = Pipeline::new(test_config(temp_db_path())).await.unwrap();
        assert_eq!(pipeline.datasources.len(), 1);
        assert!(pipeline.mastodon_poll.is_some());
    }

    #[tokio::test]
    async fn topics_snapshot_starts_empty() {
        let pipeline = Pipeline::new(test_config(temp_db_path())).await.unwrap();
        assert!(pipeline.topics_snapshot().is_empty());
        assert_eq!(pipeline.health_snapshot().posts_received, 0);
    }

    #[tokio::test]
    async fn request_stop_unblocks_run() {
        let pipeline = Pipeline::new(test_config(temp_db_path())).await.unwrap();
        let running = Arc::clone(&pipeline);
        let handle = tokio::spawn(async move { running.run().await });

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        pipeline.request_stop();

        let result = tokio::time::timeout(std::time::Duration::from_secs(5), handle).await;
        assert!(result.is_ok(), "run() did not return after request_stop");
    }

    #[tokio::test]
    async fn request_stop_is_idempotent() {
        let pipeline = Pipeline::new(test_config(temp_db_path())).await.unwrap();
        pipeline.request_stop();
        pipeline.request_stop(); // must not panic or double-notify badly
    }
}
