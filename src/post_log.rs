//! Durable post log: a single-file, WAL-journaled SQLite store used for
//! crash-recovery dedup. A thin pool wrapper with bound-parameter
//! `sqlx::query`/`query_as` calls, pointed at SQLite instead of a server
//! database since this component needs an embedded single-file store.

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{FromRow, Row, SqlitePool};
use std::str::FromStr;
use tokio::sync::Mutex;

use crate::errors::Result;
use crate::post::Post;

#[derive(Debug, Clone, FromRow)]
struct PostRow {
    id: String,
    text: String,
    created_at: DateTime<Utc>,
    language: Option<String>,
    source: String,
}

impl From<PostRow> for Post {
    fn from(row: PostRow) -> Self {
        Post {
            id: row.id,
            text: row.text,
            created_at: row.created_at,
            language: row.language,
            source: row.source,
        }
    }
}

/// Durable, crash-recoverable record of received posts.
///
/// All write operations are serialized by a process-local mutex so
/// concurrent datasources may call `save_post` safely even though
/// `SqlitePool` itself already supports concurrent connections under
/// WAL — writes are serialized in-process rather than relying on
/// SQLite-level locking to arbitrate them.
pub struct PostLog {
    pool: SqlitePool,
    write_lock: Mutex<()>,
}

impl PostLog {
    pub async fn connect(db_path: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(&format!("sqlite://{}", db_path))?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);
        let pool = SqlitePoolOptions::new().max_connections(5).connect_with(options).await?;
        let log = Self {
            pool,
            write_lock: Mutex::new(()),
        };
        log.migrate().await?;
        Ok(log)
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS posts (
                id TEXT PRIMARY KEY,
                text TEXT NOT NULL,
                created_at TEXT NOT NULL,
                language TEXT,
                source TEXT NOT NULL,
                received_at TEXT NOT NULL,
                processed INTEGER NOT NULL DEFAULT 0
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_posts_unprocessed ON posts(processed) WHERE processed = 0")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_posts_created_at ON posts(created_at)")
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Insert-or-ignore a post. Returns whether the row was newly
    /// inserted (`false` on a duplicate `id`).
    pub async fn save_post(&self, post: &Post) -> Result<bool> {
        let _guard = self.write_lock.lock().await;
        let received_at = Utc::now();
        let result = sqlx::query(
            "INSERT OR IGNORE INTO posts (id, text, created_at, language, source, received_at, processed) \
             VALUES (?, ?, ?, ?, ?, ?, 0)",
        )
        .bind(&post.id)
        .bind(&post.text)
        .bind(post.created_at)
        .bind(&post.language)
        .bind(&post.source)
        .bind(received_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// All rows with `processed = 0`, ordered by `created_at` — used to
    /// replay a window lost to a crash mid-flush.
    pub async fn get_unprocessed_posts(&self) -> Result<Vec<Post>> {
        let rows = sqlx::query_as::<_, PostRow>(
            "SELECT id, text, created_at, language, source FROM posts WHERE processed = 0 ORDER BY created_at ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Post::from).collect())
    }

    /// Mark the given ids processed. No-op on an empty slice or unknown
    /// ids.
    pub async fn mark_batch_processed(&self, ids: &[String]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let _guard = self.write_lock.lock().await;
        let placeholders = ids.iter().map(|_| "?").collect::<Vec<_>>().join(",");
        let query = format!("UPDATE posts SET processed = 1 WHERE id IN ({})", placeholders);
        let mut q = sqlx::query(&query);
        for id in ids {
            q = q.bind(id);
        }
        q.execute(&self.pool).await?;
        Ok(())
    }

    /// Delete processed rows whose `received_at` is older than the
    /// retention cutoff. Returns the number of rows removed.
    pub async fn cleanup_old_posts(&self, retention_hours: i64) -> Result<u64> {
        let _guard = self.write_lock.lock().await;
        let cutoff = Utc::now() - chrono::Duration::hours(retention_hours);
        let result = sqlx::query("DELETE FROM posts WHERE processed = 1 AND received_at < ?")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// The id of the most recently received post, used by the REST-poll
    /// datasource to seed its `since_id` cursor across restarts. Ids are
    /// tracked as "newest received", not a numeric max — see DESIGN.md.
    pub async fn max_post_id(&self) -> Result<Option<String>> {
        let row = sqlx::query("SELECT id FROM posts ORDER BY received_at DESC LIMIT 1")
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get::<String, _>("id")))
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}
