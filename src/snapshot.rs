//! Hourly snapshot persistence (§4.I): writes/reads
//! `topics_YYYYMMDD_HH.json` files and prunes old ones on a retention
//! window.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Datelike, NaiveDateTime, TimeZone, Timelike, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::{PipelineError, Result};
use crate::topic_store::{Topic, TopicState};

#[derive(Debug, Serialize, Deserialize)]
struct SnapshotFile {
    timestamp: DateTime<Utc>,
    topics: Vec<SnapshotTopic>,
}

#[derive(Debug, Serialize, Deserialize)]
struct SnapshotTopic {
    name: String,
    score: f64,
    first_seen: DateTime<Utc>,
    last_seen: DateTime<Utc>,
    source: String,
    state: TopicState,
    batches_since_seen: u32,
}

impl From<&Topic> for SnapshotTopic {
    fn from(t: &Topic) -> Self {
        Self {
            name: t.name.clone(),
            score: t.score,
            first_seen: t.first_seen,
            last_seen: t.last_seen,
            source: t.source.clone(),
            state: t.state,
            batches_since_seen: t.batches_since_seen,
        }
    }
}

fn filename_for(now: DateTime<Utc>) -> String {
    format!(
        "topics_{:04}{:02}{:02}_{:02}.json",
        now.year(),
        now.month(),
        now.day(),
        now.hour()
    )
}

/// Serialize `topics` (already sorted score-descending by the caller) to
/// `{snapshot_dir}/topics_YYYYMMDD_HH.json`, the UTC hour-floor of `now`.
/// Two saves within the same hour overwrite. Returns `None` when no
/// snapshot directory is configured.
pub async fn save_snapshot(
    snapshot_dir: Option<&str>,
    topics: &[Topic],
    now: DateTime<Utc>,
) -> Result<Option<PathBuf>> {
    let Some(dir) = snapshot_dir else {
        return Ok(None);
    };
    let dir = Path::new(dir);
    tokio::fs::create_dir_all(dir).await?;

    let path = dir.join(filename_for(now));
    let file = SnapshotFile {
        timestamp: now,
        topics: topics.iter().map(SnapshotTopic::from).collect(),
    };
    let json = serde_json::to_vec_pretty(&file)?;
    tokio::fs::write(&path, json).await?;
    Ok(Some(path))
}

/// Load a snapshot file, recomputing normalized names rather than
/// trusting the file. Structurally invalid rows are skipped with a
/// warning rather than failing the whole load.
pub async fn load_snapshot(path: &Path) -> Result<Vec<Topic>> {
    let bytes = tokio::fs::read(path)
        .await
        .map_err(|_| PipelineError::SnapshotNotFound(path.display().to_string()))?;

    let value: serde_json::Value = serde_json::from_slice(&bytes)?;
    let Some(rows) = value.get("topics").and_then(serde_json::Value::as_array) else {
        return Err(PipelineError::Snapshot(
            "snapshot file missing top-level 'topics' array".into(),
        ));
    };

    let mut topics = Vec::with_capacity(rows.len());
    for row in rows {
        match serde_json::from_value::<SnapshotTopic>(row.clone()) {
            Ok(t) => topics.push(Topic {
                name: t.name.clone(),
                normalized_name: crate::text::normalize_topic_name(&t.name),
                score: t.score,
                first_seen: t.first_seen,
                last_seen: t.last_seen,
                source: t.source,
                state: t.state,
                batches_since_seen: t.batches_since_seen,
            }),
            Err(e) => tracing::warn!(error = %e, "skipping malformed snapshot row"),
        }
    }
    Ok(topics)
}

/// Delete snapshot files whose filename-encoded hour is strictly older
/// than `now - retention_hours`. The exact cutoff hour is kept
/// (strict-less-than). Malformed filenames are left alone. Returns the
/// number of files removed.
pub async fn cleanup_snapshots(snapshot_dir: Option<&str>, now: DateTime<Utc>, retention_hours: i64) -> Result<usize> {
    let Some(dir) = snapshot_dir else {
        return Ok(0);
    };
    let dir = Path::new(dir);
    if !dir.exists() {
        return Ok(0);
    }

    let cutoff = now - chrono::Duration::hours(retention_hours);
    let mut removed = 0usize;

    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let file_name = entry.file_name();
        let Some(name) = file_name.to_str() else {
            continue;
        };
        let Some(hour) = parse_snapshot_hour(name) else {
            continue;
        };
        if hour < cutoff {
            if tokio::fs::remove_file(entry.path()).await.is_ok() {
                removed += 1;
            }
        }
    }
    Ok(removed)
}

fn parse_snapshot_hour(filename: &str) -> Option<DateTime<Utc>> {
    let stem = filename.strip_prefix("topics_")?.strip_suffix(".json")?;
    let (date_part, hour_part) = stem.split_once('_')?;
    if date_part.len() != 8 || hour_part.len() != 2 {
        return None;
    }
    let naive = NaiveDateTime::parse_from_str(
        &format!("{} {}:00:00", date_part, hour_part),
        "%Y%m%d %H:%M:%S",
    )
    .ok()?;
    Some(Utc.from_utc_datetime(&naive))
}
