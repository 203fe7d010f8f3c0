use thiserror::Error;

/// Top-level error taxonomy for the ingestion pipeline.
///
/// Unlike a request-serving gateway, nothing here maps to an HTTP status —
/// call sites log and continue (or drop a batch) rather than propagating
/// a response to anyone.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("datasource error ({source_id}): {message}")]
    Datasource { source_id: String, message: String },

    #[error("extractor error: {0}")]
    Extractor(String),

    #[error("snapshot not found: {0}")]
    SnapshotNotFound(String),

    #[error("snapshot error: {0}")]
    Snapshot(String),

    #[error("post log error: {0}")]
    PostLog(#[from] sqlx::Error),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, PipelineError>;
