//! Configuration loading and validation.
//!
//! `load` is a pure function over an already-collected environment map so
//! it can be unit tested without touching real process environment. The
//! only side effect (reading `.env` / `std::env::vars()`) happens once,
//! in `main`.

use std::collections::HashMap;

use serde::Deserialize;

const DEFAULT_EXTRACTOR_MODEL: &str = "claude-haiku-4-5-20251001";
const DEFAULT_ANTHROPIC_BASE_URL: &str = "https://api.anthropic.com";

#[derive(Debug, Clone, Deserialize)]
pub struct MastodonConfig {
    pub instance_url: String,
    pub client_id: String,
    pub client_secret: String,
    pub access_token: String,
    pub datasource_mode: DatasourceMode,
    pub poll_interval_seconds: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatasourceMode {
    Stream,
    Polling,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExtractorConfig {
    pub api_key: String,
    pub model: String,
    pub base_url: String,
    pub max_retries: u32,
    pub initial_backoff_seconds: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FeedConfig {
    pub url: String,
    pub name: String,
    pub language: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RssConfig {
    pub enabled: bool,
    pub feeds: Vec<FeedConfig>,
    pub poll_interval_seconds: u64,
    pub user_agent: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedditConfig {
    pub enabled: bool,
    pub client_id: String,
    pub client_secret: String,
    pub username: String,
    pub password: String,
    pub subreddits: Vec<String>,
    pub poll_interval_seconds: u64,
    pub include_comments: bool,
    pub user_agent: String,
    pub default_language: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PipelineSettings {
    pub buffer_window_seconds: u64,
    pub buffer_max_batch_size: usize,
    pub snapshot_dir: Option<String>,
    pub retention_hours: i64,
    pub stale_stream_seconds: u64,
    pub health_log_interval_seconds: u64,
    pub db_path: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub mastodon: MastodonConfig,
    pub extractor: ExtractorConfig,
    pub rss: RssConfig,
    pub reddit: RedditConfig,
    pub pipeline: PipelineSettings,
}

const DEFAULT_RSS_FEEDS: &[(&str, &str)] = &[
    ("https://rss.orf.at/wien.xml", "orf-wien"),
    ("https://rss.orf.at/news.xml", "orf-news"),
    ("http://www.vienna.at/rss", "vienna-at"),
    ("https://www.ots.at/rss/index", "ots"),
];

/// Load and validate configuration from a pre-collected environment map.
///
/// Every validation failure is collected rather than returned on the first
/// one — startup aborts with a message listing every missing/invalid key
/// at once instead of making an operator fix them one at a time.
pub fn load(env: &HashMap<String, String>) -> Result<Config, Vec<String>> {
    let mut errors = Vec::new();

    let get = |key: &str| env.get(key).map(|s| s.trim().to_string());
    let get_or = |key: &str, default: &str| get(key).unwrap_or_else(|| default.to_string());

    let instance_url = get("MASTODON_INSTANCE_URL").unwrap_or_default();
    if instance_url.is_empty() {
        errors.push("MASTODON_INSTANCE_URL is required".to_string());
    } else if !instance_url.starts_with("https://") {
        errors.push("MASTODON_INSTANCE_URL must start with https://".to_string());
    }

    let client_id = get("MASTODON_CLIENT_ID").unwrap_or_default();
    if client_id.is_empty() {
        errors.push("MASTODON_CLIENT_ID is required".to_string());
    }
    let client_secret = get("MASTODON_CLIENT_SECRET").unwrap_or_default();
    if client_secret.is_empty() {
        errors.push("MASTODON_CLIENT_SECRET is required".to_string());
    }
    let access_token = get("MASTODON_ACCESS_TOKEN").unwrap_or_default();
    if access_token.is_empty() {
        errors.push("MASTODON_ACCESS_TOKEN is required".to_string());
    }

    let datasource_mode = match get_or("MASTODON_DATASOURCE_MODE", "stream").as_str() {
        "stream" => DatasourceMode::Stream,
        "polling" => DatasourceMode::Polling,
        other => {
            errors.push(format!(
                "MASTODON_DATASOURCE_MODE must be 'stream' or 'polling', got '{}'",
                other
            ));
            DatasourceMode::Stream
        }
    };

    let poll_interval_seconds = parse_or(
        &get_or("MASTODON_POLL_INTERVAL_SECONDS", "30"),
        "MASTODON_POLL_INTERVAL_SECONDS",
        30,
        &mut errors,
    );

    let api_key = get("ANTHROPIC_API_KEY").unwrap_or_default();
    if api_key.is_empty() {
        errors.push("ANTHROPIC_API_KEY is required".to_string());
    }
    let model = get_or("ANTHROPIC_MODEL", DEFAULT_EXTRACTOR_MODEL);
    if model.is_empty() {
        errors.push("ANTHROPIC_MODEL must not be empty".to_string());
    }
    let base_url = get_or("ANTHROPIC_BASE_URL", DEFAULT_ANTHROPIC_BASE_URL);
    let max_retries = parse_or(
        &get_or("ANTHROPIC_MAX_RETRIES", "3"),
        "ANTHROPIC_MAX_RETRIES",
        3,
        &mut errors,
    );
    let initial_backoff_seconds: f64 = get_or("ANTHROPIC_INITIAL_BACKOFF_SECONDS", "1.0")
        .parse()
        .unwrap_or(1.0);

    let rss_enabled = get_or("RSS_ENABLED", "false").to_lowercase() == "true";
    let feeds = match get("RSS_FEEDS") {
        Some(raw) if !raw.trim().is_empty() => raw
            .split(',')
            .filter_map(|pair| {
                let pair = pair.trim();
                pair.split_once('|').map(|(url, name)| FeedConfig {
                    url: url.trim().to_string(),
                    name: name.trim().to_string(),
                    language: "de".to_string(),
                })
            })
            .collect::<Vec<_>>(),
        _ => DEFAULT_RSS_FEEDS
            .iter()
            .map(|(url, name)| FeedConfig {
                url: url.to_string(),
                name: name.to_string(),
                language: "de".to_string(),
            })
            .collect(),
    };
    if rss_enabled && feeds.is_empty() {
        errors.push("RSS_FEEDS must not be empty when RSS is enabled".to_string());
    }
    let rss_poll_interval_seconds = parse_or(
        &get_or("RSS_POLL_INTERVAL", "600"),
        "RSS_POLL_INTERVAL",
        600,
        &mut errors,
    );
    let rss_user_agent = get_or("RSS_USER_AGENT", "ViennaTalksBout/1.0");

    let reddit_enabled = get_or("REDDIT_ENABLED", "false").to_lowercase() == "true";
    let reddit_client_id = get_or("REDDIT_CLIENT_ID", "");
    let reddit_client_secret = get_or("REDDIT_CLIENT_SECRET", "");
    let reddit_username = get_or("REDDIT_USERNAME", "");
    let reddit_password = get_or("REDDIT_PASSWORD", "");
    if reddit_enabled {
        if reddit_client_id.is_empty() {
            errors.push("REDDIT_CLIENT_ID is required when Reddit is enabled".to_string());
        }
        if reddit_client_secret.is_empty() {
            errors.push("REDDIT_CLIENT_SECRET is required when Reddit is enabled".to_string());
        }
        if reddit_username.is_empty() {
            errors.push("REDDIT_USERNAME is required when Reddit is enabled".to_string());
        }
        if reddit_password.is_empty() {
            errors.push("REDDIT_PASSWORD is required when Reddit is enabled".to_string());
        }
    }
    let subreddits: Vec<String> = get_or("REDDIT_SUBREDDITS", "wien,austria")
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();
    let reddit_poll_interval_seconds = parse_or(
        &get_or("REDDIT_POLL_INTERVAL", "60"),
        "REDDIT_POLL_INTERVAL",
        60,
        &mut errors,
    );
    let reddit_include_comments = get_or("REDDIT_INCLUDE_COMMENTS", "false").to_lowercase() == "true";

    let snapshot_dir = get("SNAPSHOT_DIR").filter(|s| !s.is_empty());
    let retention_hours = parse_or(&get_or("RETENTION_HOURS", "24"), "RETENTION_HOURS", 24, &mut errors);
    let stale_stream_seconds = parse_or(
        &get_or("STALE_STREAM_SECONDS", "1800"),
        "STALE_STREAM_SECONDS",
        1800,
        &mut errors,
    );
    let health_log_interval_seconds = parse_or(
        &get_or("HEALTH_LOG_INTERVAL", "300"),
        "HEALTH_LOG_INTERVAL",
        300,
        &mut errors,
    );
    let buffer_window_seconds = parse_or(
        &get_or("BUFFER_WINDOW_SECONDS", "600"),
        "BUFFER_WINDOW_SECONDS",
        600,
        &mut errors,
    );
    let buffer_max_batch_size: usize = parse_or(
        &get_or("BUFFER_MAX_BATCH_SIZE", "100"),
        "BUFFER_MAX_BATCH_SIZE",
        100,
        &mut errors,
    );
    let db_path = get("DB_PATH").filter(|s| !s.is_empty());

    if !errors.is_empty() {
        return Err(errors);
    }

    Ok(Config {
        mastodon: MastodonConfig {
            instance_url,
            client_id,
            client_secret,
            access_token,
            datasource_mode,
            poll_interval_seconds,
        },
        extractor: ExtractorConfig {
            api_key,
            model,
            base_url,
            max_retries,
            initial_backoff_seconds,
        },
        rss: RssConfig {
            enabled: rss_enabled,
            feeds,
            poll_interval_seconds: rss_poll_interval_seconds,
            user_agent: rss_user_agent,
        },
        reddit: RedditConfig {
            enabled: reddit_enabled,
            client_id: reddit_client_id,
            client_secret: reddit_client_secret,
            username: reddit_username,
            password: reddit_password,
            subreddits,
            poll_interval_seconds: reddit_poll_interval_seconds,
            include_comments: reddit_include_comments,
            user_agent: "topicstream/0.1".to_string(),
            default_language: "de".to_string(),
        },
        pipeline: PipelineSettings {
            buffer_window_seconds,
            buffer_max_batch_size,
            snapshot_dir,
            retention_hours,
            stale_stream_seconds,
            health_log_interval_seconds,
            db_path,
        },
    })
}

fn parse_or<T: std::str::FromStr>(raw: &str, key: &str, default: T, errors: &mut Vec<String>) -> T {
    match raw.parse() {
        Ok(v) => v,
        Err(_) => {
            errors.push(format!("{} is not a valid number: '{}'", key, raw));
            default
        }
    }
}

/// Load configuration from the real process environment, honoring a `.env`
/// file if present. The only entry point that performs the file-loading
/// side effect — everything else in this module is a pure function of a
/// `HashMap`.
pub fn load_from_process_env() -> Result<Config, Vec<String>> {
    dotenvy::dotenv().ok();
    let env: HashMap<String, String> = std::env::vars().collect();
    load(&env)
}
