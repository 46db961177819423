use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default REST API root.
pub const DEFAULT_REST_ENDPOINT: &str = "https://bigquery.googleapis.com/bigquery/v2";

/// Read-path configuration shared by the REST pager and the storage fan-in reader.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReadConfig {
    /// Rows requested per REST page; 0 lets the server decide.
    pub page_size: i64,
    /// REST API root used by the HTTP service.
    pub rest_endpoint: String,
    pub retry: RetrySettings,
    pub storage: StorageReadSettings,
}

impl Default for ReadConfig {
    fn default() -> Self {
        Self {
            page_size: 0,
            rest_endpoint: DEFAULT_REST_ENDPOINT.to_string(),
            retry: RetrySettings::default(),
            storage: StorageReadSettings::default(),
        }
    }
}

impl ReadConfig {
    /// Defaults overlaid with `ROWSTREAM_*` environment overrides.
    ///
    /// Unparsable values are ignored.
    pub fn from_env() -> Self {
        let mut c = Self::default();
        if let Some(v) = env_parse::<i64>("ROWSTREAM_PAGE_SIZE") {
            c.page_size = v.max(0);
        }
        if let Ok(v) = std::env::var("ROWSTREAM_REST_ENDPOINT") {
            if !v.trim().is_empty() {
                c.rest_endpoint = v.trim().trim_end_matches('/').to_string();
            }
        }
        if let Some(v) = env_parse::<u64>("ROWSTREAM_RETRY_INITIAL_MS") {
            c.retry.initial_backoff_ms = v.max(1);
        }
        if let Some(v) = env_parse::<u64>("ROWSTREAM_RETRY_MAX_MS") {
            c.retry.max_backoff_ms = v.max(1);
        }
        if let Some(v) = env_parse::<f64>("ROWSTREAM_RETRY_MULTIPLIER") {
            if v >= 1.0 {
                c.retry.multiplier = v;
            }
        }
        if let Some(v) = env_parse::<i32>("ROWSTREAM_MAX_STREAM_COUNT") {
            c.storage.max_stream_count = v.max(0);
        }
        if let Some(v) = env_parse::<usize>("ROWSTREAM_MAX_WORKER_COUNT") {
            c.storage.max_worker_count = v.max(1);
        }
        c
    }
}

/// Exponential backoff parameters for retried calls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub multiplier: f64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            initial_backoff_ms: 1_000,
            max_backoff_ms: 32_000,
            multiplier: 2.0,
        }
    }
}

impl RetrySettings {
    pub fn initial(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    pub fn max(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }
}

/// Storage read session sizing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageReadSettings {
    /// Upper bound on streams requested from the server; 0 lets the server decide.
    pub max_stream_count: i32,
    /// Max stream workers reading concurrently.
    pub max_worker_count: usize,
}

impl Default for StorageReadSettings {
    fn default() -> Self {
        Self {
            max_stream_count: 0,
            max_worker_count: 10,
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse::<T>().ok())
}
