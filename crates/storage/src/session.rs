//! Storage read session setup for a [`RowSource`].

use std::sync::Arc;

use bytes::Bytes;
use rowstream_common::{
    CancellationToken, DEFAULT_RETRY_REASONS, JobRef, Result, RetryPolicy, RowStreamError,
    Schema, StorageReadSettings, TableRef, retryable_error, retryable_rpc,
};
use rowstream_rest::{JobMetadata, RestService, RowSource, SourceKind};
use tracing::{debug, info};

use crate::client::{CreateReadSessionRequest, ReadClient, StreamHandle};

/// A created session, resolved to a concrete table.
#[derive(Debug, Clone, PartialEq)]
pub struct ReadSession {
    pub name: String,
    pub table: TableRef,
    pub streams: Vec<StreamHandle>,
    pub arrow_schema: Bytes,
    /// Table schema from `tables.get`.
    pub schema: Schema,
    pub total_rows: u64,
}

impl ReadSession {
    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }
}

/// Opens read sessions: resolves job sources to their destination table, then issues
/// `CreateReadSession` under retry.
#[derive(Clone)]
pub struct SessionFactory {
    client: Arc<dyn ReadClient>,
    rest: Arc<dyn RestService>,
    retry: RetryPolicy,
    settings: StorageReadSettings,
}

impl SessionFactory {
    pub fn new(
        client: Arc<dyn ReadClient>,
        rest: Arc<dyn RestService>,
        retry: RetryPolicy,
        settings: StorageReadSettings,
    ) -> Self {
        Self {
            client,
            rest,
            retry,
            settings,
        }
    }

    pub fn client(&self) -> &Arc<dyn ReadClient> {
        &self.client
    }

    pub fn settings(&self) -> &StorageReadSettings {
        &self.settings
    }

    pub fn retry(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Create a session for `source`.
    ///
    /// # Errors
    /// Job sources without a destination table are rejected; metadata and session
    /// RPC failures are returned wrapped with the failing call's name.
    pub async fn open(&self, source: &RowSource, cancel: &CancellationToken) -> Result<ReadSession> {
        let (table, ordered) = match source.kind() {
            SourceKind::Table(t) => (t.clone(), false),
            SourceKind::Job { job, destination } => {
                let meta = self.job_metadata(job, cancel).await?;
                let ordered = meta.query.as_deref().is_some_and(has_top_level_order_by);
                let table = meta
                    .destination
                    .or_else(|| destination.clone())
                    .ok_or_else(|| {
                        RowStreamError::Unsupported(format!("job {job} has no destination table"))
                    })?;
                (table, ordered)
            }
        };

        let meta = self
            .retry
            .run(
                "tables.get",
                cancel,
                || self.rest.get_table(table.clone(), None),
                |e| retryable_error(e, DEFAULT_RETRY_REASONS),
            )
            .await
            .map_err(|e| e.context("tables.get"))?;

        let max_stream_count = if ordered {
            1
        } else {
            self.settings.max_stream_count
        };
        let req = CreateReadSessionRequest {
            parent: format!("projects/{}", table.project_id),
            table: table.storage_path(),
            max_stream_count,
        };
        debug!(table = %table, max_stream_count, "creating read session");
        let info = self
            .retry
            .run(
                "storage.CreateReadSession",
                cancel,
                || self.client.create_read_session(req.clone()),
                retryable_rpc,
            )
            .await
            .map_err(|e| e.context("storage.CreateReadSession"))?;

        info!(
            session = %info.name,
            table = %table,
            streams = info.streams.len(),
            ordered,
            "read session created"
        );
        Ok(ReadSession {
            name: info.name,
            table,
            streams: info.streams,
            arrow_schema: info.arrow_schema,
            schema: meta.schema,
            total_rows: meta.num_rows,
        })
    }

    async fn job_metadata(&self, job: &JobRef, cancel: &CancellationToken) -> Result<JobMetadata> {
        let job_id = job.to_string();
        self.retry
            .run(
                "jobs.get",
                cancel,
                || {
                    let job_id = job_id.clone();
                    async move {
                        let meta = self.rest.get_job(job.clone()).await?;
                        if !meta.complete {
                            return Err(RowStreamError::IncompleteJob(job_id));
                        }
                        Ok(meta)
                    }
                },
                |e| {
                    matches!(e, RowStreamError::IncompleteJob(_))
                        || retryable_error(e, DEFAULT_RETRY_REASONS)
                },
            )
            .await
            .map_err(|e| e.context("jobs.get"))
    }
}

/// True when `query` has an `ORDER BY` outside any parentheses, string
/// literal, quoted identifier or comment.
pub fn has_top_level_order_by(query: &str) -> bool {
    let bytes = query.as_bytes();
    let mut depth: usize = 0;
    let mut prev_word: Option<&str> = None;
    let mut i = 0;
    while i < bytes.len() {
        let c = bytes[i];
        match c {
            b'\'' | b'"' | b'`' => {
                i += 1;
                while i < bytes.len() && bytes[i] != c {
                    if bytes[i] == b'\\' {
                        i += 1;
                    }
                    i += 1;
                }
                i += 1;
                prev_word = None;
            }
            b'-' if bytes.get(i + 1) == Some(&b'-') => {
                while i < bytes.len() && bytes[i] != b'\n' {
                    i += 1;
                }
            }
            b'#' => {
                while i < bytes.len() && bytes[i] != b'\n' {
                    i += 1;
                }
            }
            b'/' if bytes.get(i + 1) == Some(&b'*') => {
                i += 2;
                while i + 1 < bytes.len() && !(bytes[i] == b'*' && bytes[i + 1] == b'/') {
                    i += 1;
                }
                i += 2;
            }
            b'(' => {
                depth += 1;
                prev_word = None;
                i += 1;
            }
            b')' => {
                depth = depth.saturating_sub(1);
                prev_word = None;
                i += 1;
            }
            c if c.is_ascii_alphanumeric() || c == b'_' => {
                let start = i;
                while i < bytes.len() && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'_') {
                    i += 1;
                }
                let word = &query[start..i];
                if depth == 0
                    && word.eq_ignore_ascii_case("by")
                    && prev_word.is_some_and(|p| p.eq_ignore_ascii_case("order"))
                {
                    return true;
                }
                prev_word = Some(word);
            }
            c if c.is_ascii_whitespace() => i += 1,
            _ => {
                prev_word = None;
                i += 1;
            }
        }
    }
    false
}
