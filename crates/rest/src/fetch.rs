//! Page fetch dispatch: cache first, then exactly one REST backend.
//!
//! Dispatch order for every page request:
//! 1. the source's one-shot [`ResultCache`] (first, unsliced page only);
//! 2. `jobs.getQueryResults` for job sources, after waiting once for the job to finish;
//! 3. `tabledata.list` for table sources, with a concurrent `tables.get` when the
//!    schema is still unknown.

use std::sync::Arc;
use std::time::Instant;

use futures::FutureExt;
use futures::future::BoxFuture;
use rowstream_common::{
    CancellationToken, DEFAULT_RETRY_REASONS, JobRef, Result, RetryPolicy, Row, RowStreamError,
    Schema, TableRef, global_metrics, retryable_error,
};
use tracing::{debug, warn};

use crate::service::{GetQueryResultsRequest, ListTabledataRequest, RestService};
use crate::source::{RowSource, SourceKind};
use crate::wire::decode_rest_rows;

/// One page of decoded rows.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Page {
    /// Continuation token; empty means no further pages.
    pub page_token: String,
    pub rows: Vec<Row>,
    pub total_rows: u64,
    /// Empty when the backend did not report one.
    pub schema: Schema,
}

/// Arguments of a single page fetch.
#[derive(Debug, Clone, Copy)]
pub struct PageRequest<'a> {
    pub source: &'a RowSource,
    /// Schema already known to the caller; `None` asks the backend for it.
    pub schema: Option<&'a Schema>,
    pub start_index: u64,
    pub page_size: i64,
    pub page_token: &'a str,
    pub cancel: &'a CancellationToken,
}

/// Something that can produce pages for a REST-mode iterator.
pub trait PageSource: Send + Sync {
    fn fetch_page<'a>(&'a self, req: PageRequest<'a>) -> BoxFuture<'a, Result<Page>>;
}

/// Serve the first page from the source's cache.
///
/// The cache is cleared by every call, hit or miss. Returns `Ok(None)` (a miss) unless
/// the request is for the very first, unsliced page and a schema is resolvable.
///
/// # Errors
/// Cached rows that fail to decode against the resolved schema. The backend is not
/// consulted in that case.
pub fn fetch_cached_page(
    source: &RowSource,
    schema: Option<&Schema>,
    start_index: u64,
    page_size: i64,
    page_token: &str,
) -> Result<Option<Page>> {
    let Some(cache) = source.take_cache() else {
        return Ok(None);
    };
    if !page_token.is_empty() || start_index != 0 {
        return Ok(None);
    }
    if page_size != 0 && usize::try_from(page_size).ok() != Some(cache.rows.len()) {
        return Ok(None);
    }
    let schema = match (schema, cache.schema) {
        (Some(s), _) if !s.is_empty() => s.clone(),
        (_, Some(s)) if !s.is_empty() => s,
        _ if cache.rows.is_empty() => Schema::default(),
        _ => {
            debug!("cached rows without a resolvable schema; ignoring cache");
            return Ok(None);
        }
    };
    let rows = decode_rest_rows(&cache.rows, &schema).map_err(|e| {
        warn!(error = %e, "cached rows failed to decode");
        e.context("result cache")
    })?;
    Ok(Some(Page {
        page_token: cache.next_token,
        rows,
        total_rows: cache.total_rows,
        schema,
    }))
}

/// Default [`PageSource`] backed by a [`RestService`].
#[derive(Clone)]
pub struct PageFetchDispatcher {
    service: Arc<dyn RestService>,
    retry: RetryPolicy,
}

impl PageFetchDispatcher {
    pub fn new(service: Arc<dyn RestService>, retry: RetryPolicy) -> Self {
        Self { service, retry }
    }

    pub fn service(&self) -> &Arc<dyn RestService> {
        &self.service
    }

    /// Fetch one page for `req`.
    ///
    /// # Errors
    /// Backend errors are returned wrapped with the failing call's name; there is no
    /// fallback between the job and table backends.
    pub async fn fetch(&self, req: PageRequest<'_>) -> Result<Page> {
        let started = Instant::now();
        let cached = fetch_cached_page(
            req.source,
            req.schema,
            req.start_index,
            req.page_size,
            req.page_token,
        )?;
        if let Some(page) = cached {
            global_metrics().record_cache_lookup(true);
            global_metrics().record_page(
                "cache",
                page.rows.len() as u64,
                started.elapsed().as_secs_f64(),
            );
            debug!(rows = page.rows.len(), "served first page from result cache");
            return Ok(page);
        }
        if req.page_token.is_empty() && req.start_index == 0 {
            global_metrics().record_cache_lookup(false);
        }

        let (backend, page) = match req.source.kind() {
            SourceKind::Job { job, .. } => ("query_results", self.fetch_job_page(job, &req).await?),
            SourceKind::Table(table) => ("tabledata", self.fetch_table_page(table, &req).await?),
        };
        global_metrics().record_page(
            backend,
            page.rows.len() as u64,
            started.elapsed().as_secs_f64(),
        );
        debug!(
            backend,
            rows = page.rows.len(),
            has_more = !page.page_token.is_empty(),
            total_rows = page.total_rows,
            "fetched page"
        );
        Ok(page)
    }

    /// Poll `jobs.getQueryResults` without a projection until the job reports
    /// completion. Returns at once for sources already known to be finished.
    ///
    /// # Errors
    /// Non-retryable backend errors, or [`RowStreamError::Cancelled`].
    pub async fn wait_for_job(
        &self,
        source: &RowSource,
        job: &JobRef,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if source.job_finished() {
            return Ok(());
        }
        let call = GetQueryResultsRequest {
            job: job.clone(),
            page_token: None,
            start_index: 0,
            max_results: 0,
            fields: String::new(),
        };
        let job_id = job.to_string();
        self.retry
            .run(
                "jobs.getQueryResults",
                cancel,
                || {
                    let call = call.clone();
                    let job_id = job_id.clone();
                    async move {
                        let res = self.service.get_query_results(call).await?;
                        if res.job_complete == Some(false) {
                            debug!(job = %job_id, "job still running");
                            return Err(RowStreamError::IncompleteJob(job_id));
                        }
                        Ok(())
                    }
                },
                |e| {
                    matches!(e, RowStreamError::IncompleteJob(_))
                        || retryable_error(e, DEFAULT_RETRY_REASONS)
                },
            )
            .await
            .map_err(|e| e.context("jobs.getQueryResults"))?;
        source.mark_job_finished();
        Ok(())
    }

    async fn fetch_job_page(&self, job: &JobRef, req: &PageRequest<'_>) -> Result<Page> {
        self.wait_for_job(req.source, job, req.cancel).await?;

        let mut fields = vec!["rows", "pageToken", "totalRows"];
        if req.schema.is_none() {
            fields.push("schema");
        }
        let call = GetQueryResultsRequest {
            job: job.clone(),
            page_token: non_empty(req.page_token),
            start_index: req.start_index,
            max_results: req.page_size,
            fields: fields.join(","),
        };
        let res = self
            .retry
            .run(
                "jobs.getQueryResults",
                req.cancel,
                || self.service.get_query_results(call.clone()),
                |e| retryable_error(e, DEFAULT_RETRY_REASONS),
            )
            .await
            .map_err(|e| e.context("jobs.getQueryResults"))?;

        let schema = match req.schema {
            Some(s) => s.clone(),
            None => res.schema.unwrap_or_default(),
        };
        let rows = decode_page_rows(&res.rows, &schema)?;
        Ok(Page {
            page_token: res.page_token.unwrap_or_default(),
            rows,
            total_rows: res.total_rows,
            schema,
        })
    }

    async fn fetch_table_page(&self, table: &TableRef, req: &PageRequest<'_>) -> Result<Page> {
        let call = ListTabledataRequest {
            table: table.clone(),
            page_token: non_empty(req.page_token),
            start_index: req.start_index,
            max_results: req.page_size,
        };
        let list = async {
            self.retry
                .run(
                    "tabledata.list",
                    req.cancel,
                    || self.service.list_tabledata(call.clone()),
                    |e| retryable_error(e, DEFAULT_RETRY_REASONS),
                )
                .await
                .map_err(|e| e.context("tabledata.list"))
        };

        let (data, schema) = match req.schema {
            Some(s) => (list.await?, s.clone()),
            None => {
                let schema = async {
                    self.retry
                        .run(
                            "tables.get",
                            req.cancel,
                            || {
                                self.service
                                    .get_table(table.clone(), Some("schema".to_string()))
                            },
                            |e| retryable_error(e, DEFAULT_RETRY_REASONS),
                        )
                        .await
                        .map(|meta| meta.schema)
                        .map_err(|e| e.context("tables.get"))
                };
                futures::try_join!(list, schema)?
            }
        };

        let rows = decode_page_rows(&data.rows, &schema)?;
        Ok(Page {
            page_token: data.page_token.unwrap_or_default(),
            rows,
            total_rows: data.total_rows,
            schema,
        })
    }
}

impl PageSource for PageFetchDispatcher {
    fn fetch_page<'a>(&'a self, req: PageRequest<'a>) -> BoxFuture<'a, Result<Page>> {
        self.fetch(req).boxed()
    }
}

fn decode_page_rows(rows: &[crate::wire::TableRow], schema: &Schema) -> Result<Vec<Row>> {
    if rows.is_empty() {
        return Ok(Vec::new());
    }
    if schema.is_empty() {
        return Err(RowStreamError::Decode(
            "page has rows but no schema is known".to_string(),
        ));
    }
    decode_rest_rows(rows, schema)
}

fn non_empty(token: &str) -> Option<String> {
    (!token.is_empty()).then(|| token.to_string())
}
