//! REST backend contract consumed by the page dispatcher and the storage session setup.

use futures::future::BoxFuture;
use rowstream_common::{JobRef, Result, TableRef};

use crate::wire::{QueryResults, TableDataList, TableMetadata};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListTabledataRequest {
    pub table: TableRef,
    pub page_token: Option<String>,
    pub start_index: u64,
    /// 0 lets the server pick the page size.
    pub max_results: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetQueryResultsRequest {
    pub job: JobRef,
    pub page_token: Option<String>,
    pub start_index: u64,
    pub max_results: i64,
    /// Partial-response projection, e.g. `rows,pageToken,totalRows`.
    pub fields: String,
}

/// Job facts needed to read its results.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobMetadata {
    pub query: Option<String>,
    pub destination: Option<TableRef>,
    pub complete: bool,
}

/// REST calls behind the read path. Implemented over HTTP by
/// [`crate::http::HttpRestService`] and by in-memory stubs in tests.
///
/// Also serves as the table/job metadata provider: `get_table` for background
/// schema discovery and row counts, `get_job` for redirecting a job to its
/// destination table.
pub trait RestService: Send + Sync {
    /// `tabledata.list`.
    fn list_tabledata(&self, req: ListTabledataRequest) -> BoxFuture<'_, Result<TableDataList>>;

    /// `jobs.getQueryResults`.
    fn get_query_results(&self, req: GetQueryResultsRequest)
    -> BoxFuture<'_, Result<QueryResults>>;

    /// `tables.get`, optionally projected to `fields`.
    fn get_table(
        &self,
        table: TableRef,
        fields: Option<String>,
    ) -> BoxFuture<'_, Result<TableMetadata>>;

    /// `jobs.get`.
    fn get_job(&self, job: JobRef) -> BoxFuture<'_, Result<JobMetadata>>;
}
