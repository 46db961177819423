//! `reqwest` implementation of [`RestService`] against the v2 REST API.

use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use reqwest::{Client, RequestBuilder, StatusCode};
use rowstream_common::{
    ApiError, JobRef, Result, RowStreamError, TableRef, TransportErrorKind,
};
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::service::{GetQueryResultsRequest, JobMetadata, ListTabledataRequest, RestService};
use crate::wire::{ErrorEnvelope, JobResource, QueryResults, TableDataList, TableMetadata};

#[derive(Debug, Clone)]
pub struct HttpRestService {
    client: Client,
    endpoint: String,
    access_token: Option<String>,
}

impl HttpRestService {
    /// Service rooted at `endpoint` (e.g. `https://bigquery.googleapis.com/bigquery/v2`).
    ///
    /// # Errors
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(endpoint: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| RowStreamError::InvalidConfig(format!("http client build failed: {e}")))?;
        Ok(Self {
            client,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            access_token: None,
        })
    }

    /// Attach a bearer token to every request.
    pub fn with_access_token(mut self, token: impl Into<String>) -> Self {
        self.access_token = Some(token.into());
        self
    }

    fn get(&self, path: &str) -> RequestBuilder {
        let req = self.client.get(format!("{}/{path}", self.endpoint));
        match &self.access_token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }

    async fn send_json<T: DeserializeOwned>(&self, call: &str, req: RequestBuilder) -> Result<T> {
        let resp = req.send().await.map_err(transport_error)?;
        let status = resp.status();
        let body = resp.bytes().await.map_err(transport_error)?;
        debug!(call, status = status.as_u16(), bytes = body.len(), "rest response");
        if !status.is_success() {
            return Err(RowStreamError::Api(api_error(status, &body)));
        }
        serde_json::from_slice(&body)
            .map_err(|e| RowStreamError::Decode(format!("{call} response decode failed: {e}")))
    }
}

fn table_path(t: &TableRef) -> String {
    format!(
        "projects/{}/datasets/{}/tables/{}",
        t.project_id, t.dataset_id, t.table_id
    )
}

fn paging_query(
    page_token: &Option<String>,
    start_index: u64,
    max_results: i64,
) -> Vec<(&'static str, String)> {
    let mut q = Vec::new();
    match page_token {
        Some(tok) if !tok.is_empty() => q.push(("pageToken", tok.clone())),
        _ if start_index > 0 => q.push(("startIndex", start_index.to_string())),
        _ => {}
    }
    if max_results > 0 {
        q.push(("maxResults", max_results.to_string()));
    }
    q
}

fn api_error(status: StatusCode, body: &[u8]) -> ApiError {
    match serde_json::from_slice::<ErrorEnvelope>(body) {
        Ok(env) => env.into_api_error(status.as_u16()),
        Err(_) => ApiError {
            code: status.as_u16(),
            reason: None,
            message: String::from_utf8_lossy(body).into_owned(),
        },
    }
}

fn transport_error(e: reqwest::Error) -> RowStreamError {
    let text = e.to_string();
    let kind = if e.is_timeout() {
        TransportErrorKind::Timeout
    } else if text.contains("connection refused") {
        TransportErrorKind::ConnectionRefused
    } else if text.contains("connection reset") {
        TransportErrorKind::ConnectionReset
    } else if text.contains("stream closed") {
        TransportErrorKind::StreamClosed
    } else if e.is_body() || text.contains("unexpected EOF") {
        TransportErrorKind::UnexpectedEof
    } else if e.is_connect() {
        TransportErrorKind::ConnectionRefused
    } else {
        TransportErrorKind::Other
    };
    RowStreamError::Transport {
        kind,
        message: text,
    }
}

impl RestService for HttpRestService {
    fn list_tabledata(&self, req: ListTabledataRequest) -> BoxFuture<'_, Result<TableDataList>> {
        async move {
            let path = format!("{}/data", table_path(&req.table));
            let query = paging_query(&req.page_token, req.start_index, req.max_results);
            self.send_json("tabledata.list", self.get(&path).query(&query))
                .await
        }
        .boxed()
    }

    fn get_query_results(
        &self,
        req: GetQueryResultsRequest,
    ) -> BoxFuture<'_, Result<QueryResults>> {
        async move {
            let path = format!("projects/{}/queries/{}", req.job.project_id, req.job.job_id);
            let mut query = paging_query(&req.page_token, req.start_index, req.max_results);
            if let Some(location) = &req.job.location {
                query.push(("location", location.clone()));
            }
            if !req.fields.is_empty() {
                query.push(("fields", req.fields.clone()));
            }
            self.send_json("jobs.getQueryResults", self.get(&path).query(&query))
                .await
        }
        .boxed()
    }

    fn get_table(
        &self,
        table: TableRef,
        fields: Option<String>,
    ) -> BoxFuture<'_, Result<TableMetadata>> {
        async move {
            let mut req = self.get(&table_path(&table));
            if let Some(fields) = fields {
                req = req.query(&[("fields", fields)]);
            }
            self.send_json("tables.get", req).await
        }
        .boxed()
    }

    fn get_job(&self, job: JobRef) -> BoxFuture<'_, Result<JobMetadata>> {
        async move {
            let path = format!("projects/{}/jobs/{}", job.project_id, job.job_id);
            let mut req = self.get(&path);
            if let Some(location) = &job.location {
                req = req.query(&[("location", location)]);
            }
            let resource: JobResource = self.send_json("jobs.get", req).await?;
            let query = resource.configuration.and_then(|c| c.query);
            Ok(JobMetadata {
                destination: query.as_ref().and_then(|q| q.destination_table.clone()),
                query: query.map(|q| q.query).filter(|q| !q.is_empty()),
                complete: resource
                    .status
                    .map(|s| s.state == "DONE")
                    .unwrap_or(false),
            })
        }
        .boxed()
    }
}
