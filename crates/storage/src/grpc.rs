//! tonic client for the storage read API.
//!
//! RPC schema source: `proto/bigquery_read.proto`. Authentication metadata is the
//! caller's concern: pass an already-authorized [`tonic::transport::Channel`] or an
//! access token applied as a bearer header.

use futures::future::BoxFuture;
use futures::{FutureExt, StreamExt, TryStreamExt};
use rowstream_common::{Result, RowStreamError, RpcCode, TransportErrorKind};
use tonic::metadata::MetadataValue;
use tonic::transport::{Channel, Endpoint};
use tonic::{Code, Request, Status};

use crate::client::{
    CreateReadSessionRequest, ReadClient, ReadRowsRequest, ReadRowsResponse, ReadRowsStream,
    ReadSessionInfo, StreamHandle,
};

#[allow(missing_docs)]
pub mod v1 {
    tonic::include_proto!("google.cloud.bigquery.storage.v1");
}

pub use v1::big_query_read_client::BigQueryReadClient;

pub const DEFAULT_STORAGE_ENDPOINT: &str = "https://bigquerystorage.googleapis.com";

#[derive(Debug, Clone)]
pub struct GrpcReadClient {
    inner: BigQueryReadClient<Channel>,
    access_token: Option<String>,
}

impl GrpcReadClient {
    /// Connect to `endpoint`.
    ///
    /// # Errors
    /// Returns a transport error when the endpoint is invalid or unreachable.
    pub async fn connect(endpoint: &str) -> Result<Self> {
        let channel = Endpoint::from_shared(endpoint.to_string())
            .map_err(map_transport_err)?
            .connect()
            .await
            .map_err(map_transport_err)?;
        Ok(Self::from_channel(channel))
    }

    pub fn from_channel(channel: Channel) -> Self {
        Self {
            inner: BigQueryReadClient::new(channel),
            access_token: None,
        }
    }

    pub fn with_access_token(mut self, token: impl Into<String>) -> Self {
        self.access_token = Some(token.into());
        self
    }

    fn request<T>(&self, message: T, routing: &str) -> Result<Request<T>> {
        let mut req = Request::new(message);
        let params = MetadataValue::try_from(routing)
            .map_err(|e| RowStreamError::InvalidConfig(format!("bad routing header: {e}")))?;
        req.metadata_mut().insert("x-goog-request-params", params);
        if let Some(token) = &self.access_token {
            let bearer = MetadataValue::try_from(format!("Bearer {token}"))
                .map_err(|e| RowStreamError::InvalidConfig(format!("bad access token: {e}")))?;
            req.metadata_mut().insert("authorization", bearer);
        }
        Ok(req)
    }
}

impl ReadClient for GrpcReadClient {
    fn create_read_session(
        &self,
        req: CreateReadSessionRequest,
    ) -> BoxFuture<'_, Result<ReadSessionInfo>> {
        async move {
            let routing = format!("read_session.table={}", req.table);
            let message = v1::CreateReadSessionRequest {
                parent: req.parent,
                read_session: Some(v1::ReadSession {
                    table: req.table,
                    data_format: v1::DataFormat::Arrow as i32,
                    ..Default::default()
                }),
                max_stream_count: req.max_stream_count,
            };
            let session = self
                .inner
                .clone()
                .create_read_session(self.request(message, &routing)?)
                .await
                .map_err(map_status)?
                .into_inner();
            Ok(ReadSessionInfo {
                name: session.name,
                streams: session
                    .streams
                    .into_iter()
                    .map(|s| StreamHandle { name: s.name })
                    .collect(),
                arrow_schema: session
                    .arrow_schema
                    .map(|s| s.serialized_schema.into())
                    .unwrap_or_default(),
            })
        }
        .boxed()
    }

    fn read_rows(&self, req: ReadRowsRequest) -> BoxFuture<'_, Result<ReadRowsStream>> {
        async move {
            let routing = format!("read_stream={}", req.stream);
            let message = v1::ReadRowsRequest {
                read_stream: req.stream,
                offset: req.offset,
            };
            let stream = self
                .inner
                .clone()
                .read_rows(self.request(message, &routing)?)
                .await
                .map_err(map_status)?
                .into_inner();
            Ok(stream
                .map_err(map_status)
                .map_ok(|r| ReadRowsResponse {
                    row_count: r.row_count,
                    arrow_record_batch: r
                        .arrow_record_batch
                        .map(|b| b.serialized_record_batch.into())
                        .unwrap_or_default(),
                })
                .boxed())
        }
        .boxed()
    }
}

fn map_status(status: Status) -> RowStreamError {
    RowStreamError::Rpc {
        code: rpc_code(status.code()),
        message: status.message().to_string(),
    }
}

fn map_transport_err(err: tonic::transport::Error) -> RowStreamError {
    RowStreamError::Transport {
        kind: TransportErrorKind::ConnectionRefused,
        message: format!("grpc connect failed: {err}"),
    }
}

fn rpc_code(code: Code) -> RpcCode {
    match code {
        Code::Cancelled => RpcCode::Cancelled,
        Code::InvalidArgument => RpcCode::InvalidArgument,
        Code::DeadlineExceeded => RpcCode::DeadlineExceeded,
        Code::NotFound => RpcCode::NotFound,
        Code::AlreadyExists => RpcCode::AlreadyExists,
        Code::PermissionDenied => RpcCode::PermissionDenied,
        Code::ResourceExhausted => RpcCode::ResourceExhausted,
        Code::FailedPrecondition => RpcCode::FailedPrecondition,
        Code::Aborted => RpcCode::Aborted,
        Code::OutOfRange => RpcCode::OutOfRange,
        Code::Unimplemented => RpcCode::Unimplemented,
        Code::Internal => RpcCode::Internal,
        Code::Unavailable => RpcCode::Unavailable,
        Code::DataLoss => RpcCode::DataLoss,
        Code::Unauthenticated => RpcCode::Unauthenticated,
        Code::Ok | Code::Unknown => RpcCode::Unknown,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_keep_their_meaning() {
        let err = map_status(Status::unavailable("try later"));
        assert_eq!(
            err,
            RowStreamError::Rpc {
                code: RpcCode::Unavailable,
                message: "try later".to_string(),
            }
        );
        assert!(rowstream_common::retryable_rpc(&err));
        assert!(!rowstream_common::retryable_rpc(&map_status(
            Status::permission_denied("no")
        )));
    }
}
