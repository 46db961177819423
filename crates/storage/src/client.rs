//! Storage read boundary: session creation and offset-addressed row streams.

use bytes::Bytes;
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use rowstream_common::Result;

/// Lazy response sequence of one `ReadRows` call.
pub type ReadRowsStream = BoxStream<'static, Result<ReadRowsResponse>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateReadSessionRequest {
    /// `projects/{project}`, billed for the read.
    pub parent: String,
    /// `projects/{p}/datasets/{d}/tables/{t}`.
    pub table: String,
    /// 0 lets the server decide.
    pub max_stream_count: i32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamHandle {
    pub name: String,
}

/// Server-side session: Arrow format, fixed set of streams.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReadSessionInfo {
    pub name: String,
    pub streams: Vec<StreamHandle>,
    /// IPC-encapsulated Arrow schema message.
    pub arrow_schema: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadRowsRequest {
    pub stream: String,
    pub offset: i64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReadRowsResponse {
    pub row_count: i64,
    /// IPC-encapsulated record batch message(s), without the schema.
    pub arrow_record_batch: Bytes,
}

/// Storage read transport. Implemented over gRPC by `GrpcReadClient` (feature `grpc`)
/// and by scripted clients in tests.
pub trait ReadClient: Send + Sync {
    fn create_read_session(
        &self,
        req: CreateReadSessionRequest,
    ) -> BoxFuture<'_, Result<ReadSessionInfo>>;

    /// Open `req.stream` at `req.offset`. Errors from the open itself and from the
    /// returned sequence are both reported as [`rowstream_common::RowStreamError`]s.
    fn read_rows(&self, req: ReadRowsRequest) -> BoxFuture<'_, Result<ReadRowsStream>>;
}
