use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use arrow::array::{ArrayRef, Int64Array, RecordBatch, StringArray};
use arrow::ipc::writer::StreamWriter;
use arrow_schema::{DataType, Field, Schema as ArrowSchema};
use bytes::Bytes;
use futures::future::BoxFuture;
use futures::stream::{self, StreamExt};
use futures::FutureExt;
use rowstream_common::{
    CancellationToken, FieldSchema, FieldType, JobRef, Result, RetryPolicy, RetrySettings,
    RowStreamError, RpcCode, Schema, StorageReadSettings, TableRef, Value,
};
use rowstream_rest::service::{
    GetQueryResultsRequest, JobMetadata, ListTabledataRequest, RestService,
};
use rowstream_rest::wire::{QueryResults, TableDataList, TableMetadata};
use rowstream_rest::RowSource;
use rowstream_storage::{
    CreateReadSessionRequest, ReadClient, ReadRowsRequest, ReadRowsResponse, ReadRowsStream,
    ReadSession, ReadSessionInfo, SessionFactory, StreamHandle, StreamReader,
};
use tokio::sync::Notify;

fn arrow_schema() -> Arc<ArrowSchema> {
    Arc::new(ArrowSchema::new(vec![
        Field::new("id", DataType::Int64, false),
        Field::new("stream", DataType::Utf8, true),
    ]))
}

fn table_schema() -> Schema {
    Schema::new(vec![
        FieldSchema::new("id", FieldType::Integer).required(),
        FieldSchema::new("stream", FieldType::String),
    ])
}

/// Returns (schema message, batch message) for one batch.
fn encode(stream_name: &str, ids: &[i64]) -> (Bytes, Bytes) {
    let columns: Vec<ArrayRef> = vec![
        Arc::new(Int64Array::from(ids.to_vec())),
        Arc::new(StringArray::from(vec![stream_name; ids.len()])),
    ];
    let batch = RecordBatch::try_new(arrow_schema(), columns).unwrap();
    let mut writer = StreamWriter::try_new(Vec::new(), &arrow_schema()).unwrap();
    let schema_len = writer.get_ref().len();
    writer.write(&batch).unwrap();
    let buf = writer.get_ref().clone();
    (
        Bytes::copy_from_slice(&buf[..schema_len]),
        Bytes::copy_from_slice(&buf[schema_len..]),
    )
}

fn serialized_schema() -> Bytes {
    encode("", &[]).0
}

fn response(stream_name: &str, ids: &[i64]) -> Result<ReadRowsResponse> {
    Ok(ReadRowsResponse {
        row_count: ids.len() as i64,
        arrow_record_batch: encode(stream_name, ids).1,
    })
}

fn rpc_error(code: RpcCode) -> RowStreamError {
    RowStreamError::Rpc {
        code,
        message: "scripted failure".to_string(),
    }
}

fn fast_retry() -> RetryPolicy {
    RetryPolicy::new(RetrySettings {
        initial_backoff_ms: 1,
        max_backoff_ms: 2,
        multiplier: 2.0,
    })
}

type Opener = Box<dyn Fn(&ReadRowsRequest) -> ReadRowsStream + Send + Sync>;

fn opener<F>(f: F) -> Opener
where
    F: Fn(&ReadRowsRequest) -> ReadRowsStream + Send + Sync + 'static,
{
    Box::new(f)
}

struct ScriptedClient {
    streams: Vec<String>,
    opener: Opener,
    opens: Mutex<Vec<(String, i64)>>,
    session_requests: Mutex<Vec<CreateReadSessionRequest>>,
}

impl ScriptedClient {
    fn new(streams: &[&str], opener: Opener) -> Arc<Self> {
        Arc::new(Self {
            streams: streams.iter().map(|s| s.to_string()).collect(),
            opener,
            opens: Mutex::new(Vec::new()),
            session_requests: Mutex::new(Vec::new()),
        })
    }

    fn session(&self) -> ReadSession {
        ReadSession {
            name: "sessions/s1".to_string(),
            table: TableRef::new("p", "d", "t"),
            streams: self
                .streams
                .iter()
                .map(|name| StreamHandle { name: name.clone() })
                .collect(),
            arrow_schema: serialized_schema(),
            schema: table_schema(),
            total_rows: 0,
        }
    }
}

impl ReadClient for ScriptedClient {
    fn create_read_session(
        &self,
        req: CreateReadSessionRequest,
    ) -> BoxFuture<'_, Result<ReadSessionInfo>> {
        self.session_requests.lock().unwrap().push(req);
        let info = ReadSessionInfo {
            name: "sessions/s1".to_string(),
            streams: self
                .streams
                .iter()
                .map(|name| StreamHandle { name: name.clone() })
                .collect(),
            arrow_schema: serialized_schema(),
        };
        async move { Ok(info) }.boxed()
    }

    fn read_rows(&self, req: ReadRowsRequest) -> BoxFuture<'_, Result<ReadRowsStream>> {
        self.opens
            .lock()
            .unwrap()
            .push((req.stream.clone(), req.offset));
        let stream = (self.opener)(&req);
        async move { Ok(stream) }.boxed()
    }
}

fn start(client: &Arc<ScriptedClient>, cancel: &CancellationToken) -> StreamReader {
    StreamReader::start(
        client.clone(),
        client.session(),
        &StorageReadSettings::default(),
        fast_retry(),
        cancel,
    )
    .unwrap()
}

async fn drain(reader: &mut StreamReader) -> Result<Vec<Vec<Value>>> {
    let mut rows = Vec::new();
    while let Some(row) = reader.next_row().await? {
        rows.push(row);
    }
    Ok(rows)
}

#[tokio::test]
async fn every_row_of_every_stream_is_delivered_once() {
    let client = ScriptedClient::new(
        &["s0", "s1", "s2"],
        opener(|req| {
            let base = match req.stream.as_str() {
                "s0" => 0,
                "s1" => 100,
                _ => 200,
            };
            let name = req.stream.clone();
            stream::iter(vec![
                response(&name, &[base + 1, base + 2]),
                response(&name, &[base + 3]),
            ])
            .boxed()
        }),
    );
    let cancel = CancellationToken::new();
    let mut reader = start(&client, &cancel);
    assert_eq!(reader.schema(), &table_schema());

    let rows = drain(&mut reader).await.unwrap();
    let ids: HashSet<i64> = rows.iter().map(|r| r[0].as_i64().unwrap()).collect();
    assert_eq!(rows.len(), 9);
    assert_eq!(
        ids,
        HashSet::from([1, 2, 3, 101, 102, 103, 201, 202, 203])
    );

    let s1: Vec<i64> = rows
        .iter()
        .filter(|r| r[1].as_str() == Some("s1"))
        .map(|r| r[0].as_i64().unwrap())
        .collect();
    assert_eq!(s1, vec![101, 102, 103]);

    assert!(reader.next_row().await.unwrap().is_none());
    assert!(reader.is_done());
}

#[tokio::test]
async fn session_without_streams_is_immediately_exhausted() {
    let client = ScriptedClient::new(&[], opener(|_| stream::empty().boxed()));
    let cancel = CancellationToken::new();
    let mut reader = start(&client, &cancel);
    for _ in 0..2 {
        let next = tokio::time::timeout(Duration::from_secs(5), reader.next_row())
            .await
            .expect("empty session must not block");
        assert_eq!(next, Ok(None));
    }
    assert!(reader.is_done());
    assert!(client.opens.lock().unwrap().is_empty());
}

#[tokio::test]
async fn reader_is_exhausted_after_its_only_error_is_reported() {
    let client = ScriptedClient::new(
        &["s0"],
        opener(|_| {
            let failure: Result<ReadRowsResponse> = Err(rpc_error(RpcCode::PermissionDenied));
            stream::iter(vec![failure]).boxed()
        }),
    );
    let cancel = CancellationToken::new();
    let mut reader = start(&client, &cancel);

    let first = tokio::time::timeout(Duration::from_secs(5), reader.next_row())
        .await
        .expect("worker error must be reported");
    assert!(first.is_err());
    for _ in 0..2 {
        let next = tokio::time::timeout(Duration::from_secs(5), reader.next_row())
            .await
            .expect("drained reader must not block");
        assert_eq!(next, Ok(None));
    }
}

#[tokio::test]
async fn cancelled_empty_session_reports_cancellation() {
    let client = ScriptedClient::new(&[], opener(|_| stream::empty().boxed()));
    let cancel = CancellationToken::new();
    let mut reader = start(&client, &cancel);
    cancel.cancel();
    assert_eq!(reader.next_row().await, Err(RowStreamError::Cancelled));
}

#[tokio::test]
async fn rows_produced_before_a_stream_failure_are_delivered_first() {
    let b_finished = Arc::new(Notify::new());
    let notify = b_finished.clone();
    let client = ScriptedClient::new(
        &["a", "b"],
        opener(move |req| match req.stream.as_str() {
            "a" => {
                let wait = notify.clone();
                stream::iter(vec![response("a", &[1, 2])])
                    .chain(stream::once(async move {
                        wait.notified().await;
                        Err(rpc_error(RpcCode::PermissionDenied))
                    }))
                    .boxed()
            }
            _ => {
                let done = notify.clone();
                stream::iter(vec![response("b", &[11, 12])])
                    .chain(
                        stream::once(async move { done.notify_one() })
                            .filter_map(|()| async { None::<Result<ReadRowsResponse>> }),
                    )
                    .boxed()
            }
        }),
    );
    let cancel = CancellationToken::new();
    let mut reader = start(&client, &cancel);

    let mut ids = Vec::new();
    let err = loop {
        match reader.next_row().await {
            Ok(Some(row)) => ids.push(row[0].as_i64().unwrap()),
            Ok(None) => panic!("stream a failure was lost"),
            Err(e) => break e,
        }
    };
    ids.sort_unstable();
    assert_eq!(ids, vec![1, 2, 11, 12]);
    assert!(matches!(
        err.root(),
        RowStreamError::Rpc {
            code: RpcCode::PermissionDenied,
            ..
        }
    ));
    assert!(err.to_string().starts_with("stream a: "));
}

#[tokio::test]
async fn cancellation_unblocks_a_waiting_consumer() {
    let client = ScriptedClient::new(&["s0"], opener(|_| stream::pending().boxed()));
    let cancel = CancellationToken::new();
    let mut reader = start(&client, &cancel);

    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });
    let res = tokio::time::timeout(Duration::from_secs(5), reader.next_row())
        .await
        .expect("next_row must return once cancelled");
    assert_eq!(res, Err(RowStreamError::Cancelled));
}

#[tokio::test]
async fn retryable_stream_error_resumes_at_current_offset() {
    let client = ScriptedClient::new(
        &["s0"],
        opener(|req| match req.offset {
            0 => stream::iter(vec![
                response("s0", &[1, 2]),
                Err(rpc_error(RpcCode::Unavailable)),
            ])
            .boxed(),
            _ => stream::iter(vec![response("s0", &[3, 4, 5])]).boxed(),
        }),
    );
    let cancel = CancellationToken::new();
    let mut reader = start(&client, &cancel);

    let rows = drain(&mut reader).await.unwrap();
    let ids: Vec<i64> = rows.iter().map(|r| r[0].as_i64().unwrap()).collect();
    assert_eq!(ids, vec![1, 2, 3, 4, 5]);
    assert_eq!(
        client.opens.lock().unwrap().clone(),
        vec![("s0".to_string(), 0), ("s0".to_string(), 2)]
    );
}

#[tokio::test]
async fn malformed_batch_fails_only_its_stream() {
    let client = ScriptedClient::new(
        &["bad", "good"],
        opener(|req| match req.stream.as_str() {
            "bad" => stream::iter(vec![Ok(ReadRowsResponse {
                row_count: 1,
                arrow_record_batch: Bytes::from_static(&[0xff, 0xff, 0xff, 0xff, 8, 0, 0, 0, 1]),
            })])
            .boxed(),
            _ => stream::iter(vec![response("good", &[7])]).boxed(),
        }),
    );
    let cancel = CancellationToken::new();
    let mut reader = start(&client, &cancel);

    let mut good = Vec::new();
    let mut errors = Vec::new();
    loop {
        match reader.next_row().await {
            Ok(Some(row)) => good.push(row[0].as_i64().unwrap()),
            Ok(None) => break,
            Err(e) => errors.push(e),
        }
    }
    assert_eq!(good, vec![7]);
    assert_eq!(errors.len(), 1);
    assert!(matches!(errors[0].root(), RowStreamError::Decode(_)));
}

#[derive(Default)]
struct MetadataService {
    job: Mutex<Option<JobMetadata>>,
}

impl RestService for MetadataService {
    fn list_tabledata(&self, _req: ListTabledataRequest) -> BoxFuture<'_, Result<TableDataList>> {
        async { Ok(TableDataList::default()) }.boxed()
    }

    fn get_query_results(
        &self,
        _req: GetQueryResultsRequest,
    ) -> BoxFuture<'_, Result<QueryResults>> {
        async { Ok(QueryResults::default()) }.boxed()
    }

    fn get_table(
        &self,
        _table: TableRef,
        _fields: Option<String>,
    ) -> BoxFuture<'_, Result<TableMetadata>> {
        async {
            Ok(TableMetadata {
                schema: table_schema(),
                num_rows: 42,
            })
        }
        .boxed()
    }

    fn get_job(&self, _job: JobRef) -> BoxFuture<'_, Result<JobMetadata>> {
        let meta = self.job.lock().unwrap().clone().unwrap_or_default();
        async move { Ok(meta) }.boxed()
    }
}

fn factory(client: &Arc<ScriptedClient>, rest: Arc<MetadataService>) -> SessionFactory {
    SessionFactory::new(
        client.clone(),
        rest,
        fast_retry(),
        StorageReadSettings {
            max_stream_count: 4,
            max_worker_count: 2,
        },
    )
}

#[tokio::test]
async fn table_session_uses_configured_stream_count() {
    let client = ScriptedClient::new(&["s0", "s1"], opener(|_| stream::empty().boxed()));
    let rest = Arc::new(MetadataService::default());
    let cancel = CancellationToken::new();

    let session = factory(&client, rest)
        .open(&RowSource::table(TableRef::new("p", "d", "t")), &cancel)
        .await
        .unwrap();
    assert_eq!(session.streams.len(), 2);
    assert_eq!(session.total_rows, 42);
    assert_eq!(session.schema, table_schema());

    let requests = client.session_requests.lock().unwrap().clone();
    assert_eq!(
        requests,
        vec![CreateReadSessionRequest {
            parent: "projects/p".to_string(),
            table: "projects/p/datasets/d/tables/t".to_string(),
            max_stream_count: 4,
        }]
    );
}

#[tokio::test]
async fn ordered_job_query_is_read_through_a_single_stream() {
    let client = ScriptedClient::new(&["s0"], opener(|_| stream::empty().boxed()));
    let rest = Arc::new(MetadataService {
        job: Mutex::new(Some(JobMetadata {
            query: Some("SELECT id FROM t ORDER BY id".to_string()),
            destination: Some(TableRef::new("p", "_anon", "tmp")),
            complete: true,
        })),
    });
    let cancel = CancellationToken::new();

    let session = factory(&client, rest)
        .open(&RowSource::job(JobRef::new("p", "j1")), &cancel)
        .await
        .unwrap();
    assert_eq!(session.table, TableRef::new("p", "_anon", "tmp"));
    let requests = client.session_requests.lock().unwrap().clone();
    assert_eq!(requests[0].max_stream_count, 1);
    assert_eq!(requests[0].table, "projects/p/datasets/_anon/tables/tmp");
}

#[tokio::test]
async fn job_without_destination_cannot_be_streamed() {
    let client = ScriptedClient::new(&["s0"], opener(|_| stream::empty().boxed()));
    let rest = Arc::new(MetadataService {
        job: Mutex::new(Some(JobMetadata {
            query: Some("CALL proc()".to_string()),
            destination: None,
            complete: true,
        })),
    });
    let cancel = CancellationToken::new();

    let err = factory(&client, rest)
        .open(&RowSource::job(JobRef::new("p", "j1")), &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, RowStreamError::Unsupported(_)));
    assert!(client.session_requests.lock().unwrap().is_empty());
}
