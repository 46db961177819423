//! Multi-stream fan-in: one worker per read stream, one consumer cursor.
//!
//! Workers push decoded rows into a shared zero-buffer delivery channel and report
//! failures on a separate error channel. A supervisor joins every worker before
//! releasing the channel senders, so the consumer only observes closure once all
//! streams have genuinely finished.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures::channel::mpsc;
use futures::{SinkExt, StreamExt};
use rowstream_common::{
    CancellationToken, Result, RetryPolicy, Row, RowStreamError, RpcCode, Schema,
    StorageReadSettings, global_metrics, retryable_rpc,
};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::client::{ReadClient, ReadRowsRequest, StreamHandle};
use crate::decoder::ArrowDecoder;
use crate::session::ReadSession;

/// Consumer side of a storage read session.
///
/// Cross-stream row order is unspecified; rows of one stream keep their order.
/// Dropping the reader cancels the workers without waiting for them.
pub struct StreamReader {
    rows: mpsc::Receiver<Row>,
    errors: mpsc::UnboundedReceiver<RowStreamError>,
    rows_closed: bool,
    errors_closed: bool,
    cancel: CancellationToken,
    workers: CancellationToken,
    done: Arc<AtomicBool>,
    schema: Schema,
    total_rows: u64,
    stream_count: usize,
}

impl std::fmt::Debug for StreamReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamReader")
            .field("streams", &self.stream_count)
            .field("rows_closed", &self.rows_closed)
            .field("done", &self.is_done())
            .finish()
    }
}

/// Everything one stream worker needs.
struct StreamWorker {
    client: Arc<dyn ReadClient>,
    stream: StreamHandle,
    decoder: Arc<ArrowDecoder>,
    retry: RetryPolicy,
    rows: mpsc::Sender<Row>,
    errors: mpsc::UnboundedSender<RowStreamError>,
    cancel: CancellationToken,
    slots: Arc<Semaphore>,
}

impl StreamReader {
    /// Start one worker per stream of `session`. Must be called inside a tokio runtime.
    ///
    /// # Errors
    /// Fails if the session's Arrow schema cannot be decoded. A session without
    /// streams is a valid, empty result.
    pub fn start(
        client: Arc<dyn ReadClient>,
        session: ReadSession,
        settings: &StorageReadSettings,
        retry: RetryPolicy,
        cancel: &CancellationToken,
    ) -> Result<Self> {
        let (rows_tx, rows_rx) = mpsc::channel::<Row>(0);
        let (errs_tx, errs_rx) = mpsc::unbounded::<RowStreamError>();
        let done = Arc::new(AtomicBool::new(false));
        let workers = cancel.child_token();
        let stream_count = session.streams.len();

        let mut reader = Self {
            rows: rows_rx,
            errors: errs_rx,
            rows_closed: false,
            errors_closed: false,
            cancel: cancel.clone(),
            workers: workers.clone(),
            done: Arc::clone(&done),
            schema: session.schema.clone(),
            total_rows: session.total_rows,
            stream_count,
        };
        if session.streams.is_empty() {
            debug!(session = %session.name, "read session has no streams");
            reader.rows_closed = true;
            reader.errors_closed = true;
            done.store(true, Ordering::Release);
            return Ok(reader);
        }

        let decoder = Arc::new(ArrowDecoder::try_new(
            session.arrow_schema.clone(),
            session.schema.clone(),
        )?);
        reader.schema = decoder.schema().clone();
        let slots = Arc::new(Semaphore::new(settings.max_worker_count.max(1)));

        let mut set = JoinSet::new();
        for stream in session.streams {
            let worker = StreamWorker {
                client: Arc::clone(&client),
                stream,
                decoder: Arc::clone(&decoder),
                retry: retry.clone(),
                rows: rows_tx.clone(),
                errors: errs_tx.clone(),
                cancel: workers.clone(),
                slots: Arc::clone(&slots),
            };
            set.spawn(worker.run());
        }

        let session_name = session.name;
        tokio::spawn(async move {
            while let Some(res) = set.join_next().await {
                if let Err(e) = res {
                    if e.is_panic() {
                        warn!(session = %session_name, "stream worker panicked");
                        let _ = errs_tx.unbounded_send(RowStreamError::Rpc {
                            code: RpcCode::Internal,
                            message: format!("stream worker panicked: {e}"),
                        });
                    }
                }
            }
            done.store(true, Ordering::Release);
            debug!(session = %session_name, "all stream workers joined");
            drop(rows_tx);
            drop(errs_tx);
        });
        Ok(reader)
    }

    /// Schema of the rows (table schema, or derived from the Arrow schema).
    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn total_rows(&self) -> u64 {
        self.total_rows
    }

    pub fn stream_count(&self) -> usize {
        self.stream_count
    }

    /// True once every worker has been joined.
    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    /// Next row from any stream; `Ok(None)` once all streams are drained.
    ///
    /// Rows already handed over by workers are returned before a queued worker error.
    ///
    /// # Errors
    /// The first worker error not yet reported, or [`RowStreamError::Cancelled`] when
    /// the governing token fires.
    pub async fn next_row(&mut self) -> Result<Option<Row>> {
        loop {
            if self.rows_closed && self.errors_closed {
                if self.cancel.is_cancelled() {
                    return Err(RowStreamError::Cancelled);
                }
                return Ok(None);
            }
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(RowStreamError::Cancelled),
                row = self.rows.next(), if !self.rows_closed => match row {
                    Some(row) => return Ok(Some(row)),
                    None => {
                        self.rows_closed = true;
                        return match self.errors.try_recv() {
                            Ok(e) => Err(e),
                            Err(_) => Ok(None),
                        };
                    }
                },
                err = self.errors.next(), if !self.errors_closed => match err {
                    Some(e) => return Err(e),
                    None => self.errors_closed = true,
                },
                else => return Ok(None),
            }
        }
    }
}

impl Drop for StreamReader {
    fn drop(&mut self) {
        self.workers.cancel();
    }
}

impl StreamWorker {
    async fn run(mut self) {
        let _permit = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return,
            permit = Arc::clone(&self.slots).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => return,
            },
        };
        global_metrics().record_stream_worker("started");
        debug!(stream = %self.stream.name, "stream worker started");

        match self.read_stream().await {
            Ok(rows) => {
                global_metrics().record_stream_worker("finished");
                info!(stream = %self.stream.name, rows, "stream worker finished");
            }
            Err(e) if e.is_cancelled() => {
                debug!(stream = %self.stream.name, "stream worker cancelled");
            }
            Err(e) => {
                global_metrics().record_stream_worker("failed");
                warn!(stream = %self.stream.name, error = %e, "stream worker failed");
                let err = e.context(format!("stream {}", self.stream.name));
                let _ = self.errors.unbounded_send(err);
            }
        }
    }

    /// Read the stream to its end, re-opening at the current offset after
    /// retryable RPC failures. Returns the number of rows delivered.
    async fn read_stream(&mut self) -> Result<u64> {
        let mut offset: i64 = 0;
        let mut backoff = self.retry.backoff();
        loop {
            let req = ReadRowsRequest {
                stream: self.stream.name.clone(),
                offset,
            };
            let client = Arc::clone(&self.client);
            let mut responses = self
                .retry
                .run(
                    "storage.ReadRows",
                    &self.cancel,
                    || client.read_rows(req.clone()),
                    retryable_rpc,
                )
                .await?;

            loop {
                let next = tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => return Err(RowStreamError::Cancelled),
                    next = responses.next() => next,
                };
                let resp = match next {
                    None => return Ok(offset as u64),
                    Some(Ok(resp)) => resp,
                    Some(Err(e)) if retryable_rpc(&e) => {
                        let delay = backoff.pause();
                        debug!(
                            stream = %self.stream.name,
                            offset,
                            delay_ms = delay.as_millis() as u64,
                            error = %e,
                            "re-opening read stream"
                        );
                        tokio::select! {
                            biased;
                            _ = self.cancel.cancelled() => return Err(RowStreamError::Cancelled),
                            _ = tokio::time::sleep(delay) => {}
                        }
                        break;
                    }
                    Some(Err(e)) => return Err(e),
                };
                if resp.row_count <= 0 {
                    continue;
                }
                let rows = self.decoder.decode(&resp.arrow_record_batch)?.into_rows()?;
                for row in rows {
                    let sent = tokio::select! {
                        biased;
                        _ = self.cancel.cancelled() => return Err(RowStreamError::Cancelled),
                        sent = self.rows.send(row) => sent,
                    };
                    // Receiver gone: the reader was dropped.
                    if sent.is_err() {
                        return Err(RowStreamError::Cancelled);
                    }
                }
                offset += resp.row_count;
            }
        }
    }
}
