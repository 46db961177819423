//! Row cursor over a REST page walk or a storage fan-in session.

use std::collections::VecDeque;
use std::sync::Arc;

use futures::Stream;
use rowstream_common::{CancellationToken, Result, Row, RowStreamError, Schema, global_metrics};
use rowstream_rest::{PageRequest, PageSource, RowSource};
use rowstream_storage::StreamReader;
use tracing::debug;

/// REST paging state.
pub struct RestPager {
    source: Arc<RowSource>,
    pages: Arc<dyn PageSource>,
    page_token: String,
    fetched: bool,
}

impl RestPager {
    pub fn new(source: Arc<RowSource>, pages: Arc<dyn PageSource>) -> Self {
        Self {
            source,
            pages,
            page_token: String::new(),
            fetched: false,
        }
    }

    /// Continuation token of the last page; empty before the first fetch and at the end.
    pub fn page_token(&self) -> &str {
        &self.page_token
    }
}

/// Transport chosen once at construction.
pub enum ReadBackend {
    Rest(RestPager),
    Storage(StreamReader),
}

#[derive(Debug, Clone, PartialEq)]
enum State {
    Fresh,
    Ready,
    Exhausted,
    Failed(RowStreamError),
}

/// Cursor over the rows of a [`RowSource`].
///
/// `next` returns `Ok(None)` at end of data, and keeps returning it. The first error
/// is terminal: every later call returns the same error.
pub struct RowIterator {
    backend: ReadBackend,
    buffer: VecDeque<Row>,
    schema: Schema,
    total_rows: u64,
    start_index: u64,
    page_size: i64,
    state: State,
    cancel: CancellationToken,
}

impl std::fmt::Debug for RowIterator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RowIterator")
            .field("accelerated", &self.is_accelerated())
            .field("buffered", &self.buffer.len())
            .field("total_rows", &self.total_rows)
            .field("state", &self.state)
            .finish()
    }
}

impl RowIterator {
    /// REST-mode iterator; `page_size` 0 lets the server choose.
    pub fn rest(
        source: Arc<RowSource>,
        pages: Arc<dyn PageSource>,
        page_size: i64,
        cancel: CancellationToken,
    ) -> Self {
        Self::with_backend(
            ReadBackend::Rest(RestPager::new(source, pages)),
            page_size,
            cancel,
        )
    }

    pub fn storage(reader: StreamReader, cancel: CancellationToken) -> Self {
        Self::with_backend(ReadBackend::Storage(reader), 0, cancel)
    }

    fn with_backend(backend: ReadBackend, page_size: i64, cancel: CancellationToken) -> Self {
        Self {
            backend,
            buffer: VecDeque::new(),
            schema: Schema::default(),
            total_rows: 0,
            start_index: 0,
            page_size,
            state: State::Fresh,
            cancel,
        }
    }

    /// Row offset of the first REST page. Ignored once paging has produced a token.
    pub fn set_start_index(&mut self, start_index: u64) {
        self.start_index = start_index;
    }

    pub fn start_index(&self) -> u64 {
        self.start_index
    }

    pub fn page_size(&self) -> i64 {
        self.page_size
    }

    /// Result schema. Empty until the first successful `next`.
    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    /// Total rows reported by the backend. 0 until the first successful `next`.
    pub fn total_rows(&self) -> u64 {
        self.total_rows
    }

    /// True when rows come from a storage read session.
    pub fn is_accelerated(&self) -> bool {
        matches!(self.backend, ReadBackend::Storage(_))
    }

    /// Next row, or `Ok(None)` once the source is exhausted.
    ///
    /// # Errors
    /// The first fetch, decode, stream or cancellation error; replayed on every
    /// subsequent call.
    pub async fn next(&mut self) -> Result<Option<Row>> {
        loop {
            match &self.state {
                State::Failed(e) => return Err(e.clone()),
                State::Exhausted => return Ok(None),
                State::Fresh | State::Ready => {}
            }
            if let Some(row) = self.buffer.pop_front() {
                return Ok(Some(row));
            }
            match self.fill().await {
                Ok(true) => self.state = State::Ready,
                Ok(false) => self.state = State::Exhausted,
                Err(e) => {
                    debug!(error = %e, "row iterator failed");
                    self.state = State::Failed(e.clone());
                    return Err(e);
                }
            }
        }
    }

    /// Refill the buffer. `Ok(false)` means no more data.
    async fn fill(&mut self) -> Result<bool> {
        let Self {
            backend,
            buffer,
            schema,
            total_rows,
            start_index,
            page_size,
            cancel,
            ..
        } = self;
        match backend {
            ReadBackend::Rest(pager) => {
                if pager.fetched && pager.page_token.is_empty() {
                    return Ok(false);
                }
                let start_index = if pager.page_token.is_empty() {
                    *start_index
                } else {
                    0
                };
                let page = pager
                    .pages
                    .fetch_page(PageRequest {
                        source: &pager.source,
                        schema: (!schema.is_empty()).then_some(&*schema),
                        start_index,
                        page_size: *page_size,
                        page_token: &pager.page_token,
                        cancel,
                    })
                    .await?;
                pager.fetched = true;
                pager.page_token = page.page_token;
                if schema.is_empty() && !page.schema.is_empty() {
                    *schema = page.schema;
                }
                if *total_rows == 0 {
                    *total_rows = page.total_rows;
                }
                global_metrics().record_rows("rest", page.rows.len() as u64);
                if page.rows.is_empty() && !pager.page_token.is_empty() {
                    debug!(token = %pager.page_token, "empty page with continuation token");
                }
                buffer.extend(page.rows);
                Ok(true)
            }
            ReadBackend::Storage(reader) => {
                if schema.is_empty() {
                    *schema = reader.schema().clone();
                }
                if *total_rows == 0 {
                    *total_rows = reader.total_rows();
                }
                match reader.next_row().await? {
                    Some(row) => {
                        global_metrics().record_rows("storage", 1);
                        buffer.push_back(row);
                        Ok(true)
                    }
                    None => Ok(false),
                }
            }
        }
    }

    /// Adapt into a stream that ends after end-of-data or after yielding the first error.
    pub fn into_stream(self) -> impl Stream<Item = Result<Row>> + Send {
        futures::stream::unfold(Some(self), |it| async move {
            let mut it = it?;
            match it.next().await {
                Ok(Some(row)) => Some((Ok(row), Some(it))),
                Ok(None) => None,
                Err(e) => Some((Err(e), None)),
            }
        })
    }
}
