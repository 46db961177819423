//! Read entry point: picks REST paging or storage streaming for a source.

use std::sync::Arc;

use rowstream_common::{
    CancellationToken, JobRef, ReadConfig, Result, RetryPolicy, RowStreamError, TableRef,
};
use rowstream_rest::{PageFetchDispatcher, PageSource, RestService, RowSource};
use rowstream_storage::{ReadClient, SessionFactory, StreamReader};
use tracing::{debug, info};

use crate::iterator::RowIterator;

/// Transport selection for one read.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ReadMode {
    /// Storage streaming when a read client is configured, unless the source already
    /// holds its complete result inline.
    #[default]
    Auto,
    Rest,
    Storage,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReadOptions {
    pub mode: ReadMode,
    /// Overrides `ReadConfig::page_size` for this read.
    pub page_size: Option<i64>,
    /// REST-mode row offset of the first page.
    pub start_index: u64,
}

impl ReadOptions {
    pub fn with_mode(mut self, mode: ReadMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_page_size(mut self, page_size: i64) -> Self {
        self.page_size = Some(page_size);
        self
    }

    pub fn with_start_index(mut self, start_index: u64) -> Self {
        self.start_index = start_index;
        self
    }
}

/// Builds [`RowIterator`]s against a REST service and, optionally, a storage read
/// client.
#[derive(Clone)]
pub struct Reader {
    config: ReadConfig,
    retry: RetryPolicy,
    rest: Arc<dyn RestService>,
    pages: Arc<dyn PageSource>,
    read_client: Option<Arc<dyn ReadClient>>,
}

impl std::fmt::Debug for Reader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reader")
            .field("config", &self.config)
            .field("storage", &self.read_client.is_some())
            .finish()
    }
}

impl Reader {
    pub fn new(rest: Arc<dyn RestService>, config: ReadConfig) -> Self {
        let retry = RetryPolicy::new(config.retry.clone());
        let pages = Arc::new(PageFetchDispatcher::new(Arc::clone(&rest), retry.clone()));
        Self {
            config,
            retry,
            rest,
            pages,
            read_client: None,
        }
    }

    /// Enable storage streaming.
    pub fn with_read_client(mut self, client: Arc<dyn ReadClient>) -> Self {
        self.read_client = Some(client);
        self
    }

    /// Replace the REST page source (the default dispatches to the REST service).
    pub fn with_page_source(mut self, pages: Arc<dyn PageSource>) -> Self {
        self.pages = pages;
        self
    }

    /// Replace the retry policy used by every call made for reads from now on.
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.pages = Arc::new(PageFetchDispatcher::new(Arc::clone(&self.rest), retry.clone()));
        self.retry = retry;
        self
    }

    pub fn config(&self) -> &ReadConfig {
        &self.config
    }

    pub async fn read_table(&self, table: TableRef, cancel: &CancellationToken) -> Result<RowIterator> {
        self.read(RowSource::table(table), ReadOptions::default(), cancel)
            .await
    }

    pub async fn read_job(&self, job: JobRef, cancel: &CancellationToken) -> Result<RowIterator> {
        self.read(RowSource::job(job), ReadOptions::default(), cancel)
            .await
    }

    /// Build an iterator over `source`. The mode is fixed here for the iterator's
    /// lifetime.
    ///
    /// # Errors
    /// Forcing storage mode without a read client is an `InvalidConfig` error.
    /// Storage session setup failures are returned here rather than from `next`.
    pub async fn read(
        &self,
        source: RowSource,
        opts: ReadOptions,
        cancel: &CancellationToken,
    ) -> Result<RowIterator> {
        let storage = match (opts.mode, &self.read_client) {
            (ReadMode::Rest, _) => None,
            (ReadMode::Storage, None) => {
                return Err(RowStreamError::InvalidConfig(
                    "storage read mode requires a read client".to_string(),
                ));
            }
            (ReadMode::Storage, Some(client)) => Some(client),
            (ReadMode::Auto, Some(_)) if source.cache_is_complete() => {
                debug!("source holds its complete result; reading via REST");
                None
            }
            (ReadMode::Auto, client) => client.as_ref(),
        };

        let Some(client) = storage else {
            let page_size = opts.page_size.unwrap_or(self.config.page_size);
            let mut it = RowIterator::rest(
                Arc::new(source),
                Arc::clone(&self.pages),
                page_size,
                cancel.clone(),
            );
            it.set_start_index(opts.start_index);
            return Ok(it);
        };

        let factory = SessionFactory::new(
            Arc::clone(client),
            Arc::clone(&self.rest),
            self.retry.clone(),
            self.config.storage.clone(),
        );
        let session = factory.open(&source, cancel).await?;
        info!(
            table = %session.table,
            streams = session.streams.len(),
            total_rows = session.total_rows,
            "reading via storage session"
        );
        let reader = StreamReader::start(
            Arc::clone(client),
            session,
            &self.config.storage,
            self.retry.clone(),
            cancel,
        )?;
        Ok(RowIterator::storage(reader, cancel.clone()))
    }
}
