//! Where a read's rows come from, plus the one-shot first-page cache.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};

use rowstream_common::{JobRef, Schema, TableRef};

use crate::wire::TableRow;

/// Table XOR job. A job is authoritative over the destination table it may carry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceKind {
    Table(TableRef),
    Job {
        job: JobRef,
        destination: Option<TableRef>,
    },
}

/// First page of results received inline by a query run.
///
/// Consumed at most once: the first fetch takes it whether or not it can be served.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResultCache {
    pub rows: Vec<TableRow>,
    pub schema: Option<Schema>,
    pub next_token: String,
    pub total_rows: u64,
}

/// Descriptor of a read. Read-only apart from the cache slot.
#[derive(Debug)]
pub struct RowSource {
    kind: SourceKind,
    cache: Mutex<Option<ResultCache>>,
    job_finished: AtomicBool,
}

impl RowSource {
    pub fn table(table: TableRef) -> Self {
        Self::from_kind(SourceKind::Table(table))
    }

    pub fn job(job: JobRef) -> Self {
        Self::from_kind(SourceKind::Job {
            job,
            destination: None,
        })
    }

    pub fn job_with_destination(job: JobRef, destination: TableRef) -> Self {
        Self::from_kind(SourceKind::Job {
            job,
            destination: Some(destination),
        })
    }

    fn from_kind(kind: SourceKind) -> Self {
        Self {
            kind,
            cache: Mutex::new(None),
            job_finished: AtomicBool::new(false),
        }
    }

    /// Attach the inline first page of a query run. Only the query-run path should
    /// call this, before any iterator reads from the source.
    pub fn with_cache(self, cache: ResultCache) -> Self {
        *self.cache.lock().unwrap_or_else(PoisonError::into_inner) = Some(cache);
        self.job_finished.store(true, Ordering::Release);
        self
    }

    pub fn kind(&self) -> &SourceKind {
        &self.kind
    }

    pub fn job_ref(&self) -> Option<&JobRef> {
        match &self.kind {
            SourceKind::Job { job, .. } => Some(job),
            SourceKind::Table(_) => None,
        }
    }

    /// Table backing the rows: the table itself, or a job's known destination.
    pub fn table_ref(&self) -> Option<&TableRef> {
        match &self.kind {
            SourceKind::Table(t) => Some(t),
            SourceKind::Job { destination, .. } => destination.as_ref(),
        }
    }

    /// True once a job source is known to have finished. Table sources never wait.
    pub fn job_finished(&self) -> bool {
        matches!(self.kind, SourceKind::Table(_)) || self.job_finished.load(Ordering::Acquire)
    }

    pub fn mark_job_finished(&self) {
        self.job_finished.store(true, Ordering::Release);
    }

    pub fn has_cache(&self) -> bool {
        self.cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// True when the cache holds the entire result (no continuation token).
    pub fn cache_is_complete(&self) -> bool {
        self.cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|c| c.next_token.is_empty())
    }

    /// Remove and return the cache; later calls see `None`.
    pub fn take_cache(&self) -> Option<ResultCache> {
        self.cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}
