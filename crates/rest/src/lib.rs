//! REST read path for rowstream.
//!
//! Architecture role:
//! - describes what is read ([`RowSource`]) and holds the inline first-page cache
//! - dispatches each page fetch to the cache, `jobs.getQueryResults` or
//!   `tabledata.list` ([`PageFetchDispatcher`])
//! - decodes the JSON `f`/`v` row encoding into [`rowstream_common::Value`] rows
//!
//! Key modules:
//! - [`fetch`]
//! - [`http`]
//! - [`service`]
//! - [`source`]
//! - [`wire`]

pub mod fetch;
pub mod http;
pub mod service;
pub mod source;
pub mod wire;

pub use fetch::{Page, PageFetchDispatcher, PageRequest, PageSource, fetch_cached_page};
pub use http::HttpRestService;
pub use service::{GetQueryResultsRequest, JobMetadata, ListTabledataRequest, RestService};
pub use source::{ResultCache, RowSource, SourceKind};
pub use wire::{TableCell, TableRow, decode_rest_rows};
