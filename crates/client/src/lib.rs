//! Row reading client for rowstream.
//!
//! Architecture role:
//! - decides once per read between REST paging and storage streaming ([`Reader`])
//! - exposes a single cursor contract over both transports ([`RowIterator`])
//!
//! ```no_run
//! # async fn demo() -> rowstream_common::Result<()> {
//! use std::sync::Arc;
//! use rowstream_client::Reader;
//! use rowstream_common::{CancellationToken, ReadConfig, TableRef};
//! use rowstream_rest::HttpRestService;
//!
//! let config = ReadConfig::from_env();
//! let rest = Arc::new(HttpRestService::new(config.rest_endpoint.clone())?);
//! let reader = Reader::new(rest, config);
//! let cancel = CancellationToken::new();
//! let mut rows = reader
//!     .read_table(TableRef::new("p", "d", "t"), &cancel)
//!     .await?;
//! while let Some(row) = rows.next().await? {
//!     println!("{row:?}");
//! }
//! # Ok(())
//! # }
//! ```

pub mod iterator;
pub mod reader;

pub use iterator::{ReadBackend, RestPager, RowIterator};
pub use reader::{ReadMode, ReadOptions, Reader};
