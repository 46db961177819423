//! Shared configuration, error types, ids, schema/value model, retry policy and
//! metrics for rowstream crates.
//!
//! Architecture role:
//! - defines read-path configuration passed across layers
//! - provides the common [`RowStreamError`] / [`Result`] contracts
//! - models result schemas and row cell values
//! - hosts the backoff/retry combinator consumed by every fetch path
//!
//! Key modules:
//! - [`config`]
//! - [`error`]
//! - [`ids`]
//! - [`metrics`]
//! - [`retry`]
//! - [`schema`]
//! - [`value`]

pub mod config;
pub mod error;
pub mod ids;
pub mod metrics;
pub mod retry;
pub mod schema;
pub mod value;

pub use config::{ReadConfig, RetrySettings, StorageReadSettings};
pub use error::{ApiError, Result, RowStreamError, RpcCode, TransportErrorKind};
pub use ids::{JobRef, TableRef};
pub use metrics::{ReadMetrics, global_metrics};
pub use retry::{
    Backoff, DEFAULT_RETRY_REASONS, JOB_RETRY_REASONS, RetryPolicy, retryable_error,
    retryable_rpc,
};
pub use schema::{FieldMode, FieldSchema, FieldType, Schema};
pub use tokio_util::sync::CancellationToken;
pub use value::{Row, Value};
