//! Storage read path for rowstream.
//!
//! Architecture role:
//! - opens read sessions for table and job sources ([`SessionFactory`])
//! - decodes Arrow IPC payloads into rows ([`ArrowDecoder`])
//! - fans multiple server streams into a single cursor ([`StreamReader`])
//!
//! Feature flags:
//! - `grpc`: tonic client for the storage read API ([`grpc::GrpcReadClient`])

pub mod client;
pub mod decoder;
pub mod fanin;
#[cfg(feature = "grpc")]
pub mod grpc;
pub mod session;

pub use client::{
    CreateReadSessionRequest, ReadClient, ReadRowsRequest, ReadRowsResponse, ReadRowsStream,
    ReadSessionInfo, StreamHandle,
};
pub use decoder::{ArrowDecoder, DecodedBatch};
pub use fanin::StreamReader;
pub use session::{ReadSession, SessionFactory, has_top_level_order_by};
