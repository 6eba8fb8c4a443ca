// Copyright (c) tidedb.io 2025
// This file is licensed under the MIT

//! Transport seam between the query core and the wire.
//!
//! The concrete transport (connection pooling, authentication, TLS) lives
//! outside this crate; the core only requires something that can exchange a
//! request for a stream of response byte chunks.

use futures_util::stream::BoxStream;

pub use crate::error::TransportError;
use crate::request::QueryRequest;

/// Chunked response bytes as delivered by the transport.
///
/// Chunk boundaries are arbitrary; they need not align with JSON value
/// boundaries. Connection-level failures surface as an `Err` item.
pub type ByteStream = BoxStream<'static, Result<Vec<u8>, TransportError>>;

/// A request/response channel to the query service.
///
/// Implementations are shared across concurrent executions; each `send`
/// returns an independent response stream. Dropping the returned stream
/// releases the underlying connection resources, which is how cancellation
/// tears a request down.
pub trait QueryTransport: Send + Sync {
	fn send(&self, request: QueryRequest) -> ByteStream;
}
