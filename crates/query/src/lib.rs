// Copyright (c) tidedb.io 2025
// This file is licensed under the MIT

//! Query execution core of the TideDB Rust client.
//!
//! This crate owns the client side of the query protocol:
//!
//! - **Statement building** — an immutable expression DSL
//!   (`select(..).from(..).filter(..)`) resolving to deterministic
//!   canonical text, plus raw statements via [`Statement::raw`].
//! - **Request encoding** — turning a statement or cached plan plus
//!   parameter bindings and configuration into a wire payload, failing
//!   fast on unbound placeholders.
//! - **Prepared statements** — [`QueryCore::prepare`] obtains a
//!   server-side execution plan, cached by canonical statement text in a
//!   shared [`PlanCache`]; stale plans are transparently re-prepared once.
//! - **Streaming aggregation** — a resumable parser decodes the chunked
//!   response document into row, error, and metadata events regardless of
//!   how the transport fragments it; the executor aggregates them eagerly
//!   into a [`QueryResult`] or hands them to the caller as an
//!   [`EventStream`].
//!
//! The concrete transport is injected behind the
//! [`QueryTransport`](transport::QueryTransport) seam.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use tidedb_query::{
//! 	Params, Query, QueryConfig, QueryCore, ident, positional, select, wildcard,
//! 	transport::{ByteStream, QueryTransport},
//! };
//!
//! # struct MyTransport;
//! # impl QueryTransport for MyTransport {
//! # 	fn send(&self, _request: tidedb_query::QueryRequest) -> ByteStream {
//! # 		unimplemented!()
//! # 	}
//! # }
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let core = QueryCore::new(Arc::new(MyTransport));
//!
//! let statement = select([wildcard()]).from("default").filter(ident("item").eq(positional(1)))?.build()?;
//!
//! let plan = core.prepare(&statement, &QueryConfig::default()).await?;
//! let result = core.execute(&Query::prepared(plan, Params::positional([123])), &QueryConfig::default()).await?;
//!
//! assert!(result.final_success());
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod execute;
pub mod plan;
pub mod request;
pub mod statement;
pub mod stream;
pub mod transport;

pub use error::{EncodeError, ExecuteError, ExecuteErrorKind, ParseError, StatementError, TransportError};
pub use execute::{Cancellation, EventStream, Query, QueryCore, QueryResult};
pub use plan::{ExecutionPlan, PlanCache};
pub use request::{DEFAULT_QUERY_TIMEOUT, Params, QueryConfig, QueryRequest, ScanConsistency};
pub use statement::{
	BinaryOperator, Expression, Placeholder, Select, Statement, ident, lit, named, positional, select, wildcard,
};
pub use stream::{
	MetadataFragment, QueryMetadata, QueryStatus, ResponseEvent, ResponseParser, STALE_PLAN_CODES, ServerError,
};
