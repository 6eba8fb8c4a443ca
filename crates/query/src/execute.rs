// Copyright (c) tidedb.io 2025
// This file is licensed under the MIT

//! Query execution: dispatch, streaming aggregation, and plan lifecycle.
//!
//! [`QueryCore`] drives one request through the transport and the response
//! parser, in one of two modes: eager ([`execute`](QueryCore::execute)),
//! which buffers everything into a [`QueryResult`], or lazy
//! ([`execute_streaming`](QueryCore::execute_streaming)), which hands rows
//! to the caller as they arrive. Executions are independent; only the plan
//! cache is shared between them.

use std::{
	pin::Pin,
	sync::Arc,
	task::{Context, Poll},
};

use futures_util::Stream;
use serde_json::Value;
use tokio::{
	sync::{mpsc, watch},
	time::{self, Instant},
};
use tokio_stream::StreamExt;

use crate::{
	error::{EncodeError, ExecuteError, ExecuteErrorKind},
	plan::{ExecutionPlan, PlanCache},
	request::{Params, QueryConfig, QueryRequest, encode_prepare, encode_prepared, encode_simple},
	statement::Statement,
	stream::{QueryMetadata, QueryStatus, ResponseEvent, ResponseParser, ServerError},
	transport::QueryTransport,
};

/// Buffered events between the driver task and a lazy [`EventStream`].
const EVENT_BUFFER: usize = 32;

/// One query to execute: a statement, optionally with parameters, or a
/// previously prepared plan.
#[derive(Debug, Clone, PartialEq)]
pub enum Query {
	Simple(Statement),
	Parameterized(Statement, Params),
	Prepared(ExecutionPlan, Params),
}

impl Query {
	/// A statement executed without parameters.
	pub fn simple(statement: Statement) -> Query {
		Query::Simple(statement)
	}

	/// A statement executed with parameter bindings.
	pub fn parameterized(statement: Statement, params: Params) -> Query {
		Query::Parameterized(statement, params)
	}

	/// An execution of a previously prepared plan.
	pub fn prepared(plan: ExecutionPlan, params: Params) -> Query {
		Query::Prepared(plan, params)
	}
}

/// The aggregated outcome of one completed execution.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryResult {
	rows: Vec<Value>,
	errors: Vec<ServerError>,
	metadata: QueryMetadata,
}

impl QueryResult {
	/// Result rows, in arrival order.
	pub fn rows(&self) -> &[Value] {
		&self.rows
	}

	pub fn into_rows(self) -> Vec<Value> {
		self.rows
	}

	/// Server-reported error entries, in arrival order.
	///
	/// A non-empty sequence does not by itself mean the execution failed:
	/// the server may report informational entries alongside an overall
	/// success status. See [`final_success`](Self::final_success).
	pub fn errors(&self) -> &[ServerError] {
		&self.errors
	}

	pub fn metadata(&self) -> &QueryMetadata {
		&self.metadata
	}

	/// Whether the server reported the execution as successful.
	///
	/// This mirrors the server status alone. The server may pair a success
	/// status with entries in [`errors`](Self::errors) (e.g. "Primary
	/// index already exists"), so callers that need to distinguish
	/// informational entries from real failures inspect both signals. A
	/// missing status reads as not successful.
	pub fn final_success(&self) -> bool {
		self.metadata.status.as_ref().is_some_and(QueryStatus::is_success)
	}

	pub(crate) fn has_stale_plan_error(&self) -> bool {
		self.errors.iter().any(ServerError::is_stale_plan)
	}
}

/// Cooperative cancellation token for in-flight executions.
///
/// Cloneable; cancelling any clone cancels them all. Once an execution
/// acknowledges cancellation it closes the transport stream, discards
/// buffered partial state, and delivers nothing further.
#[derive(Debug, Clone)]
pub struct Cancellation {
	sender: Arc<watch::Sender<bool>>,
	receiver: watch::Receiver<bool>,
}

impl Cancellation {
	pub fn new() -> Self {
		let (sender, receiver) = watch::channel(false);
		Self {
			sender: Arc::new(sender),
			receiver,
		}
	}

	/// Request cancellation. Idempotent.
	pub fn cancel(&self) {
		let _ = self.sender.send(true);
	}

	pub fn is_cancelled(&self) -> bool {
		*self.receiver.borrow()
	}

	/// Resolves once cancellation has been requested.
	pub async fn cancelled(&self) {
		let mut receiver = self.receiver.clone();
		loop {
			if *receiver.borrow_and_update() {
				return;
			}
			if receiver.changed().await.is_err() {
				std::future::pending::<()>().await;
			}
		}
	}
}

impl Default for Cancellation {
	fn default() -> Self {
		Self::new()
	}
}

async fn cancelled_or_never(cancellation: &Option<Cancellation>) {
	match cancellation {
		Some(token) => token.cancelled().await,
		None => std::future::pending().await,
	}
}

/// Lazy result stream for large result sets.
///
/// Rows are delivered as they arrive; error entries and metadata fragments
/// are delivered once the response document completes, followed by a final
/// [`ResponseEvent::StreamEnd`]. Dropping the stream abandons the execution
/// and releases its transport resources.
#[derive(Debug)]
pub struct EventStream {
	rx: mpsc::Receiver<Result<ResponseEvent, ExecuteError>>,
}

impl EventStream {
	/// Receive the next event, or `None` once the execution is over.
	pub async fn recv(&mut self) -> Option<Result<ResponseEvent, ExecuteError>> {
		self.rx.recv().await
	}
}

impl Stream for EventStream {
	type Item = Result<ResponseEvent, ExecuteError>;

	fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
		self.rx.poll_recv(cx)
	}
}

/// Running aggregation state of one response.
#[derive(Default)]
struct Aggregate {
	rows: Vec<Value>,
	errors: Vec<ServerError>,
	metadata: QueryMetadata,
	ended: bool,
}

impl Aggregate {
	fn apply(&mut self, event: ResponseEvent) {
		match event {
			ResponseEvent::Row(row) => self.rows.push(row),
			ResponseEvent::Error(error) => self.errors.push(error),
			ResponseEvent::Metadata(fragment) => self.metadata.merge(fragment),
			ResponseEvent::StreamEnd => self.ended = true,
		}
	}

	fn into_result(self) -> QueryResult {
		QueryResult {
			rows: self.rows,
			errors: self.errors,
			metadata: self.metadata,
		}
	}

	fn fail(self, kind: ExecuteErrorKind) -> ExecuteError {
		ExecuteError::new(kind, self.into_result())
	}
}

/// How one attempt reaches the wire: literal statement text, or a plan
/// reference that can be transparently re-prepared.
#[derive(Debug, Clone)]
enum Attempt {
	Adhoc(QueryRequest),
	Prepared {
		plan: ExecutionPlan,
		params: Params,
	},
}

impl Attempt {
	fn encode(&self, config: &QueryConfig) -> Result<QueryRequest, EncodeError> {
		match self {
			Attempt::Adhoc(request) => Ok(request.clone()),
			Attempt::Prepared {
				plan,
				params,
			} => encode_prepared(plan, params, config),
		}
	}
}

enum AttemptOutcome {
	Finished {
		withheld: Vec<ResponseEvent>,
		stale: bool,
		rows_delivered: bool,
	},
	Failed(ExecuteError),
	/// Cancelled, or the caller dropped the stream. Nothing further may be
	/// delivered.
	Silent,
}

/// The client-side query execution core.
///
/// Holds the transport seam and the shared plan cache. Cheap to clone;
/// clones share both.
#[derive(Clone)]
pub struct QueryCore {
	transport: Arc<dyn QueryTransport>,
	cache: Arc<PlanCache>,
}

impl QueryCore {
	pub fn new(transport: Arc<dyn QueryTransport>) -> Self {
		Self::with_cache(transport, Arc::new(PlanCache::new()))
	}

	/// Build a core sharing an existing plan cache.
	pub fn with_cache(transport: Arc<dyn QueryTransport>, cache: Arc<PlanCache>) -> Self {
		Self {
			transport,
			cache,
		}
	}

	pub fn plan_cache(&self) -> &PlanCache {
		&self.cache
	}

	/// React to a cluster topology change: every cached plan may now name
	/// nodes that no longer serve it, so the cache is cleared wholesale.
	pub fn topology_changed(&self) {
		tracing::debug!("topology change notification, invalidating plan cache");
		self.cache.invalidate_all();
	}

	/// Prepare a statement, caching and returning the server-issued plan.
	///
	/// Sends a PREPARE request and takes the single result row as the plan
	/// representation.
	pub async fn prepare(&self, statement: &Statement, config: &QueryConfig) -> Result<ExecutionPlan, ExecuteError> {
		let deadline = Instant::now() + config.timeout;
		self.prepare_text(&statement.canonical_text(), config, deadline).await
	}

	/// Execute eagerly, buffering the whole response into a
	/// [`QueryResult`].
	///
	/// Statements with a cached plan run prepared; when the server signals
	/// the plan is stale, the entry is invalidated and the statement is
	/// re-prepared and re-executed exactly once before the failure
	/// surfaces. No retry is attempted after cancellation or timeout.
	pub async fn execute(&self, query: &Query, config: &QueryConfig) -> Result<QueryResult, ExecuteError> {
		let deadline = Instant::now() + config.timeout;
		let attempt = self.resolve(query, config).map_err(|error| ExecuteError::bare(error.into()))?;
		let request = attempt.encode(config).map_err(|error| ExecuteError::bare(error.into()))?;
		let result = self.run_request(request, config, deadline).await?;

		let Attempt::Prepared {
			plan,
			params,
		} = &attempt
		else {
			return Ok(result);
		};
		if !result.has_stale_plan_error() {
			return Ok(result);
		}

		tracing::debug!(statement = plan.statement_text(), "prepared plan rejected, re-preparing once");
		self.cache.invalidate(plan.statement_text());
		let fresh = self.prepare_text(plan.statement_text(), config, deadline).await?;
		let request = encode_prepared(&fresh, params, config).map_err(|error| ExecuteError::bare(error.into()))?;
		let second = self.run_request(request, config, deadline).await?;
		if second.has_stale_plan_error() {
			return Err(ExecuteError::new(ExecuteErrorKind::StalePlan, second));
		}
		Ok(second)
	}

	/// Execute lazily, returning an [`EventStream`] that yields rows as
	/// they arrive. Suited to result sets too large to buffer.
	pub async fn execute_streaming(&self, query: &Query, config: &QueryConfig) -> Result<EventStream, ExecuteError> {
		let deadline = Instant::now() + config.timeout;
		let attempt = self.resolve(query, config).map_err(|error| ExecuteError::bare(error.into()))?;
		let request = attempt.encode(config).map_err(|error| ExecuteError::bare(error.into()))?;

		let (tx, rx) = mpsc::channel(EVENT_BUFFER);
		let core = self.clone();
		let config = config.clone();
		tokio::spawn(async move {
			core.drive_streaming(attempt, request, config, deadline, tx).await;
		});
		Ok(EventStream {
			rx,
		})
	}

	/// Pick the wire form for a query: a cached plan when one matches the
	/// statement's canonical text, literal text otherwise.
	fn resolve(&self, query: &Query, config: &QueryConfig) -> Result<Attempt, EncodeError> {
		match query {
			Query::Simple(statement) => self.resolve_statement(statement, &Params::None, config),
			Query::Parameterized(statement, params) => self.resolve_statement(statement, params, config),
			Query::Prepared(plan, params) => Ok(Attempt::Prepared {
				plan: plan.clone(),
				params: params.clone(),
			}),
		}
	}

	fn resolve_statement(
		&self,
		statement: &Statement,
		params: &Params,
		config: &QueryConfig,
	) -> Result<Attempt, EncodeError> {
		let canonical = statement.canonical_text();
		if let Some(plan) = self.cache.lookup(&canonical) {
			Ok(Attempt::Prepared {
				plan,
				params: params.clone(),
			})
		} else {
			Ok(Attempt::Adhoc(encode_simple(statement, params, config)?))
		}
	}

	async fn prepare_text(
		&self,
		canonical_text: &str,
		config: &QueryConfig,
		deadline: Instant,
	) -> Result<ExecutionPlan, ExecuteError> {
		let statement = Statement::raw(canonical_text);
		let request = encode_prepare(&statement, config).map_err(|error| ExecuteError::bare(error.into()))?;
		let result = self.run_request(request, config, deadline).await?;
		let Some(body) = result.rows().first().cloned() else {
			return Err(ExecuteError::new(ExecuteErrorKind::MissingPlan, result));
		};
		let plan = ExecutionPlan::new(canonical_text, body);
		self.cache.store(plan.clone());
		tracing::debug!(statement = canonical_text, name = plan.name().unwrap_or("<unnamed>"), "stored prepared plan");
		Ok(plan)
	}

	/// Drive one request to completion, buffering everything.
	async fn run_request(
		&self,
		request: QueryRequest,
		config: &QueryConfig,
		deadline: Instant,
	) -> Result<QueryResult, ExecuteError> {
		tracing::debug!(client_context_id = request.client_context_id(), "dispatching query request");
		let cancellation = config.cancellation.clone();
		let mut chunks = self.transport.send(request);
		let mut parser = ResponseParser::new();
		let mut aggregate = Aggregate::default();
		loop {
			let item = tokio::select! {
				biased;
				_ = cancelled_or_never(&cancellation) => {
					tracing::debug!("query execution cancelled");
					return Err(aggregate.fail(ExecuteErrorKind::Cancelled));
				}
				_ = time::sleep_until(deadline) => {
					tracing::debug!("query execution deadline exceeded");
					return Err(aggregate.fail(ExecuteErrorKind::Timeout));
				}
				item = chunks.next() => item,
			};
			match item {
				Some(Ok(chunk)) => {
					let events = match parser.feed(&chunk) {
						Ok(events) => events,
						Err(error) => return Err(aggregate.fail(error.into())),
					};
					for event in events {
						aggregate.apply(event);
					}
					if aggregate.ended {
						return Ok(aggregate.into_result());
					}
				}
				Some(Err(error)) => return Err(aggregate.fail(error.into())),
				None => {
					return match parser.finish() {
						Ok(()) => Ok(aggregate.into_result()),
						Err(error) => Err(aggregate.fail(error.into())),
					};
				}
			}
		}
	}

	/// Driver task behind [`execute_streaming`](Self::execute_streaming).
	async fn drive_streaming(
		self,
		mut attempt: Attempt,
		mut request: QueryRequest,
		config: QueryConfig,
		deadline: Instant,
		tx: mpsc::Sender<Result<ResponseEvent, ExecuteError>>,
	) {
		let mut retried = false;
		loop {
			match self.stream_attempt(request, &config, deadline, &tx).await {
				AttemptOutcome::Finished {
					withheld,
					stale,
					rows_delivered,
				} => {
					if stale && !rows_delivered {
						let prepared = match &attempt {
							Attempt::Prepared {
								plan,
								params,
							} => Some((plan.statement_text().to_string(), params.clone())),
							Attempt::Adhoc(_) => None,
						};
						if let Some((text, params)) = prepared {
							if !retried {
								retried = true;
								tracing::debug!(statement = text.as_str(), "prepared plan rejected, re-preparing once");
								self.cache.invalidate(&text);
								let fresh = match self.prepare_text(&text, &config, deadline).await {
									Ok(plan) => plan,
									Err(error) => {
										// Cancellation acknowledged during the
										// re-prepare delivers nothing further.
										if error.kind != ExecuteErrorKind::Cancelled {
											let _ = tx.send(Err(error)).await;
										}
										return;
									}
								};
								request = match encode_prepared(&fresh, &params, &config) {
									Ok(request) => request,
									Err(error) => {
										let _ = tx.send(Err(ExecuteError::bare(error.into()))).await;
										return;
									}
								};
								attempt = Attempt::Prepared {
									plan: fresh,
									params,
								};
								continue;
							}
							let partial = collect_partial(withheld);
							let _ = tx.send(Err(ExecuteError::new(ExecuteErrorKind::StalePlan, partial))).await;
							return;
						}
					}
					for event in withheld {
						if tx.send(Ok(event)).await.is_err() {
							return;
						}
					}
					let _ = tx.send(Ok(ResponseEvent::StreamEnd)).await;
					return;
				}
				AttemptOutcome::Failed(error) => {
					let _ = tx.send(Err(error)).await;
					return;
				}
				AttemptOutcome::Silent => return,
			}
		}
	}

	/// Run one streaming attempt. Rows pass straight through to the
	/// caller; error entries and metadata fragments are withheld until the
	/// document completes so a stale-plan response can be retried without
	/// surfacing events from the abandoned attempt.
	async fn stream_attempt(
		&self,
		request: QueryRequest,
		config: &QueryConfig,
		deadline: Instant,
		tx: &mpsc::Sender<Result<ResponseEvent, ExecuteError>>,
	) -> AttemptOutcome {
		tracing::debug!(client_context_id = request.client_context_id(), "dispatching streaming query request");
		let cancellation = config.cancellation.clone();
		let mut chunks = self.transport.send(request);
		let mut parser = ResponseParser::new();
		let mut withheld: Vec<ResponseEvent> = Vec::new();
		let mut partial = Aggregate::default();
		let mut stale = false;
		let mut rows_delivered = false;
		loop {
			let item = tokio::select! {
				biased;
				_ = cancelled_or_never(&cancellation) => {
					tracing::debug!("streaming query execution cancelled");
					return AttemptOutcome::Silent;
				}
				_ = tx.closed() => {
					tracing::debug!("event stream dropped, abandoning execution");
					return AttemptOutcome::Silent;
				}
				_ = time::sleep_until(deadline) => {
					tracing::debug!("streaming query execution deadline exceeded");
					return AttemptOutcome::Failed(partial.fail(ExecuteErrorKind::Timeout));
				}
				item = chunks.next() => item,
			};
			match item {
				Some(Ok(chunk)) => {
					let events = match parser.feed(&chunk) {
						Ok(events) => events,
						Err(error) => return AttemptOutcome::Failed(partial.fail(error.into())),
					};
					for event in events {
						match event {
							ResponseEvent::Row(row) => {
								rows_delivered = true;
								if tx.send(Ok(ResponseEvent::Row(row))).await.is_err() {
									return AttemptOutcome::Silent;
								}
							}
							ResponseEvent::Error(error) => {
								stale |= error.is_stale_plan();
								partial.apply(ResponseEvent::Error(error.clone()));
								withheld.push(ResponseEvent::Error(error));
							}
							ResponseEvent::Metadata(fragment) => {
								partial.apply(ResponseEvent::Metadata(fragment.clone()));
								withheld.push(ResponseEvent::Metadata(fragment));
							}
							ResponseEvent::StreamEnd => {
								return AttemptOutcome::Finished {
									withheld,
									stale,
									rows_delivered,
								};
							}
						}
					}
				}
				Some(Err(error)) => return AttemptOutcome::Failed(partial.fail(error.into())),
				None => {
					return match parser.finish() {
						Ok(()) => AttemptOutcome::Finished {
							withheld,
							stale,
							rows_delivered,
						},
						Err(error) => AttemptOutcome::Failed(partial.fail(error.into())),
					};
				}
			}
		}
	}
}

fn collect_partial(withheld: Vec<ResponseEvent>) -> QueryResult {
	let mut aggregate = Aggregate::default();
	for event in withheld {
		aggregate.apply(event);
	}
	aggregate.into_result()
}

#[cfg(test)]
mod tests {
	use serde_json::json;

	use super::*;
	use crate::stream::MetadataFragment;

	fn result_with(status: Option<QueryStatus>, errors: Vec<ServerError>) -> QueryResult {
		QueryResult {
			rows: Vec::new(),
			errors,
			metadata: QueryMetadata {
				status,
				..Default::default()
			},
		}
	}

	#[test]
	fn test_final_success_follows_server_status() {
		let informational = ServerError::new(json!({"msg": "Primary index already exists"}));
		assert!(result_with(Some(QueryStatus::Success), vec![informational]).final_success());
		assert!(!result_with(Some(QueryStatus::Errors), Vec::new()).final_success());
		assert!(!result_with(None, Vec::new()).final_success());
	}

	#[test]
	fn test_stale_plan_detection_on_result() {
		let stale = ServerError::new(json!({"code": 4040, "msg": "no such prepared statement"}));
		assert!(result_with(Some(QueryStatus::Errors), vec![stale]).has_stale_plan_error());
		assert!(!result_with(Some(QueryStatus::Success), Vec::new()).has_stale_plan_error());
	}

	#[test]
	fn test_aggregate_preserves_arrival_order() {
		let mut aggregate = Aggregate::default();
		aggregate.apply(ResponseEvent::Row(json!({"a": 1})));
		aggregate.apply(ResponseEvent::Metadata(MetadataFragment {
			status: Some(QueryStatus::Success),
			..Default::default()
		}));
		aggregate.apply(ResponseEvent::Row(json!({"a": 2})));
		aggregate.apply(ResponseEvent::StreamEnd);
		assert!(aggregate.ended);
		let result = aggregate.into_result();
		assert_eq!(result.rows(), &[json!({"a": 1}), json!({"a": 2})]);
		assert!(result.final_success());
	}

	#[tokio::test]
	async fn test_cancellation_token() {
		let token = Cancellation::new();
		assert!(!token.is_cancelled());

		let clone = token.clone();
		clone.cancel();
		assert!(token.is_cancelled());
		// Resolves immediately once cancelled.
		token.cancelled().await;

		// Idempotent.
		token.cancel();
		assert!(token.is_cancelled());
	}
}
