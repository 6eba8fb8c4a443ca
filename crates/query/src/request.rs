// Copyright (c) tidedb.io 2025
// This file is licensed under the MIT

//! Request payload encoding.
//!
//! An execution call turns a statement (or a cached plan) plus parameter
//! bindings and configuration into one transient [`QueryRequest`]. Encoding
//! validates that every placeholder the statement references has a bound
//! value; a missing binding is a structural error surfaced before any I/O.

use std::{collections::HashMap, time::Duration};

use serde_json::{Map, Value};
use uuid::Uuid;

use crate::{
	error::EncodeError,
	execute::Cancellation,
	plan::ExecutionPlan,
	statement::{Placeholder, Statement},
};

/// Default per-request deadline applied when the caller does not set one.
pub const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(75);

/// Parameter bindings for one execution.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum Params {
	#[default]
	None,
	/// Bound by 1-based position (`$1`, `$2`, ...).
	Positional(Vec<Value>),
	/// Bound by name (`$name`). Keys are stored without the leading `$`.
	Named(HashMap<String, Value>),
}

impl Params {
	pub fn positional<I, V>(values: I) -> Params
	where
		I: IntoIterator<Item = V>,
		V: Into<Value>,
	{
		Params::Positional(values.into_iter().map(Into::into).collect())
	}

	pub fn named<I, K, V>(pairs: I) -> Params
	where
		I: IntoIterator<Item = (K, V)>,
		K: Into<String>,
		V: Into<Value>,
	{
		Params::Named(
			pairs.into_iter()
				.map(|(key, value)| {
					let key = key.into();
					let key = key.strip_prefix('$').map(str::to_string).unwrap_or(key);
					(key, value.into())
				})
				.collect(),
		)
	}

	fn binds(&self, placeholder: &Placeholder) -> bool {
		match (self, placeholder) {
			(Params::Positional(values), Placeholder::Positional(index)) => *index >= 1 && *index <= values.len(),
			(Params::Named(map), Placeholder::Named(name)) => map.contains_key(name.as_str()),
			_ => false,
		}
	}
}

/// Scan consistency requested for one execution.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ScanConsistency {
	/// Use whatever index state is available. Fastest, may miss recent
	/// mutations.
	#[default]
	NotBounded,
	/// Wait for the index to catch up with the request time.
	RequestPlus,
}

impl ScanConsistency {
	pub fn wire_name(&self) -> &'static str {
		match self {
			ScanConsistency::NotBounded => "not_bounded",
			ScanConsistency::RequestPlus => "request_plus",
		}
	}
}

/// Per-execution configuration.
#[derive(Debug, Clone)]
pub struct QueryConfig {
	/// Deadline for the whole execution, including streaming.
	pub timeout: Duration,
	pub scan_consistency: ScanConsistency,
	/// Correlation id echoed by the server; generated when not set.
	pub client_context_id: Option<String>,
	/// Cooperative cancellation token observed while the execution is in
	/// flight.
	pub cancellation: Option<Cancellation>,
}

impl Default for QueryConfig {
	fn default() -> Self {
		Self {
			timeout: DEFAULT_QUERY_TIMEOUT,
			scan_consistency: ScanConsistency::default(),
			client_context_id: None,
			cancellation: None,
		}
	}
}

impl QueryConfig {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn with_timeout(mut self, timeout: Duration) -> Self {
		self.timeout = timeout;
		self
	}

	pub fn with_scan_consistency(mut self, scan_consistency: ScanConsistency) -> Self {
		self.scan_consistency = scan_consistency;
		self
	}

	pub fn with_client_context_id(mut self, id: impl Into<String>) -> Self {
		self.client_context_id = Some(id.into());
		self
	}

	pub fn with_cancellation(mut self, cancellation: Cancellation) -> Self {
		self.cancellation = Some(cancellation);
		self
	}
}

/// A transport-ready request payload. Created per execution call and
/// discarded after send.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryRequest {
	body: Value,
	client_context_id: String,
	timeout: Duration,
}

impl QueryRequest {
	/// The JSON body posted to the query service.
	pub fn body(&self) -> &Value {
		&self.body
	}

	pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
		serde_json::to_vec(&self.body)
	}

	pub fn client_context_id(&self) -> &str {
		&self.client_context_id
	}

	pub fn timeout(&self) -> Duration {
		self.timeout
	}
}

/// Encode a statement execution, embedding parameter values and
/// configuration.
pub fn encode_simple(statement: &Statement, params: &Params, config: &QueryConfig) -> Result<QueryRequest, EncodeError> {
	check_bindings(&statement.placeholders(), params)?;
	let mut body = Map::new();
	body.insert("statement".to_string(), Value::String(statement.canonical_text()));
	apply_params(&mut body, params);
	finish_request(body, config)
}

/// Encode an execution of a previously prepared plan.
pub fn encode_prepared(plan: &ExecutionPlan, params: &Params, config: &QueryConfig) -> Result<QueryRequest, EncodeError> {
	check_bindings(&plan.placeholders(), params)?;
	let mut body = Map::new();
	body.insert("prepared".to_string(), plan.body().clone());
	apply_params(&mut body, params);
	finish_request(body, config)
}

/// Encode the PREPARE request for a statement with no cached plan.
pub fn encode_prepare(statement: &Statement, config: &QueryConfig) -> Result<QueryRequest, EncodeError> {
	let mut body = Map::new();
	body.insert("statement".to_string(), Value::String(format!("PREPARE {}", statement.canonical_text())));
	finish_request(body, config)
}

fn check_bindings(placeholders: &[Placeholder], params: &Params) -> Result<(), EncodeError> {
	for placeholder in placeholders {
		if !params.binds(placeholder) {
			return Err(match placeholder {
				Placeholder::Positional(index) => EncodeError::UnboundPositional(*index),
				Placeholder::Named(name) => EncodeError::UnboundNamed(name.clone()),
			});
		}
	}
	Ok(())
}

fn apply_params(body: &mut Map<String, Value>, params: &Params) {
	match params {
		Params::None => {}
		Params::Positional(values) => {
			body.insert("args".to_string(), Value::Array(values.clone()));
		}
		Params::Named(map) => {
			// Sorted so the encoded body is deterministic.
			let mut keys: Vec<&String> = map.keys().collect();
			keys.sort();
			for key in keys {
				body.insert(format!("${}", key), map[key].clone());
			}
		}
	}
}

fn finish_request(mut body: Map<String, Value>, config: &QueryConfig) -> Result<QueryRequest, EncodeError> {
	let client_context_id = config.client_context_id.clone().unwrap_or_else(|| Uuid::new_v4().to_string());
	body.insert("client_context_id".to_string(), Value::String(client_context_id.clone()));
	body.insert("timeout".to_string(), Value::String(format!("{}ms", config.timeout.as_millis())));
	body.insert("scan_consistency".to_string(), Value::String(config.scan_consistency.wire_name().to_string()));
	Ok(QueryRequest {
		body: Value::Object(body),
		client_context_id,
		timeout: config.timeout,
	})
}
