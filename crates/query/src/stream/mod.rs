// Copyright (c) tidedb.io 2025
// This file is licensed under the MIT

//! Response stream events and metadata.

mod parser;

pub use parser::ResponseParser;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Server error codes marking a prepared plan the server no longer knows.
pub const STALE_PLAN_CODES: &[i64] = &[4040, 4050, 4070];

/// A discrete event decoded from the chunked response stream.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseEvent {
	/// One element of the `results` array.
	Row(Value),
	/// One element of the `errors` array.
	Error(ServerError),
	/// A completed top-level metadata field.
	Metadata(MetadataFragment),
	/// The response document is complete.
	StreamEnd,
}

/// A structured error entry reported by the server inside the response
/// document.
///
/// Server errors are data, not failures: the server may report an overall
/// success status alongside informational entries (e.g. "Primary index
/// already exists"), so callers inspect both the error sequence and the
/// status rather than relying on a single boolean.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServerError {
	raw: Value,
}

impl ServerError {
	pub fn new(raw: Value) -> Self {
		Self {
			raw,
		}
	}

	/// The numeric error code, if the server supplied one.
	pub fn code(&self) -> Option<i64> {
		self.raw.get("code").and_then(Value::as_i64)
	}

	/// The human-readable message, if the server supplied one.
	pub fn msg(&self) -> Option<&str> {
		self.raw.get("msg").and_then(Value::as_str)
	}

	/// The raw error object as received.
	pub fn raw(&self) -> &Value {
		&self.raw
	}

	/// Whether this error marks a prepared plan the server no longer
	/// recognises, making the cached entry unusable.
	pub fn is_stale_plan(&self) -> bool {
		self.code().is_some_and(|code| STALE_PLAN_CODES.contains(&code))
	}
}

/// The execution status reported by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryStatus {
	Success,
	Running,
	Completed,
	Stopped,
	Timeout,
	Errors,
	Fatal,
	/// A status string this client does not know. Kept verbatim.
	Unknown(String),
}

impl QueryStatus {
	pub fn parse(raw: &str) -> QueryStatus {
		match raw {
			"success" => QueryStatus::Success,
			"running" => QueryStatus::Running,
			"completed" => QueryStatus::Completed,
			"stopped" => QueryStatus::Stopped,
			"timeout" => QueryStatus::Timeout,
			"errors" => QueryStatus::Errors,
			"fatal" => QueryStatus::Fatal,
			other => QueryStatus::Unknown(other.to_string()),
		}
	}

	/// Whether the server reported the execution as successful.
	pub fn is_success(&self) -> bool {
		matches!(self, QueryStatus::Success)
	}
}

/// A partial metadata update decoded from one top-level response field.
///
/// Fields arrive in whatever order the server produced them; fragments are
/// merged into a [`QueryMetadata`] as they complete.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetadataFragment {
	pub request_id: Option<String>,
	pub client_context_id: Option<String>,
	pub status: Option<QueryStatus>,
	pub signature: Option<Value>,
	pub metrics: Option<Value>,
}

/// The accumulated metadata record of one response.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryMetadata {
	pub request_id: Option<String>,
	pub client_context_id: Option<String>,
	pub status: Option<QueryStatus>,
	pub signature: Option<Value>,
	pub metrics: Option<Value>,
}

impl QueryMetadata {
	/// Merge a completed fragment into the running record.
	pub fn merge(&mut self, fragment: MetadataFragment) {
		if let Some(request_id) = fragment.request_id {
			self.request_id = Some(request_id);
		}
		if let Some(client_context_id) = fragment.client_context_id {
			self.client_context_id = Some(client_context_id);
		}
		if let Some(status) = fragment.status {
			self.status = Some(status);
		}
		if let Some(signature) = fragment.signature {
			self.signature = Some(signature);
		}
		if let Some(metrics) = fragment.metrics {
			self.metrics = Some(metrics);
		}
	}
}

#[cfg(test)]
mod tests {
	use serde_json::json;

	use super::*;

	#[test]
	fn test_server_error_accessors() {
		let error = ServerError::new(json!({"code": 4000, "msg": "Primary index already exists"}));
		assert_eq!(error.code(), Some(4000));
		assert_eq!(error.msg(), Some("Primary index already exists"));
		assert!(!error.is_stale_plan());
	}

	#[test]
	fn test_stale_plan_codes() {
		for code in [4040, 4050, 4070] {
			assert!(ServerError::new(json!({"code": code, "msg": "no such prepared statement"})).is_stale_plan());
		}
		assert!(!ServerError::new(json!({"msg": "no code at all"})).is_stale_plan());
	}

	#[test]
	fn test_status_parsing() {
		assert_eq!(QueryStatus::parse("success"), QueryStatus::Success);
		assert_eq!(QueryStatus::parse("fatal"), QueryStatus::Fatal);
		assert_eq!(QueryStatus::parse("later_addition"), QueryStatus::Unknown("later_addition".to_string()));
		assert!(QueryStatus::Success.is_success());
		assert!(!QueryStatus::Completed.is_success());
	}

	#[test]
	fn test_metadata_merge_keeps_latest() {
		let mut metadata = QueryMetadata::default();
		metadata.merge(MetadataFragment {
			request_id: Some("r1".to_string()),
			..Default::default()
		});
		metadata.merge(MetadataFragment {
			status: Some(QueryStatus::Success),
			metrics: Some(json!({"resultCount": 1})),
			..Default::default()
		});
		assert_eq!(metadata.request_id.as_deref(), Some("r1"));
		assert_eq!(metadata.status, Some(QueryStatus::Success));
		assert!(metadata.metrics.is_some());
	}
}
