// Copyright (c) tidedb.io 2025
// This file is licensed under the MIT

//! Test support for the query execution core.
//!
//! Provides a scripted [`MockTransport`] with controllable chunk
//! fragmentation, injected failures, and artificial delays, plus helpers
//! for building response documents.

mod transport;

pub use transport::{MockTransport, ScriptedChunk, ScriptedResponse};

/// A minimal successful response document carrying the given rows.
pub fn rows_response(rows: &[serde_json::Value]) -> String {
	let results = serde_json::to_string(rows).expect("rows serialise");
	format!(
		r#"{{"requestID":"test-request","results":{},"errors":[],"status":"success","metrics":{{"resultCount":{}}}}}"#,
		results,
		rows.len()
	)
}

/// A PREPARE response whose single row is a plan body for the given
/// statement text.
pub fn plan_response(name: &str) -> String {
	format!(
		r##"{{"requestID":"test-prepare","results":[{{"name":"{}","signature":{{"*":"*"}},"operator":{{"#operator":"Sequence"}}}}],"errors":[],"status":"success"}}"##,
		name
	)
}

/// A response reporting that the referenced prepared plan is unknown.
pub fn stale_plan_response() -> String {
	r#"{"requestID":"test-stale","results":[],"errors":[{"code":4040,"msg":"no such prepared statement"}],"status":"errors"}"#
		.to_string()
}

#[cfg(test)]
mod tests {
	use serde_json::json;

	use super::*;

	#[test]
	fn test_rows_response_is_valid_json() {
		let doc = rows_response(&[json!({"item": "value"})]);
		let value: serde_json::Value = serde_json::from_str(&doc).unwrap();
		assert_eq!(value["results"][0]["item"], json!("value"));
		assert_eq!(value["status"], json!("success"));
	}

	#[test]
	fn test_plan_response_carries_plan_fields() {
		let doc = plan_response("p1");
		let value: serde_json::Value = serde_json::from_str(&doc).unwrap();
		assert_eq!(value["results"][0]["name"], json!("p1"));
		assert!(value["results"][0]["signature"].is_object());
		assert!(value["results"][0]["operator"].is_object());
	}

	#[test]
	fn test_stale_plan_response_uses_stale_code() {
		let doc = stale_plan_response();
		let value: serde_json::Value = serde_json::from_str(&doc).unwrap();
		assert!(tidedb_query::STALE_PLAN_CODES.contains(&value["errors"][0]["code"].as_i64().unwrap()));
	}
}
