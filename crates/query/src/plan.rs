// Copyright (c) tidedb.io 2025
// This file is licensed under the MIT

//! Server-issued execution plans and the shared plan cache.

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::statement::{Placeholder, scan_placeholders};

/// An opaque execution plan issued by the query service in response to a
/// PREPARE request.
///
/// The body is immutable once received. The canonical text of the statement
/// it was prepared from is retained so a plan the server no longer knows
/// can be transparently re-prepared.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionPlan {
	statement_text: String,
	body: Value,
}

impl ExecutionPlan {
	pub fn new(statement_text: impl Into<String>, body: Value) -> Self {
		Self {
			statement_text: statement_text.into(),
			body,
		}
	}

	/// The raw plan body as returned by the server.
	pub fn body(&self) -> &Value {
		&self.body
	}

	/// The server-assigned plan name, if any.
	pub fn name(&self) -> Option<&str> {
		self.body.get("name").and_then(Value::as_str)
	}

	/// The result signature advertised by the plan.
	pub fn signature(&self) -> Option<&Value> {
		self.body.get("signature")
	}

	/// The operator tree of the plan.
	pub fn operator(&self) -> Option<&Value> {
		self.body.get("operator")
	}

	/// Canonical text of the statement this plan was prepared from.
	pub fn statement_text(&self) -> &str {
		&self.statement_text
	}

	/// Placeholders referenced by the prepared statement.
	pub fn placeholders(&self) -> Vec<Placeholder> {
		scan_placeholders(&self.statement_text)
	}
}

/// Shared cache mapping canonical statement text to execution plans.
///
/// The cache is safe for concurrent use from any number of in-flight
/// executions: lookups and stores on distinct keys do not block each other,
/// and [`invalidate_all`](PlanCache::invalidate_all) is totally ordered
/// against racing stores. Keys are exact-match only; a plan is never served
/// for textually different statement text.
pub struct PlanCache {
	entries: DashMap<String, ExecutionPlan>,
	hits: AtomicU64,
	misses: AtomicU64,
}

impl PlanCache {
	pub fn new() -> Self {
		Self {
			entries: DashMap::new(),
			hits: AtomicU64::new(0),
			misses: AtomicU64::new(0),
		}
	}

	/// Look up the plan for the given canonical statement text.
	pub fn lookup(&self, canonical_text: &str) -> Option<ExecutionPlan> {
		match self.entries.get(canonical_text) {
			Some(entry) => {
				self.hits.fetch_add(1, Ordering::Relaxed);
				tracing::debug!(statement = canonical_text, "plan cache hit");
				Some(entry.value().clone())
			}
			None => {
				self.misses.fetch_add(1, Ordering::Relaxed);
				None
			}
		}
	}

	/// Store a plan under the canonical text it was prepared from,
	/// overwriting any previous entry. Idempotent.
	///
	/// The key is taken from the plan itself, so a stored plan always
	/// matches the statement that produced it.
	pub fn store(&self, plan: ExecutionPlan) {
		self.entries.insert(plan.statement_text().to_string(), plan);
	}

	/// Drop the entry for one canonical statement text, if present.
	pub fn invalidate(&self, canonical_text: &str) -> bool {
		let removed = self.entries.remove(canonical_text).is_some();
		if removed {
			tracing::debug!(statement = canonical_text, "invalidated cached plan");
		}
		removed
	}

	/// Drop every cached plan. Invoked on cluster topology change or
	/// explicit user request. Idempotent.
	pub fn invalidate_all(&self) {
		let entries = self.entries.len();
		self.entries.clear();
		tracing::debug!(entries, "plan cache invalidated");
	}

	pub fn len(&self) -> usize {
		self.entries.len()
	}

	pub fn is_empty(&self) -> bool {
		self.entries.is_empty()
	}

	/// Number of cache hits served so far. Observability only.
	pub fn hits(&self) -> u64 {
		self.hits.load(Ordering::Relaxed)
	}

	/// Number of lookups that missed. Observability only.
	pub fn misses(&self) -> u64 {
		self.misses.load(Ordering::Relaxed)
	}
}

impl Default for PlanCache {
	fn default() -> Self {
		Self::new()
	}
}

#[cfg(test)]
mod tests {
	use serde_json::json;

	use super::*;

	fn plan(text: &str) -> ExecutionPlan {
		ExecutionPlan::new(text, json!({"name": "p1", "signature": {"*": "*"}, "operator": {"#operator": "Sequence"}}))
	}

	#[test]
	fn test_plan_accessors() {
		let plan = plan("SELECT * FROM default WHERE item = $1");
		assert_eq!(plan.name(), Some("p1"));
		assert!(plan.signature().is_some());
		assert!(plan.operator().is_some());
		assert_eq!(plan.placeholders(), vec![Placeholder::Positional(1)]);
	}

	#[test]
	fn test_lookup_after_store() {
		let cache = PlanCache::new();
		assert!(cache.lookup("SELECT 1").is_none());
		cache.store(plan("SELECT 1"));
		assert_eq!(cache.lookup("SELECT 1").unwrap().name(), Some("p1"));
		assert_eq!(cache.hits(), 1);
		assert_eq!(cache.misses(), 1);
	}

	#[test]
	fn test_exact_match_only() {
		let cache = PlanCache::new();
		cache.store(plan("SELECT 1"));
		assert!(cache.lookup("SELECT 1 ").is_none());
		assert!(cache.lookup("select 1").is_none());
	}

	#[test]
	fn test_store_overwrites() {
		let cache = PlanCache::new();
		cache.store(plan("SELECT 1"));
		cache.store(ExecutionPlan::new("SELECT 1", json!({"name": "p2"})));
		assert_eq!(cache.lookup("SELECT 1").unwrap().name(), Some("p2"));
		assert_eq!(cache.len(), 1);
	}

	#[test]
	fn test_invalidate_single_entry() {
		let cache = PlanCache::new();
		cache.store(plan("SELECT 1"));
		cache.store(plan("SELECT 2"));
		assert!(cache.invalidate("SELECT 1"));
		assert!(!cache.invalidate("SELECT 1"));
		assert!(cache.lookup("SELECT 1").is_none());
		assert!(cache.lookup("SELECT 2").is_some());
	}

	#[test]
	fn test_invalidate_all_is_idempotent() {
		let cache = PlanCache::new();
		cache.store(plan("SELECT 1"));
		cache.invalidate_all();
		cache.invalidate_all();
		assert!(cache.is_empty());
		assert!(cache.lookup("SELECT 1").is_none());
		cache.store(plan("SELECT 1"));
		assert!(cache.lookup("SELECT 1").is_some());
	}
}
