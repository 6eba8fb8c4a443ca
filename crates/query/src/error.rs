// Copyright (c) tidedb.io 2025
// This file is licensed under the MIT

//! Error taxonomy of the query execution core.
//!
//! Structural errors ([`StatementError`], [`EncodeError`]) fail fast at the
//! call that caused them. Stream errors ([`ParseError`], [`TransportError`])
//! fail the single in-flight execution and leave shared state untouched.
//! [`ExecuteError`] wraps a failed execution together with whatever partial
//! result had been collected, so callers can inspect partial progress.
//!
//! Server-reported query errors are data, not failures: they are delivered
//! inside [`QueryResult::errors`](crate::execute::QueryResult::errors) and
//! never raised through this module.

use crate::execute::QueryResult;

/// Structural error raised while composing a statement.
///
/// Detected at composition time, before any encoding or I/O.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StatementError {
	#[error("where predicate must be a boolean expression, got a {found}")]
	NonBooleanPredicate {
		found: String,
	},

	#[error("keyspace name cannot be empty")]
	EmptyKeyspace,

	#[error("select list cannot be empty")]
	EmptyProjection,

	#[error("positional placeholders start at $1")]
	ZeroPositionalPlaceholder,
}

/// Error raised while encoding a request payload.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EncodeError {
	#[error("no value bound for positional placeholder ${0}")]
	UnboundPositional(usize),

	#[error("no value bound for named placeholder ${0}")]
	UnboundNamed(String),
}

/// Error raised by the response stream parser.
///
/// A parse error aborts the single in-flight stream; concurrent executions
/// and the plan cache are unaffected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
	#[error("unexpected byte {byte:#04x} at offset {offset}")]
	Unexpected {
		byte: u8,
		offset: u64,
	},

	#[error("expected an array for response field {field:?}")]
	ExpectedArray {
		field: String,
	},

	#[error("invalid JSON value in response field {field:?}: {reason}")]
	InvalidValue {
		field: String,
		reason: String,
	},

	#[error("response document is truncated")]
	Truncated,

	#[error("trailing data after the response document")]
	TrailingData,

	#[error("parser already failed, a fresh instance is required")]
	Aborted,
}

/// Failure reported by the transport seam.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
	#[error("failed to reach the query service: {0}")]
	Connect(String),

	#[error("i/o failure on the response stream: {0}")]
	Io(String),

	#[error("connection closed before the response completed")]
	Closed,
}

/// A failed query execution, carrying whatever partial rows, errors, and
/// metadata were collected before the failure.
#[derive(Debug, PartialEq, thiserror::Error)]
#[error("query execution failed: {kind}")]
pub struct ExecuteError {
	pub kind: ExecuteErrorKind,
	pub partial: QueryResult,
}

impl ExecuteError {
	pub(crate) fn new(kind: ExecuteErrorKind, partial: QueryResult) -> Self {
		Self {
			kind,
			partial,
		}
	}

	/// A failure that occurred before any response data was collected.
	pub(crate) fn bare(kind: ExecuteErrorKind) -> Self {
		Self::new(kind, QueryResult::default())
	}
}

/// The reason a query execution failed.
#[derive(Debug, PartialEq, thiserror::Error)]
pub enum ExecuteErrorKind {
	#[error("{0}")]
	Encode(#[from] EncodeError),

	#[error("{0}")]
	Transport(#[from] TransportError),

	#[error("{0}")]
	Parse(#[from] ParseError),

	#[error("deadline exceeded")]
	Timeout,

	#[error("cancelled by the caller")]
	Cancelled,

	#[error("server rejected the prepared plan again after re-preparing")]
	StalePlan,

	#[error("PREPARE returned no plan row")]
	MissingPlan,
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_statement_error_display() {
		let err = StatementError::NonBooleanPredicate {
			found: "string literal".to_string(),
		};
		assert_eq!(err.to_string(), "where predicate must be a boolean expression, got a string literal");
	}

	#[test]
	fn test_encode_error_display() {
		assert_eq!(EncodeError::UnboundPositional(2).to_string(), "no value bound for positional placeholder $2");
		assert_eq!(
			EncodeError::UnboundNamed("item".to_string()).to_string(),
			"no value bound for named placeholder $item"
		);
	}

	#[test]
	fn test_execute_error_display_includes_kind() {
		let err = ExecuteError::bare(ExecuteErrorKind::Timeout);
		assert_eq!(err.to_string(), "query execution failed: deadline exceeded");
	}
}
